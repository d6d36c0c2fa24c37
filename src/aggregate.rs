//! Vote aggregation.

use crate::models::Participant;

/// Mean of all numeric votes, rounded to one decimal place.
///
/// Votes that are absent or do not parse as a finite number are ignored.
/// Returns `0.0` when nothing qualifies.
pub fn average<'a, I>(participants: I) -> f64
where
    I: IntoIterator<Item = &'a Participant>,
{
    let (sum, count) = participants
        .into_iter()
        .filter_map(|p| p.vote.as_deref())
        .filter_map(|vote| vote.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));

    if count == 0 {
        return 0.0;
    }

    round_one_decimal(sum / count as f64)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn voter(vote: Option<&str>) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            name: "voter".to_string(),
            vote: vote.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_roster_averages_to_zero() {
        assert_eq!(average(&Vec::<Participant>::new()), 0.0);
    }

    #[test]
    fn test_mean_of_numeric_votes() {
        let roster = [voter(Some("3")), voter(Some("5"))];
        assert_eq!(average(&roster), 4.0);
    }

    #[test]
    fn test_non_numeric_and_missing_votes_are_ignored() {
        assert_eq!(average(&[voter(Some("x")), voter(None)]), 0.0);

        let roster = [voter(Some("8")), voter(Some("XL")), voter(None)];
        assert_eq!(average(&roster), 8.0);
    }

    #[test]
    fn test_rounds_to_one_decimal() {
        let roster = [voter(Some("1")), voter(Some("2")), voter(Some("2"))];
        assert_eq!(average(&roster), 1.7);

        let roster = [voter(Some("0")), voter(Some("1")), voter(Some("1"))];
        assert_eq!(average(&roster), 0.7);
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let roster = [voter(Some("inf")), voter(Some("NaN")), voter(Some("13"))];
        assert_eq!(average(&roster), 13.0);
    }
}

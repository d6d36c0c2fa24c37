//! Room model and the voting systems a room can use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const FIBONACCI_LABELS: &[&str] = &["0", "1", "2", "3", "5", "8", "13", "21", "34", "55"];
const LINEAR_LABELS: &[&str] = &["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];
const TSHIRT_LABELS: &[&str] = &["XS", "S", "M", "L", "XL", "XXL"];

/// Label set a room votes with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VotingSystem {
    #[default]
    Fibonacci,
    Linear,
    Tshirt,
}

impl VotingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingSystem::Fibonacci => "fibonacci",
            VotingSystem::Linear => "linear",
            VotingSystem::Tshirt => "tshirt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fibonacci" => Some(VotingSystem::Fibonacci),
            "linear" => Some(VotingSystem::Linear),
            "tshirt" => Some(VotingSystem::Tshirt),
            _ => None,
        }
    }

    /// Vote buttons offered for this system, in display order.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            VotingSystem::Fibonacci => FIBONACCI_LABELS,
            VotingSystem::Linear => LINEAR_LABELS,
            VotingSystem::Tshirt => TSHIRT_LABELS,
        }
    }

    pub fn accepts(&self, label: &str) -> bool {
        self.labels().contains(&label)
    }
}

/// A shared estimation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub voting_system: VotingSystem,
    #[serde(default)]
    pub revealed: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new room; the backend fills in id and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct NewRoom<'a> {
    pub name: &'a str,
    pub voting_system: VotingSystem,
    pub revealed: bool,
}

//! Hosted backend: row API over `reqwest`, changes over the realtime socket.
//!
//! Rows live behind `{base}/rest/v1/{table}` and are filtered with
//! `column=eq.value` query parameters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use super::realtime::{self, RealtimeConfig};
use super::{Backend, Subscription};
use crate::errors::AppError;
use crate::models::{
    NewParticipant, NewRoom, Participant, PresenceMeta, Room, VotingSystem,
};

const ROOMS: &str = "rooms";
const PARTICIPANTS: &str = "participants";

/// Client for the hosted row API and its realtime channel.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    realtime: RealtimeConfig,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: Option<String>, heartbeat_interval: Duration) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let realtime =
            RealtimeConfig::from_base_url(&base_url, api_key.clone(), heartbeat_interval);
        Self {
            client: Client::new(),
            base_url,
            api_key,
            realtime,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.table_url(table));
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, AppError> {
        let response = self
            .request(reqwest::Method::GET, table)
            .query(&[("select", "*")])
            .query(filters)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn insert_row<T: DeserializeOwned, B: serde::Serialize + ?Sized>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<T, AppError> {
        let response = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let mut rows: Vec<T> = check(response).await?.json().await?;
        if rows.is_empty() {
            return Err(AppError::BackendUnavailable(format!(
                "Insert into {} returned no row",
                table
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn patch_rows(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: serde_json::Value,
    ) -> Result<(), AppError> {
        let response = self
            .request(reqwest::Method::PATCH, table)
            .query(filters)
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into `BackendUnavailable`.
async fn check(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!(%status, "Backend rejected request: {}", body);
    Err(AppError::BackendUnavailable(format!(
        "Backend returned {}: {}",
        status, body
    )))
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl Backend for RestBackend {
    async fn create_room(
        &self,
        name: &str,
        voting_system: VotingSystem,
    ) -> Result<Room, AppError> {
        let body = NewRoom {
            name,
            voting_system,
            revealed: false,
        };
        self.insert_row(ROOMS, &body).await
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, AppError> {
        let rows: Vec<Room> = self.fetch_rows(ROOMS, &[("id", eq(room_id))]).await?;
        Ok(rows.into_iter().next())
    }

    async fn set_revealed(&self, room_id: Uuid, revealed: bool) -> Result<(), AppError> {
        self.patch_rows(ROOMS, &[("id", eq(room_id))], json!({ "revealed": revealed }))
            .await
    }

    async fn find_participant_by_name(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Option<Participant>, AppError> {
        let rows: Vec<Participant> = self
            .fetch_rows(
                PARTICIPANTS,
                &[
                    ("room_id", eq(room_id)),
                    ("name", eq(name)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn create_participant(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Participant, AppError> {
        let body = NewParticipant {
            room_id,
            name,
            vote: None,
        };
        self.insert_row(PARTICIPANTS, &body).await
    }

    async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, AppError> {
        self.fetch_rows(
            PARTICIPANTS,
            &[
                ("room_id", eq(room_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn set_vote(&self, participant_id: Uuid, vote: Option<&str>) -> Result<(), AppError> {
        self.patch_rows(
            PARTICIPANTS,
            &[("id", eq(participant_id))],
            json!({ "vote": vote }),
        )
        .await
    }

    async fn clear_votes(&self, room_id: Uuid) -> Result<(), AppError> {
        self.patch_rows(
            PARTICIPANTS,
            &[("room_id", eq(room_id))],
            json!({ "vote": null }),
        )
        .await
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), AppError> {
        let response = self
            .request(reqwest::Method::DELETE, PARTICIPANTS)
            .query(&[("id", eq(participant_id))])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
        presence: PresenceMeta,
    ) -> Result<Subscription, AppError> {
        realtime::subscribe(&self.realtime, room_id, presence).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROOM: &str = "5f0e6a7c-1c1a-4d8b-9f4e-2d6f1b0c9a11";
    const ALICE: &str = "0d3f9a52-7e1b-4c6a-8f2d-9b1e4c7a5d30";

    fn room_row(revealed: bool) -> Value {
        json!({
            "id": ROOM,
            "name": "Sprint 12",
            "voting_system": "fibonacci",
            "revealed": revealed,
            "created_at": "2024-05-01T10:00:00+00:00"
        })
    }

    fn alice_row(vote: Option<&str>) -> Value {
        json!({
            "id": ALICE,
            "room_id": ROOM,
            "name": "Alice",
            "vote": vote,
            "created_at": "2024-05-01T10:00:01+00:00"
        })
    }

    fn backend(server: &MockServer) -> RestBackend {
        RestBackend::new(
            &server.uri(),
            Some("anon-key".to_string()),
            Duration::from_secs(25),
        )
    }

    fn room_id() -> Uuid {
        Uuid::parse_str(ROOM).unwrap()
    }

    #[tokio::test]
    async fn test_create_room_returns_backend_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rooms"))
            .and(header("apikey", "anon-key"))
            .and(header("Authorization", "Bearer anon-key"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({
                "name": "Sprint 12",
                "voting_system": "fibonacci",
                "revealed": false
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([room_row(false)])))
            .expect(1)
            .mount(&server)
            .await;

        let room = backend(&server)
            .create_room("Sprint 12", VotingSystem::Fibonacci)
            .await
            .unwrap();
        assert_eq!(room.id, room_id());
        assert!(!room.revealed);
    }

    #[tokio::test]
    async fn test_get_room_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/rooms"))
            .and(query_param("id", format!("eq.{ROOM}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        assert!(backend(&server).get_room(room_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_participant_by_name_filters_room_and_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/participants"))
            .and(query_param("room_id", format!("eq.{ROOM}")))
            .and(query_param("name", "eq.Alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([alice_row(Some("5"))])))
            .mount(&server)
            .await;

        let found = backend(&server)
            .find_participant_by_name(room_id(), "Alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.vote.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_clear_votes_patches_whole_room() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/participants"))
            .and(query_param("room_id", format!("eq.{ROOM}")))
            .and(body_json(json!({ "vote": null })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server).clear_votes(room_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_participant() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/participants"))
            .and(query_param("id", format!("eq.{ALICE}")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server)
            .delete_participant(Uuid::parse_str(ALICE).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/rooms"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .set_revealed(room_id(), true)
            .await
            .unwrap_err();
        match err {
            AppError::BackendUnavailable(msg) => assert!(msg.contains("maintenance")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let backend = RestBackend::new("http://127.0.0.1:9", None, Duration::from_secs(25));
        let err = backend.list_participants(room_id()).await.unwrap_err();
        assert!(matches!(err, AppError::BackendUnavailable(_)));
    }
}

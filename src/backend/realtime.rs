//! Hosted realtime channel client over `tokio-tungstenite`.
//!
//! One websocket and one channel topic per room. The join registers both
//! row-change filters and the presence key; decoding turns server frames
//! into [`RemoteEvent`]s. There is no reconnect: socket loss ends the
//! subscription with `Closed`.

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::Subscription;
use crate::errors::AppError;
use crate::models::{Participant, PresenceMeta, RemoteEvent, Room, SubscriptionStatus};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const PROTOCOL_VERSION: &str = "1.0.0";
const HEARTBEAT_TOPIC: &str = "phoenix";

/// Where and how to reach the realtime socket.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Websocket endpoint without query string
    pub endpoint: String,
    pub api_key: Option<String>,
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    /// Derive the socket endpoint from the row API base URL.
    pub fn from_base_url(
        base_url: &str,
        api_key: Option<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        Self {
            endpoint: format!("{ws_base}/realtime/v1/websocket"),
            api_key,
            heartbeat_interval,
        }
    }

    fn socket_url(&self) -> String {
        match &self.api_key {
            Some(key) => format!(
                "{}?apikey={}&vsn={}",
                self.endpoint, key, PROTOCOL_VERSION
            ),
            None => format!("{}?vsn={}", self.endpoint, PROTOCOL_VERSION),
        }
    }
}

/// Wire frame of the channel protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default)]
    join_ref: Option<String>,
}

impl Frame {
    fn new(topic: &str, event: &str, payload: Value, reference: String, join_ref: Option<&str>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: join_ref.map(str::to_string),
        }
    }
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

/// Row change as delivered by the server. Both field spellings are accepted.
#[derive(Debug, Deserialize)]
struct PostgresChange {
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    kind: String,
    #[serde(alias = "new", default)]
    record: Option<Value>,
    #[serde(alias = "old", default)]
    old_record: Option<Value>,
}

fn topic_for(room_id: Uuid) -> String {
    format!("realtime:room:{room_id}")
}

fn join_frame(
    topic: &str,
    room_id: Uuid,
    presence_key: Uuid,
    access_token: Option<&str>,
    join_ref: &str,
) -> Frame {
    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": presence_key.to_string() },
            "postgres_changes": [
                {
                    "event": "*",
                    "schema": "public",
                    "table": "rooms",
                    "filter": format!("id=eq.{room_id}"),
                },
                {
                    "event": "*",
                    "schema": "public",
                    "table": "participants",
                    "filter": format!("room_id=eq.{room_id}"),
                },
            ],
        },
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    Frame::new(topic, "phx_join", payload, join_ref.to_string(), Some(join_ref))
}

fn presence_frame(topic: &str, action: &str, meta: Value, reference: String, join_ref: &str) -> Frame {
    Frame::new(
        topic,
        "presence",
        json!({ "type": "presence", "event": action, "payload": meta }),
        reference,
        Some(join_ref),
    )
}

/// Translate one server frame for `topic` into controller events.
fn decode_frame(frame: &Frame, topic: &str, join_ref: &str) -> Vec<RemoteEvent> {
    if frame.topic != topic {
        return Vec::new();
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            if status == Some("ok") {
                vec![RemoteEvent::Status(SubscriptionStatus::Subscribed)]
            } else {
                let reason = frame
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .or(status)
                    .unwrap_or("join rejected");
                vec![RemoteEvent::Status(SubscriptionStatus::Failed(
                    reason.to_string(),
                ))]
            }
        }
        "phx_error" => vec![RemoteEvent::Status(SubscriptionStatus::Failed(
            "channel error".to_string(),
        ))],
        "phx_close" => vec![RemoteEvent::Status(SubscriptionStatus::Closed)],
        "system" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                let message = frame
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("subscription error");
                vec![RemoteEvent::Status(SubscriptionStatus::Failed(
                    message.to_string(),
                ))]
            } else {
                Vec::new()
            }
        }
        "postgres_changes" => {
            let data = frame.payload.get("data").unwrap_or(&frame.payload);
            match serde_json::from_value::<PostgresChange>(data.clone()) {
                Ok(change) => decode_change(change).into_iter().collect(),
                Err(e) => {
                    tracing::warn!("Dropping undecodable change payload: {}", e);
                    Vec::new()
                }
            }
        }
        "presence_state" => {
            let participant_ids = presence_keys(&frame.payload);
            vec![RemoteEvent::PresenceSynced { participant_ids }]
        }
        "presence_diff" => {
            let joins = frame.payload.get("joins").map(presence_keys).unwrap_or_default();
            let leaves = frame.payload.get("leaves").map(presence_keys).unwrap_or_default();
            joins
                .into_iter()
                .map(|participant_id| RemoteEvent::PresenceJoined { participant_id })
                .chain(
                    leaves
                        .into_iter()
                        .map(|participant_id| RemoteEvent::PresenceLeft { participant_id }),
                )
                .collect()
        }
        _ => Vec::new(),
    }
}

fn decode_change(change: PostgresChange) -> Option<RemoteEvent> {
    let kind = change.kind.to_ascii_uppercase();
    match (change.table.as_str(), kind.as_str()) {
        ("rooms", "INSERT" | "UPDATE") => {
            parse_row::<Room>(change.record).map(RemoteEvent::RoomChanged)
        }
        ("participants", "INSERT") => {
            parse_row::<Participant>(change.record).map(RemoteEvent::ParticipantInserted)
        }
        ("participants", "UPDATE") => {
            parse_row::<Participant>(change.record).map(RemoteEvent::ParticipantUpdated)
        }
        ("participants", "DELETE") => change
            .old_record
            .as_ref()
            .and_then(|old| old.get("id"))
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(|id| RemoteEvent::ParticipantDeleted { id }),
        (table, kind) => {
            tracing::debug!(table, kind, "Ignoring change");
            None
        }
    }
}

fn parse_row<T: serde::de::DeserializeOwned>(record: Option<Value>) -> Option<T> {
    let record = record?;
    match serde_json::from_value(record) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!("Dropping undecodable row: {}", e);
            None
        }
    }
}

fn presence_keys(map: &Value) -> Vec<Uuid> {
    let mut keys: Vec<Uuid> = map
        .as_object()
        .map(|entries| {
            entries
                .keys()
                .filter_map(|key| Uuid::parse_str(key).ok())
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), AppError> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// Connect, join the room topic and spawn the channel task.
pub(super) async fn subscribe(
    config: &RealtimeConfig,
    room_id: Uuid,
    presence: PresenceMeta,
) -> Result<Subscription, AppError> {
    let (socket, _) = connect_async(config.socket_url()).await?;
    let (mut sink, mut stream) = socket.split();

    let topic = topic_for(room_id);
    let mut refs = RefCounter::default();
    let join_ref = refs.next();
    send_frame(
        &mut sink,
        &join_frame(
            &topic,
            room_id,
            presence.participant_id,
            config.api_key.as_deref(),
            &join_ref,
        ),
    )
    .await?;
    tracing::info!(%room_id, "Joining realtime channel");

    let meta = serde_json::to_value(&presence)?;
    let period = config.heartbeat_interval;
    let (tx, events) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut tracked = false;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    if tracked {
                        let untrack = presence_frame(&topic, "untrack", json!({}), refs.next(), &join_ref);
                        let _ = send_frame(&mut sink, &untrack).await;
                    }
                    let leave = Frame::new(&topic, "phx_leave", json!({}), refs.next(), Some(&join_ref));
                    let _ = send_frame(&mut sink, &leave).await;
                    let _ = sink.close().await;
                    break;
                }
                _ = heartbeat.tick() => {
                    let beat = Frame::new(HEARTBEAT_TOPIC, "heartbeat", json!({}), refs.next(), None);
                    if let Err(e) = send_frame(&mut sink, &beat).await {
                        tracing::warn!(%room_id, "Heartbeat failed: {}", e);
                        break;
                    }
                }
                message = stream.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::warn!(%room_id, "Realtime socket error: {}", e);
                            break;
                        }
                    };
                    let frame: Frame = match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("Dropping malformed realtime frame: {}", e);
                            continue;
                        }
                    };
                    for event in decode_frame(&frame, &topic, &join_ref) {
                        if event == RemoteEvent::Status(SubscriptionStatus::Subscribed) && !tracked {
                            let track = presence_frame(&topic, "track", meta.clone(), refs.next(), &join_ref);
                            match send_frame(&mut sink, &track).await {
                                Ok(()) => tracked = true,
                                Err(e) => tracing::warn!(%room_id, "Presence track failed: {}", e),
                            }
                        }
                        let _ = tx.send(event);
                    }
                }
            }
        }

        let _ = tx.send(RemoteEvent::Status(SubscriptionStatus::Closed));
        tracing::info!(%room_id, "Realtime channel closed");
    });

    Ok(Subscription::new(room_id, events, shutdown_tx, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "5f0e6a7c-1c1a-4d8b-9f4e-2d6f1b0c9a11";
    const ALICE: &str = "0d3f9a52-7e1b-4c6a-8f2d-9b1e4c7a5d30";
    const BOB: &str = "8a6c2e14-3b5d-4f7a-9c1e-6d2b8f4a0e57";

    fn room_id() -> Uuid {
        Uuid::parse_str(ROOM).unwrap()
    }

    fn server_frame(event: &str, payload: Value) -> Frame {
        Frame {
            topic: topic_for(room_id()),
            event: event.to_string(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    fn decode(frame: &Frame) -> Vec<RemoteEvent> {
        decode_frame(frame, &topic_for(room_id()), "1")
    }

    #[test]
    fn test_socket_url_from_base_url() {
        let config = RealtimeConfig::from_base_url(
            "https://demo.example.co/",
            Some("anon-key".to_string()),
            Duration::from_secs(25),
        );
        assert_eq!(
            config.socket_url(),
            "wss://demo.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );

        let local = RealtimeConfig::from_base_url("http://127.0.0.1:54321", None, Duration::from_secs(5));
        assert_eq!(
            local.socket_url(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?vsn=1.0.0"
        );
    }

    #[test]
    fn test_join_frame_registers_both_tables_and_presence_key() {
        let frame = join_frame(
            &topic_for(room_id()),
            room_id(),
            Uuid::parse_str(ALICE).unwrap(),
            Some("token"),
            "1",
        );
        assert_eq!(frame.event, "phx_join");
        assert_eq!(frame.reference.as_deref(), Some("1"));
        assert_eq!(frame.payload["config"]["presence"]["key"], ALICE);
        let filters = frame.payload["config"]["postgres_changes"]
            .as_array()
            .unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0]["filter"], format!("id=eq.{ROOM}"));
        assert_eq!(filters[1]["filter"], format!("room_id=eq.{ROOM}"));
        assert_eq!(frame.payload["access_token"], "token");

        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["ref"], "1");
        assert_eq!(wire["join_ref"], "1");
    }

    #[test]
    fn test_join_reply() {
        let mut ok = server_frame("phx_reply", json!({ "status": "ok", "response": {} }));
        ok.reference = Some("1".to_string());
        assert_eq!(
            decode(&ok),
            vec![RemoteEvent::Status(SubscriptionStatus::Subscribed)]
        );

        let mut rejected = server_frame(
            "phx_reply",
            json!({ "status": "error", "response": { "reason": "unauthorized" } }),
        );
        rejected.reference = Some("1".to_string());
        assert_eq!(
            decode(&rejected),
            vec![RemoteEvent::Status(SubscriptionStatus::Failed(
                "unauthorized".to_string()
            ))]
        );

        // Replies to anything but the join are not status changes.
        let mut heartbeat_reply = ok.clone();
        heartbeat_reply.reference = Some("7".to_string());
        assert!(decode(&heartbeat_reply).is_empty());
    }

    #[test]
    fn test_participant_insert_in_server_shape() {
        let frame = server_frame(
            "postgres_changes",
            json!({
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "participants",
                    "type": "INSERT",
                    "commit_timestamp": "2024-05-01T10:00:01Z",
                    "record": {
                        "id": BOB,
                        "room_id": ROOM,
                        "name": "Bob",
                        "vote": null,
                        "created_at": "2024-05-01T10:00:01+00:00"
                    },
                    "old_record": null
                }
            }),
        );
        match decode(&frame).as_slice() {
            [RemoteEvent::ParticipantInserted(p)] => {
                assert_eq!(p.name, "Bob");
                assert_eq!(p.vote, None);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_client_shape_update_and_delete() {
        let update = server_frame(
            "postgres_changes",
            json!({
                "data": {
                    "table": "participants",
                    "eventType": "UPDATE",
                    "new": {
                        "id": ALICE,
                        "room_id": ROOM,
                        "name": "Alice",
                        "vote": "8",
                        "created_at": "2024-05-01T10:00:00+00:00"
                    },
                    "old": { "id": ALICE }
                }
            }),
        );
        match decode(&update).as_slice() {
            [RemoteEvent::ParticipantUpdated(p)] => assert_eq!(p.vote.as_deref(), Some("8")),
            other => panic!("unexpected events {:?}", other),
        }

        let delete = server_frame(
            "postgres_changes",
            json!({
                "data": {
                    "table": "participants",
                    "type": "DELETE",
                    "record": {},
                    "old_record": { "id": ALICE }
                }
            }),
        );
        assert_eq!(
            decode(&delete),
            vec![RemoteEvent::ParticipantDeleted {
                id: Uuid::parse_str(ALICE).unwrap()
            }]
        );
    }

    #[test]
    fn test_room_update() {
        let frame = server_frame(
            "postgres_changes",
            json!({
                "data": {
                    "table": "rooms",
                    "type": "UPDATE",
                    "record": {
                        "id": ROOM,
                        "name": "Sprint",
                        "voting_system": "fibonacci",
                        "revealed": true,
                        "created_at": "2024-05-01T09:59:00+00:00"
                    }
                }
            }),
        );
        match decode(&frame).as_slice() {
            [RemoteEvent::RoomChanged(room)] => assert!(room.revealed),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_presence_state_and_diff() {
        let state = server_frame(
            "presence_state",
            json!({
                BOB: { "metas": [{ "phx_ref": "b" }] },
                ALICE: { "metas": [{ "phx_ref": "a" }] }
            }),
        );
        let mut expected = vec![Uuid::parse_str(ALICE).unwrap(), Uuid::parse_str(BOB).unwrap()];
        expected.sort();
        assert_eq!(
            decode(&state),
            vec![RemoteEvent::PresenceSynced {
                participant_ids: expected
            }]
        );

        let diff = server_frame(
            "presence_diff",
            json!({
                "joins": { BOB: { "metas": [] } },
                "leaves": { ALICE: { "metas": [] } }
            }),
        );
        assert_eq!(
            decode(&diff),
            vec![
                RemoteEvent::PresenceJoined {
                    participant_id: Uuid::parse_str(BOB).unwrap()
                },
                RemoteEvent::PresenceLeft {
                    participant_id: Uuid::parse_str(ALICE).unwrap()
                },
            ]
        );
    }

    #[test]
    fn test_other_topics_and_bad_payloads_are_ignored() {
        let mut foreign = server_frame("phx_close", json!({}));
        foreign.topic = "realtime:room:other".to_string();
        assert!(decode(&foreign).is_empty());

        let garbage = server_frame("postgres_changes", json!({ "data": { "table": 3 } }));
        assert!(decode(&garbage).is_empty());

        let bad_row = server_frame(
            "postgres_changes",
            json!({ "data": { "table": "participants", "type": "INSERT", "record": { "id": "nope" } } }),
        );
        assert!(decode(&bad_row).is_empty());
    }

    #[test]
    fn test_system_error() {
        let frame = server_frame(
            "system",
            json!({ "status": "error", "message": "replication slot unavailable" }),
        );
        assert_eq!(
            decode(&frame),
            vec![RemoteEvent::Status(SubscriptionStatus::Failed(
                "replication slot unavailable".to_string()
            ))]
        );
        assert!(decode(&server_frame("system", json!({ "status": "ok" }))).is_empty());
    }
}

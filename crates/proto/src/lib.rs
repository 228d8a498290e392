// Wire types for the presence service.
//
// Two surfaces share this crate:
//
// - The client protocol: self-describing JSON messages over the WebSocket,
//   tagged by a `type` field (`ClientMessage` inbound, `ServerMessage`
//   outbound).
// - The bus envelope: the JSON payload published on `status:<user_id>`
//   topics and fanned out to subscribed sockets.
//
// Everything here is plain serde; the gateway and the reaper never build
// JSON by hand.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use domain::{Status, UserId};

/// Messages a client may send over the socket. Unknown `type` tags fail to
/// deserialize and are answered with a `presence.error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "presence.heartbeat")]
    Heartbeat,
    #[serde(rename = "presence.away")]
    Away,
    #[serde(rename = "presence.active")]
    Active,
    #[serde(rename = "presence.subscribe")]
    Subscribe { target_user_id: UserId },
    #[serde(rename = "presence.unsubscribe")]
    Unsubscribe { target_user_id: UserId },
}

/// Effective status of one user at one instant, as sent in subscribe acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: Status,
    pub ts: i64,
}

/// Why a subscribe request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotMutual,
    TooManySubscriptions,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A status transition of a user the socket observes.
    #[serde(rename = "presence.status")]
    Status {
        user_id: UserId,
        status: Status,
        ts: i64,
    },
    /// Subscription authorized; carries a snapshot taken at ack time so late
    /// joiners do not wait for the next transition.
    #[serde(rename = "presence.subscribe.ack")]
    SubscribeAck {
        target_user_id: UserId,
        current: StatusSnapshot,
    },
    #[serde(rename = "presence.subscribe.denied")]
    SubscribeDenied {
        target_user_id: UserId,
        reason: DenyReason,
    },
    /// Protocol violation; the session continues.
    #[serde(rename = "presence.error")]
    Error { reason: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The payload published on the fanout bus for every observable transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub user_id: UserId,
    pub status: Status,
    pub ts: i64,
}

/// The only envelope kind the presence plane publishes today.
pub const KIND_STATUS_CHANGED: &str = "status_changed";

impl Envelope {
    pub fn status_changed(user_id: UserId, status: Status, ts: i64) -> Self {
        Self {
            kind: KIND_STATUS_CHANGED.to_string(),
            user_id,
            status,
            ts,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bus topic carrying one user's transitions.
pub fn status_topic(user: UserId) -> String {
    format!("status:{}", user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_by_type_tag() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"presence.heartbeat"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"presence.subscribe","target_user_id":7}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { target_user_id: 7 });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"presence.nope"}"#).is_err());
    }

    #[test]
    fn envelope_round_trip_preserves_all_fields() {
        let env = Envelope::status_changed(7, Status::Away, 1020);
        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(env, back);
        assert_eq!(back.kind, KIND_STATUS_CHANGED);
    }

    #[test]
    fn server_messages_carry_the_wire_type_tag() {
        let ack = ServerMessage::SubscribeAck {
            target_user_id: 7,
            current: StatusSnapshot {
                status: Status::Away,
                ts: 1020,
            },
        };
        let json = ack.to_json().unwrap();
        assert!(json.contains(r#""type":"presence.subscribe.ack""#));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(ack, back);

        let denied = ServerMessage::SubscribeDenied {
            target_user_id: 3,
            reason: DenyReason::NotMutual,
        };
        assert!(denied.to_json().unwrap().contains(r#""reason":"not_mutual""#));
    }
}

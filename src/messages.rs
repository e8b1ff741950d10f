use serde::{Deserialize, Serialize};

use crate::error::CareError;
use crate::models::{Consultation, Message, Role, UserId};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "send_message")]
    SendMessage {
        recipient_id: UserId,
        message: String,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        user_id: UserId,
        role: Role,
    },
    #[serde(rename = "receive_message")]
    ReceiveMessage(Message),
    #[serde(rename = "consultation_updated")]
    ConsultationUpdated {
        consultation: Consultation,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error {
        kind: String,
        message: String,
    },
}

impl From<&CareError> for ServerMessage {
    fn from(err: &CareError) -> Self {
        ServerMessage::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn parses_client_frames() {
        let frame = r#"{"type":"send_message","recipient_id":7,"message":"hi"}"#;
        let parsed: ClientMessage = serde_json::from_str(frame).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::SendMessage {
                recipient_id: 7,
                message: "hi".to_string()
            }
        );
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn receive_message_is_flat() {
        let frame = ServerMessage::ReceiveMessage(Message {
            id: 1,
            sender_id: 2,
            recipient_id: 3,
            body: "hello".to_string(),
            created_at: Utc::now(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "receive_message");
        assert_eq!(json["sender_id"], 2);
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn errors_carry_kind() {
        let frame = ServerMessage::from(&CareError::NotFound("user 9".into()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "not_found");
    }
}

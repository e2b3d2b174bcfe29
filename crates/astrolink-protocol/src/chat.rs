//! Chat payloads carried by both dialects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single chat message as delivered by the server.
///
/// Field names on the wire are camelCase; unknown or absent fields decode
/// to their defaults so a schema drift on the server side degrades to
/// empty values instead of a dropped message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessage {
    pub sender_id: i64,
    pub sender_name: String,
    pub association_id: i64,
    pub text: String,
    pub id: i64,
    pub date: i64,
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.sender_name, self.text)
    }
}

/// The legacy dialect wraps one or more messages in a named envelope:
/// `{"name":"chat","args":[{...},{...}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChatPayload {
    pub name: String,
    pub args: Vec<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_deserialize_camel_case_keys() {
        let json = r#"{"senderId":12345,"senderName":"Kelar","associationId":777,"text":"o7","id":98,"date":1621500000}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.sender_id, 12345);
        assert_eq!(msg.sender_name, "Kelar");
        assert_eq!(msg.association_id, 777);
        assert_eq!(msg.text, "o7");
        assert_eq!(msg.id, 98);
        assert_eq!(msg.date, 1621500000);
    }

    #[test]
    fn test_chat_message_missing_fields_default() {
        let msg: ChatMessage = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.sender_id, 0);
        assert_eq!(msg.sender_name, "");
    }

    #[test]
    fn test_chat_message_serialize_uses_camel_case() {
        let msg = ChatMessage {
            sender_id: 1,
            sender_name: "A".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""senderId":1"#));
        assert!(json.contains(r#""senderName":"A""#));
        assert!(json.contains(r#""associationId":0"#));
    }

    #[test]
    fn test_chat_payload_multiple_args() {
        let json = r#"{"name":"chat","args":[{"senderId":1,"text":"a"},{"senderId":2,"text":"b"}]}"#;
        let payload: ChatPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.name, "chat");
        assert_eq!(payload.args.len(), 2);
        assert_eq!(payload.args[0].text, "a");
        assert_eq!(payload.args[1].sender_id, 2);
    }

    #[test]
    fn test_chat_message_display() {
        let msg = ChatMessage {
            sender_name: "Kelar".into(),
            text: "fleet incoming".into(),
            ..Default::default()
        };
        assert_eq!(msg.to_string(), "[Kelar] fleet incoming");
    }
}

//! Live-connection frames.
//!
//! Frames are JSON text messages exchanged between the gateway and a browser
//! client. The `messageType` field selects the variant.

use serde::{Deserialize, Serialize};

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Post a message into a channel.
    SubmitMessage {
        /// Target channel.
        channel: String,
        /// Message text.
        message: String,
    },

    /// Switch the session's live subscription.
    ChangeChannel {
        /// Channel to switch to.
        channel: String,
    },

    /// Create a channel and switch to it.
    NewChannel {
        /// Requested channel name.
        #[serde(rename = "newChannel")]
        new_channel: String,
    },
}

impl ClientFrame {
    /// Wire name of the frame, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::SubmitMessage { .. } => "submitMessage",
            ClientFrame::ChangeChannel { .. } => "changeChannel",
            ClientFrame::NewChannel { .. } => "newChannel",
        }
    }
}

/// One stored message replayed into a client's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub account_id: String,
    pub content: String,
    pub timestamp: u64,
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ServerFrame {
    /// First frame on every connection.
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        channels: Vec<String>,
        #[serde(rename = "subscribedTo")]
        subscribed_to: String,
    },

    /// A live message on the subscribed channel.
    Message {
        #[serde(rename = "accountId")]
        account_id: String,
        content: String,
    },

    /// Stored messages for a channel, oldest first.
    History {
        channel: String,
        messages: Vec<HistoryEntry>,
    },

    /// Drop whatever the client currently displays.
    ClearHistory,

    /// A channel was created on the client's request.
    ChannelCreated { channel: String },

    /// The session's subscription moved.
    ChannelChanged { channel: String },

    /// A known channel was renamed.
    ChannelRenamed { from: String, to: String },

    /// Something the client asked for failed.
    Error { message: String },
}

impl ServerFrame {
    /// Create a live message frame.
    #[must_use]
    pub fn message(account_id: impl Into<String>, content: impl Into<String>) -> Self {
        ServerFrame::Message {
            account_id: account_id.into(),
            content: content.into(),
        }
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_wire_names() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "messageType": "newChannel",
            "newChannel": "bravo"
        }))
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::NewChannel {
                new_channel: "bravo".into()
            }
        );
        assert_eq!(frame.kind(), "newChannel");

        let frame: ClientFrame = serde_json::from_value(json!({
            "messageType": "submitMessage",
            "channel": "alpha",
            "message": "hi"
        }))
        .unwrap();
        assert_eq!(frame.kind(), "submitMessage");
    }

    #[test]
    fn test_server_message_shape() {
        let value = serde_json::to_value(ServerFrame::message("1", "hi")).unwrap();
        assert_eq!(
            value,
            json!({"messageType": "message", "accountId": "1", "content": "hi"})
        );

        let value = serde_json::to_value(ServerFrame::ClearHistory).unwrap();
        assert_eq!(value, json!({"messageType": "clearHistory"}));
    }

    #[test]
    fn test_unknown_client_frame_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_value(json!({"messageType": "deleteEverything"}));
        assert!(result.is_err());
    }
}

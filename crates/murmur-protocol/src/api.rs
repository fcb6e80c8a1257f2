//! HTTP request and response bodies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A numeric field that clients may send either as a JSON number or as a
/// decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    /// Interpret the value as an unsigned integer.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberOrString::Number(n) => write!(f, "{n}"),
            NumberOrString::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for NumberOrString {
    fn from(n: u64) -> Self {
        NumberOrString::Number(n)
    }
}

impl From<&str> for NumberOrString {
    fn from(s: &str) -> Self {
        NumberOrString::Text(s.to_string())
    }
}

/// `POST /sendMessage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub channel: String,
    pub account: NumberOrString,
    pub timestamp: NumberOrString,
    pub message: String,
}

/// Reply to an accepted `POST /sendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message_id: String,
}

/// `POST /createChannel` and `POST /deleteChannel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNameRequest {
    pub name: String,
}

/// Action envelope inside an update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAction {
    pub action: String,
    #[serde(default)]
    pub parameters: Vec<BTreeMap<String, String>>,
}

/// `POST /updateChannel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateChannelRequest {
    pub channel: String,
    #[serde(default)]
    pub account: Option<NumberOrString>,
    pub request: UpdateAction,
}

/// Query string of `GET /getChannel`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// A channel directory entry as returned over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelView {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "EndpointTopicARN")]
    pub endpoint_topic_arn: String,
    #[serde(rename = "QueueARN")]
    pub queue_arn: String,
    #[serde(rename = "TableARN")]
    pub table_arn: String,
    #[serde(rename = "SubscriptionARN")]
    pub subscription_arn: String,
}

/// Error body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_or_string() {
        let req: SendMessageRequest = serde_json::from_value(json!({
            "channel": "alpha",
            "account": "1",
            "timestamp": 1000,
            "message": "hi"
        }))
        .unwrap();
        assert_eq!(req.account.as_u64(), Some(1));
        assert_eq!(req.timestamp.as_u64(), Some(1000));

        assert_eq!(NumberOrString::from("12x").as_u64(), None);
        assert_eq!(NumberOrString::from("-1").as_u64(), None);
    }

    #[test]
    fn test_channel_view_field_names() {
        let view = ChannelView {
            id: 1,
            name: "alpha".into(),
            endpoint_topic_arn: "t".into(),
            queue_arn: "q".into(),
            table_arn: "d".into(),
            subscription_arn: "s".into(),
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["Name"], "alpha");
        assert_eq!(value["EndpointTopicARN"], "t");
        assert_eq!(value["QueueARN"], "q");
        assert_eq!(value["TableARN"], "d");
    }

    #[test]
    fn test_update_request_parameters() {
        let req: UpdateChannelRequest = serde_json::from_value(json!({
            "channel": "alpha",
            "account": "1",
            "request": {"action": "ChangeChannelName", "parameters": [{"name": "omega"}]}
        }))
        .unwrap();
        assert_eq!(req.request.action, "ChangeChannelName");
        assert_eq!(req.request.parameters[0]["name"], "omega");
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Terminates every JSON record; one frame may carry several.
pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const JOIN_TEST_RUN: &str = "JoinTestRun";
pub const LEAVE_TEST_RUN: &str = "LeaveTestRun";

const TYPE_INVOCATION: u8 = 1;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn json() -> Self {
        Self {
            protocol: "json".to_string(),
            version: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { target: String, arguments: Vec<Value> },
    Ping,
    Close { error: Option<String> },
    /// Completions, stream items and other record types the client ignores.
    Other(u8),
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct OutboundInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    target: &'a str,
    arguments: Vec<Value>,
}

#[derive(Debug)]
pub enum FrameError {
    Json(serde_json::Error),
    MissingTarget,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Json(err) => write!(f, "invalid hub record: {err}"),
            FrameError::MissingTarget => write!(f, "hub invocation without target"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Json(err)
    }
}

pub fn encode_record<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut record = serde_json::to_string(message)?;
    record.push(RECORD_SEPARATOR);
    Ok(record)
}

pub fn encode_handshake() -> Result<String, serde_json::Error> {
    encode_record(&HandshakeRequest::json())
}

pub fn encode_invocation(target: &str, arguments: Vec<Value>) -> Result<String, serde_json::Error> {
    encode_record(&OutboundInvocation {
        kind: TYPE_INVOCATION,
        target,
        arguments,
    })
}

pub fn encode_ping() -> Result<String, serde_json::Error> {
    encode_record(&serde_json::json!({ "type": TYPE_PING }))
}

pub fn split_records(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn parse_handshake(record: &str) -> Result<HandshakeResponse, FrameError> {
    Ok(serde_json::from_str(record)?)
}

pub fn parse_record(record: &str) -> Result<HubMessage, FrameError> {
    let raw: RawRecord = serde_json::from_str(record)?;
    match raw.kind {
        TYPE_INVOCATION => {
            let target = raw.target.ok_or(FrameError::MissingTarget)?;
            Ok(HubMessage::Invocation {
                target,
                arguments: raw.arguments,
            })
        }
        TYPE_PING => Ok(HubMessage::Ping),
        TYPE_CLOSE => Ok(HubMessage::Close { error: raw.error }),
        other => Ok(HubMessage::Other(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_is_terminated_by_separator() {
        let record = encode_invocation(JOIN_TEST_RUN, vec![json!("run-1")]).expect("encode");
        assert!(record.ends_with(RECORD_SEPARATOR));
        let body: Value = serde_json::from_str(record.trim_end_matches(RECORD_SEPARATOR))
            .expect("json");
        assert_eq!(
            body,
            json!({"type": 1, "target": "JoinTestRun", "arguments": ["run-1"]})
        );
    }

    #[test]
    fn one_frame_may_carry_several_records() {
        let frame = format!(
            "{}{}{}",
            encode_invocation("TestUpdate", vec![json!({"message": "a"})]).expect("a"),
            encode_ping().expect("ping"),
            encode_invocation("TestUpdate", vec![json!({"message": "b"})]).expect("b"),
        );
        let messages: Vec<HubMessage> = split_records(&frame)
            .map(|record| parse_record(record).expect("parse"))
            .collect();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], HubMessage::Ping);
        assert!(matches!(
            &messages[2],
            HubMessage::Invocation { target, .. } if target == "TestUpdate"
        ));
    }

    #[test]
    fn close_and_completion_records() {
        assert_eq!(
            parse_record(r#"{"type":7,"error":"server shutting down"}"#).expect("close"),
            HubMessage::Close {
                error: Some("server shutting down".to_string())
            }
        );
        assert_eq!(
            parse_record(r#"{"type":3,"invocationId":"1"}"#).expect("completion"),
            HubMessage::Other(3)
        );
        assert!(matches!(
            parse_record(r#"{"type":1,"arguments":[]}"#),
            Err(FrameError::MissingTarget)
        ));
        assert!(matches!(parse_record("{oops"), Err(FrameError::Json(_))));
    }

    #[test]
    fn handshake_round() {
        let request = encode_handshake().expect("handshake");
        assert_eq!(request, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert_eq!(parse_handshake("{}").expect("ok").error, None);
        assert_eq!(
            parse_handshake(r#"{"error":"unsupported"}"#)
                .expect("err")
                .error
                .as_deref(),
            Some("unsupported")
        );
    }
}

//! NIP-01 message codec.
//!
//! Client frames: `["EVENT", event]`, `["REQ", sub_id, filter]`,
//! `["CLOSE", sub_id]`. Relay frames: `["EVENT", sub_id, event]`,
//! `["EOSE", sub_id]`, `["OK", event_id, accepted, message]`,
//! `["NOTICE", message]`.

use serde_json::{json, Value};

use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::relay::filter::Filter;

/// Frame sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter]),
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Frame received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    /// Frame types the engine has no use for (AUTH, COUNT, ...).
    Unknown,
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let array = value
            .as_array()
            .ok_or_else(|| StreamError::PublishFailed(format!("non-array relay frame: {}", text)))?;
        let kind = array.first().and_then(Value::as_str).unwrap_or_default();

        match kind {
            "EVENT" if array.len() >= 3 => {
                let subscription_id = array[1].as_str().unwrap_or_default().to_string();
                let event: Event = serde_json::from_value(array[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "EOSE" if array.len() >= 2 => Ok(RelayMessage::Eose {
                subscription_id: array[1].as_str().unwrap_or_default().to_string(),
            }),
            "OK" if array.len() >= 3 => Ok(RelayMessage::Ok {
                event_id: array[1].as_str().unwrap_or_default().to_string(),
                accepted: array[2].as_bool().unwrap_or(false),
                message: array
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" if array.len() >= 2 => Ok(RelayMessage::Notice {
                message: array[1].as_str().unwrap_or_default().to_string(),
            }),
            _ => Ok(RelayMessage::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GENESIS;

    fn sample_event() -> Event {
        Event::new_text_note(
            "ab".repeat(32),
            GENESIS.to_string(),
            "hello".to_string(),
            1700000000,
        )
    }

    #[test]
    fn test_req_frame_shape() {
        let message = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filter: Filter::new().authors(vec!["p1".to_string()]),
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"["REQ","sub1",{"authors":["p1"]}]"#
        );
    }

    #[test]
    fn test_close_frame_shape() {
        let message = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };
        assert_eq!(message.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_event_frame_round_trip() {
        let event = sample_event();
        let frame = json!(["EVENT", "sub1", event]).to_string();
        match RelayMessage::from_json(&frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(parsed.content, "hello");
                assert_eq!(parsed.prev(), GENESIS);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_ok_and_eose_frames() {
        match RelayMessage::from_json(r#"["OK","e1",true,""]"#).unwrap() {
            RelayMessage::Ok {
                event_id, accepted, ..
            } => {
                assert_eq!(event_id, "e1");
                assert!(accepted);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose { .. }
        ));
    }

    #[test]
    fn test_unknown_frame_is_tolerated() {
        assert!(matches!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#).unwrap(),
            RelayMessage::Unknown
        ));
    }
}

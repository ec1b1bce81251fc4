//! Relay wire protocol.
//!
//! Frames are JSON arrays whose first element names the frame type:
//!
//! | direction       | frame                                   |
//! |-----------------|-----------------------------------------|
//! | client -> relay | `["EVENT", event]`                      |
//! | client -> relay | `["REQ", sub_id, filter, ...]`          |
//! | client -> relay | `["CLOSE", sub_id]`                     |
//! | relay -> client | `["EVENT", sub_id, event]`              |
//! | relay -> client | `["OK", event_id, accepted, message]`   |
//! | relay -> client | `["EOSE", sub_id]`                      |
//! | relay -> client | `["NOTICE", message]`                   |
//! | relay -> client | `["CLOSED", sub_id, message]`           |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::event::{Event, EventKind, TAG_GROUP};
use crate::types::{EventId, PublicKey};

/// Subscription filter. Tag constraints use the `#<tag>` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<EventKind>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<PublicKey>>,
    #[serde(rename = "#g", default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn pubkey(mut self, pubkey: PublicKey) -> Self {
        self.pubkeys.get_or_insert_with(Vec::new).push(pubkey);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.get_or_insert_with(Vec::new).push(group.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(pubkeys) = &self.pubkeys {
            if !pubkeys.iter().any(|pk| event.is_addressed_to(pk)) {
                return false;
            }
        }
        if let Some(groups) = &self.groups {
            if !event
                .tag_values(TAG_GROUP)
                .any(|g| groups.iter().any(|want| want == g))
            {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

/// Frames sent from the client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        Self::Event(Box::new(event))
    }

    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Event(event) => serde_json::json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            Self::Close(subscription_id) => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_array(text)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let event = element(&frame, 1)?;
                Ok(Self::Event(Box::new(serde_json::from_value(event.clone())?)))
            }
            "REQ" => {
                let subscription_id = string_at(&frame, 1)?;
                let filters = frame[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(Self::Close(string_at(&frame, 1)?)),
            other => Err(ProtocolError::UnknownFrame(other.to_string())),
        }
    }
}

/// Frames sent from a relay to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Eose(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            Self::Eose(subscription_id) => serde_json::json!(["EOSE", subscription_id]),
            Self::Notice(message) => serde_json::json!(["NOTICE", message]),
            Self::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_array(text)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1)?;
                let event: Event = serde_json::from_value(element(&frame, 2)?.clone())?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => {
                let event_id = EventId::from_hex(&string_at(&frame, 1)?)?;
                let accepted = element(&frame, 2)?
                    .as_bool()
                    .ok_or_else(|| ProtocolError::Malformed("OK flag is not a bool".into()))?;
                // The message is optional on some relays.
                let message = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(Self::Eose(string_at(&frame, 1)?)),
            "NOTICE" => Ok(Self::Notice(string_at(&frame, 1)?)),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&frame, 1)?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(ProtocolError::UnknownFrame(other.to_string())),
        }
    }
}

/// Build the `p`-tag filter for direct messages addressed to `recipient`.
pub fn direct_message_filter(recipient: &PublicKey) -> Filter {
    Filter::new()
        .kinds([EventKind::DirectMessage, EventKind::Reaction])
        .pubkey(*recipient)
}

fn parse_array(text: &str) -> Result<Vec<Value>, ProtocolError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        _ => Err(ProtocolError::Malformed("frame is not a JSON array".into())),
    }
}

fn frame_type(frame: &[Value]) -> Result<&str, ProtocolError> {
    frame
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing frame type".into()))
}

fn element(frame: &[Value], index: usize) -> Result<&Value, ProtocolError> {
    frame
        .get(index)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing element {index}")))
}

fn string_at(frame: &[Value], index: usize) -> Result<String, ProtocolError> {
    element(frame, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("element {index} is not a string")))
}

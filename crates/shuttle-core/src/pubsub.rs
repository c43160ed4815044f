use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::CellCoord;

/// Records requested per poll. Only the newest two feed the reconciler.
pub const SUBSCRIBE_NUM_RECORDS: usize = 4;

/// Body of `GET {pubsub}/subscribe`. Records are ordered newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubscribeResponse {
    #[serde(default)]
    pub records: Vec<PubSubRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PubSubRecord {
    /// Either a JSON-encoded string or an already-parsed object.
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMetadata {
    pub tray_id: Option<String>,
    pub slot_id: Option<String>,
}

/// One fully-defaulted action notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub row: i64,
    pub rack: i64,
    pub slot: i64,
    pub depth: i64,
    pub action: String,
    pub status: String,
    pub success: bool,
    pub metadata: EventMetadata,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Store,
    Retrieve,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
    Other,
}

impl DecodedEvent {
    pub fn cell(&self) -> CellCoord {
        CellCoord {
            row: self.row,
            rack: self.rack,
            slot: self.slot,
            depth: self.depth,
        }
    }

    pub fn operation(&self) -> Operation {
        match self.action.as_str() {
            "store" => Operation::Store,
            "retrieve" => Operation::Retrieve,
            _ => Operation::Other,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.status.as_str() {
            "start" => Phase::Start,
            "stop" => Phase::Stop,
            _ => Phase::Other,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawActionMessage {
    #[serde(default, deserialize_with = "deserialize_coord")]
    row: i64,
    #[serde(default, deserialize_with = "deserialize_coord")]
    rack: i64,
    #[serde(default, deserialize_with = "deserialize_coord")]
    slot: i64,
    #[serde(default, deserialize_with = "deserialize_coord")]
    depth: i64,
    #[serde(default, deserialize_with = "deserialize_label")]
    action: String,
    #[serde(default, deserialize_with = "deserialize_label")]
    status: String,
    #[serde(default = "default_success", deserialize_with = "deserialize_success")]
    success: bool,
    #[serde(default, deserialize_with = "deserialize_metadata")]
    metadata: EventMetadata,
}

fn default_success() -> bool {
    true
}

/// Coordinates arrive as integers, floats or numeric strings. Anything else is 0.
fn deserialize_coord<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.trunc() as i64))
                .unwrap_or(0)
        }
        _ => 0,
    })
}

fn deserialize_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(s) => s.trim().to_ascii_lowercase(),
        _ => String::new(),
    })
}

fn deserialize_success<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Bool(b) => b,
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "false" | "0" | "no"
        ),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    })
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<EventMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    let Value::Object(map) = val else {
        return Ok(EventMetadata::default());
    };
    Ok(EventMetadata {
        tray_id: map.get("tray_id").and_then(id_string),
        slot_id: map.get("slot_id").and_then(id_string),
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_updated_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decode one pub/sub record into an event with every field defaulted.
pub fn decode_record(record: &PubSubRecord) -> Result<DecodedEvent, DecodeError> {
    let parsed;
    let message = match &record.message {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw)
                .map_err(|err| DecodeError::MalformedMessage(err.to_string()))?;
            &parsed
        }
        other => other,
    };
    if !message.is_object() {
        return Err(DecodeError::MalformedMessage(format!(
            "expected object, got {}",
            value_kind(message)
        )));
    }
    let raw = RawActionMessage::deserialize(message)
        .map_err(|err| DecodeError::MalformedMessage(err.to_string()))?;
    Ok(DecodedEvent {
        row: raw.row,
        rack: raw.rack,
        slot: raw.slot,
        depth: raw.depth,
        action: raw.action,
        status: raw.status,
        success: raw.success,
        metadata: raw.metadata,
        updated_at: parse_updated_at(record.updated_at.as_deref()),
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The newest two decodable events of one poll response.
#[derive(Debug, Clone, Default)]
pub struct LatestEvents {
    pub first: Option<DecodedEvent>,
    pub second: Option<DecodedEvent>,
    pub errors: Vec<DecodeError>,
}

/// Decode `records[0]` and `records[1]`. A malformed record is skipped and
/// reported; if `records[0]` is malformed there is nothing to reconcile.
pub fn decode_latest(records: &[PubSubRecord]) -> LatestEvents {
    let mut latest = LatestEvents::default();
    let mut decode = |record: Option<&PubSubRecord>| -> Option<DecodedEvent> {
        match decode_record(record?) {
            Ok(event) => Some(event),
            Err(err) => {
                latest.errors.push(err);
                None
            }
        }
    };
    let first = decode(records.first());
    let second = decode(records.get(1));
    latest.first = first;
    latest.second = second;
    latest
}

/// `{api prefix}_{robot}` where the prefix is the lower-cased leading run of
/// alphanumerics in the configured API name.
pub fn topic_name(api_name: &str, robot_name: &str) -> Option<String> {
    let prefix: String = api_name
        .trim()
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    let robot = robot_name.trim();
    if prefix.is_empty() || robot.is_empty() {
        return None;
    }
    Some(format!("{prefix}_{robot}"))
}

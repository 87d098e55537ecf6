//! AMTP protocol messages.
//!
//! Defines the message envelope exchanged through the gateway, its
//! well-formedness rules, and the transport-neutral JSON form.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::PROTOCOL_VERSION;
use crate::error::{AmtpError, Result};

/// Fractional-second digits kept on timestamps (microseconds).
const MAX_FRACTION_DIGITS: usize = 6;

/// AMTP message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version
    #[serde(default = "default_version")]
    pub version: String,
    /// Unique message ID
    #[serde(default = "generate_message_id")]
    pub message_id: String,
    /// Key for de-duplicating repeated send attempts
    #[serde(default = "generate_idempotency_key")]
    pub idempotency_key: String,
    /// Creation time, microsecond precision
    #[serde(default = "now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Sender address (`agent@domain`)
    pub sender: String,
    /// Recipient addresses
    pub recipients: Vec<String>,
    /// Subject line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Structured payload; a JSON `null` is treated as absent
    #[serde(default, skip_serializing_if = "payload_is_absent")]
    pub payload: Option<Value>,
    /// Schema reference (`namespace:category.subcategory.vN`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// ID of the message this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Opaque headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    /// Opaque attachments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
}

impl Message {
    /// Create a message with fresh ID, idempotency key and timestamp.
    ///
    /// The message is not validated; call [`Message::validate`] or let the
    /// session do it on send.
    pub fn new<I>(sender: impl Into<String>, recipients: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            version: default_version(),
            message_id: generate_message_id(),
            idempotency_key: generate_idempotency_key(),
            timestamp: now(),
            sender: sender.into(),
            recipients: recipients.into_iter().map(Into::into).collect(),
            subject: None,
            payload: None,
            schema: None,
            in_reply_to: None,
            headers: None,
            attachments: None,
        }
    }

    /// Set the subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the payload (`null` clears it)
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Null => None,
            payload => Some(payload),
        };
        self
    }

    /// Set the schema reference
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Mark as a reply to another message
    pub fn with_in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(message_id.into());
        self
    }

    /// Set headers
    pub fn with_headers(mut self, headers: Map<String, Value>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Set attachments
    pub fn with_attachments(mut self, attachments: Vec<Value>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Check sender, recipients and schema reference.
    pub fn validate(&self) -> Result<()> {
        if self.sender.is_empty() {
            return Err(AmtpError::Validation(
                "Message must have a sender".to_string(),
            ));
        }

        if self.recipients.is_empty() {
            return Err(AmtpError::Validation(
                "Message must have at least one recipient".to_string(),
            ));
        }

        if let Some(bad) = self.recipients.iter().find(|r| !is_valid_address(r)) {
            return Err(AmtpError::Validation(format!(
                "Invalid recipient address: {bad}"
            )));
        }

        if !is_valid_address(&self.sender) {
            return Err(AmtpError::Validation(format!(
                "Invalid sender address: {}",
                self.sender
            )));
        }

        if let Some(schema) = &self.schema {
            if !is_valid_schema_ref(schema) {
                return Err(AmtpError::Validation(format!(
                    "Invalid schema format: {schema}"
                )));
            }
        }

        Ok(())
    }

    /// Build a reply draft addressed to this message's sender.
    ///
    /// The sender is left empty for the session to fill in.
    pub fn reply(&self, payload: Value, subject: Option<&str>) -> Message {
        let subject = match subject {
            Some(s) => s.to_string(),
            None => format!("Re: {}", self.subject.as_deref().unwrap_or("Message")),
        };

        Message::new("", [self.sender.clone()])
            .with_subject(subject)
            .with_payload(payload)
            .with_in_reply_to(&self.message_id)
    }

    /// Convert to the structured form sent over the wire
    pub fn to_transport(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse the structured wire form.
    ///
    /// Missing ID, idempotency key, version or timestamp are filled in;
    /// timestamps with more than microsecond precision are truncated.
    pub fn from_transport(value: &Value) -> Result<Self> {
        Ok(Message::deserialize(value)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialized size in bytes, as checked against the send quota
    pub fn size_bytes(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id: String = self.message_id.chars().take(8).collect();
        write!(
            f,
            "Message(id={}..., from={}, to={:?})",
            short_id, self.sender, self.recipients
        )
    }
}

/// Check an address has the form `agent@domain` with both parts non-empty.
pub fn is_valid_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((agent, domain)) => !agent.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// Loose check of a schema reference carried on a message.
pub fn is_valid_schema_ref(schema: &str) -> bool {
    schema.contains(':') && schema.contains('.')
}

/// The part of an address before `@` (the whole string if there is none).
pub fn local_part(address: &str) -> &str {
    address.split_once('@').map_or(address, |(local, _)| local)
}

/// Parse an ISO-8601 timestamp, truncating fractional seconds to microseconds.
///
/// Accepts `Z` or numeric offsets; a timestamp without an offset is read as UTC.
pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    let normalized = truncate_fraction(raw.trim());

    match DateTime::parse_from_rfc3339(&normalized) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

/// Format a timestamp the way it goes on the wire
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn truncate_fraction(raw: &str) -> Cow<'_, str> {
    // The date part never contains '.', so the first one starts the fraction.
    let Some(dot) = raw.find('.') else {
        return Cow::Borrowed(raw);
    };

    let digits = raw[dot + 1..]
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits <= MAX_FRACTION_DIGITS {
        return Cow::Borrowed(raw);
    }

    let keep = dot + 1 + MAX_FRACTION_DIGITS;
    let rest = dot + 1 + digits;
    Cow::Owned(format!("{}{}", &raw[..keep], &raw[rest..]))
}

fn payload_is_absent(payload: &Option<Value>) -> bool {
    matches!(payload, None | Some(Value::Null))
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn generate_idempotency_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(MAX_FRACTION_DIGITS as u16)
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .map_err(|e| de::Error::custom(format!("invalid timestamp '{raw}': {e}")))
    }
}

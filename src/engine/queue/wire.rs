use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::ProtocolError;

/// Version stamped into every envelope this build produces. Consumers accept
/// any `1.x` payload.
pub const PAYLOAD_SCHEMA_VERSION: &str = "1.0";

/// Partition key for a checkbox. Every action on the same checkbox carries
/// the same key, so the transport orders them relative to one another.
pub fn partition_key(checkbox_nbr: i64) -> String {
    format!("checkbox-{checkbox_nbr}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckboxAction {
    #[serde(rename = "checked")]
    Check,
    #[serde(rename = "unchecked")]
    Uncheck,
}

impl CheckboxAction {
    /// The checkbox state this action leaves behind.
    pub fn checked(self) -> bool {
        matches!(self, Self::Check)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Check => "checked",
            Self::Uncheck => "unchecked",
        }
    }
}

impl fmt::Display for CheckboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckboxAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checked" | "check" => Ok(Self::Check),
            "unchecked" | "uncheck" => Ok(Self::Uncheck),
            other => Err(format!("unknown checkbox action {other:?}")),
        }
    }
}

/// What a client asked for. Immutable once built; `request_uuid` doubles as
/// the transport deduplication id.
///
/// Identifiers travel as strings so that a malformed producer degrades to a
/// validation failure on the consumer rather than an undecodable body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct CheckboxActionPayload {
    pub action: CheckboxAction,
    pub checkbox_nbr: i64,
    #[builder(setter(transform = |id: Uuid| id.to_string()))]
    pub user_uuid: String,
    #[builder(setter(transform = |id: Uuid| id.to_string()))]
    pub request_uuid: String,
    #[builder(default = Utc::now())]
    pub request_time: DateTime<Utc>,
    #[builder(setter(into))]
    pub user_ip: String,
    #[builder(setter(into))]
    pub api_server: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub payload_schema_version: String,
    pub group_id: String,
    pub deduplication_id: String,
}

/// The envelope exchanged through the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxActionMessage {
    pub header: MessageHeader,
    pub payload: CheckboxActionPayload,
}

impl CheckboxActionMessage {
    pub fn new(payload: CheckboxActionPayload) -> Self {
        let header = MessageHeader {
            payload_schema_version: PAYLOAD_SCHEMA_VERSION.to_string(),
            group_id: partition_key(payload.checkbox_nbr),
            deduplication_id: payload.request_uuid.clone(),
        };
        Self { header, payload }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Checks the envelope against a store of `checkbox_count` checkboxes and
    /// parses its identifiers.
    pub fn validate(
        &self,
        checkbox_count: u32,
    ) -> Result<ValidatedAction, ProtocolError> {
        let version = &self.header.payload_schema_version;
        if version.split('.').next() != Some("1") {
            return Err(ProtocolError::SchemaVersion(version.clone()));
        }

        let payload = &self.payload;
        let nbr = payload.checkbox_nbr;
        if nbr < 0 || nbr >= i64::from(checkbox_count) {
            return Err(ProtocolError::CheckboxOutOfRange {
                nbr,
                count: checkbox_count,
            });
        }

        let expected_group = partition_key(nbr);
        if self.header.group_id != expected_group {
            return Err(ProtocolError::HeaderMismatch {
                field: "group_id",
                expected: expected_group,
                found: self.header.group_id.clone(),
            });
        }
        if self.header.deduplication_id != payload.request_uuid {
            return Err(ProtocolError::HeaderMismatch {
                field: "deduplication_id",
                expected: payload.request_uuid.clone(),
                found: self.header.deduplication_id.clone(),
            });
        }

        Ok(ValidatedAction {
            checkbox_nbr: nbr as u32,
            checked: payload.action.checked(),
            user_id: parse_uuid("user_uuid", &payload.user_uuid)?,
            request_id: parse_uuid("request_uuid", &payload.request_uuid)?,
            request_time: payload.request_time,
        })
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, ProtocolError> {
    Uuid::parse_str(value).map_err(|source| ProtocolError::InvalidUuid {
        field,
        value: value.to_string(),
        source,
    })
}

/// A decoded action whose identifiers have been parsed and whose checkbox
/// number is known to be in range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatedAction {
    pub checkbox_nbr: u32,
    pub checked: bool,
    pub user_id: Uuid,
    pub request_id: Uuid,
    pub request_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(nbr: i64) -> CheckboxActionPayload {
        CheckboxActionPayload::builder()
            .action(CheckboxAction::Check)
            .checkbox_nbr(nbr)
            .user_uuid(Uuid::now_v7())
            .request_uuid(Uuid::now_v7())
            .user_ip("127.0.0.1")
            .api_server("api1")
            .build()
    }

    #[test]
    fn envelope_keys_follow_checkbox() {
        let msg = CheckboxActionMessage::new(payload(42));
        assert_eq!(msg.header.group_id, "checkbox-42");
        assert_eq!(msg.header.deduplication_id, msg.payload.request_uuid);
        assert_eq!(msg.header.payload_schema_version, PAYLOAD_SCHEMA_VERSION);
    }

    #[test]
    fn body_uses_wire_field_names() {
        let body = CheckboxActionMessage::new(payload(3)).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["payload"]["action"], "checked");
        assert_eq!(value["payload"]["checkbox_nbr"], 3);
        assert_eq!(value["header"]["group_id"], "checkbox-3");
        assert!(value["payload"]["user_ip"].is_string());
        assert!(value["payload"]["api_server"].is_string());
    }

    #[test]
    fn validate_parses_identifiers() {
        let msg = CheckboxActionMessage::new(payload(9));
        let decoded =
            CheckboxActionMessage::decode(&msg.encode().unwrap()).unwrap();
        let action = decoded.validate(10).unwrap();
        assert_eq!(action.checkbox_nbr, 9);
        assert!(action.checked);
        assert_eq!(action.request_id.to_string(), msg.payload.request_uuid);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let msg = CheckboxActionMessage::new(payload(10));
        assert!(matches!(
            msg.validate(10),
            Err(ProtocolError::CheckboxOutOfRange { nbr: 10, count: 10 })
        ));
        let msg = CheckboxActionMessage::new(payload(-1));
        assert!(matches!(
            msg.validate(10),
            Err(ProtocolError::CheckboxOutOfRange { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_uuid() {
        let mut msg = CheckboxActionMessage::new(payload(1));
        msg.payload.user_uuid = "not-a-uuid".into();
        assert!(matches!(
            msg.validate(10),
            Err(ProtocolError::InvalidUuid {
                field: "user_uuid",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_foreign_partition() {
        let mut msg = CheckboxActionMessage::new(payload(1));
        msg.header.group_id = partition_key(2);
        assert!(matches!(
            msg.validate(10),
            Err(ProtocolError::HeaderMismatch {
                field: "group_id",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_unknown_major_version() {
        let mut msg = CheckboxActionMessage::new(payload(1));
        msg.header.payload_schema_version = "2.0".into();
        assert!(matches!(
            msg.validate(10),
            Err(ProtocolError::SchemaVersion(_))
        ));
    }

    #[test]
    fn garbage_body_is_codec_error() {
        assert!(matches!(
            CheckboxActionMessage::decode("{\"header\":"),
            Err(ProtocolError::Codec(_))
        ));
    }

    #[test]
    fn action_parses_both_spellings() {
        assert_eq!("check".parse::<CheckboxAction>(), Ok(CheckboxAction::Check));
        assert_eq!(
            "Unchecked".parse::<CheckboxAction>(),
            Ok(CheckboxAction::Uncheck)
        );
        assert!("toggle".parse::<CheckboxAction>().is_err());
    }
}

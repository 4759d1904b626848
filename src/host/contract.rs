//! Versioned host command/event envelopes for the update bridge.

use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Event carrying a [`crate::ProgressEvent`] for an in-flight request.
pub const EVENT_UPDATE_PROGRESS: &str = "update.progress";

/// Event emitted right before the process exits for a handoff.
pub const EVENT_APP_EXITING: &str = "app.exiting";

/// Command set for host integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "host.version")]
    HostVersion,
    #[serde(rename = "update.check")]
    UpdateCheck,
    #[serde(rename = "update.download")]
    UpdateDownload,
    #[serde(rename = "update.run_updater")]
    UpdateRunUpdater,
    #[serde(rename = "app.exit")]
    AppExit,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::HostVersion => "host.version",
            Self::UpdateCheck => "update.check",
            Self::UpdateDownload => "update.download",
            Self::UpdateRunUpdater => "update.run_updater",
            Self::AppExit => "app.exit",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host.ping" => Some(Self::HostPing),
            "host.version" => Some(Self::HostVersion),
            "update.check" => Some(Self::UpdateCheck),
            "update.download" => Some(Self::UpdateDownload),
            "update.run_updater" => Some(Self::UpdateRunUpdater),
            "app.exit" => Some(Self::AppExit),
            _ => None,
        }
    }

    /// Commands doing network or disk work. They are routed on a blocking
    /// thread so the command loop keeps answering.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::UpdateCheck | Self::UpdateDownload | Self::UpdateRunUpdater
        )
    }
}

/// A versioned response envelope from backend host -> frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned command envelope from frontend -> backend host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A versioned event envelope from backend host -> frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_round_trip_wire_format() {
        for name in [
            CommandName::HostPing,
            CommandName::HostVersion,
            CommandName::UpdateCheck,
            CommandName::UpdateDownload,
            CommandName::UpdateRunUpdater,
            CommandName::AppExit,
        ] {
            assert_eq!(CommandName::parse(name.as_str()), Some(name));
            let json = serde_json::to_value(name).expect("serialize in test");
            assert_eq!(json, serde_json::Value::String(name.as_str().to_owned()));
        }
        assert_eq!(CommandName::parse("runtime.start"), None);
    }

    #[test]
    fn only_update_work_is_blocking() {
        assert!(CommandName::UpdateDownload.is_blocking());
        assert!(CommandName::UpdateCheck.is_blocking());
        assert!(!CommandName::AppExit.is_blocking());
        assert!(!CommandName::HostPing.is_blocking());
    }

    #[test]
    fn validate_rejects_bad_envelopes() {
        let mut envelope = CommandEnvelope::new("", CommandName::HostPing, serde_json::json!({}));
        let err = envelope.validate().err();
        assert_eq!(err.map(|e| e.kind), Some(ContractErrorKind::InvalidEnvelope));

        envelope.request_id = "req-1".into();
        envelope.v = 2;
        let err = envelope.validate().err();
        assert_eq!(err.map(|e| e.kind), Some(ContractErrorKind::UnsupportedVersion));
    }

    #[test]
    fn payload_may_be_omitted() {
        let parsed: CommandEnvelope =
            serde_json::from_str(r#"{"v":1,"request_id":"r","command":"app.exit"}"#)
                .expect("deserialize in test");
        assert_eq!(parsed.command, CommandName::AppExit);
        assert!(parsed.payload.is_null());
    }
}

//! Protocol message definitions
//!
//! Defines the JSON messages exchanged on the terminal and notification
//! channels. Every message carries a `type` tag in snake_case.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::{ActivityState, StateChangeEvent};

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from a terminal client to the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes for the session
    Input {
        /// Raw input forwarded to the attach process
        data: String,
    },

    /// New client terminal geometry
    Resize {
        /// Terminal width in columns
        cols: u16,
        /// Terminal height in rows
        rows: u16,
    },
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Input { data } => {
                if data.len() > MAX_INPUT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "input exceeds maximum length of {} bytes",
                        MAX_INPUT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::Resize { cols, rows } => {
                if *cols == 0 || *cols > MAX_TERMINAL_COLS {
                    return Err(ProtocolError::ValidationError(format!(
                        "cols must be between 1 and {}",
                        MAX_TERMINAL_COLS
                    )));
                }
                if *rows == 0 || *rows > MAX_TERMINAL_ROWS {
                    return Err(ProtocolError::ValidationError(format!(
                        "rows must be between 1 and {}",
                        MAX_TERMINAL_ROWS
                    )));
                }
                Ok(())
            }
        }
    }

    /// Create an Input message
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    /// Create a Resize message
    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize { cols, rows }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Encoding of an output payload that is not plain text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    Base64,
}

/// Messages sent from the gateway to a terminal client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session is attached and streaming
    Ready {
        /// Session name
        session: String,
    },

    /// Ask the client to report its geometry
    RequestResize,

    /// Terminal output
    Output {
        /// UTF-8 text, or base64 when `encoding` says so
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<OutputEncoding>,
    },

    /// Attach failure
    Error {
        /// Human-readable error message
        message: String,
    },

    /// The attach process exited; final message
    Exit {
        /// Exit code of the attach process
        code: i32,
    },

    /// Another client took over the session; final message
    Replaced {
        /// Reason for the replacement
        message: String,
    },
}

impl ServerMessage {
    /// Create a Ready message
    pub fn ready(session: impl Into<String>) -> Self {
        ServerMessage::Ready {
            session: session.into(),
        }
    }

    /// Create a text Output message
    pub fn output_text(data: impl Into<String>) -> Self {
        ServerMessage::Output {
            data: data.into(),
            encoding: None,
        }
    }

    /// Create a base64 Output message
    pub fn output_base64(data: impl Into<String>) -> Self {
        ServerMessage::Output {
            data: data.into(),
            encoding: Some(OutputEncoding::Base64),
        }
    }

    /// Create an Error message
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Create an Exit message
    pub fn exit(code: i32) -> Self {
        ServerMessage::Exit { code }
    }

    /// Create a Replaced message
    pub fn replaced(message: impl Into<String>) -> Self {
        ServerMessage::Replaced {
            message: message.into(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Messages on the notification channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Snapshot of all monitored sessions, sent first
    InitialStates {
        states: BTreeMap<String, ActivityState>,
    },

    /// One state transition
    AgentStateChange(StateChangeEvent),
}

impl Notification {
    /// Serialize the notification to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_input_parsing() {
        let msg = ClientMessage::from_json(r#"{"type":"input","data":"ls\r"}"#).unwrap();
        assert_eq!(msg, ClientMessage::input("ls\r"));
    }

    #[test]
    fn test_resize_parsing() {
        let msg = ClientMessage::from_json(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ClientMessage::resize(120, 40));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = ClientMessage::from_json(r#"{"type":"spawn","data":"x"}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_missing_field_rejected() {
        let result = ClientMessage::from_json(r#"{"type":"resize","cols":80}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_resize_invalid_cols() {
        let result = ClientMessage::resize(0, 24).validate();
        assert!(matches!(result, Err(ProtocolError::ValidationError(_))));
        let result = ClientMessage::resize(MAX_TERMINAL_COLS + 1, 24).validate();
        assert!(matches!(result, Err(ProtocolError::ValidationError(_))));
    }

    #[test]
    fn test_resize_invalid_rows() {
        let result = ClientMessage::resize(80, 0).validate();
        assert!(matches!(result, Err(ProtocolError::ValidationError(_))));
        let result = ClientMessage::resize(80, MAX_TERMINAL_ROWS + 1).validate();
        assert!(matches!(result, Err(ProtocolError::ValidationError(_))));
    }

    #[test]
    fn test_resize_max_dimensions() {
        assert!(ClientMessage::resize(MAX_TERMINAL_COLS, MAX_TERMINAL_ROWS)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_input_max_length() {
        let long = "x".repeat(MAX_INPUT_LENGTH + 1);
        assert!(ClientMessage::input(long).validate().is_err());
        assert!(ClientMessage::input("x".repeat(MAX_INPUT_LENGTH))
            .validate()
            .is_ok());
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ready_serialization() {
        let json = ServerMessage::ready("dev").to_json().unwrap();
        assert_eq!(json, r#"{"type":"ready","session":"dev"}"#);
    }

    #[test]
    fn test_request_resize_serialization() {
        let json = ServerMessage::RequestResize.to_json().unwrap();
        assert_eq!(json, r#"{"type":"request_resize"}"#);
    }

    #[test]
    fn test_text_output_omits_encoding() {
        let json = ServerMessage::output_text("hi").to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi"}"#);
    }

    #[test]
    fn test_base64_output_serialization() {
        let json = ServerMessage::output_base64("/w==").to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"/w==","encoding":"base64"}"#);
    }

    #[test]
    fn test_terminal_messages_serialization() {
        assert_eq!(
            ServerMessage::exit(0).to_json().unwrap(),
            r#"{"type":"exit","code":0}"#
        );
        assert_eq!(
            ServerMessage::replaced("gone").to_json().unwrap(),
            r#"{"type":"replaced","message":"gone"}"#
        );
        assert_eq!(
            ServerMessage::error("Session not found: dev").to_json().unwrap(),
            r#"{"type":"error","message":"Session not found: dev"}"#
        );
    }

    // -------------------------------------------------------------------------
    // Notification Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_initial_states_serialization() {
        let mut states = BTreeMap::new();
        states.insert("build".to_string(), ActivityState::Idle);
        states.insert("dev".to_string(), ActivityState::Busy);

        let json = Notification::InitialStates { states }.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"initial_states","states":{"build":"idle","dev":"busy"}}"#
        );
    }

    #[test]
    fn test_state_change_is_flattened() {
        let timestamp = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let event = StateChangeEvent::new(
            "dev",
            ActivityState::Stopped,
            ActivityState::Busy,
            timestamp,
        );

        let json = Notification::AgentStateChange(event.clone())
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "agent_state_change");
        assert_eq!(value["sessionId"], "dev");
        assert_eq!(value["sessionName"], "dev");
        assert_eq!(value["state"], "stopped");
        assert_eq!(value["previousState"], "busy");
        assert_eq!(value["timestamp"], "2026-01-02T03:04:05Z");

        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Notification::AgentStateChange(event));
    }
}

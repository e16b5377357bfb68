//! Wire contract between a rendering host and the avatar engine.
//!
//! Every message is one JSON object per line. Hosts send commands, the
//! engine answers each with exactly one response carrying the same
//! `request_id`, and pushes events whenever avatar state changes.

use serde::{Deserialize, Serialize};

/// Version stamped on every envelope.
pub const CONTRACT_VERSION: u32 = 1;

macro_rules! commands {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Commands understood by the host bridge.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum CommandName {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl CommandName {
            /// Every command, in wire order.
            pub const ALL: &'static [CommandName] = &[$(Self::$variant),+];

            /// Wire name, e.g. `reply.speak`.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }

            /// Look up a command by wire name.
            #[must_use]
            pub fn parse(raw: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|c| c.as_str() == raw)
            }
        }
    };
}

commands! {
    HostPing => "host.ping",
    HostVersion => "host.version",
    ModelLoad => "model.load",
    ModelUnload => "model.unload",
    ReplySpeak => "reply.speak",
    SpeechCancel => "speech.cancel",
    EmotionSet => "emotion.set",
    FrameSnapshot => "frame.snapshot",
    RuntimeStop => "runtime.stop",
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope rejected before routing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("unsupported contract version {got}; expected {expected}")]
    UnsupportedVersion { got: u32, expected: u32 },
    #[error("request_id cannot be empty")]
    MissingRequestId,
}

/// Host to engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Check the version and request id.
    ///
    /// # Errors
    ///
    /// Returns the first [`ContractError`] found.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != CONTRACT_VERSION {
            return Err(ContractError::UnsupportedVersion {
                got: self.v,
                expected: CONTRACT_VERSION,
            });
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::MissingRequestId);
        }
        Ok(())
    }
}

/// Engine answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Unsolicited engine notification, named like `speech.start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: CONTRACT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

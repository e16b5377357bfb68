//! Backend dispatch with automatic fallback.
//!
//! [`Dispatcher`] is a pure state machine. Callers feed it requests
//! (`speak`, `cancel`) and session-tagged [`BackendEvent`]s; it answers with
//! [`Effect`]s to execute (start or cancel a backend) and notifications to
//! publish. It never touches a backend itself, so every transition is
//! testable without one.
//!
//! ```text
//! Idle ──speak──▶ Dispatching ──ready/start──▶ Playing ──end──▶ Ended
//!                     │  ▲                        │
//!                     │  └──── remote error ◀─────┤   (retry on local)
//!                     └──────── local error ──────┴──▶ Failed
//! ```

pub mod language;

use crate::backend::{BackendEvent, BackendKind, BackendSignal, SessionId};
use crate::config::DispatchConfig;
use language::classify_language;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Identity of one caller-visible utterance.
///
/// Stable across a fallback retry, unlike [`SessionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UtteranceId(u64);

impl UtteranceId {
    /// Raw utterance number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "utterance-{}", self.0)
    }
}

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Dispatching,
    Playing,
    Ended,
    Failed,
}

impl DispatchPhase {
    /// Whether an utterance is in flight.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Dispatching | Self::Playing)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Playing => "playing",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

/// Why an utterance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Playback finished naturally.
    Completed,
    /// Cancelled by the caller or superseded by a new utterance.
    Cancelled,
    /// The local backend failed; no fallback remains.
    Failed(String),
}

impl EndReason {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Lifecycle notifications for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Speech became audible. Emitted once per utterance, even across a
    /// fallback.
    SpeakStart {
        utterance: UtteranceId,
        backend: BackendKind,
    },
    /// Playback reached a character offset.
    Boundary {
        utterance: UtteranceId,
        offset: usize,
        length: usize,
    },
    /// The utterance is over. Emitted exactly once per utterance.
    SpeakEnd {
        utterance: UtteranceId,
        reason: EndReason,
    },
    /// The remote voice failed and the local backend took over.
    Fallback {
        utterance: UtteranceId,
        from: BackendKind,
        reason: String,
    },
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start `backend` speaking `text` under `session`.
    Start {
        backend: BackendKind,
        session: SessionId,
        text: String,
    },
    /// Stop `session` on `backend`.
    Cancel {
        backend: BackendKind,
        session: SessionId,
    },
    /// Publish a notification.
    Notify(Notification),
}

#[derive(Debug, Clone)]
struct ActiveUtterance {
    utterance: UtteranceId,
    session: SessionId,
    backend: BackendKind,
    text: String,
    started: bool,
}

/// Backend selection and lifecycle state machine.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    remote_language: String,
    remote_enabled: bool,
    phase: DispatchPhase,
    active: Option<ActiveUtterance>,
    next_session: u64,
    next_utterance: u64,
}

impl Dispatcher {
    /// Create an idle dispatcher.
    #[must_use]
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            remote_language: config.remote_language.clone(),
            remote_enabled: config.remote_enabled,
            phase: DispatchPhase::Idle,
            active: None,
            next_session: 1,
            next_utterance: 1,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> DispatchPhase {
        self.phase
    }

    /// Utterance in flight, if any.
    #[must_use]
    pub fn active_utterance(&self) -> Option<UtteranceId> {
        self.active.as_ref().map(|a| a.utterance)
    }

    /// Current session and backend, if any.
    #[must_use]
    pub fn active_session(&self) -> Option<(SessionId, BackendKind)> {
        self.active.as_ref().map(|a| (a.session, a.backend))
    }

    /// Backend that `speak(text)` would choose.
    #[must_use]
    pub fn select_backend(&self, text: &str) -> BackendKind {
        if self.remote_enabled && classify_language(text).code() == self.remote_language {
            BackendKind::Remote
        } else {
            BackendKind::Local
        }
    }

    /// Begin a new utterance, terminating any utterance still in flight.
    pub fn speak(&mut self, text: &str) -> (UtteranceId, Vec<Effect>) {
        let mut effects = self.cancel();

        let utterance = UtteranceId(self.next_utterance);
        self.next_utterance += 1;
        let session = self.allocate_session();
        let backend = self.select_backend(text);
        info!(%utterance, %session, backend = backend.as_str(), "dispatching speech");

        self.active = Some(ActiveUtterance {
            utterance,
            session,
            backend,
            text: text.to_owned(),
            started: false,
        });
        self.phase = DispatchPhase::Dispatching;
        effects.push(Effect::Start {
            backend,
            session,
            text: text.to_owned(),
        });
        (utterance, effects)
    }

    /// Cancel the utterance in flight.
    ///
    /// Emits `SpeakEnd` and returns to `Idle`. A no-op when nothing is in
    /// flight.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let Some(active) = self.active.take() else {
            return Vec::new();
        };
        info!(utterance = %active.utterance, session = %active.session, "speech cancelled");
        self.phase = DispatchPhase::Idle;
        vec![
            Effect::Cancel {
                backend: active.backend,
                session: active.session,
            },
            Effect::Notify(Notification::SpeakEnd {
                utterance: active.utterance,
                reason: EndReason::Cancelled,
            }),
        ]
    }

    /// Apply one backend event.
    ///
    /// Events from any session other than the current one are ignored.
    pub fn handle(&mut self, event: &BackendEvent) -> Vec<Effect> {
        let Some(active) = self.active.as_mut() else {
            debug!(session = %event.session, signal = ?event.signal, "ignoring event with no active speech");
            return Vec::new();
        };
        if active.session != event.session || active.backend != event.backend {
            debug!(
                session = %event.session,
                current = %active.session,
                signal = ?event.signal,
                "ignoring stale backend event"
            );
            return Vec::new();
        }

        match &event.signal {
            BackendSignal::Ready | BackendSignal::Started => self.mark_started(),
            BackendSignal::Boundary { offset, length } => {
                let mut effects = self.mark_started();
                if let Some(active) = &self.active {
                    effects.push(Effect::Notify(Notification::Boundary {
                        utterance: active.utterance,
                        offset: *offset,
                        length: *length,
                    }));
                }
                effects
            }
            BackendSignal::Ended => {
                let Some(active) = self.active.take() else {
                    return Vec::new();
                };
                info!(utterance = %active.utterance, "speech completed");
                self.phase = DispatchPhase::Ended;
                vec![Effect::Notify(Notification::SpeakEnd {
                    utterance: active.utterance,
                    reason: EndReason::Completed,
                })]
            }
            BackendSignal::Error(reason) => self.fail(reason),
        }
    }

    /// A backend refused to start `session` synchronously.
    pub fn start_failed(&mut self, session: SessionId, reason: &str) -> Vec<Effect> {
        match &self.active {
            Some(active) if active.session == session => self.fail(reason),
            _ => Vec::new(),
        }
    }

    fn mark_started(&mut self) -> Vec<Effect> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        self.phase = DispatchPhase::Playing;
        if active.started {
            return Vec::new();
        }
        active.started = true;
        vec![Effect::Notify(Notification::SpeakStart {
            utterance: active.utterance,
            backend: active.backend,
        })]
    }

    fn fail(&mut self, reason: &str) -> Vec<Effect> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };

        match active.backend {
            BackendKind::Remote => {
                let failed_session = active.session;
                let session = self.allocate_session();
                let Some(active) = self.active.as_mut() else {
                    return Vec::new();
                };
                warn!(
                    utterance = %active.utterance,
                    failed = %failed_session,
                    retry = %session,
                    reason,
                    "remote voice failed; falling back to local"
                );
                active.session = session;
                active.backend = BackendKind::Local;
                self.phase = DispatchPhase::Dispatching;
                vec![
                    Effect::Cancel {
                        backend: BackendKind::Remote,
                        session: failed_session,
                    },
                    Effect::Notify(Notification::Fallback {
                        utterance: active.utterance,
                        from: BackendKind::Remote,
                        reason: reason.to_owned(),
                    }),
                    Effect::Start {
                        backend: BackendKind::Local,
                        session,
                        text: active.text.clone(),
                    },
                ]
            }
            BackendKind::Local => {
                let utterance = active.utterance;
                error!(%utterance, reason, "local speech backend failed");
                self.active = None;
                self.phase = DispatchPhase::Failed;
                vec![Effect::Notify(Notification::SpeakEnd {
                    utterance,
                    reason: EndReason::Failed(reason.to_owned()),
                })]
            }
        }
    }

    fn allocate_session(&mut self) -> SessionId {
        let session = SessionId::new(self.next_session);
        self.next_session += 1;
        session
    }
}

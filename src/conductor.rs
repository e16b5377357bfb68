//! Drives speech backends from dispatcher effects.
//!
//! [`SpeechConductor`] owns the [`AvatarSync`] engine, the backends and the
//! channel they report on. Everything runs on the caller's task: events are
//! pulled with [`SpeechConductor::next_event`] (or drained with
//! [`SpeechConductor::pump`]) and applied one at a time in delivery order.

use crate::backend::{
    AudioSink, BackendEvent, BackendKind, EventSink, PacedLocalBackend, RemoteVoiceBackend,
    SpeechBackend,
};
use crate::config::SyncConfig;
use crate::dispatch::{Effect, UtteranceId};
use crate::engine::AvatarSync;
use crate::error::{Result, SyncError};
use crate::reply::Reply;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Executes dispatcher effects against real backends.
pub struct SpeechConductor {
    sync: AvatarSync,
    local: Box<dyn SpeechBackend>,
    remote: Option<Box<dyn SpeechBackend>>,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl std::fmt::Debug for SpeechConductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechConductor")
            .field("sync", &self.sync)
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl SpeechConductor {
    /// Assemble a conductor from an engine and backends.
    ///
    /// Without a remote backend, speech routed to the remote voice falls
    /// back to local immediately.
    pub fn new(
        sync: AvatarSync,
        local: Box<dyn SpeechBackend>,
        remote: Option<Box<dyn SpeechBackend>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(
            local = local.kind().as_str(),
            remote = remote.as_ref().map(|r| r.kind().as_str()),
            "speech conductor ready"
        );
        Self {
            sync,
            local,
            remote,
            events_tx,
            events_rx,
        }
    }

    /// Build the standard backends from config. Both voices play through
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the remote voice settings are
    /// invalid.
    pub fn from_config(config: &SyncConfig, sink: Arc<dyn AudioSink>) -> Result<Self> {
        let local: Box<dyn SpeechBackend> = Box::new(PacedLocalBackend::with_audio(
            &config.local,
            Arc::clone(&sink),
        ));
        let remote: Option<Box<dyn SpeechBackend>> = if config.dispatch.remote_enabled {
            Some(Box::new(RemoteVoiceBackend::new(config.remote.clone(), sink)?))
        } else {
            None
        };
        Ok(Self::new(AvatarSync::new(config), local, remote))
    }

    /// The engine.
    #[must_use]
    pub fn sync(&self) -> &AvatarSync {
        &self.sync
    }

    /// The engine, mutably (model loading, emotion, frames).
    pub fn sync_mut(&mut self) -> &mut AvatarSync {
        &mut self.sync
    }

    /// Speak a reply, superseding anything in flight.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BackendUnavailable`] if no backend could even
    /// start.
    pub fn speak(&mut self, reply: Reply) -> Result<UtteranceId> {
        let (utterance, effects) = self.sync.submit(reply);
        self.execute(effects)?;
        Ok(utterance)
    }

    /// Cancel the utterance in flight.
    pub fn cancel(&mut self) {
        let effects = self.sync.cancel();
        // Cancelling never starts a backend, so this cannot fail.
        if let Err(e) = self.execute(effects) {
            warn!(error = %e, "unexpected failure while cancelling speech");
        }
    }

    /// Wait for the next backend event.
    ///
    /// Never returns `None` while the conductor is alive, since it holds a
    /// sender itself.
    pub async fn next_event(&mut self) -> Option<BackendEvent> {
        self.events_rx.recv().await
    }

    /// Apply one backend event and execute what follows from it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BackendUnavailable`] when the local backend
    /// failed.
    pub fn handle_event(&mut self, event: &BackendEvent) -> Result<()> {
        let effects = self.sync.on_backend_event(event)?;
        self.execute(effects)
    }

    /// Apply every event already queued. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns the last [`SyncError::BackendUnavailable`] seen; later events
    /// are still applied.
    pub fn pump(&mut self) -> Result<usize> {
        let mut applied = 0;
        let mut outcome = Ok(());
        while let Ok(event) = self.events_rx.try_recv() {
            if let Err(e) = self.handle_event(&event) {
                outcome = Err(e);
            }
            applied += 1;
        }
        outcome.map(|()| applied)
    }

    fn execute(&mut self, effects: Vec<Effect>) -> Result<()> {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut outcome = Ok(());
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Start {
                    backend,
                    session,
                    text,
                } => {
                    let events = self.events_tx.clone();
                    let started = match self.backend_mut(backend) {
                        Some(b) => b.start(session, &text, events),
                        None => Err(SyncError::BackendTransient(format!(
                            "{} backend is not configured",
                            backend.as_str()
                        ))),
                    };
                    if let Err(e) = started {
                        warn!(%session, backend = backend.as_str(), error = %e, "backend failed to start");
                        match self.sync.on_start_failed(session, &e.to_string()) {
                            Ok(more) => queue.extend(more),
                            Err(e) => outcome = Err(e),
                        }
                    }
                }
                Effect::Cancel { backend, session } => {
                    if let Some(b) = self.backend_mut(backend) {
                        b.cancel(session);
                    }
                }
                // Already applied by the engine.
                Effect::Notify(_) => {}
            }
        }
        outcome
    }

    fn backend_mut(&mut self, kind: BackendKind) -> Option<&mut (dyn SpeechBackend + 'static)> {
        match kind {
            BackendKind::Local => Some(self.local.as_mut()),
            BackendKind::Remote => self.remote.as_deref_mut(),
        }
    }
}

//! Kuchipaku: speech-to-expression synchronization for avatars.
//!
//! Drives a character's mouth and emotion shapes in step with synthesized
//! speech:
//!
//! Reply → Dispatcher → Backend → boundary events → Timing adapter →
//! Viseme resolver → Blend engine → Idle corrector → renderer
//!
//! # Architecture
//!
//! - **Timing** ([`timing`], [`viseme`]): folds boundary offsets and timed
//!   units into one playback state and resolves the active viseme.
//! - **Blending** ([`blend`]): mouth and emotion channels, each mutually
//!   exclusive, evaluated once per frame.
//! - **Dispatch** ([`dispatch`], [`backend`]): picks a speech backend by
//!   language and falls back to the local voice when the remote one fails.
//! - **Audio** ([`audio`]): WAV decoding and speaker playback for both
//!   voices.
//! - **Idle motion** ([`idle`]): arm rest pose, blinking and breathing,
//!   reapplied every frame.
//! - **Facade** ([`engine`], [`conductor`]): wires the above together on a
//!   single task; [`host`] exposes it over a JSON stdio protocol.

pub mod app_dirs;
pub mod audio;
pub mod backend;
pub mod blend;
pub mod conductor;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod host;
pub mod idle;
pub mod model;
pub mod reply;
pub mod runtime;
pub mod sentiment;
pub mod timing;
pub mod viseme;

pub use conductor::SpeechConductor;
pub use config::SyncConfig;
pub use engine::{AvatarSync, FrameOutput};
pub use error::{Result, SyncError};
pub use model::CharacterModel;
pub use reply::Reply;
pub use runtime::AvatarEvent;

//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `KUCHIPAKU_CONFIG_DIR` overrides [`config_dir`]
//! - `KUCHIPAKU_DATA_DIR` overrides [`data_dir`]
//! - `KUCHIPAKU_LOG_DIR` overrides [`logs_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Resolves to `dirs::data_dir()/kuchipaku/` by default.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KUCHIPAKU_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("kuchipaku"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kuchipaku-data"))
}

/// Application config directory (holds `config.toml`).
///
/// Resolves to `dirs::config_dir()/kuchipaku/` by default.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KUCHIPAKU_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("kuchipaku"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kuchipaku-config"))
}

/// Log file directory (`data_dir()/logs/` unless overridden).
#[must_use]
pub fn logs_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KUCHIPAKU_LOG_DIR") {
        return PathBuf::from(override_dir);
    }
    data_dir().join("logs")
}

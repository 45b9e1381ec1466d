//! Error types for the A2DP profile daemon.
//!
//! The connection state machine itself never fails: every protocol-level
//! problem is resolved locally. The variants here cover the outer seams
//! (configuration, D-Bus, BlueZ and the profile actor's inbox).

use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum A2dpError {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Unknown codec: {0}")]
   UnknownCodec(String),

   #[error("Native stack rejected codec preference")]
   CodecPreferenceRejected,

   #[error("Profile has been shut down")]
   ProfileShutdown,

   #[error("Failed to inhibit sleep: {0}")]
   WakeLock(#[source] zbus::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `A2dpError`.
pub type Result<T> = std::result::Result<T, A2dpError>;

//! Error types for the link manager.
//!
//! Synchronous rejections (validation, busy transfer engine, configuration)
//! are reported through [`LinkError`]. Failures reported later by the host
//! stack never surface here; they reach the registered handlers as a
//! [`GattStatus`](crate::transport::GattStatus).

use smol_str::SmolStr;
use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the link manager.
#[derive(Error, Debug)]
pub enum LinkError {
   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0:?}")]
   InvalidAddress(SmolStr),

   #[error("Packet length must be greater than zero")]
   InvalidPacketLength,

   #[error("Transfer payload is empty")]
   EmptyPayload,

   #[error("Invalid MTU {0}: must be greater than 20")]
   InvalidMtu(u16),

   #[error("Transport refused to issue {0}")]
   TransportIssue(&'static str),

   #[error("Another chunked transfer is already running")]
   TransferBusy,

   #[error("Background task panicked: {0}")]
   TaskPanicked(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl LinkError {
   /// Whether the error is a synchronous validation rejection.
   pub const fn is_validation(&self) -> bool {
      matches!(
         self,
         Self::InvalidAddress(_) | Self::InvalidPacketLength | Self::EmptyPayload | Self::InvalidMtu(_)
      )
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;

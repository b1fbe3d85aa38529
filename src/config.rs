//! Configuration management for the link manager.
//!
//! This module handles loading and saving configuration from disk,
//! including channel identifiers, timing parameters and known devices.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   address::Address,
   error::{LinkError, Result},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_connect_timeout_ms")]
   pub connect_timeout_ms: u64,

   /// Whether links are opened with the host stack's auto-reconnect flag and
   /// retried by the reconnect policy.
   #[serde(default)]
   pub auto_connect: bool,

   #[serde(default = "default_retry_count")]
   pub connect_retry_count: u32,

   /// Upper bound on the wait for a write acknowledgement in auto-pace mode.
   #[serde(default = "default_auto_pace_timeout_ms")]
   pub auto_pace_timeout_ms: u64,

   #[serde(default = "default_transfer_pool_size")]
   pub transfer_pool_size: usize,

   #[serde(default = "default_true")]
   pub enable_notify_on_ready: bool,

   #[serde(default)]
   pub channels: ChannelConfig,
}

/// Identifiers used to classify discovered channels.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
   #[serde(default = "default_service")]
   pub service: Uuid,

   #[serde(default)]
   pub extra_services: Vec<Uuid>,

   #[serde(default = "default_write_channel")]
   pub write: Option<Uuid>,

   #[serde(default)]
   pub read: Option<Uuid>,
}

/// Represents a known peripheral.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: Address,
   pub name: SmolStr,
}

const fn default_connect_timeout_ms() -> u64 {
   10_000
}

const fn default_retry_count() -> u32 {
   3
}

const fn default_auto_pace_timeout_ms() -> u64 {
   500
}

const fn default_transfer_pool_size() -> usize {
   2
}

const fn default_true() -> bool {
   true
}

const fn default_service() -> Uuid {
   Uuid::from_u128(0x0000fee9_0000_1000_8000_00805f9b34fb)
}

const fn default_write_channel() -> Option<Uuid> {
   Some(Uuid::from_u128(0xd44bc439_abfd_45a2_b575_925416129600))
}

impl Default for ChannelConfig {
   fn default() -> Self {
      Self {
         service: default_service(),
         extra_services: vec![],
         write: default_write_channel(),
         read: None,
      }
   }
}

impl ChannelConfig {
   /// Whether `uuid` names the primary service or one of the extra services.
   pub fn is_wanted_service(&self, uuid: &Uuid) -> bool {
      self.service == *uuid || self.extra_services.contains(uuid)
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         connect_timeout_ms: default_connect_timeout_ms(),
         auto_connect: false,
         connect_retry_count: default_retry_count(),
         auto_pace_timeout_ms: default_auto_pace_timeout_ms(),
         transfer_pool_size: default_transfer_pool_size(),
         enable_notify_on_ready: true,
         channels: ChannelConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there first if
   /// the file does not exist.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("GATTLINK_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("gattlink").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn auto_pace_timeout(&self) -> Duration {
      Duration::from_millis(self.auto_pace_timeout_ms)
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: Address) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_from_empty_file() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.connect_timeout(), Duration::from_secs(10));
      assert_eq!(config.auto_pace_timeout(), Duration::from_millis(500));
      assert_eq!(config.connect_retry_count, 3);
      assert!(config.enable_notify_on_ready);
      assert!(!config.auto_connect);
      assert_eq!(config.channels, ChannelConfig::default());
   }

   #[test]
   fn test_load_creates_default_then_roundtrips() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let mut config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert!(config.known_devices.is_empty());

      config.known_devices.push(KnownDevice {
         address: "AA:BB:CC:DD:EE:01".parse().unwrap(),
         name: "sensor".into(),
      });
      config.channels.read = Some(Uuid::from_u128(7));
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.known_devices, config.known_devices);
      assert_eq!(loaded.channels.read, Some(Uuid::from_u128(7)));
      assert_eq!(
         loaded.is_known_device("AA:BB:CC:DD:EE:01".parse().unwrap()),
         Some("sensor")
      );
   }

   #[test]
   fn test_rejects_bad_address() {
      let text = r#"
         [[known_devices]]
         address = "not-an-address"
         name = "x"
      "#;
      assert!(toml::from_str::<Config>(text).is_err());
   }

   #[test]
   fn test_wanted_service() {
      let mut channels = ChannelConfig::default();
      let extra = Uuid::from_u128(42);
      assert!(channels.is_wanted_service(&default_service()));
      assert!(!channels.is_wanted_service(&extra));
      channels.extra_services.push(extra);
      assert!(channels.is_wanted_service(&extra));
   }
}

//! Per-device connection state.

use serde::Serialize;
use serde_json::json;

use crate::address::Address;

/// Connection lifecycle of a single device.
///
/// `Disconnected → Connecting → Connected → Ready`, with `Connecting →
/// Disconnected` on timeout or failure and `Connected | Ready →
/// Disconnected` on link loss.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Ready,
}

impl ConnectionState {
   /// Whether a link is established (channel handles may be valid).
   pub const fn is_linked(self) -> bool {
      matches!(self, Self::Connected | Self::Ready)
   }

   /// Whether a connect attempt is pending or has succeeded.
   pub const fn is_active(self) -> bool {
      !matches!(self, Self::Disconnected)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Snapshot of a known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
   pub address: Address,
   pub state: ConnectionState,
   pub auto_reconnect: bool,
}

impl DeviceInfo {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.to_string(),
         "state": self.state.to_str(),
         "auto_reconnect": self.auto_reconnect,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_state_predicates() {
      assert!(!ConnectionState::Disconnected.is_active());
      assert!(ConnectionState::Connecting.is_active());
      assert!(!ConnectionState::Connecting.is_linked());
      assert!(ConnectionState::Connected.is_linked());
      assert!(ConnectionState::Ready.is_linked());
      assert_eq!(ConnectionState::Ready.to_string(), "ready");
   }

   #[test]
   fn test_info_json() {
      let info = DeviceInfo {
         address: Address::new([0xAA, 0, 0, 0, 0, 1]),
         state: ConnectionState::Connecting,
         auto_reconnect: true,
      };
      let value = info.to_json();
      assert_eq!(value["address"], "AA:00:00:00:00:01");
      assert_eq!(value["state"], "connecting");
      assert_eq!(value["auto_reconnect"], true);
   }
}

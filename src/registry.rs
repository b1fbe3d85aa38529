//! Per-device channel handles.
//!
//! After service discovery the exposed channels are classified against the
//! configured write/read ids and notify capability. The resulting handles
//! live here until the device disconnects.

use std::collections::HashMap;

use log::debug;

use crate::{
   address::Address,
   config::ChannelConfig,
   notify::NotifySequencer,
   transport::{Channel, Service},
};

/// Channels picked out of a discovered service list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
   /// Whether the primary service (or an extra one) was present.
   pub matched_service: bool,
   pub write: Option<Channel>,
   pub read: Option<Channel>,
   pub notify: Vec<Channel>,
}

/// Classifies `services` against `config`. Channels of other services, and
/// channels matching no role, are ignored. Pure, so rerunning it on the same
/// input yields the same handle set.
pub fn classify(services: &[Service], config: &ChannelConfig) -> Classification {
   let mut out = Classification::default();
   for service in services {
      if !config.is_wanted_service(&service.uuid) {
         debug!("Skipping service {}", service.uuid);
         continue;
      }
      out.matched_service = true;

      for channel in &service.channels {
         if config.write == Some(channel.uuid) && out.write.is_none() {
            out.write = Some(channel.clone());
         }
         if config.read == Some(channel.uuid) && out.read.is_none() {
            out.read = Some(channel.clone());
         }
         if channel.properties.is_notifiable() && !out.notify.contains(channel) {
            out.notify.push(channel.clone());
         }
      }
   }
   out
}

/// Routing state of one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceChannels {
   pub write: Option<Channel>,
   pub read: Option<Channel>,
   pub notify: NotifySequencer,
}

/// Channel handles of every linked device.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
   devices: HashMap<Address, DeviceChannels>,
}

impl ChannelRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Installs the handles of a fresh classification, replacing whatever the
   /// device had before and resetting its notification queue.
   pub fn install(&mut self, address: Address, classification: Classification) -> &mut DeviceChannels {
      let entry = self.devices.entry(address).or_default();
      entry.write = classification.write;
      entry.read = classification.read;
      entry.notify.reset(classification.notify);
      entry
   }

   pub fn get(&self, address: Address) -> Option<&DeviceChannels> {
      self.devices.get(&address)
   }

   pub fn get_mut(&mut self, address: Address) -> Option<&mut DeviceChannels> {
      self.devices.get_mut(&address)
   }

   pub fn write_channel(&self, address: Address) -> Option<&Channel> {
      self.devices.get(&address)?.write.as_ref()
   }

   pub fn read_channel(&self, address: Address) -> Option<&Channel> {
      self.devices.get(&address)?.read.as_ref()
   }

   /// Drops every handle of `address`. Returns whether there were any.
   pub fn release(&mut self, address: Address) -> bool {
      self.devices.remove(&address).is_some()
   }

   pub fn clear(&mut self) {
      self.devices.clear();
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }
}

#[cfg(test)]
mod tests {
   use uuid::Uuid;

   use super::*;
   use crate::transport::Properties;

   const WRITE: Uuid = Uuid::from_u128(0x100);
   const READ: Uuid = Uuid::from_u128(0x101);

   fn channel(service: Uuid, uuid: Uuid, handle: u16, properties: Properties) -> Channel {
      Channel {
         service,
         uuid,
         service_handle: 1,
         handle,
         properties,
      }
   }

   fn config() -> ChannelConfig {
      ChannelConfig {
         service: Uuid::from_u128(0xfee9),
         extra_services: vec![Uuid::from_u128(0xfeea)],
         write: Some(WRITE),
         read: Some(READ),
      }
   }

   fn services() -> Vec<Service> {
      let primary = Uuid::from_u128(0xfee9);
      let extra = Uuid::from_u128(0xfeea);
      let other = Uuid::from_u128(0x180f);
      vec![
         Service {
            uuid: other,
            handle: 1,
            channels: vec![channel(other, Uuid::from_u128(0x2a19), 2, Properties::NOTIFY)],
         },
         Service {
            uuid: primary,
            handle: 10,
            channels: vec![
               channel(primary, WRITE, 11, Properties::WRITE | Properties::NOTIFY),
               channel(primary, READ, 12, Properties::READ),
               channel(primary, Uuid::from_u128(0x102), 13, Properties::INDICATE | Properties::NOTIFY),
               channel(primary, Uuid::from_u128(0x103), 14, Properties::READ),
            ],
         },
         Service {
            uuid: extra,
            handle: 20,
            channels: vec![channel(extra, Uuid::from_u128(0x200), 21, Properties::INDICATE)],
         },
      ]
   }

   #[test]
   fn test_classify_roles() {
      let result = classify(&services(), &config());
      assert!(result.matched_service);
      assert_eq!(result.write.as_ref().map(|c| c.handle), Some(11));
      assert_eq!(result.read.as_ref().map(|c| c.handle), Some(12));
      let notify: Vec<_> = result.notify.iter().map(|c| c.handle).collect();
      // Foreign-service channels are ignored, a NOTIFY|INDICATE channel is
      // queued once.
      assert_eq!(notify, vec![11, 13, 21]);
   }

   #[test]
   fn test_classify_idempotent() {
      let services = services();
      assert_eq!(classify(&services, &config()), classify(&services, &config()));
   }

   #[test]
   fn test_classify_without_wanted_service() {
      let mut cfg = config();
      cfg.service = Uuid::from_u128(0xdead);
      cfg.extra_services.clear();
      let result = classify(&services(), &cfg);
      assert!(!result.matched_service);
      assert!(result.write.is_none() && result.read.is_none() && result.notify.is_empty());
   }

   #[test]
   fn test_install_and_release() {
      let address = Address::new([9; 6]);
      let mut registry = ChannelRegistry::new();
      registry.install(address, classify(&services(), &config()));
      assert_eq!(registry.write_channel(address).map(|c| c.uuid), Some(WRITE));
      assert_eq!(registry.get(address).unwrap().notify.channels().len(), 3);

      // Reinstalling replaces rather than accumulates.
      registry.install(address, classify(&services(), &config()));
      assert_eq!(registry.get(address).unwrap().notify.channels().len(), 3);
      assert_eq!(registry.len(), 1);

      assert!(registry.release(address));
      assert!(registry.write_channel(address).is_none());
      assert!(registry.read_channel(address).is_none());
      assert!(!registry.release(address));
      assert!(registry.is_empty());
   }
}

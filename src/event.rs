//! Consumer-facing events.
//!
//! The built-in request handlers translate router callbacks into
//! [`BleEvent`]s and hand them to an [`EventBus`] supplied by the
//! application.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{address::Address, device::ConnectionState, transport::GattStatus};

/// Events that can be emitted by the link manager.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
   ConnectionChanged {
      address: Address,
      state: ConnectionState,
   },
   ConnectTimeout {
      address: Address,
   },
   ConnectFailed {
      address: Address,
      status: GattStatus,
   },
   ServicesDiscovered {
      address: Address,
   },
   Ready {
      address: Address,
   },
   NotificationsArmed {
      address: Address,
   },
   NotificationsDisarmed {
      address: Address,
   },
   NotifyFailed {
      address: Address,
      status: GattStatus,
   },
   ValueChanged {
      address: Address,
      channel: Uuid,
      value: Vec<u8>,
   },
   ReadCompleted {
      address: Address,
      channel: Uuid,
      value: Vec<u8>,
   },
   ReadFailed {
      address: Address,
      channel: Uuid,
      status: GattStatus,
   },
   WriteCompleted {
      address: Address,
      channel: Uuid,
   },
   WriteFailed {
      address: Address,
      channel: Uuid,
      status: GattStatus,
   },
   MtuChanged {
      address: Address,
      mtu: u16,
      status: GattStatus,
   },
   RssiRead {
      address: Address,
      rssi: i16,
      status: GattStatus,
   },
   AdapterStateChanged {
      powered: bool,
   },
}

impl BleEvent {
   pub const fn address(&self) -> Option<Address> {
      match self {
         Self::ConnectionChanged { address, .. }
         | Self::ConnectTimeout { address }
         | Self::ConnectFailed { address, .. }
         | Self::ServicesDiscovered { address }
         | Self::Ready { address }
         | Self::NotificationsArmed { address }
         | Self::NotificationsDisarmed { address }
         | Self::NotifyFailed { address, .. }
         | Self::ValueChanged { address, .. }
         | Self::ReadCompleted { address, .. }
         | Self::ReadFailed { address, .. }
         | Self::WriteCompleted { address, .. }
         | Self::WriteFailed { address, .. }
         | Self::MtuChanged { address, .. }
         | Self::RssiRead { address, .. } => Some(*address),
         Self::AdapterStateChanged { .. } => None,
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BleEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

impl EventBus for mpsc::UnboundedSender<BleEvent> {
   fn emit(&self, event: BleEvent) {
      // A closed receiver only means nobody is listening anymore.
      let _ = self.send(event);
   }
}

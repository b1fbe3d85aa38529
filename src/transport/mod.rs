//! Host Bluetooth stack interface.
//!
//! The link manager never talks to a radio directly. It issues operations
//! through [`Transport`] and receives their completions, link-state changes
//! and value notifications as [`TransportEvent`]s pushed into an
//! [`EventSink`] (normally an [`EventQueue`] drained by the manager's
//! dispatcher task).

use std::{
   fmt,
   ops::BitOr,
   sync::Arc,
   time::Duration,
};

use crossbeam::queue::SegQueue;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{address::Address, error::Result};

#[cfg(feature = "bluez")]
pub mod bluez;
#[cfg(test)]
pub(crate) mod mock;

/// Opaque handle to an open link, allocated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

/// Status code carried by completion events. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GattStatus(pub u16);

impl GattStatus {
   pub const SUCCESS: Self = Self(0x0000);
   /// Generic failure, as reported by stacks that do not expose a code.
   pub const FAILURE: Self = Self(0x0101);

   pub const fn is_success(self) -> bool {
      self.0 == Self::SUCCESS.0
   }
}

impl fmt::Display for GattStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}", self.0)
   }
}

/// Declared capability flags of a channel (GATT characteristic properties).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Properties(u8);

impl Properties {
   pub const READ: Self = Self(0x02);
   pub const WRITE_NO_RESPONSE: Self = Self(0x04);
   pub const WRITE: Self = Self(0x08);
   pub const NOTIFY: Self = Self(0x10);
   pub const INDICATE: Self = Self(0x20);

   pub const fn from_bits(bits: u8) -> Self {
      Self(bits)
   }

   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn contains(self, other: Self) -> bool {
      self.0 & other.0 == other.0
   }

   /// Whether the channel can push value changes once armed.
   pub const fn is_notifiable(self) -> bool {
      self.0 & (Self::NOTIFY.0 | Self::INDICATE.0) != 0
   }
}

impl BitOr for Properties {
   type Output = Self;

   fn bitor(self, rhs: Self) -> Self {
      Self(self.0 | rhs.0)
   }
}

/// A device-exposed data endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
   pub service: Uuid,
   pub uuid: Uuid,
   /// Transport-specific id of the owning service.
   pub service_handle: u16,
   /// Transport-specific id of the channel itself.
   pub handle: u16,
   pub properties: Properties,
}

/// A discovered service and the channels it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
   pub uuid: Uuid,
   pub handle: u16,
   pub channels: Vec<Channel>,
}

/// Asynchronous notifications from the host stack.
///
/// Events that drive the connection state machine carry the link they were
/// produced on, so results from a link that has since been closed can be
/// told apart from those of a newer link to the same device.
#[derive(Debug, Clone)]
pub enum TransportEvent {
   LinkStateChanged {
      address: Address,
      link: LinkHandle,
      connected: bool,
      status: GattStatus,
   },
   ChannelsDiscovered {
      address: Address,
      link: LinkHandle,
      services: Vec<Service>,
      status: GattStatus,
   },
   ChannelWritten {
      address: Address,
      channel: Channel,
      status: GattStatus,
   },
   ChannelRead {
      address: Address,
      channel: Channel,
      value: Vec<u8>,
      status: GattStatus,
   },
   ChannelChanged {
      address: Address,
      channel: Channel,
      value: Vec<u8>,
   },
   DescriptorWritten {
      address: Address,
      link: LinkHandle,
      channel: Channel,
      enabled: bool,
      status: GattStatus,
   },
   MtuChanged {
      address: Address,
      mtu: u16,
      status: GattStatus,
   },
   SignalStrengthRead {
      address: Address,
      rssi: i16,
      status: GattStatus,
   },
   AdapterStateChanged {
      powered: bool,
   },
}

impl TransportEvent {
   /// The device the event concerns, if any.
   pub const fn address(&self) -> Option<Address> {
      match self {
         Self::LinkStateChanged { address, .. }
         | Self::ChannelsDiscovered { address, .. }
         | Self::ChannelWritten { address, .. }
         | Self::ChannelRead { address, .. }
         | Self::ChannelChanged { address, .. }
         | Self::DescriptorWritten { address, .. }
         | Self::MtuChanged { address, .. }
         | Self::SignalStrengthRead { address, .. } => Some(*address),
         Self::AdapterStateChanged { .. } => None,
      }
   }

   /// The link the event was produced on, for events tied to one.
   pub const fn link(&self) -> Option<LinkHandle> {
      match self {
         Self::LinkStateChanged { link, .. }
         | Self::ChannelsDiscovered { link, .. }
         | Self::DescriptorWritten { link, .. } => Some(*link),
         _ => None,
      }
   }
}

/// Operations offered by the host Bluetooth stack.
///
/// Every method must return promptly: the boolean results only say whether
/// the operation was issued. Completions arrive later as [`TransportEvent`]s.
pub trait Transport: Send + Sync {
   /// Opens a link to `address`. Link-up or failure is reported through a
   /// [`TransportEvent::LinkStateChanged`].
   fn open_link(&self, address: Address, auto_reconnect: bool) -> Result<LinkHandle>;

   /// Releases the link. No further events are expected for it.
   fn close_link(&self, link: LinkHandle);

   fn discover_channels(&self, link: LinkHandle) -> bool;

   fn write_channel(&self, link: LinkHandle, channel: &Channel, value: &[u8]) -> bool;

   fn read_channel(&self, link: LinkHandle, channel: &Channel) -> bool;

   fn set_notify(&self, link: LinkHandle, channel: &Channel, enabled: bool) -> bool;

   fn read_signal_strength(&self, link: LinkHandle) -> bool;

   fn request_mtu(&self, link: LinkHandle, mtu: u16) -> bool;
}

/// Receiver of transport events.
pub trait EventSink: Send + Sync {
   fn push(&self, event: TransportEvent);
}

/// Shared handle to an event sink.
pub type EventSinkRef = Arc<dyn EventSink>;

/// Lock-free queue of inbound transport events.
///
/// Transports push from any thread; a single consumer drains it in order.
#[derive(Debug, Default)]
pub struct EventQueue {
   queue: SegQueue<TransportEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Waits for the next event. Returns `None` once every other handle to
   /// the queue has been dropped and the queue is empty.
   pub async fn recv(self: &Arc<Self>) -> Option<TransportEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn try_recv(&self) -> Option<TransportEvent> {
      self.queue.pop()
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }
}

impl EventSink for EventQueue {
   fn push(&self, event: TransportEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

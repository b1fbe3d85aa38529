//! Callback routing for transport events.
//!
//! The manager never holds concrete references to the code that consumes
//! its events. Each category of event has a handler trait; at most one
//! handler per category is registered at a time and registering a new one
//! replaces the previous one.

use std::{collections::HashMap, fmt, sync::Arc};

use log::debug;
use parking_lot::RwLock;

use crate::{
   address::Address,
   device::ConnectionState,
   transport::{Channel, GattStatus},
};

/// Event categories a handler can be registered for.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Category {
   Connect,
   Read,
   Write,
   Notify,
   Mtu,
   Rssi,
}

/// Link lifecycle callbacks.
pub trait ConnectHandler: Send + Sync {
   fn on_connection_changed(&self, address: Address, state: ConnectionState);

   fn on_connect_timeout(&self, _address: Address) {}

   /// The link failed or dropped with a non-zero status.
   fn on_connect_failed(&self, _address: Address, _status: GattStatus) {}

   fn on_services_discovered(&self, _address: Address) {}

   fn on_ready(&self, _address: Address) {}

   fn on_adapter_state_changed(&self, _powered: bool) {}
}

pub trait ReadHandler: Send + Sync {
   fn on_read(&self, address: Address, channel: &Channel, value: &[u8]);

   fn on_read_failed(&self, address: Address, channel: &Channel, status: GattStatus);
}

pub trait WriteHandler: Send + Sync {
   fn on_write(&self, address: Address, channel: &Channel);

   fn on_write_failed(&self, address: Address, channel: &Channel, status: GattStatus);
}

pub trait NotifyHandler: Send + Sync {
   fn on_changed(&self, address: Address, channel: &Channel, value: &[u8]);

   /// Every notify-capable channel of the device has been enabled.
   fn on_notify_armed(&self, _address: Address) {}

   /// Every notify-capable channel of the device has been disabled.
   fn on_notify_disarmed(&self, _address: Address) {}

   fn on_notify_failed(&self, _address: Address, _status: GattStatus) {}
}

pub trait MtuHandler: Send + Sync {
   fn on_mtu_changed(&self, address: Address, mtu: u16, status: GattStatus);
}

pub trait RssiHandler: Send + Sync {
   fn on_rssi_read(&self, address: Address, rssi: i16, status: GattStatus);
}

/// A registered handler, tagged with its category.
#[derive(Clone)]
pub enum Handler {
   Connect(Arc<dyn ConnectHandler>),
   Read(Arc<dyn ReadHandler>),
   Write(Arc<dyn WriteHandler>),
   Notify(Arc<dyn NotifyHandler>),
   Mtu(Arc<dyn MtuHandler>),
   Rssi(Arc<dyn RssiHandler>),
}

impl Handler {
   pub const fn category(&self) -> Category {
      match self {
         Self::Connect(_) => Category::Connect,
         Self::Read(_) => Category::Read,
         Self::Write(_) => Category::Write,
         Self::Notify(_) => Category::Notify,
         Self::Mtu(_) => Category::Mtu,
         Self::Rssi(_) => Category::Rssi,
      }
   }
}

impl fmt::Debug for Handler {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "Handler({})", self.category())
   }
}

/// Registry mapping each [`Category`] to its current handler.
#[derive(Debug, Default)]
pub struct CallbackRouter {
   handlers: RwLock<HashMap<Category, Handler>>,
}

macro_rules! typed_lookup {
   ($($name:ident => $variant:ident : $trait:ident),* $(,)?) => {
      $(
         pub fn $name(&self) -> Option<Arc<dyn $trait>> {
            match self.handlers.read().get(&Category::$variant) {
               Some(Handler::$variant(h)) => Some(h.clone()),
               _ => None,
            }
         }
      )*
   };
}

impl CallbackRouter {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers `handler` for its category, returning the handler it
   /// replaced.
   pub fn register(&self, handler: impl Into<Handler>) -> Option<Handler> {
      let handler = handler.into();
      let category = handler.category();
      debug!("Registering {category} handler");
      self.handlers.write().insert(category, handler)
   }

   pub fn unregister(&self, category: Category) -> Option<Handler> {
      self.handlers.write().remove(&category)
   }

   /// Returns the handler currently registered for `category`.
   pub fn get(&self, category: Category) -> Option<Handler> {
      self.handlers.read().get(&category).cloned()
   }

   pub fn is_registered(&self, category: Category) -> bool {
      self.handlers.read().contains_key(&category)
   }

   /// Drops every registered handler.
   pub fn release(&self) {
      self.handlers.write().clear();
      debug!("Callback router released");
   }

   typed_lookup! {
      connect => Connect: ConnectHandler,
      read => Read: ReadHandler,
      write => Write: WriteHandler,
      notify => Notify: NotifyHandler,
      mtu => Mtu: MtuHandler,
      rssi => Rssi: RssiHandler,
   }
}

macro_rules! impl_into_handler {
   ($($variant:ident : $trait:ident),* $(,)?) => {
      $(
         impl From<Arc<dyn $trait>> for Handler {
            fn from(h: Arc<dyn $trait>) -> Self {
               Self::$variant(h)
            }
         }
      )*
   };
}

impl_into_handler! {
   Connect: ConnectHandler,
   Read: ReadHandler,
   Write: WriteHandler,
   Notify: NotifyHandler,
   Mtu: MtuHandler,
   Rssi: RssiHandler,
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use strum::IntoEnumIterator;

   use super::*;

   #[derive(Default)]
   struct Counter(AtomicUsize);

   impl MtuHandler for Counter {
      fn on_mtu_changed(&self, _address: Address, _mtu: u16, _status: GattStatus) {
         self.0.fetch_add(1, Ordering::SeqCst);
      }
   }

   #[test]
   fn test_register_replaces_previous() {
      let router = CallbackRouter::new();
      assert!(router.mtu().is_none());

      let first = Arc::new(Counter::default());
      let second = Arc::new(Counter::default());
      assert!(router.register(first.clone() as Arc<dyn MtuHandler>).is_none());
      let replaced = router.register(second.clone() as Arc<dyn MtuHandler>);
      assert_eq!(replaced.map(|h| h.category()), Some(Category::Mtu));

      router
         .mtu()
         .unwrap()
         .on_mtu_changed(Address::default(), 23, GattStatus::SUCCESS);
      assert_eq!(first.0.load(Ordering::SeqCst), 0);
      assert_eq!(second.0.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn test_lookup_absent_and_release() {
      let router = CallbackRouter::new();
      for category in Category::iter() {
         assert!(router.get(category).is_none());
      }

      router.register(Arc::new(Counter::default()) as Arc<dyn MtuHandler>);
      assert!(router.is_registered(Category::Mtu));
      assert!(router.connect().is_none());

      router.release();
      assert!(!router.is_registered(Category::Mtu));
   }

   #[test]
   fn test_unregister() {
      let router = CallbackRouter::new();
      router.register(Arc::new(Counter::default()) as Arc<dyn MtuHandler>);
      assert!(router.unregister(Category::Mtu).is_some());
      assert!(router.unregister(Category::Mtu).is_none());
      assert_eq!(Category::Rssi.to_string(), "rssi");
   }
}

//! Built-in request handlers.
//!
//! One handler per router category. Each forwards its callbacks to the
//! application's [`EventBus`] as [`BleEvent`]s. They are registered
//! explicitly by [`register_defaults`] and may be replaced through the
//! router at any time.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
   address::Address,
   device::ConnectionState,
   event::{BleEvent, EventSender},
   router::{
      CallbackRouter, ConnectHandler, MtuHandler, NotifyHandler, ReadHandler, RssiHandler,
      WriteHandler,
   },
   transport::{Channel, GattStatus},
};

/// Registers one built-in handler per category, all emitting to `events`.
pub fn register_defaults(router: &CallbackRouter, events: &EventSender) {
   router.register(Arc::new(ConnectRequest::new(events.clone())) as Arc<dyn ConnectHandler>);
   router.register(Arc::new(ReadRequest::new(events.clone())) as Arc<dyn ReadHandler>);
   router.register(Arc::new(WriteRequest::new(events.clone())) as Arc<dyn WriteHandler>);
   router.register(Arc::new(NotifyRequest::new(events.clone())) as Arc<dyn NotifyHandler>);
   router.register(Arc::new(MtuRequest::new(events.clone())) as Arc<dyn MtuHandler>);
   router.register(Arc::new(RssiRequest::new(events.clone())) as Arc<dyn RssiHandler>);
}

macro_rules! request {
   ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
      $(
         $(#[$meta])*
         pub struct $name {
            events: EventSender,
         }

         impl $name {
            pub fn new(events: EventSender) -> Self {
               Self { events }
            }
         }
      )*
   };
}

request! {
   /// Forwards connection lifecycle changes.
   ConnectRequest,
   ReadRequest,
   WriteRequest,
   /// Forwards value changes and arming results.
   NotifyRequest,
   MtuRequest,
   RssiRequest,
}

impl ConnectHandler for ConnectRequest {
   fn on_connection_changed(&self, address: Address, state: ConnectionState) {
      info!("{address}: {state}");
      self.events.emit(BleEvent::ConnectionChanged { address, state });
   }

   fn on_connect_timeout(&self, address: Address) {
      warn!("{address}: connect timed out");
      self.events.emit(BleEvent::ConnectTimeout { address });
   }

   fn on_connect_failed(&self, address: Address, status: GattStatus) {
      warn!("{address}: link failed with status {status}");
      self.events.emit(BleEvent::ConnectFailed { address, status });
   }

   fn on_services_discovered(&self, address: Address) {
      self.events.emit(BleEvent::ServicesDiscovered { address });
   }

   fn on_ready(&self, address: Address) {
      self.events.emit(BleEvent::Ready { address });
   }

   fn on_adapter_state_changed(&self, powered: bool) {
      self.events.emit(BleEvent::AdapterStateChanged { powered });
   }
}

impl ReadHandler for ReadRequest {
   fn on_read(&self, address: Address, channel: &Channel, value: &[u8]) {
      self.events.emit(BleEvent::ReadCompleted {
         address,
         channel: channel.uuid,
         value: value.to_vec(),
      });
   }

   fn on_read_failed(&self, address: Address, channel: &Channel, status: GattStatus) {
      warn!("{address}: read of {} failed with status {status}", channel.uuid);
      self.events.emit(BleEvent::ReadFailed {
         address,
         channel: channel.uuid,
         status,
      });
   }
}

impl WriteHandler for WriteRequest {
   fn on_write(&self, address: Address, channel: &Channel) {
      self.events.emit(BleEvent::WriteCompleted {
         address,
         channel: channel.uuid,
      });
   }

   fn on_write_failed(&self, address: Address, channel: &Channel, status: GattStatus) {
      warn!("{address}: write to {} failed with status {status}", channel.uuid);
      self.events.emit(BleEvent::WriteFailed {
         address,
         channel: channel.uuid,
         status,
      });
   }
}

impl NotifyHandler for NotifyRequest {
   fn on_changed(&self, address: Address, channel: &Channel, value: &[u8]) {
      self.events.emit(BleEvent::ValueChanged {
         address,
         channel: channel.uuid,
         value: value.to_vec(),
      });
   }

   fn on_notify_armed(&self, address: Address) {
      debug!("{address}: notifications armed");
      self.events.emit(BleEvent::NotificationsArmed { address });
   }

   fn on_notify_disarmed(&self, address: Address) {
      debug!("{address}: notifications disarmed");
      self.events.emit(BleEvent::NotificationsDisarmed { address });
   }

   fn on_notify_failed(&self, address: Address, status: GattStatus) {
      warn!("{address}: arming notifications failed with status {status}");
      self.events.emit(BleEvent::NotifyFailed { address, status });
   }
}

impl MtuHandler for MtuRequest {
   fn on_mtu_changed(&self, address: Address, mtu: u16, status: GattStatus) {
      self.events.emit(BleEvent::MtuChanged {
         address,
         mtu,
         status,
      });
   }
}

impl RssiHandler for RssiRequest {
   fn on_rssi_read(&self, address: Address, rssi: i16, status: GattStatus) {
      self.events.emit(BleEvent::RssiRead {
         address,
         rssi,
         status,
      });
   }
}

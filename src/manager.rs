//! Multi-device connection manager.
//!
//! Owns the per-address state machine (`Disconnected → Connecting →
//! Connected → Ready`), the connect timers, the link table and the channel
//! routing state. Transport events are fed in through
//! [`BleManager::handle_event`], which never blocks; every outcome reaches
//! consumers through the [`CallbackRouter`].
//!
//! Locking: the device table is always taken before the routing registry,
//! and router handlers are only invoked once both are released.

use std::{
   collections::HashMap,
   sync::{Arc, Weak},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

use crate::{
   address::Address,
   config::Config,
   device::{ConnectionState, DeviceInfo},
   error::{LinkError, Result},
   event::EventSender,
   notify::Step,
   pool::TaskPool,
   registry::{ChannelRegistry, classify},
   request,
   router::CallbackRouter,
   transfer::{ChunkedWriter, PacketWriter, TransferHandle, TransferRequest},
   transport::{Channel, EventQueue, GattStatus, LinkHandle, Service, Transport, TransportEvent},
};

/// Smallest MTU that may be requested.
const MIN_MTU: u16 = 21;

struct ManagedDevice {
   state: ConnectionState,
   auto_reconnect: bool,
   link: Option<LinkHandle>,
   timeout: Option<JoinHandle<()>>,
   /// Bumped on every connect attempt so a stale timer can recognise itself.
   generation: u64,
}

impl ManagedDevice {
   const fn new(auto_reconnect: bool) -> Self {
      Self {
         state: ConnectionState::Disconnected,
         auto_reconnect,
         link: None,
         timeout: None,
         generation: 0,
      }
   }

   fn cancel_timeout(&mut self) {
      if let Some(handle) = self.timeout.take() {
         handle.abort();
      }
   }

   const fn is_idle(&self) -> bool {
      matches!(self.state, ConnectionState::Disconnected) && self.link.is_none()
   }

   /// Whether `link` is the link currently held for this device.
   fn owns(&self, link: LinkHandle) -> bool {
      self.link == Some(link)
   }

   const fn info(&self, address: Address) -> DeviceInfo {
      DeviceInfo {
         address,
         state: self.state,
         auto_reconnect: self.auto_reconnect,
      }
   }
}

impl Drop for ManagedDevice {
   fn drop(&mut self) {
      self.cancel_timeout();
   }
}

type DeviceTable = HashMap<Address, ManagedDevice>;

fn linked(devices: &DeviceTable, address: Address) -> Option<LinkHandle> {
   devices
      .get(&address)
      .filter(|d| d.state.is_linked())
      .and_then(|d| d.link)
}

struct ManagerInner {
   config: Config,
   transport: Arc<dyn Transport>,
   router: CallbackRouter,
   devices: Mutex<DeviceTable>,
   routing: Mutex<ChannelRegistry>,
   writer: ChunkedWriter,
   pool: TaskPool,
}

impl ManagerInner {
   /// Releases everything held for `address` and marks it disconnected.
   fn teardown(&self, address: Address, device: &mut ManagedDevice) {
      device.cancel_timeout();
      if let Some(link) = device.link.take() {
         self.transport.close_link(link);
      }
      self.routing.lock().release(address);
      device.state = ConnectionState::Disconnected;
   }
}

/// Handle to the connection manager. Cheap to clone.
#[derive(Clone)]
pub struct BleManager(Arc<ManagerInner>);

impl BleManager {
   /// Creates a manager and registers the built-in request handlers, which
   /// forward every callback to `events`.
   pub fn new(config: Config, transport: Arc<dyn Transport>, events: &EventSender) -> Self {
      let manager = Self::bare(config, transport);
      request::register_defaults(&manager.0.router, events);
      manager
   }

   /// Creates a manager with an empty router.
   pub fn bare(config: Config, transport: Arc<dyn Transport>) -> Self {
      let writer = ChunkedWriter::new(config.auto_pace_timeout());
      let pool = TaskPool::new(config.transfer_pool_size);
      Self(Arc::new(ManagerInner {
         config,
         transport,
         router: CallbackRouter::new(),
         devices: Mutex::new(HashMap::new()),
         routing: Mutex::new(ChannelRegistry::new()),
         writer,
         pool,
      }))
   }

   pub(crate) fn downgrade(&self) -> WeakManager {
      WeakManager(Arc::downgrade(&self.0))
   }

   pub fn config(&self) -> &Config {
      &self.0.config
   }

   pub fn router(&self) -> &CallbackRouter {
      &self.0.router
   }

   /// Drains `queue` into [`Self::handle_event`] until the queue closes or
   /// the manager is dropped.
   pub fn spawn_dispatcher(&self, queue: Arc<EventQueue>) -> JoinHandle<()> {
      let weak = self.downgrade();
      tokio::spawn(async move {
         while let Some(event) = queue.recv().await {
            let Some(manager) = weak.upgrade() else {
               break;
            };
            manager.handle_event(event);
         }
         debug!("Event dispatcher stopped");
      })
   }

   // === Connection lifecycle ===

   /// Starts connecting to `address`.
   ///
   /// Returns whether an attempt is under way: `true` when one was issued or
   /// the device is already connecting or connected, `false` when the
   /// transport refused to open the link.
   ///
   /// A malformed address is rejected with [`LinkError::InvalidAddress`]
   /// rather than `Ok(false)`, so callers can tell a bad argument from a
   /// refused link. Nothing is started and no timer is armed in that case.
   /// Use [`Self::connect_to`] with an already parsed [`Address`] to get the
   /// plain issued flag.
   pub fn connect(&self, address: &str) -> Result<bool> {
      let address: Address = address.parse()?;
      Ok(self.connect_to(address))
   }

   pub fn connect_to(&self, address: Address) -> bool {
      let mut devices = self.0.devices.lock();
      let device = devices
         .entry(address)
         .or_insert_with(|| ManagedDevice::new(self.0.config.auto_connect));
      if device.state.is_active() {
         debug!("{address}: already {}, ignoring connect", device.state);
         return true;
      }

      let link = match self.0.transport.open_link(address, device.auto_reconnect) {
         Ok(link) => link,
         Err(e) => {
            warn!("{address}: failed to open link: {e}");
            return false;
         },
      };
      device.link = Some(link);
      device.state = ConnectionState::Connecting;
      device.generation += 1;
      device.timeout = Some(self.arm_timeout(address, device.generation));
      drop(devices);

      info!(
         "{address}: connecting (timeout {:?})",
         self.0.config.connect_timeout()
      );
      self.state_changed(address, ConnectionState::Connecting);
      true
   }

   fn arm_timeout(&self, address: Address, generation: u64) -> JoinHandle<()> {
      let weak = self.downgrade();
      let delay = self.0.config.connect_timeout();
      tokio::spawn(async move {
         time::sleep(delay).await;
         if let Some(manager) = weak.upgrade() {
            manager.connect_timed_out(address, generation);
         }
      })
   }

   fn connect_timed_out(&self, address: Address, generation: u64) {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            return;
         };
         if device.generation != generation || device.state != ConnectionState::Connecting {
            return;
         }
         // This is the running timer; detach rather than abort it.
         device.timeout = None;
         self.0.teardown(address, device);
      }

      warn!("{address}: connect timed out");
      if let Some(handler) = self.0.router.connect() {
         handler.on_connect_timeout(address);
         handler.on_connection_changed(address, ConnectionState::Disconnected);
      }
   }

   /// Aborts a pending connect attempt. Returns whether one was pending.
   pub fn cancel_connect(&self, address: Address) -> bool {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            return false;
         };
         if device.state != ConnectionState::Connecting {
            return false;
         }
         self.0.teardown(address, device);
      }
      info!("{address}: connect cancelled");
      self.state_changed(address, ConnectionState::Disconnected);
      true
   }

   /// Closes the link to `address` and drops its channel handles right away.
   /// A later link-down confirmation for it is ignored. Returns whether
   /// there was anything to disconnect.
   pub fn disconnect(&self, address: Address) -> bool {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            debug!("{address}: disconnect of unknown device");
            return false;
         };
         if device.is_idle() {
            return false;
         }
         self.0.teardown(address, device);
      }
      info!("{address}: disconnected");
      self.state_changed(address, ConnectionState::Disconnected);
      true
   }

   /// Disconnects `address` if needed and forgets it.
   pub fn remove_device(&self, address: Address) -> bool {
      let was_active = {
         let mut devices = self.0.devices.lock();
         let Some(mut device) = devices.remove(&address) else {
            return false;
         };
         let was_active = !device.is_idle();
         self.0.teardown(address, &mut device);
         was_active
      };
      if was_active {
         self.state_changed(address, ConnectionState::Disconnected);
      }
      info!("{address}: removed");
      true
   }

   /// Sets whether the transport (and any layered reconnect policy) should
   /// keep reconnecting to `address`. Takes effect on the next connect.
   pub fn set_auto_reconnect(&self, address: Address, enabled: bool) {
      self
         .0
         .devices
         .lock()
         .entry(address)
         .or_insert_with(|| ManagedDevice::new(enabled))
         .auto_reconnect = enabled;
   }

   /// Releases every link and cancels every timer.
   pub fn close_all(&self) {
      let closed: Vec<Address> = {
         let mut devices = self.0.devices.lock();
         devices
            .iter_mut()
            .filter(|(_, device)| !device.is_idle())
            .map(|(address, device)| {
               self.0.teardown(*address, device);
               *address
            })
            .collect()
      };
      for address in closed {
         self.state_changed(address, ConnectionState::Disconnected);
      }
   }

   /// Closes everything, stops any transfer and drops all handlers.
   pub fn shutdown(&self) {
      info!("Shutting down link manager");
      self.close_all();
      self.0.writer.cancel();
      self.0.router.release();
   }

   // === Snapshots ===

   pub fn devices(&self) -> Vec<DeviceInfo> {
      let mut infos: Vec<_> = self
         .0
         .devices
         .lock()
         .iter()
         .map(|(address, device)| device.info(*address))
         .collect();
      infos.sort_by_key(|info| info.address);
      infos
   }

   pub fn device(&self, address: Address) -> Option<DeviceInfo> {
      self.0.devices.lock().get(&address).map(|d| d.info(address))
   }

   pub fn state(&self, address: Address) -> ConnectionState {
      self
         .0
         .devices
         .lock()
         .get(&address)
         .map_or(ConnectionState::Disconnected, |d| d.state)
   }

   /// Addresses with an established link.
   pub fn connected_devices(&self) -> Vec<Address> {
      let mut out: Vec<_> = self
         .0
         .devices
         .lock()
         .iter()
         .filter(|(_, d)| d.state.is_linked())
         .map(|(address, _)| *address)
         .collect();
      out.sort();
      out
   }

   // === Single operations ===

   /// Issues a single write to the device's write channel.
   pub fn write(&self, address: Address, value: &[u8]) -> bool {
      let devices = self.0.devices.lock();
      let Some(link) = linked(&devices, address) else {
         warn!("{address}: write while not connected");
         return false;
      };
      let routing = self.0.routing.lock();
      let Some(channel) = routing.write_channel(address) else {
         warn!("{address}: no write channel");
         return false;
      };
      debug!("→ {address}: {}", hex::encode(value));
      self.0.transport.write_channel(link, channel, value)
   }

   /// Issues a read of the device's read channel.
   pub fn read(&self, address: Address) -> bool {
      let devices = self.0.devices.lock();
      let Some(link) = linked(&devices, address) else {
         warn!("{address}: read while not connected");
         return false;
      };
      let routing = self.0.routing.lock();
      let Some(channel) = routing.read_channel(address) else {
         warn!("{address}: no read channel");
         return false;
      };
      self.0.transport.read_channel(link, channel)
   }

   pub fn read_rssi(&self, address: Address) -> bool {
      let devices = self.0.devices.lock();
      linked(&devices, address).is_some_and(|link| self.0.transport.read_signal_strength(link))
   }

   pub fn request_mtu(&self, address: Address, mtu: u16) -> Result<bool> {
      if mtu < MIN_MTU {
         return Err(LinkError::InvalidMtu(mtu));
      }
      let devices = self.0.devices.lock();
      Ok(linked(&devices, address).is_some_and(|link| self.0.transport.request_mtu(link, mtu)))
   }

   pub fn enable_notifications(&self, address: Address) -> bool {
      self.start_notify(address, true)
   }

   pub fn disable_notifications(&self, address: Address) -> bool {
      self.start_notify(address, false)
   }

   fn start_notify(&self, address: Address, enabled: bool) -> bool {
      let (link, step) = {
         let devices = self.0.devices.lock();
         let Some(link) = linked(&devices, address) else {
            return false;
         };
         let mut routing = self.0.routing.lock();
         let Some(channels) = routing.get_mut(address) else {
            return false;
         };
         if channels.notify.is_running() {
            warn!("{address}: notification sequence already running");
            return false;
         }
         (link, channels.notify.begin(enabled))
      };
      self.drive_notify(address, link, step, enabled);
      true
   }

   // === Chunked transfers ===

   /// Starts a chunked write on the background pool. Only one transfer runs
   /// at a time; a second request fails with [`LinkError::TransferBusy`].
   pub fn transfer<F>(&self, request: TransferRequest, on_progress: F) -> Result<TransferHandle>
   where
      F: FnMut(f64) + Send + 'static,
   {
      self.0.writer.start(&self.0.pool, self.clone(), request, on_progress)
   }

   pub fn cancel_transfer(&self) -> bool {
      self.0.writer.cancel()
   }

   pub fn is_transferring(&self) -> bool {
      self.0.writer.is_active()
   }

   // === Transport events ===

   /// Applies one transport event. Never blocks.
   pub fn handle_event(&self, event: TransportEvent) {
      match event {
         TransportEvent::LinkStateChanged {
            address,
            link,
            connected: true,
            ..
         } => self.link_up(address, link),
         TransportEvent::LinkStateChanged {
            address,
            link,
            connected: false,
            status,
         } => self.link_down(address, link, status),
         TransportEvent::ChannelsDiscovered {
            address,
            link,
            services,
            status,
         } => self.channels_discovered(address, link, &services, status),
         TransportEvent::DescriptorWritten {
            address,
            link,
            channel,
            status,
            ..
         } => self.descriptor_written(address, link, &channel, status),
         TransportEvent::ChannelWritten {
            address,
            channel,
            status,
         } => {
            self.0.writer.acknowledge(address, status);
            if let Some(handler) = self.0.router.write() {
               if status.is_success() {
                  handler.on_write(address, &channel);
               } else {
                  handler.on_write_failed(address, &channel, status);
               }
            }
         },
         TransportEvent::ChannelRead {
            address,
            channel,
            value,
            status,
         } => {
            if let Some(handler) = self.0.router.read() {
               if status.is_success() {
                  handler.on_read(address, &channel, &value);
               } else {
                  handler.on_read_failed(address, &channel, status);
               }
            }
         },
         TransportEvent::ChannelChanged {
            address,
            channel,
            value,
         } => {
            if linked(&self.0.devices.lock(), address).is_none() {
               debug!("{address}: dropping value change on unlinked device");
               return;
            }
            debug!("← {address}: {}", hex::encode(&value));
            if let Some(handler) = self.0.router.notify() {
               handler.on_changed(address, &channel, &value);
            }
         },
         TransportEvent::MtuChanged {
            address,
            mtu,
            status,
         } => {
            if let Some(handler) = self.0.router.mtu() {
               handler.on_mtu_changed(address, mtu, status);
            }
         },
         TransportEvent::SignalStrengthRead {
            address,
            rssi,
            status,
         } => {
            if let Some(handler) = self.0.router.rssi() {
               handler.on_rssi_read(address, rssi, status);
            }
         },
         TransportEvent::AdapterStateChanged { powered } => {
            if powered {
               info!("Adapter powered on");
            } else {
               warn!("Adapter powered off, closing every link");
               self.close_all();
            }
            if let Some(handler) = self.0.router.connect() {
               handler.on_adapter_state_changed(powered);
            }
         },
      }
   }

   fn link_up(&self, address: Address, link: LinkHandle) {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            debug!("{address}: link-up from unknown device");
            return;
         };
         if device.state != ConnectionState::Connecting || !device.owns(link) {
            debug!("{address}: ignoring link-up on {link:?} while {}", device.state);
            return;
         }
         device.cancel_timeout();
         device.state = ConnectionState::Connected;
      }

      info!("{address}: connected, discovering services");
      self.state_changed(address, ConnectionState::Connected);
      if !self.0.transport.discover_channels(link) {
         warn!("{address}: service discovery could not be issued");
         self.fail_link(address, link, GattStatus::FAILURE);
      }
   }

   fn link_down(&self, address: Address, link: LinkHandle, status: GattStatus) {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            return;
         };
         if !device.owns(link) {
            debug!("{address}: link-down on {link:?} after teardown, ignoring");
            return;
         }
         self.0.teardown(address, device);
      }

      if status.is_success() {
         info!("{address}: link closed");
      } else {
         warn!("{address}: link lost with status {status}");
         if let Some(handler) = self.0.router.connect() {
            handler.on_connect_failed(address, status);
         }
      }
      self.state_changed(address, ConnectionState::Disconnected);
   }

   /// Tears `link` down after an asynchronous failure, unless it has
   /// already been replaced or released.
   fn fail_link(&self, address: Address, link: LinkHandle, status: GattStatus) {
      {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            return;
         };
         if !device.owns(link) {
            return;
         }
         self.0.teardown(address, device);
      }
      if let Some(handler) = self.0.router.connect() {
         handler.on_connect_failed(address, status);
         handler.on_connection_changed(address, ConnectionState::Disconnected);
      }
   }

   fn channels_discovered(
      &self,
      address: Address,
      link: LinkHandle,
      services: &[Service],
      status: GattStatus,
   ) {
      let usable = status.is_success() && services.iter().any(|s| !s.channels.is_empty());
      let installed = {
         let mut devices = self.0.devices.lock();
         let Some(device) = devices.get_mut(&address) else {
            return;
         };
         if !device.state.is_linked() || !device.owns(link) {
            debug!("{address}: discovery result from {link:?} after teardown, ignoring");
            return;
         }
         if usable {
            let classification = classify(services, &self.0.config.channels);
            let matched = classification.matched_service;
            let mut routing = self.0.routing.lock();
            let channels = routing.install(address, classification);
            if matched {
               device.state = ConnectionState::Ready;
            }
            let arm = matched && self.0.config.enable_notify_on_ready;
            let step = arm.then(|| channels.notify.begin(true));
            Some((matched, step))
         } else {
            self.0.teardown(address, device);
            None
         }
      };

      let Some((matched, step)) = installed else {
         if status.is_success() {
            warn!("{address}: device exposes no channels, disconnecting");
            self.state_changed(address, ConnectionState::Disconnected);
         } else {
            warn!("{address}: service discovery failed with status {status}");
            if let Some(handler) = self.0.router.connect() {
               handler.on_connect_failed(address, status);
               handler.on_connection_changed(address, ConnectionState::Disconnected);
            }
         }
         return;
      };

      let handler = self.0.router.connect();
      if let Some(handler) = &handler {
         handler.on_services_discovered(address);
      }
      if !matched {
         warn!(
            "{address}: service {} not found, staying connected",
            self.0.config.channels.service
         );
         return;
      }

      info!("{address}: ready");
      if let Some(handler) = &handler {
         handler.on_ready(address);
      }
      if let Some(step) = step {
         self.drive_notify(address, link, step, true);
      }
   }

   fn descriptor_written(
      &self,
      address: Address,
      link: LinkHandle,
      channel: &Channel,
      status: GattStatus,
   ) {
      let next = {
         let devices = self.0.devices.lock();
         if linked(&devices, address) != Some(link) {
            debug!("{address}: descriptor confirmation from {link:?} after teardown");
            return;
         }
         let mut routing = self.0.routing.lock();
         let Some(channels) = routing.get_mut(address) else {
            return;
         };
         if !channels.notify.is_running() {
            debug!("{address}: stray descriptor confirmation on {}", channel.uuid);
            return;
         }
         if status.is_success() {
            Some((channels.notify.advance(), channels.notify.enabled()))
         } else {
            channels.notify.abort();
            None
         }
      };

      match next {
         Some((step, enabled)) => self.drive_notify(address, link, step, enabled),
         None => {
            warn!(
               "{address}: descriptor write on {} failed with status {status}",
               channel.uuid
            );
            if let Some(handler) = self.0.router.notify() {
               handler.on_notify_failed(address, status);
            }
         },
      }
   }

   fn drive_notify(&self, address: Address, link: LinkHandle, step: Step, enabled: bool) {
      match step {
         Step::Arm(channel) => {
            debug!(
               "{address}: {} notifications on {}",
               if enabled { "enabling" } else { "disabling" },
               channel.uuid
            );
            if !self.0.transport.set_notify(link, &channel, enabled) {
               if let Some(channels) = self.0.routing.lock().get_mut(address) {
                  channels.notify.abort();
               }
               warn!("{address}: descriptor write on {} could not be issued", channel.uuid);
               if let Some(handler) = self.0.router.notify() {
                  handler.on_notify_failed(address, GattStatus::FAILURE);
               }
            }
         },
         Step::Done { enabled } => {
            if let Some(handler) = self.0.router.notify() {
               if enabled {
                  handler.on_notify_armed(address);
               } else {
                  handler.on_notify_disarmed(address);
               }
            }
         },
         Step::Idle => debug!("{address}: stray descriptor confirmation"),
      }
   }

   fn state_changed(&self, address: Address, state: ConnectionState) {
      if let Some(handler) = self.0.router.connect() {
         handler.on_connection_changed(address, state);
      }
   }
}

impl PacketWriter for BleManager {
   fn write_packet(&self, address: Address, packet: &[u8]) -> bool {
      self.write(address, packet)
   }
}

/// Non-owning handle, used by timers and layered policies.
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
   pub(crate) fn upgrade(&self) -> Option<BleManager> {
      self.0.upgrade().map(BleManager)
   }
}

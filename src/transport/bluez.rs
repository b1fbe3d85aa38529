//! BlueZ transport backed by `bluer`.
//!
//! Every link gets its own command worker so GATT operations on one device
//! are serialised while different devices proceed independently. The
//! [`Transport`] methods only enqueue commands; results come back through
//! the event sink.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Device, DeviceEvent, DeviceProperty, Session,
   gatt::remote::Characteristic,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   runtime::Handle,
   sync::mpsc,
   task::{AbortHandle, JoinHandle, JoinSet},
   time,
};

use super::{
   Channel, EventSinkRef, GattStatus, LinkHandle, Properties, Service, Transport, TransportEvent,
};
use crate::{
   address::Address,
   error::{LinkError, Result},
};

/// How long to wait for BlueZ to resolve services after connecting.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Reported when a link drops without being asked to.
const LINK_LOST: GattStatus = GattStatus(0x08);

#[derive(Debug)]
enum Command {
   Discover,
   Write(Channel, Vec<u8>),
   Read(Channel),
   SetNotify(Channel, bool),
   Rssi,
}

struct Link {
   device: Device,
   tx: mpsc::UnboundedSender<Command>,
   tasks: JoinSet<()>,
}

impl Drop for Link {
   fn drop(&mut self) {
      self.tasks.abort_all();
   }
}

pub struct BluezTransport {
   adapter: Adapter,
   events: EventSinkRef,
   powered: Arc<AtomicBool>,
   runtime: Handle,
   links: Mutex<HashMap<LinkHandle, Link>>,
   next_link: AtomicU64,
   monitor: JoinHandle<()>,
}

impl BluezTransport {
   /// Opens the default adapter, powering it on if needed, and starts
   /// watching its power state.
   pub async fn new(events: EventSinkRef) -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter: {}", adapter.name());

      let powered = Arc::new(AtomicBool::new(true));
      let monitor = tokio::spawn(monitor_adapter(
         adapter.clone(),
         powered.clone(),
         events.clone(),
      ));
      Ok(Arc::new(Self {
         adapter,
         events,
         powered,
         runtime: Handle::current(),
         links: Mutex::new(HashMap::new()),
         next_link: AtomicU64::new(1),
         monitor,
      }))
   }

   fn send(&self, link: LinkHandle, command: Command) -> bool {
      match self.links.lock().get(&link) {
         Some(entry) => entry.tx.send(command).is_ok(),
         None => {
            debug!("Command for closed link {link:?} dropped");
            false
         },
      }
   }
}

impl Drop for BluezTransport {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

impl Transport for BluezTransport {
   fn open_link(&self, address: Address, auto_reconnect: bool) -> Result<LinkHandle> {
      if !self.powered.load(Ordering::SeqCst) {
         return Err(LinkError::TransportIssue("connect: adapter is powered off"));
      }
      let device = self.adapter.device(bluer::Address(address.octets()))?;
      let link = LinkHandle(self.next_link.fetch_add(1, Ordering::Relaxed));
      let (tx, rx) = mpsc::unbounded_channel();
      let mut tasks = JoinSet::new();
      tasks.spawn_on(
         link_worker(address, link, device.clone(), auto_reconnect, self.events.clone(), rx),
         &self.runtime,
      );

      self.links.lock().insert(link, Link { device, tx, tasks });
      debug!("{address}: opened link {link:?}");
      Ok(link)
   }

   fn close_link(&self, link: LinkHandle) {
      let Some(entry) = self.links.lock().remove(&link) else {
         return;
      };
      let device = entry.device.clone();
      drop(entry);
      self.runtime.spawn(async move {
         if let Err(e) = device.disconnect().await {
            debug!("{}: disconnect: {e}", device.address());
         }
      });
   }

   fn discover_channels(&self, link: LinkHandle) -> bool {
      self.send(link, Command::Discover)
   }

   fn write_channel(&self, link: LinkHandle, channel: &Channel, value: &[u8]) -> bool {
      self.send(link, Command::Write(channel.clone(), value.to_vec()))
   }

   fn read_channel(&self, link: LinkHandle, channel: &Channel) -> bool {
      self.send(link, Command::Read(channel.clone()))
   }

   fn set_notify(&self, link: LinkHandle, channel: &Channel, enabled: bool) -> bool {
      self.send(link, Command::SetNotify(channel.clone(), enabled))
   }

   fn read_signal_strength(&self, link: LinkHandle) -> bool {
      self.send(link, Command::Rssi)
   }

   fn request_mtu(&self, link: LinkHandle, mtu: u16) -> bool {
      // BlueZ negotiates the ATT MTU itself on connect.
      debug!("MTU request ({mtu}) on {link:?} not supported by BlueZ");
      false
   }
}

fn status_of<T>(result: &bluer::Result<T>) -> GattStatus {
   match result {
      Ok(_) => GattStatus::SUCCESS,
      Err(_) => GattStatus::FAILURE,
   }
}

/// Per-link command loop. Everything it reports is tagged with `link`.
async fn link_worker(
   address: Address,
   link: LinkHandle,
   device: Device,
   auto_reconnect: bool,
   events: EventSinkRef,
   mut rx: mpsc::UnboundedReceiver<Command>,
) {
   if auto_reconnect && let Err(e) = device.set_trusted(true).await {
      warn!("{address}: failed to mark trusted: {e}");
   }

   let connected = device.connect().await;
   if let Err(e) = &connected {
      warn!("{address}: connect failed: {e}");
   }
   let status = status_of(&connected);
   events.push(TransportEvent::LinkStateChanged {
      address,
      link,
      connected: status.is_success(),
      status,
   });
   if !status.is_success() {
      return;
   }

   let mut tasks = JoinSet::new();
   tasks.spawn(monitor_device(address, link, device.clone(), events.clone()));
   let mut notifiers: HashMap<(u16, u16), AbortHandle> = HashMap::new();

   while let Some(command) = rx.recv().await {
      match command {
         Command::Discover => {
            let (services, status) = match discover(&device).await {
               Ok(services) => (services, GattStatus::SUCCESS),
               Err(e) => {
                  warn!("{address}: service discovery failed: {e}");
                  (vec![], GattStatus::FAILURE)
               },
            };
            events.push(TransportEvent::ChannelsDiscovered {
               address,
               link,
               services,
               status,
            });
         },
         Command::Write(channel, value) => {
            let result = match characteristic(&device, &channel).await {
               Ok(ch) => ch.write(&value).await,
               Err(e) => Err(e),
            };
            if let Err(e) = &result {
               warn!("{address}: write to {} failed: {e}", channel.uuid);
            }
            events.push(TransportEvent::ChannelWritten {
               address,
               status: status_of(&result),
               channel,
            });
         },
         Command::Read(channel) => {
            let result = match characteristic(&device, &channel).await {
               Ok(ch) => ch.read().await,
               Err(e) => Err(e),
            };
            let status = status_of(&result);
            events.push(TransportEvent::ChannelRead {
               address,
               value: result.unwrap_or_default(),
               status,
               channel,
            });
         },
         Command::SetNotify(channel, enabled) => {
            let key = (channel.service_handle, channel.handle);
            if let Some(previous) = notifiers.remove(&key) {
               previous.abort();
            }
            let status = if enabled {
               match characteristic(&device, &channel).await {
                  Ok(ch) => {
                     let abort = tasks.spawn(forward_changes(
                        address,
                        ch,
                        channel.clone(),
                        events.clone(),
                     ));
                     notifiers.insert(key, abort);
                     GattStatus::SUCCESS
                  },
                  Err(e) => {
                     warn!("{address}: cannot subscribe to {}: {e}", channel.uuid);
                     GattStatus::FAILURE
                  },
               }
            } else {
               GattStatus::SUCCESS
            };
            events.push(TransportEvent::DescriptorWritten {
               address,
               link,
               channel,
               enabled,
               status,
            });
         },
         Command::Rssi => {
            let (rssi, status) = match device.rssi().await {
               Ok(Some(rssi)) => (rssi, GattStatus::SUCCESS),
               Ok(None) => (0, GattStatus::FAILURE),
               Err(e) => {
                  warn!("{address}: RSSI read failed: {e}");
                  (0, GattStatus::FAILURE)
               },
            };
            events.push(TransportEvent::SignalStrengthRead {
               address,
               rssi,
               status,
            });
         },
      }
   }
   debug!("{address}: link worker stopped");
}

async fn characteristic(device: &Device, channel: &Channel) -> bluer::Result<Characteristic> {
   device
      .service(channel.service_handle)
      .await?
      .characteristic(channel.handle)
      .await
}

async fn discover(device: &Device) -> bluer::Result<Vec<Service>> {
   let deadline = time::Instant::now() + DISCOVERY_TIMEOUT;
   while !device.is_services_resolved().await? {
      if time::Instant::now() >= deadline {
         warn!("{}: services not resolved in time", device.address());
         break;
      }
      time::sleep(DISCOVERY_POLL_INTERVAL).await;
   }

   let mut services = Vec::new();
   for service in device.services().await? {
      let uuid = service.uuid().await?;
      let mut channels = Vec::new();
      for ch in service.characteristics().await? {
         let flags = ch.flags().await?;
         let mut properties = Properties::default();
         for (set, bit) in [
            (flags.read, Properties::READ),
            (flags.write_without_response, Properties::WRITE_NO_RESPONSE),
            (flags.write, Properties::WRITE),
            (flags.notify, Properties::NOTIFY),
            (flags.indicate, Properties::INDICATE),
         ] {
            if set {
               properties = properties | bit;
            }
         }
         channels.push(Channel {
            service: uuid,
            uuid: ch.uuid().await?,
            service_handle: service.id(),
            handle: ch.id(),
            properties,
         });
      }
      debug!("{}: service {uuid} with {} channels", device.address(), channels.len());
      services.push(Service {
         uuid,
         handle: service.id(),
         channels,
      });
   }
   Ok(services)
}

async fn forward_changes(
   address: Address,
   ch: Characteristic,
   channel: Channel,
   events: EventSinkRef,
) {
   let stream = match ch.notify().await {
      Ok(stream) => stream,
      Err(e) => {
         warn!("{address}: notify session on {} failed: {e}", channel.uuid);
         return;
      },
   };
   pin_mut!(stream);
   while let Some(value) = stream.next().await {
      events.push(TransportEvent::ChannelChanged {
         address,
         channel: channel.clone(),
         value,
      });
   }
   debug!("{address}: notify session on {} ended", channel.uuid);
}

async fn monitor_device(address: Address, link: LinkHandle, device: Device, events: EventSinkRef) {
   let Ok(stream) = device.events().await else {
      warn!("{address}: failed to get device events");
      return;
   };
   pin_mut!(stream);
   while let Some(event) = stream.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
         warn!("{address}: link lost");
         events.push(TransportEvent::LinkStateChanged {
            address,
            link,
            connected: false,
            status: LINK_LOST,
         });
         return;
      }
   }
}

async fn monitor_adapter(adapter: Adapter, powered: Arc<AtomicBool>, events: EventSinkRef) {
   let Ok(stream) = adapter.events().await else {
      warn!("Failed to get adapter events for {}", adapter.name());
      return;
   };
   pin_mut!(stream);
   while let Some(event) = stream.next().await {
      if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
         powered.store(on, Ordering::SeqCst);
         events.push(TransportEvent::AdapterStateChanged { powered: on });
      }
   }
   warn!("Adapter {} event stream ended", adapter.name());
}

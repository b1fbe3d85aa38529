//! `gattlinkd`: keeps the configured peripherals connected over BlueZ and
//! logs everything they report.

use std::sync::Arc;

use gattlink::{
   BleEvent, BleManager, Config, EventQueue, EventSender, ReconnectPolicy, Result,
   transport::{EventSinkRef, bluez::BluezTransport},
};
use log::{info, warn};
use tokio::{signal, sync::mpsc};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gattlinkd...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let queue = EventQueue::new();
   let transport = BluezTransport::new(queue.clone() as EventSinkRef).await?;

   let (event_tx, mut event_rx) = mpsc::unbounded_channel();
   let manager = BleManager::new(config.clone(), transport, &(Arc::new(event_tx) as EventSender));
   let _reconnect = ReconnectPolicy::install(&manager);
   let dispatcher = manager.spawn_dispatcher(queue);

   let logger = {
      let manager = manager.clone();
      tokio::spawn(async move {
         while let Some(event) = event_rx.recv().await {
            log_event(&manager, &event);
         }
      })
   };

   for device in &config.known_devices {
      manager.set_auto_reconnect(device.address, config.auto_connect);
      if !manager.connect_to(device.address) {
         warn!("Could not start connecting to {} ({})", device.name, device.address);
      }
   }

   signal::ctrl_c().await?;
   info!("Shutting down gattlinkd...");

   manager.shutdown();
   dispatcher.abort();
   logger.abort();

   Ok(())
}

fn log_event(manager: &BleManager, event: &BleEvent) {
   match event {
      BleEvent::ValueChanged {
         address,
         channel,
         value,
      }
      | BleEvent::ReadCompleted {
         address,
         channel,
         value,
      } => {
         info!("{address} {channel}: {}", hex::encode(value));
      },
      BleEvent::Ready { address } => {
         let name = manager.config().is_known_device(*address).unwrap_or("unknown");
         if let Some(info) = manager.device(*address) {
            info!("{name} ready: {}", info.to_json());
         }
      },
      _ => info!("{event:?}"),
   }
}

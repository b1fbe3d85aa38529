//! Reconnect policy layered over the connect handler.
//!
//! The manager never retries on its own. [`ReconnectPolicy`] wraps whatever
//! connect handler is registered, forwards every callback to it, and for
//! devices flagged auto-reconnect re-issues `connect` with exponential
//! backoff after a timeout or an error disconnect.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{task::JoinHandle, time};

use crate::{
   address::Address,
   device::ConnectionState,
   manager::{BleManager, WeakManager},
   router::ConnectHandler,
   transport::GattStatus,
};

/// Upper bound on the delay between attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Attempt {
   retries: u32,
   /// Set by a timeout or failure, consumed by the disconnect that follows.
   failed: bool,
   pending: Option<JoinHandle<()>>,
}

impl Drop for Attempt {
   fn drop(&mut self) {
      if let Some(handle) = self.pending.take() {
         handle.abort();
      }
   }
}

pub struct ReconnectPolicy {
   manager: WeakManager,
   inner: Option<Arc<dyn ConnectHandler>>,
   max_retries: u32,
   attempts: Mutex<HashMap<Address, Attempt>>,
}

impl ReconnectPolicy {
   /// Registers the policy in front of the manager's current connect
   /// handler.
   pub fn install(manager: &BleManager) -> Arc<Self> {
      let policy = Arc::new(Self {
         manager: manager.downgrade(),
         inner: manager.router().connect(),
         max_retries: manager.config().connect_retry_count,
         attempts: Mutex::new(HashMap::new()),
      });
      manager
         .router()
         .register(policy.clone() as Arc<dyn ConnectHandler>);
      policy
   }

   /// Retries spent on `address` since it was last ready.
   pub fn retries(&self, address: Address) -> u32 {
      self.attempts.lock().get(&address).map_or(0, |a| a.retries)
   }

   /// Forgets `address` and cancels any scheduled attempt.
   pub fn stop(&self, address: Address) {
      if self.attempts.lock().remove(&address).is_some() {
         debug!("{address}: reconnect stopped");
      }
   }

   fn mark_failed(&self, address: Address) {
      self.attempts.lock().entry(address).or_default().failed = true;
   }

   fn schedule(&self, address: Address) {
      let Some(manager) = self.manager.upgrade() else {
         return;
      };
      if !manager.device(address).is_some_and(|d| d.auto_reconnect) {
         self.stop(address);
         return;
      }

      let mut attempts = self.attempts.lock();
      let attempt = attempts.entry(address).or_default();
      if attempt.retries >= self.max_retries {
         warn!("{address}: giving up after {} reconnect attempts", attempt.retries);
         attempts.remove(&address);
         return;
      }

      let delay = calc_retry_delay(attempt.retries);
      attempt.retries += 1;
      info!(
         "{address}: reconnecting in {delay:?} (attempt {}/{})",
         attempt.retries, self.max_retries
      );

      let weak = self.manager.clone();
      let task = tokio::spawn(async move {
         time::sleep(delay).await;
         if let Some(manager) = weak.upgrade() {
            manager.connect_to(address);
         }
      });
      if let Some(previous) = attempt.pending.replace(task) {
         previous.abort();
      }
   }

   fn reconnect_powered_devices(&self) {
      let Some(manager) = self.manager.upgrade() else {
         return;
      };
      for info in manager.devices() {
         if info.auto_reconnect && info.state == ConnectionState::Disconnected {
            manager.connect_to(info.address);
         }
      }
   }
}

impl ConnectHandler for ReconnectPolicy {
   fn on_connection_changed(&self, address: Address, state: ConnectionState) {
      if let Some(inner) = &self.inner {
         inner.on_connection_changed(address, state);
      }
      if state != ConnectionState::Disconnected {
         return;
      }

      let failed = self
         .attempts
         .lock()
         .get_mut(&address)
         .is_some_and(|a| std::mem::take(&mut a.failed));
      if failed {
         self.schedule(address);
      } else {
         self.stop(address);
      }
   }

   fn on_connect_timeout(&self, address: Address) {
      if let Some(inner) = &self.inner {
         inner.on_connect_timeout(address);
      }
      self.mark_failed(address);
   }

   fn on_connect_failed(&self, address: Address, status: GattStatus) {
      if let Some(inner) = &self.inner {
         inner.on_connect_failed(address, status);
      }
      self.mark_failed(address);
   }

   fn on_services_discovered(&self, address: Address) {
      if let Some(inner) = &self.inner {
         inner.on_services_discovered(address);
      }
   }

   fn on_ready(&self, address: Address) {
      if let Some(inner) = &self.inner {
         inner.on_ready(address);
      }
      self.stop(address);
   }

   fn on_adapter_state_changed(&self, powered: bool) {
      if let Some(inner) = &self.inner {
         inner.on_adapter_state_changed(powered);
      }
      if powered {
         self.reconnect_powered_devices();
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(5));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

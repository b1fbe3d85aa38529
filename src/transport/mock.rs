//! Recording transport used by the unit tests.

use std::{
   collections::HashMap,
   sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use uuid::Uuid;

use super::{Channel, LinkHandle, Transport};
use crate::{
   address::Address,
   error::{LinkError, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
   Open(Address, bool),
   Close(LinkHandle),
   Discover(LinkHandle),
   Write(LinkHandle, Uuid, Vec<u8>),
   Read(LinkHandle, Uuid),
   SetNotify(LinkHandle, Uuid, bool),
   ReadRssi(LinkHandle),
   RequestMtu(LinkHandle, u16),
}

#[derive(Debug)]
pub struct MockTransport {
   calls: Mutex<Vec<Call>>,
   links: Mutex<HashMap<Address, LinkHandle>>,
   next_link: AtomicU64,
   pub open_ok: AtomicBool,
   pub issue_ok: AtomicBool,
   /// Number of writes accepted before `write_channel` starts refusing.
   write_budget: AtomicU64,
}

impl Default for MockTransport {
   fn default() -> Self {
      Self {
         calls: Mutex::new(Vec::new()),
         links: Mutex::new(HashMap::new()),
         next_link: AtomicU64::new(1),
         open_ok: AtomicBool::new(true),
         issue_ok: AtomicBool::new(true),
         write_budget: AtomicU64::new(u64::MAX),
      }
   }
}

impl MockTransport {
   pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   /// The most recently opened link to `address`.
   pub fn link_of(&self, address: Address) -> Option<LinkHandle> {
      self.links.lock().get(&address).copied()
   }

   pub fn clear(&self) {
      self.calls.lock().clear();
   }

   pub fn fail_writes_after(&self, accepted: u64) {
      self.write_budget.store(accepted, Ordering::SeqCst);
   }

   pub fn writes(&self) -> Vec<Vec<u8>> {
      self
         .calls
         .lock()
         .iter()
         .filter_map(|call| match call {
            Call::Write(_, _, bytes) => Some(bytes.clone()),
            _ => None,
         })
         .collect()
   }

   fn record(&self, call: Call) -> bool {
      self.calls.lock().push(call);
      self.issue_ok.load(Ordering::SeqCst)
   }
}

impl Transport for MockTransport {
   fn open_link(&self, address: Address, auto_reconnect: bool) -> Result<LinkHandle> {
      self.calls.lock().push(Call::Open(address, auto_reconnect));
      if self.open_ok.load(Ordering::SeqCst) {
         let link = LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst));
         self.links.lock().insert(address, link);
         Ok(link)
      } else {
         Err(LinkError::TransportIssue("open"))
      }
   }

   fn close_link(&self, link: LinkHandle) {
      self.calls.lock().push(Call::Close(link));
   }

   fn discover_channels(&self, link: LinkHandle) -> bool {
      self.record(Call::Discover(link))
   }

   fn write_channel(&self, link: LinkHandle, channel: &Channel, value: &[u8]) -> bool {
      let accepted = self
         .write_budget
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
         .is_ok();
      if !accepted {
         return false;
      }
      self.record(Call::Write(link, channel.uuid, value.to_vec()))
   }

   fn read_channel(&self, link: LinkHandle, channel: &Channel) -> bool {
      self.record(Call::Read(link, channel.uuid))
   }

   fn set_notify(&self, link: LinkHandle, channel: &Channel, enabled: bool) -> bool {
      self.record(Call::SetNotify(link, channel.uuid, enabled))
   }

   fn read_signal_strength(&self, link: LinkHandle) -> bool {
      self.record(Call::ReadRssi(link))
   }

   fn request_mtu(&self, link: LinkHandle, mtu: u16) -> bool {
      self.record(Call::RequestMtu(link, mtu))
   }
}

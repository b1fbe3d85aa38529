//! Serial arming of notify-capable channels.
//!
//! GATT stacks accept a single outstanding descriptor write per link, so the
//! notify-capable channels of a device are enabled (or disabled) one at a
//! time: the next channel is armed only once the previous descriptor write
//! has been confirmed.

use crate::transport::Channel;

/// Outcome of a confirmed descriptor write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
   /// Arm this channel next.
   Arm(Channel),
   /// Every channel in the queue has been confirmed.
   Done { enabled: bool },
   /// No sequence was in progress; the confirmation is stale.
   Idle,
}

/// Ordered queue of channels awaiting a confirmed descriptor write.
#[derive(Debug, Clone, Default)]
pub struct NotifySequencer {
   channels: Vec<Channel>,
   cursor: usize,
   enabled: bool,
   running: bool,
}

impl NotifySequencer {
   pub fn new(channels: Vec<Channel>) -> Self {
      Self {
         channels,
         ..Default::default()
      }
   }

   pub fn channels(&self) -> &[Channel] {
      &self.channels
   }

   pub const fn cursor(&self) -> usize {
      self.cursor
   }

   pub const fn is_running(&self) -> bool {
      self.running
   }

   /// Descriptor value of the current (or last) sequence.
   pub const fn enabled(&self) -> bool {
      self.enabled
   }

   /// Replaces the queue contents and resets the cursor.
   pub fn reset(&mut self, channels: Vec<Channel>) {
      self.channels = channels;
      self.cursor = 0;
      self.running = false;
   }

   /// Starts a sequence. Returns the first channel to arm, or
   /// [`Step::Done`] right away when there is nothing to arm.
   pub fn begin(&mut self, enabled: bool) -> Step {
      self.cursor = 0;
      self.enabled = enabled;
      match self.channels.first() {
         Some(first) => {
            self.running = true;
            Step::Arm(first.clone())
         },
         None => {
            self.running = false;
            Step::Done { enabled }
         },
      }
   }

   /// Records a confirmed descriptor write and returns what to do next.
   pub fn advance(&mut self) -> Step {
      if !self.running {
         return Step::Idle;
      }
      if self.cursor + 1 < self.channels.len() {
         self.cursor += 1;
         Step::Arm(self.channels[self.cursor].clone())
      } else {
         self.running = false;
         Step::Done {
            enabled: self.enabled,
         }
      }
   }

   /// Abandons a sequence after a failed descriptor write.
   pub fn abort(&mut self) {
      self.running = false;
   }
}

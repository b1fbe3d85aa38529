//! Chunked, flow-controlled writes.
//!
//! A payload is split into fixed-size packets written one after another to
//! the device's write channel. Between packets the engine either sleeps for
//! a fixed delay (manual pacing) or waits for the transport to confirm the
//! previous write (auto pacing), bounded by a timeout so a lost confirmation
//! cannot stall the transfer. Only one transfer runs at a time.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::{sync::oneshot, task::JoinHandle, time};

use crate::{
   address::Address,
   error::{LinkError, Result},
   pool::TaskPool,
   transport::GattStatus,
};

pub type Packet = SmallVec<[u8; 32]>;

/// Issues a single packet write. Returns whether the write was issued.
pub trait PacketWriter: Send + Sync {
   fn write_packet(&self, address: Address, packet: &[u8]) -> bool;
}

/// Parameters of one chunked write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
   pub address: Address,
   pub payload: Vec<u8>,
   pub packet_len: usize,
   /// Pause between packets in manual mode.
   pub delay: Duration,
   /// Pace on write confirmations instead of `delay`.
   pub auto_pace: bool,
   /// Zero-pad the final packet up to `packet_len`.
   pub pad_final_packet: bool,
}

impl TransferRequest {
   pub fn new(address: Address, payload: impl Into<Vec<u8>>, packet_len: usize) -> Self {
      Self {
         address,
         payload: payload.into(),
         packet_len,
         delay: Duration::ZERO,
         auto_pace: false,
         pad_final_packet: false,
      }
   }

   pub const fn delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
   }

   pub const fn auto_pace(mut self, auto_pace: bool) -> Self {
      self.auto_pace = auto_pace;
      self
   }

   pub const fn pad_final_packet(mut self, pad: bool) -> Self {
      self.pad_final_packet = pad;
      self
   }

   pub fn validate(&self) -> Result<()> {
      if self.payload.is_empty() {
         return Err(LinkError::EmptyPayload);
      }
      if self.packet_len == 0 {
         return Err(LinkError::InvalidPacketLength);
      }
      Ok(())
   }

   pub fn packet_count(&self) -> usize {
      if self.packet_len == 0 {
         0
      } else {
         self.payload.len().div_ceil(self.packet_len)
      }
   }

   pub fn packets(&self) -> Packets<'_> {
      packetize(&self.payload, self.packet_len, self.pad_final_packet)
   }
}

/// Iterator over the packets of a payload, yielding each packet with the
/// number of payload bytes it carries (padding excluded).
#[derive(Debug, Clone)]
pub struct Packets<'a> {
   chunks: Option<std::slice::Chunks<'a, u8>>,
   packet_len: usize,
   pad: bool,
}

impl Iterator for Packets<'_> {
   type Item = (Packet, usize);

   fn next(&mut self) -> Option<Self::Item> {
      let chunk = self.chunks.as_mut()?.next()?;
      let mut packet = Packet::from_slice(chunk);
      if self.pad {
         packet.resize(self.packet_len, 0);
      }
      Some((packet, chunk.len()))
   }
}

/// Splits `payload` into `packet_len`-sized packets. A zero `packet_len`
/// yields nothing.
pub fn packetize(payload: &[u8], packet_len: usize, pad: bool) -> Packets<'_> {
   Packets {
      chunks: (packet_len > 0).then(|| payload.chunks(packet_len)),
      packet_len,
      pad,
   }
}

/// Fraction of `total` covered by `sent`, rounded half-up to two decimals
/// and capped at 1.0.
pub fn progress(sent: usize, total: usize) -> f64 {
   if total == 0 {
      return 1.0;
   }
   let (sent, total) = (sent as u128, total as u128);
   let hundredths = (200 * sent + total) / (2 * total);
   (hundredths as f64 / 100.0).min(1.0)
}

/// How a transfer ended. `confirmed` counts payload bytes whose write was
/// issued before the transfer stopped, minus any packet the device rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
   Completed,
   Failed { confirmed: usize },
   Cancelled { confirmed: usize },
}

/// One-shot write confirmation for the packet in flight, carrying the
/// status the transport reported for it.
#[derive(Debug, Default)]
struct AckSlot(Mutex<Option<(Address, oneshot::Sender<GattStatus>)>>);

impl AckSlot {
   fn arm(&self, address: Address) -> oneshot::Receiver<GattStatus> {
      let (tx, rx) = oneshot::channel();
      *self.0.lock() = Some((address, tx));
      rx
   }

   fn acknowledge(&self, address: Address, status: GattStatus) -> bool {
      let mut slot = self.0.lock();
      match slot.take() {
         Some((armed, tx)) if armed == address => tx.send(status).is_ok(),
         other => {
            *slot = other;
            false
         },
      }
   }

   fn disarm(&self) {
      self.0.lock().take();
   }
}

#[derive(Debug)]
struct WriterState {
   active: AtomicBool,
   cancel: AtomicBool,
   ack: AckSlot,
   ack_timeout: Duration,
}

/// Clears the active flag when a transfer task ends, however it ends.
struct ActiveGuard(Arc<WriterState>);

impl Drop for ActiveGuard {
   fn drop(&mut self) {
      self.0.ack.disarm();
      self.0.active.store(false, Ordering::SeqCst);
   }
}

/// The chunked-write engine. Cheaply cloneable; clones share state.
#[derive(Debug, Clone)]
pub struct ChunkedWriter {
   state: Arc<WriterState>,
}

/// Handle on a running transfer.
#[derive(Debug)]
pub struct TransferHandle {
   handle: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
   /// Waits for the transfer to end.
   pub async fn outcome(self) -> Result<TransferOutcome> {
      self.handle.await.map_err(LinkError::TaskPanicked)
   }

   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }
}

impl ChunkedWriter {
   /// `ack_timeout` bounds each wait for a write confirmation in auto-pace
   /// mode.
   pub fn new(ack_timeout: Duration) -> Self {
      Self {
         state: Arc::new(WriterState {
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            ack: AckSlot::default(),
            ack_timeout,
         }),
      }
   }

   pub fn is_active(&self) -> bool {
      self.state.active.load(Ordering::SeqCst)
   }

   /// Requests cancellation of the running transfer. Takes effect before the
   /// next packet is sent. Returns whether a transfer was running.
   pub fn cancel(&self) -> bool {
      if self.is_active() {
         self.state.cancel.store(true, Ordering::SeqCst);
         true
      } else {
         false
      }
   }

   /// Delivers a write completion from `address`. A paced transfer waiting
   /// on it advances on success and fails otherwise. Returns whether one was
   /// waiting.
   pub fn acknowledge(&self, address: Address, status: GattStatus) -> bool {
      self.state.ack.acknowledge(address, status)
   }

   /// Validates `request` and starts it on `pool`. `on_progress` receives
   /// the progress after every successfully issued packet.
   pub fn start<W, F>(
      &self,
      pool: &TaskPool,
      writer: W,
      request: TransferRequest,
      on_progress: F,
   ) -> Result<TransferHandle>
   where
      W: PacketWriter + 'static,
      F: FnMut(f64) + Send + 'static,
   {
      request.validate()?;
      if self
         .state
         .active
         .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
         .is_err()
      {
         return Err(LinkError::TransferBusy);
      }
      self.state.cancel.store(false, Ordering::SeqCst);

      let guard = ActiveGuard(self.state.clone());
      let handle = pool.spawn(async move {
         let state = guard.0.clone();
         let outcome = run(&state, &writer, request, on_progress).await;
         drop(guard);
         outcome
      });
      Ok(TransferHandle { handle })
   }
}

async fn run<W, F>(
   state: &WriterState,
   writer: &W,
   request: TransferRequest,
   mut on_progress: F,
) -> TransferOutcome
where
   W: PacketWriter,
   F: FnMut(f64),
{
   let address = request.address;
   let total = request.payload.len();
   let count = request.packet_count();
   info!(
      "{address}: transferring {total} bytes in {count} packets of {} ({})",
      request.packet_len,
      if request.auto_pace { "auto-paced" } else { "fixed delay" }
   );

   let mut sent = 0;
   for (index, (packet, len)) in request.packets().enumerate() {
      if state.cancel.load(Ordering::SeqCst) {
         info!("{address}: transfer cancelled after {sent}/{total} bytes");
         return TransferOutcome::Cancelled { confirmed: sent };
      }

      let ack = request.auto_pace.then(|| state.ack.arm(address));
      if !writer.write_packet(address, &packet) {
         state.ack.disarm();
         warn!("{address}: transfer failed at packet {}/{count}", index + 1);
         return TransferOutcome::Failed { confirmed: sent };
      }
      sent += len;
      on_progress(progress(sent, total));

      match ack {
         Some(ack) => match time::timeout(state.ack_timeout, ack).await {
            Ok(Ok(status)) if !status.is_success() => {
               warn!(
                  "{address}: packet {}/{count} rejected with status {status}",
                  index + 1
               );
               return TransferOutcome::Failed {
                  confirmed: sent - len,
               };
            },
            Ok(_) => {},
            Err(_) => {
               debug!("{address}: no write confirmation for packet {}, continuing", index + 1);
            },
         },
         None if index + 1 < count => time::sleep(request.delay).await,
         None => {},
      }
   }

   info!("{address}: transfer of {total} bytes complete");
   TransferOutcome::Completed
}

#[cfg(test)]
mod tests {
   use tokio::{sync::mpsc, time::Instant};

   use super::*;

   const ADDR: Address = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   #[derive(Default)]
   struct Recorder {
      packets: Mutex<Vec<Vec<u8>>>,
      fail_at: Option<usize>,
      tap: Option<mpsc::UnboundedSender<usize>>,
   }

   impl PacketWriter for Arc<Recorder> {
      fn write_packet(&self, _address: Address, packet: &[u8]) -> bool {
         let mut packets = self.packets.lock();
         if self.fail_at == Some(packets.len()) {
            return false;
         }
         packets.push(packet.to_vec());
         if let Some(tap) = &self.tap {
            let _ = tap.send(packets.len());
         }
         true
      }
   }

   fn progress_log() -> (Arc<Mutex<Vec<f64>>>, impl FnMut(f64) + Send + 'static) {
      let log = Arc::new(Mutex::new(Vec::new()));
      let sink = log.clone();
      (log, move |p| sink.lock().push(p))
   }

   #[test]
   fn test_packet_count_and_reassembly() {
      let payload: Vec<u8> = (0..=255u8).cycle().take(97).collect();
      for len in 1..=payload.len() + 3 {
         for pad in [false, true] {
            let packets: Vec<_> = packetize(&payload, len, pad).collect();
            assert_eq!(packets.len(), payload.len().div_ceil(len));

            let mut joined = Vec::new();
            for (packet, carried) in &packets {
               joined.extend_from_slice(&packet[..*carried]);
               if pad {
                  assert_eq!(packet.len(), len);
                  assert!(packet[*carried..].iter().all(|b| *b == 0));
               }
            }
            assert_eq!(joined, payload);
         }
      }
      assert_eq!(packetize(&payload, 0, false).count(), 0);
   }

   #[test]
   fn test_progress_rounding() {
      assert_eq!(progress(20, 45), 0.44);
      assert_eq!(progress(40, 45), 0.89);
      assert_eq!(progress(45, 45), 1.0);
      // Exact halves round up.
      assert_eq!(progress(1, 200), 0.01);
      assert_eq!(progress(50, 45), 1.0);
   }

   #[test]
   fn test_validation() {
      assert!(matches!(
         TransferRequest::new(ADDR, Vec::<u8>::new(), 20).validate(),
         Err(LinkError::EmptyPayload)
      ));
      assert!(matches!(
         TransferRequest::new(ADDR, vec![1u8], 0).validate(),
         Err(LinkError::InvalidPacketLength)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_example_transfer() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder::default());
      let (log, on_progress) = progress_log();

      let request = TransferRequest::new(ADDR, vec![7u8; 45], 20).delay(Duration::from_millis(100));
      let start = Instant::now();
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, on_progress)
         .unwrap();
      assert!(writer.is_active());

      assert_eq!(handle.outcome().await.unwrap(), TransferOutcome::Completed);
      let lengths: Vec<_> = recorder.packets.lock().iter().map(Vec::len).collect();
      assert_eq!(lengths, vec![20, 20, 5]);
      assert_eq!(*log.lock(), vec![0.44, 0.89, 1.0]);
      // Delays only separate packets.
      assert!(start.elapsed() >= Duration::from_millis(200));
      assert!(start.elapsed() < Duration::from_millis(300));
      assert!(!writer.is_active());
   }

   #[tokio::test(start_paused = true)]
   async fn test_padded_final_packet() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder::default());
      let request = TransferRequest::new(ADDR, vec![1u8; 45], 20).pad_final_packet(true);
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, |_| {})
         .unwrap();
      assert_eq!(handle.outcome().await.unwrap(), TransferOutcome::Completed);

      let packets = recorder.packets.lock();
      assert_eq!(packets.len(), 3);
      assert_eq!(packets[2].len(), 20);
      assert_eq!(&packets[2][..5], &[1u8; 5]);
      assert_eq!(&packets[2][5..], &[0u8; 15]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_invalid_request_starts_nothing() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder::default());
      let err = writer
         .start(
            &TaskPool::new(1),
            recorder.clone(),
            TransferRequest::new(ADDR, Vec::<u8>::new(), 20),
            |_| {},
         )
         .unwrap_err();
      assert!(err.is_validation());
      assert!(!writer.is_active());
      assert!(recorder.packets.lock().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_single_active_transfer() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let pool = TaskPool::new(2);
      let recorder = Arc::new(Recorder::default());
      let slow = TransferRequest::new(ADDR, vec![0u8; 40], 10).delay(Duration::from_secs(1));

      let handle = writer.start(&pool, recorder.clone(), slow.clone(), |_| {}).unwrap();
      assert!(matches!(
         writer.start(&pool, recorder.clone(), slow.clone(), |_| {}),
         Err(LinkError::TransferBusy)
      ));

      assert_eq!(handle.outcome().await.unwrap(), TransferOutcome::Completed);
      let again = writer.start(&pool, recorder, slow, |_| {}).unwrap();
      assert_eq!(again.outcome().await.unwrap(), TransferOutcome::Completed);
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_mid_transfer() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder::default());
      let canceller = writer.clone();
      let (log, mut record) = progress_log();
      let on_progress = move |p: f64| {
         record(p);
         if p >= 0.4 {
            assert!(canceller.cancel());
         }
      };

      let request = TransferRequest::new(ADDR, vec![3u8; 50], 10).delay(Duration::from_millis(10));
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, on_progress)
         .unwrap();

      assert_eq!(
         handle.outcome().await.unwrap(),
         TransferOutcome::Cancelled { confirmed: 20 }
      );
      assert_eq!(recorder.packets.lock().len(), 2);
      assert_eq!(*log.lock(), vec![0.2, 0.4]);
      assert!(!writer.cancel());
   }

   #[tokio::test(start_paused = true)]
   async fn test_write_failure_stops_transfer() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder {
         fail_at: Some(2),
         ..Default::default()
      });
      let (log, on_progress) = progress_log();
      let request = TransferRequest::new(ADDR, vec![0u8; 100], 20);
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, on_progress)
         .unwrap();

      assert_eq!(
         handle.outcome().await.unwrap(),
         TransferOutcome::Failed { confirmed: 40 }
      );
      assert_eq!(recorder.packets.lock().len(), 2);
      assert_eq!(*log.lock(), vec![0.2, 0.4]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_pace_advances_on_ack() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let (tap, mut written) = mpsc::unbounded_channel();
      let recorder = Arc::new(Recorder {
         tap: Some(tap),
         ..Default::default()
      });
      // The configured delay is ignored in auto-pace mode.
      let request = TransferRequest::new(ADDR, vec![0u8; 30], 10)
         .delay(Duration::from_secs(60))
         .auto_pace(true);

      let start = Instant::now();
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, |_| {})
         .unwrap();
      for expected in 1..=3 {
         assert_eq!(written.recv().await, Some(expected));
         // A confirmation from another device does not pace this transfer.
         assert!(!writer.acknowledge(Address::new([1; 6]), GattStatus::SUCCESS));
         assert!(writer.acknowledge(ADDR, GattStatus::SUCCESS));
      }

      assert_eq!(handle.outcome().await.unwrap(), TransferOutcome::Completed);
      assert!(start.elapsed() < Duration::from_millis(500));
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_pace_falls_back_to_timeout() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let recorder = Arc::new(Recorder::default());
      let request = TransferRequest::new(ADDR, vec![0u8; 30], 10).auto_pace(true);

      let start = Instant::now();
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, |_| {})
         .unwrap();
      assert_eq!(handle.outcome().await.unwrap(), TransferOutcome::Completed);
      assert_eq!(recorder.packets.lock().len(), 3);
      assert!(start.elapsed() >= Duration::from_millis(1500));
      assert!(start.elapsed() < Duration::from_millis(1600));
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_pace_stops_on_rejected_write() {
      let writer = ChunkedWriter::new(Duration::from_millis(500));
      let (tap, mut written) = mpsc::unbounded_channel();
      let recorder = Arc::new(Recorder {
         tap: Some(tap),
         ..Default::default()
      });
      let (log, on_progress) = progress_log();
      let request = TransferRequest::new(ADDR, vec![0u8; 30], 10).auto_pace(true);
      let handle = writer
         .start(&TaskPool::new(1), recorder.clone(), request, on_progress)
         .unwrap();

      assert_eq!(written.recv().await, Some(1));
      assert!(writer.acknowledge(ADDR, GattStatus::SUCCESS));
      assert_eq!(written.recv().await, Some(2));
      assert!(writer.acknowledge(ADDR, GattStatus(0x03)));

      assert_eq!(
         handle.outcome().await.unwrap(),
         TransferOutcome::Failed { confirmed: 10 }
      );
      assert_eq!(recorder.packets.lock().len(), 2);
      assert_eq!(*log.lock(), vec![0.33, 0.67]);
      assert!(!writer.is_active());
   }
}

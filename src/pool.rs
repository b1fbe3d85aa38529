//! Bounded pool for background jobs.
//!
//! Chunked transfers and other caller-issued sequences that suspend run
//! here, off the event-dispatch path. At most `size` of them make progress
//! at once; the rest wait for a permit.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};

#[derive(Debug, Clone)]
pub struct TaskPool {
   permits: Arc<Semaphore>,
   size: usize,
}

impl TaskPool {
   pub fn new(size: usize) -> Self {
      let size = size.max(1);
      Self {
         permits: Arc::new(Semaphore::new(size)),
         size,
      }
   }

   pub const fn size(&self) -> usize {
      self.size
   }

   /// Number of jobs that could start right now without waiting.
   pub fn available(&self) -> usize {
      self.permits.available_permits()
   }

   pub fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
   where
      F: Future + Send + 'static,
      F::Output: Send + 'static,
   {
      let permits = self.permits.clone();
      tokio::spawn(async move {
         // The semaphore is never closed, so the permit is always granted.
         let _permit = permits.acquire_owned().await.ok();
         job.await
      })
   }
}

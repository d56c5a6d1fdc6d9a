//! Memory batcher
//!
//! Accumulates vector-memory writes and flushes either when the batch hits
//! its size cap or after a quiet delay, whichever comes first. The actual
//! network write always happens on a worker task so callers in the speech
//! and screen pipelines never wait on the backend.

use crate::inference::{InferenceClient, MemoryItem, MemorySource};
use crate::trace::TraceContext;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Batcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Batch size that triggers an immediate flush
    pub max_size: usize,
    /// Quiet period after which a partial batch flushes
    pub flush_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            flush_delay: Duration::from_millis(2000),
        }
    }
}

struct BatchState {
    items: Vec<MemoryItem>,
    timer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    stopped: bool,
}

struct Shared {
    client: Arc<InferenceClient>,
    config: BatcherConfig,
    state: Mutex<BatchState>,
}

/// Size/delay-batched writer to `Memory.BatchStore`.
pub struct MemoryBatcher {
    shared: Arc<Shared>,
}

impl MemoryBatcher {
    pub fn new(client: Arc<InferenceClient>, config: BatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                state: Mutex::new(BatchState {
                    items: Vec::new(),
                    timer: None,
                    workers: Vec::new(),
                    stopped: false,
                }),
            }),
        }
    }

    /// Queue one item. Reaching the size cap flushes inside this call
    /// (dispatching the write to a worker); otherwise the delay timer is
    /// re-armed.
    pub fn add(&self, text: &str, source: MemorySource) {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            debug!("memory batcher stopped, dropping item");
            return;
        }
        state.items.push(MemoryItem {
            text: text.to_string(),
            source,
        });

        if state.items.len() >= self.shared.config.max_size {
            Shared::flush_locked(&self.shared, &mut state);
        } else {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let shared = self.shared.clone();
            let delay = self.shared.config.flush_delay;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut state = shared.state.lock().unwrap();
                Shared::flush_locked(&shared, &mut state);
            }));
        }
    }

    /// Flush whatever is pending right now.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock().unwrap();
        Shared::flush_locked(&self.shared, &mut state);
    }

    /// Flush the remainder and wait for every in-flight worker.
    pub async fn stop(&self) {
        let workers = {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            Shared::flush_locked(&self.shared, &mut state);
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.await;
        }
        debug!("memory batcher stopped");
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }
}

impl Shared {
    /// Swap the batch out under the lock and dispatch it to a worker.
    fn flush_locked(shared: &Arc<Shared>, state: &mut BatchState) {
        if state.items.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.items);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let client = shared.client.clone();
        let worker = tokio::spawn(async move {
            let ctx = TraceContext::new();
            match client.batch_store(&ctx, &batch).await {
                Ok(stored) => debug!(stored, "memory batch stored"),
                Err(err) => warn!(error = %err, dropped = batch.len(), "memory batch store failed"),
            }
        });
        state.workers.retain(|w| !w.is_finished());
        state.workers.push(worker);
    }
}

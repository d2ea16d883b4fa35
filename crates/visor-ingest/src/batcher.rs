//! Trailing-debounce batching for ambient speech. Finalized transcript
//! fragments pile into a buffer; a pause in input flushes the buffer as
//! one turn. The buffer is only ever emptied by a successful hand-off to
//! the transport or an explicit cancel, so nothing said while a send is
//! in flight is lost.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use visor_core::reply::Reply;
use visor_core::turn::TurnPort;

#[derive(Clone, Debug)]
pub struct BatcherConfig {
    /// Quiet period that ends a batch.
    pub quiet: Duration,
    /// Upper bound on how long one send may stay in flight before the
    /// batcher gives up on it and drains what has accumulated since.
    pub safety: Duration,
    /// Prepended to every batched message.
    pub prefix: String,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            quiet: Duration::from_millis(2_500),
            safety: Duration::from_secs(60),
            prefix: String::new(),
        }
    }
}

struct BatchState {
    buffer: Vec<String>,
    debounce: Option<AbortHandle>,
    debounce_gen: u64,
    in_flight: bool,
    /// A flush arrived while a send was in flight; retry on completion.
    deferred: bool,
    safety: Option<AbortHandle>,
}

struct BatcherInner {
    config: BatcherConfig,
    port: Arc<dyn TurnPort>,
    out: mpsc::Sender<String>,
    state: Mutex<BatchState>,
}

/// Debounced single-consumer batcher over a `TurnPort`. Clones share
/// state.
#[derive(Clone)]
pub struct InputBatcher {
    inner: Arc<BatcherInner>,
}

impl InputBatcher {
    pub fn new(config: BatcherConfig, port: Arc<dyn TurnPort>, out: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                port,
                out,
                state: Mutex::new(BatchState {
                    buffer: Vec::new(),
                    debounce: None,
                    debounce_gen: 0,
                    in_flight: false,
                    deferred: false,
                    safety: None,
                }),
            }),
        }
    }

    /// Append a fragment and restart the quiet-period timer.
    pub fn push(&self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.trim().is_empty() {
            return;
        }

        let mut state = self.inner.state.lock();
        state.buffer.push(fragment);
        state.debounce_gen += 1;
        if let Some(timer) = state.debounce.take() {
            timer.abort();
        }

        let generation = state.debounce_gen;
        let batcher = self.clone();
        let quiet = self.inner.config.quiet;
        state.debounce = Some(
            tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                if batcher.inner.state.lock().debounce_gen == generation {
                    batcher.try_flush();
                }
            })
            .abort_handle(),
        );
    }

    /// Drop everything buffered and resolve any in-flight turn empty.
    pub async fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            state.buffer.clear();
            state.deferred = false;
            if let Some(timer) = state.debounce.take() {
                timer.abort();
            }
            if let Some(timer) = state.safety.take() {
                timer.abort();
            }
            state.in_flight = false;
        }
        let cancelled = self.inner.port.cancel_all().await;
        if cancelled > 0 {
            tracing::info!(cancelled, "batcher cancelled in-flight turns");
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// Send the buffer as one turn, unless a send is already in flight;
    /// then keep the buffer and retry when it completes.
    fn try_flush(&self) {
        let message = {
            let mut state = self.inner.state.lock();
            if state.buffer.is_empty() {
                return;
            }
            if state.in_flight {
                state.deferred = true;
                tracing::debug!(fragments = state.buffer.len(), "send in flight, flush deferred");
                return;
            }
            state.in_flight = true;
            let joined = state.buffer.join(" ");
            state.buffer.clear();

            let batcher = self.clone();
            let safety = self.inner.config.safety;
            state.safety = Some(
                tokio::spawn(async move {
                    tokio::time::sleep(safety).await;
                    batcher.force_release().await;
                })
                .abort_handle(),
            );
            format!("{}{}", self.inner.config.prefix, joined)
        };

        let batcher = self.clone();
        tokio::spawn(async move {
            let raw = batcher.inner.port.submit_turn(message, None).await;
            batcher.on_send_complete(raw);
        });
    }

    fn on_send_complete(&self, raw: String) {
        let (stale, retry) = {
            let mut state = self.inner.state.lock();
            if !state.in_flight {
                // The safety timer already released this send; its reply
                // no longer has an owner.
                (true, false)
            } else {
                state.in_flight = false;
                if let Some(timer) = state.safety.take() {
                    timer.abort();
                }
                let retry = state.deferred || !state.buffer.is_empty();
                state.deferred = false;
                (false, retry)
            }
        };

        if stale {
            tracing::debug!("dropping reply from an abandoned send");
        } else {
            match Reply::classify(&raw) {
                Reply::Text(text) => {
                    if self.inner.out.try_send(text).is_err() {
                        tracing::warn!("batch reply dropped: consumer not keeping up");
                    }
                }
                Reply::Silent => tracing::debug!("batch turn declined a reply"),
            }
        }

        if retry {
            self.try_flush();
        }
    }

    /// Safety bound hit: stop waiting on the stuck send, cancel it, and
    /// drain whatever has accumulated meanwhile.
    async fn force_release(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.in_flight {
                return;
            }
            state.in_flight = false;
            state.safety = None;
            state.deferred = false;
        }
        tracing::warn!("in-flight send exceeded safety bound, cancelling");
        self.inner.port.cancel_all().await;
        self.try_flush();
    }
}

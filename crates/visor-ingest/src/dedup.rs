//! Per-source notification coalescing. The first event from a source is
//! flushed with zero added latency; everything else from that source
//! inside a sliding window collapses into one trailing flush with a
//! count. Bounds display churn to one render per quiet window per source
//! without dropping information.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Clone, Debug)]
pub struct DedupConfig {
    /// Sliding quiet window per source.
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15),
        }
    }
}

/// A coalesced notification ready for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationFlush {
    pub source: String,
    pub body: String,
    /// Events represented by this flush.
    pub count: u32,
}

struct Entry {
    /// Events accumulated since the immediate flush.
    pending: u32,
    last_body: String,
    /// Bumped on every arrival; a window timer only acts if its
    /// generation still matches.
    generation: u64,
    timer: Option<AbortHandle>,
}

struct DedupInner {
    config: DedupConfig,
    entries: Mutex<HashMap<String, Entry>>,
    out: mpsc::Sender<NotificationFlush>,
}

/// Sliding-window deduplicator. Clones share state.
#[derive(Clone)]
pub struct NotificationDedup {
    inner: Arc<DedupInner>,
}

impl NotificationDedup {
    pub fn new(config: DedupConfig, out: mpsc::Sender<NotificationFlush>) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                config,
                entries: Mutex::new(HashMap::new()),
                out,
            }),
        }
    }

    pub fn add(&self, source: impl Into<String>, body: impl Into<String>) {
        let source = source.into();
        let body = body.into();

        let mut entries = self.inner.entries.lock();
        match entries.get_mut(&source) {
            None => {
                // First sighting: surface immediately, then open the window.
                self.emit(NotificationFlush {
                    source: source.clone(),
                    body: body.clone(),
                    count: 1,
                });
                let timer = self.arm_window(source.clone(), 0);
                entries.insert(
                    source,
                    Entry {
                        pending: 0,
                        last_body: body,
                        generation: 0,
                        timer: Some(timer),
                    },
                );
            }
            Some(entry) => {
                entry.pending += 1;
                entry.last_body = body;
                entry.generation += 1;
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                entry.timer = Some(self.arm_window(source, entry.generation));
            }
        }
    }

    /// Open sources (windows currently running).
    pub fn open_windows(&self) -> usize {
        self.inner.entries.lock().len()
    }

    fn arm_window(&self, source: String, generation: u64) -> AbortHandle {
        let dedup = self.clone();
        let window = self.inner.config.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            dedup.close_window(&source, generation);
        })
        .abort_handle()
    }

    fn close_window(&self, source: &str, generation: u64) {
        let flush = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get(source) else { return };
            if entry.generation != generation {
                return; // a newer arrival restarted the window
            }
            let Some(entry) = entries.remove(source) else { return };
            (entry.pending > 0).then(|| NotificationFlush {
                source: source.to_string(),
                body: entry.last_body,
                count: entry.pending,
            })
        };
        if let Some(flush) = flush {
            self.emit(flush);
        }
    }

    fn emit(&self, flush: NotificationFlush) {
        if self.inner.out.try_send(flush).is_err() {
            tracing::warn!("notification flush dropped: consumer not keeping up");
        }
    }
}

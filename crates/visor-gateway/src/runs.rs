//! Per-turn run tracking. Every submitted turn gets a slot that moves
//! through an explicit state machine: unmatched (FIFO, waiting for the
//! backend to announce a run id) → matched (keyed by run id) → resolved.
//! A slot is resolved exactly once, by whichever happens first of a
//! terminal reply, the end-grace window, cancellation, or the hard
//! timeout, and every timer guarding it is aborted at that moment.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use visor_core::ids::RunId;
use visor_core::turn::WaitingSignal;

/// Timeout schedule for one turn.
#[derive(Clone, Debug)]
pub struct RunTimeouts {
    /// Fires the caller's waiting signal; the turn stays live.
    pub soft: Duration,
    /// Force-resolves with the slot's fallback text.
    pub hard: Duration,
    /// How long a lifecycle end waits for a late terminal reply before
    /// the turn resolves as "no reply due".
    pub end_grace: Duration,
}

impl Default for RunTimeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(45),
            hard: Duration::from_secs(300),
            end_grace: Duration::from_secs(2),
        }
    }
}

struct Slot {
    id: u64,
    outcome: Option<oneshot::Sender<String>>,
    waiting: Option<WaitingSignal>,
    hard_fallback: String,
    timers: Vec<AbortHandle>,
    end_seen: bool,
}

impl Slot {
    /// Resolve and tear down. Idempotence comes from removal: a slot is
    /// taken out of the ledger before this runs, so no second path can
    /// reach it.
    fn finish(mut self, text: &str) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(text.to_string());
        }
    }
}

#[derive(Default)]
struct Ledger {
    unmatched: VecDeque<Slot>,
    matched: HashMap<RunId, Slot>,
}

impl Ledger {
    fn take_by_id(&mut self, slot_id: u64) -> Option<Slot> {
        if let Some(pos) = self.unmatched.iter().position(|s| s.id == slot_id) {
            return self.unmatched.remove(pos);
        }
        let run_id = self
            .matched
            .iter()
            .find(|(_, s)| s.id == slot_id)
            .map(|(k, _)| k.clone())?;
        self.matched.remove(&run_id)
    }

    fn get_mut_by_id(&mut self, slot_id: u64) -> Option<&mut Slot> {
        if let Some(slot) = self.unmatched.iter_mut().find(|s| s.id == slot_id) {
            return Some(slot);
        }
        self.matched.values_mut().find(|s| s.id == slot_id)
    }
}

/// Handle returned to the submitting caller.
pub struct TurnTicket {
    pub slot: u64,
    pub outcome: oneshot::Receiver<String>,
}

/// Registry of live turn slots. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    timeouts: RunTimeouts,
    ledger: Mutex<Ledger>,
    next_slot: AtomicU64,
}

impl RunRegistry {
    pub fn new(timeouts: RunTimeouts) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                timeouts,
                ledger: Mutex::new(Ledger::default()),
                next_slot: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new turn at the back of the unmatched queue and arm its
    /// soft and hard timers.
    pub fn begin_turn(&self, waiting: Option<WaitingSignal>, hard_fallback: String) -> TurnTicket {
        let slot_id = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let soft = {
            let registry = self.clone();
            let delay = self.inner.timeouts.soft;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.fire_waiting(slot_id);
            })
            .abort_handle()
        };
        let hard = {
            let registry = self.clone();
            let delay = self.inner.timeouts.hard;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.expire(slot_id);
            })
            .abort_handle()
        };

        let slot = Slot {
            id: slot_id,
            outcome: Some(tx),
            waiting,
            hard_fallback,
            timers: vec![soft, hard],
            end_seen: false,
        };
        self.inner.ledger.lock().unmatched.push_back(slot);

        TurnTicket {
            slot: slot_id,
            outcome: rx,
        }
    }

    /// The backend announced a run start: associate it with the oldest
    /// unmatched turn. The backend starts runs in request order, so the
    /// match is strict FIFO.
    pub fn on_start(&self, run_id: RunId) -> bool {
        let mut ledger = self.inner.ledger.lock();
        let Some(slot) = ledger.unmatched.pop_front() else {
            tracing::debug!(run_id = %run_id, "lifecycle start with no waiting turn");
            return false;
        };
        if let Some(displaced) = ledger.matched.insert(run_id.clone(), slot) {
            tracing::warn!(run_id = %run_id, "run id reused; resolving displaced turn empty");
            displaced.finish("");
        }
        true
    }

    /// Terminal reply for a matched run. Unknown run ids are a no-op:
    /// the turn may already have resolved by timeout or cancellation.
    pub fn on_final(&self, run_id: &RunId, text: &str) -> bool {
        let slot = self.inner.ledger.lock().matched.remove(run_id);
        match slot {
            Some(slot) => {
                slot.finish(text);
                true
            }
            None => false,
        }
    }

    /// Lifecycle end for a matched run. The terminal reply may still be
    /// in flight, so the slot gets a grace window instead of resolving
    /// immediately; if nothing lands in time it resolves empty.
    pub fn on_end(&self, run_id: &RunId) {
        let mut ledger = self.inner.ledger.lock();
        let Some(slot) = ledger.matched.get_mut(run_id) else {
            return;
        };
        if slot.end_seen {
            return;
        }
        slot.end_seen = true;

        let registry = self.clone();
        let run_id = run_id.clone();
        let grace = self.inner.timeouts.end_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let slot = registry.inner.ledger.lock().matched.remove(&run_id);
            if let Some(slot) = slot {
                tracing::debug!(run_id = %run_id, "run ended with no terminal reply");
                slot.finish("");
            }
        })
        .abort_handle();
        slot.timers.push(handle);
    }

    /// Resolve a specific turn, wherever it currently lives.
    pub fn resolve(&self, slot_id: u64, text: &str) -> bool {
        let slot = self.inner.ledger.lock().take_by_id(slot_id);
        match slot {
            Some(slot) => {
                slot.finish(text);
                true
            }
            None => false,
        }
    }

    /// Resolve every outstanding turn with empty text.
    pub fn cancel_all(&self) -> usize {
        let (unmatched, matched) = {
            let mut ledger = self.inner.ledger.lock();
            let unmatched: Vec<Slot> = ledger.unmatched.drain(..).collect();
            let matched: Vec<Slot> = ledger.matched.drain().map(|(_, s)| s).collect();
            (unmatched, matched)
        };
        let count = unmatched.len() + matched.len();
        for slot in unmatched.into_iter().chain(matched) {
            slot.finish("");
        }
        count
    }

    /// (unmatched, matched) live slot counts.
    pub fn counts(&self) -> (usize, usize) {
        let ledger = self.inner.ledger.lock();
        (ledger.unmatched.len(), ledger.matched.len())
    }

    fn fire_waiting(&self, slot_id: u64) {
        let mut ledger = self.inner.ledger.lock();
        if let Some(slot) = ledger.get_mut_by_id(slot_id) {
            if let Some(waiting) = slot.waiting.take() {
                let _ = waiting.send(());
            }
        }
    }

    fn expire(&self, slot_id: u64) {
        let slot = self.inner.ledger.lock().take_by_id(slot_id);
        if let Some(slot) = slot {
            tracing::warn!(slot = slot_id, "turn hit hard timeout");
            let fallback = slot.hard_fallback.clone();
            slot.finish(&fallback);
        }
    }
}

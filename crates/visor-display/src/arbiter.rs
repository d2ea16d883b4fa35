//! The display arbiter: single owner of the physical display. One job
//! renders at a time. Interactive jobs (driven by the user speaking)
//! flush the queue and take the display immediately; passive jobs
//! (notifications, pushed bitmaps) wait their turn in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::bitmap::solid_black_frame;
use crate::paginate::paginate;
use crate::surface::DisplaySurface;

/// Dwell times for each job class.
#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    /// Per page of a paginated reply.
    pub page_dwell: Duration,
    /// Added after the last page before the display clears.
    pub page_trail: Duration,
    /// Thinking/waiting screens hold the display at most this long.
    pub interactive_hold: Duration,
    pub welcome_dwell: Duration,
    pub status_dwell: Duration,
    pub notification_dwell: Duration,
    pub bitmap_dwell: Duration,
    /// Pause between the black frame and the clear in bitmap teardown.
    pub blackout_delay: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            page_dwell: Duration::from_secs(12),
            page_trail: Duration::from_secs(2),
            interactive_hold: Duration::from_secs(60),
            welcome_dwell: Duration::from_secs(3),
            status_dwell: Duration::from_secs(3),
            notification_dwell: Duration::from_secs(10),
            bitmap_dwell: Duration::from_secs(10),
            blackout_delay: Duration::from_millis(250),
        }
    }
}

/// Snapshot for the debug endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DisplayStatus {
    pub busy: bool,
    pub queue_depth: usize,
    pub busy_remaining_ms: u64,
}

enum Job {
    /// Sequential labeled pages, then trail grace, then clear.
    Pages(Vec<String>),
    /// Plain text for a fixed dwell, then clear.
    Plain { body: String, dwell: Duration },
    /// Title/body card for a fixed dwell, then clear.
    Card {
        title: String,
        body: String,
        dwell: Duration,
    },
    /// Bitmap with the two-step teardown: image, black frame, clear.
    Bitmap { payload: String, dwell: Duration },
}

struct State {
    busy: bool,
    queue: VecDeque<Job>,
    current: Option<AbortHandle>,
    /// Generation of the job that owns the display. A finishing job may
    /// have been superseded between its last render step and its
    /// completion callback; the generation check makes that a no-op.
    current_gen: u64,
    next_gen: u64,
    busy_until: Option<Instant>,
}

struct ArbiterInner {
    surface: Arc<dyn DisplaySurface>,
    config: ArbiterConfig,
    state: Mutex<State>,
}

/// Single consumer of the display. Clones share the same state.
#[derive(Clone)]
pub struct DisplayArbiter {
    inner: Arc<ArbiterInner>,
}

impl DisplayArbiter {
    pub fn new(surface: Arc<dyn DisplaySurface>, config: ArbiterConfig) -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                surface,
                config,
                state: Mutex::new(State {
                    busy: false,
                    queue: VecDeque::new(),
                    current: None,
                    current_gen: 0,
                    next_gen: 0,
                    busy_until: None,
                }),
            }),
        }
    }

    // Interactive operations: always preempt.

    pub fn show_welcome(&self, text: impl Into<String>) {
        let dwell = self.inner.config.welcome_dwell;
        self.preempt(Job::Plain {
            body: text.into(),
            dwell,
        });
    }

    pub fn show_thinking(&self, user_text: impl Into<String>) {
        let dwell = self.inner.config.interactive_hold;
        self.preempt(Job::Card {
            title: user_text.into(),
            body: "Thinking...".into(),
            dwell,
        });
    }

    pub fn show_waiting(&self) {
        let dwell = self.inner.config.interactive_hold;
        self.preempt(Job::Plain {
            body: "Still working on it...".into(),
            dwell,
        });
    }

    pub fn show_reply(&self, text: &str) {
        self.preempt(Job::Pages(paginate(text)));
    }

    pub fn show_status(&self, text: impl Into<String>, dwell: Option<Duration>) {
        let dwell = dwell.unwrap_or(self.inner.config.status_dwell);
        self.preempt(Job::Plain {
            body: text.into(),
            dwell,
        });
    }

    // Passive operations: render when idle, queue when busy.

    pub fn show_notification(
        &self,
        title: impl Into<String>,
        body: impl Into<String>,
        dwell: Option<Duration>,
    ) {
        let dwell = dwell.unwrap_or(self.inner.config.notification_dwell);
        self.passive(Job::Card {
            title: title.into(),
            body: body.into(),
            dwell,
        });
    }

    pub fn push_bitmap(&self, payload: impl Into<String>, dwell: Option<Duration>) {
        let dwell = dwell.unwrap_or(self.inner.config.bitmap_dwell);
        self.passive(Job::Bitmap {
            payload: payload.into(),
            dwell,
        });
    }

    /// Cosmetic dashboard line. Failures are swallowed.
    pub fn set_dashboard(&self, line: impl Into<String>) {
        let surface = Arc::clone(&self.inner.surface);
        let line = line.into();
        tokio::spawn(async move {
            if let Err(e) = surface.write_dashboard(&line).await {
                tracing::debug!(error = %e, "dashboard write failed");
            }
        });
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().busy
    }

    pub fn status(&self) -> DisplayStatus {
        let state = self.inner.state.lock();
        let remaining = state
            .busy_until
            .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        DisplayStatus {
            busy: state.busy,
            queue_depth: state.queue.len(),
            busy_remaining_ms: remaining,
        }
    }

    /// Interactive path: flush queued passives, abort the current job,
    /// own the display now.
    fn preempt(&self, job: Job) {
        let mut state = self.inner.state.lock();
        let dropped = state.queue.len();
        if dropped > 0 {
            tracing::debug!(dropped, "interactive job flushed queued notifications");
        }
        state.queue.clear();
        if let Some(current) = state.current.take() {
            current.abort();
        }
        self.start_locked(&mut state, job);
    }

    /// Passive path: queue behind whatever currently owns the display.
    fn passive(&self, job: Job) {
        let mut state = self.inner.state.lock();
        if state.busy {
            state.queue.push_back(job);
            tracing::debug!(depth = state.queue.len(), "display busy, job queued");
            return;
        }
        self.start_locked(&mut state, job);
    }

    fn start_locked(&self, state: &mut State, job: Job) {
        state.next_gen += 1;
        let generation = state.next_gen;
        state.current_gen = generation;
        state.busy = true;
        state.busy_until = Some(Instant::now() + self.job_duration(&job));
        let arbiter = self.clone();
        let handle = tokio::spawn(async move {
            arbiter.render(&job).await;
            arbiter.complete(generation);
        })
        .abort_handle();
        state.current = Some(handle);
    }

    /// Busy window for a job: everything up to and including its clear.
    fn job_duration(&self, job: &Job) -> Duration {
        let config = &self.inner.config;
        match job {
            Job::Pages(pages) => config.page_dwell * pages.len() as u32 + config.page_trail,
            Job::Plain { dwell, .. } | Job::Card { dwell, .. } => *dwell,
            Job::Bitmap { dwell, .. } => *dwell + config.blackout_delay,
        }
    }

    async fn render(&self, job: &Job) {
        let surface = &self.inner.surface;
        let config = &self.inner.config;
        match job {
            Job::Pages(pages) => {
                for page in pages {
                    if let Err(e) = surface.show_text(page).await {
                        tracing::warn!(error = %e, "reply page render failed");
                    }
                    tokio::time::sleep(config.page_dwell).await;
                }
                tokio::time::sleep(config.page_trail).await;
                let _ = surface.clear().await;
            }
            Job::Plain { body, dwell } => {
                if let Err(e) = surface.show_text(body).await {
                    tracing::warn!(error = %e, "text render failed");
                }
                tokio::time::sleep(*dwell).await;
                let _ = surface.clear().await;
            }
            Job::Card { title, body, dwell } => {
                if let Err(e) = surface.show_card(title, body).await {
                    tracing::warn!(error = %e, "card render failed");
                }
                tokio::time::sleep(*dwell).await;
                let _ = surface.clear().await;
            }
            Job::Bitmap { payload, dwell } => {
                if let Err(e) = surface.show_bitmap(payload).await {
                    tracing::warn!(error = %e, "bitmap render failed");
                }
                tokio::time::sleep(*dwell).await;
                // The panel ghosts if cleared straight from an image:
                // paint it black first, then clear.
                let _ = surface.show_bitmap(&solid_black_frame()).await;
                tokio::time::sleep(config.blackout_delay).await;
                let _ = surface.clear().await;
            }
        }
    }

    /// Job finished: hand the display to the next queued job, if any.
    fn complete(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.current_gen != generation {
            return; // superseded after its last render step
        }
        state.current = None;
        match state.queue.pop_front() {
            Some(next) => self.start_locked(&mut state, next),
            None => {
                state.busy = false;
                state.busy_until = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockSurface, SurfaceCall};

    fn fast_config() -> ArbiterConfig {
        ArbiterConfig {
            page_dwell: Duration::from_millis(30),
            page_trail: Duration::from_millis(10),
            interactive_hold: Duration::from_millis(200),
            welcome_dwell: Duration::from_millis(30),
            status_dwell: Duration::from_millis(30),
            notification_dwell: Duration::from_millis(30),
            bitmap_dwell: Duration::from_millis(30),
            blackout_delay: Duration::from_millis(10),
        }
    }

    fn setup() -> (Arc<MockSurface>, DisplayArbiter) {
        let surface = Arc::new(MockSurface::new());
        let arbiter = DisplayArbiter::new(Arc::clone(&surface) as Arc<dyn DisplaySurface>, fast_config());
        (surface, arbiter)
    }

    #[tokio::test]
    async fn idle_notification_renders_immediately() {
        let (surface, arbiter) = setup();
        arbiter.show_notification("Mail", "2 new messages", None);

        surface.wait_for_calls(1).await;
        assert_eq!(
            surface.calls()[0],
            SurfaceCall::Card {
                title: "Mail".into(),
                body: "2 new messages".into()
            }
        );
    }

    #[tokio::test]
    async fn busy_notification_queues_and_renders_in_order() {
        let (surface, arbiter) = setup();
        arbiter.show_notification("First", "a", None);
        arbiter.show_notification("Second", "b", None);
        arbiter.show_notification("Third", "c", None);
        assert!(arbiter.is_busy());

        // card + clear per job
        surface.wait_for_calls(6).await;
        let titles: Vec<String> = surface
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SurfaceCall::Card { title, .. } => Some(title),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec!["First", "Second", "Third"]);
        assert!(!arbiter.is_busy());
    }

    #[tokio::test]
    async fn interactive_reply_flushes_queue_and_preempts() {
        let (surface, arbiter) = setup();
        arbiter.show_notification("First", "a", None);
        arbiter.show_notification("Queued", "b", None);
        assert_eq!(arbiter.status().queue_depth, 1);

        arbiter.show_reply("short answer");
        assert_eq!(arbiter.status().queue_depth, 0);

        // reply text + clear, then idle; the queued card must never render
        surface.wait_for_calls(2).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let calls = surface.calls();
        assert!(calls.contains(&SurfaceCall::Text("short answer".into())));
        assert!(
            !calls.iter().any(|c| matches!(c, SurfaceCall::Card { title, .. } if title == "Queued")),
            "flushed notification still rendered: {calls:?}"
        );
        assert!(!arbiter.is_busy());
    }

    #[tokio::test]
    async fn long_reply_renders_labeled_pages_in_sequence() {
        let (surface, arbiter) = setup();
        let text = "word ".repeat(120).trim_end().to_string();
        let pages = paginate(&text);
        assert!(pages.len() >= 2);

        arbiter.show_reply(&text);
        surface.wait_for_calls(pages.len() + 1).await; // pages + clear

        let shown: Vec<String> = surface
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SurfaceCall::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(shown, pages);
        assert_eq!(surface.calls().last(), Some(&SurfaceCall::Clear));
    }

    #[tokio::test]
    async fn bitmap_teardown_paints_black_before_clear() {
        let (surface, arbiter) = setup();
        arbiter.push_bitmap("Qk0_payload", None);

        surface.wait_for_calls(3).await;
        let calls = surface.calls();
        assert_eq!(calls[0], SurfaceCall::Bitmap("Qk0_payload".into()));
        assert_eq!(calls[1], SurfaceCall::Bitmap(solid_black_frame()));
        assert_eq!(calls[2], SurfaceCall::Clear);
    }

    #[tokio::test]
    async fn thinking_holds_display_until_reply_supersedes() {
        let (surface, arbiter) = setup();
        arbiter.show_thinking("what is the time");
        surface.wait_for_calls(1).await;
        assert!(arbiter.is_busy());

        arbiter.show_reply("half past three");
        surface.wait_for_calls(3).await;
        let calls = surface.calls();
        assert!(calls.contains(&SurfaceCall::Text("half past three".into())));
    }

    #[tokio::test]
    async fn dashboard_failure_is_swallowed() {
        let (surface, arbiter) = setup();
        surface.set_failing(true);
        arbiter.set_dashboard("Visor: Ready");
        surface.wait_for_calls(1).await;
        assert_eq!(surface.calls()[0], SurfaceCall::Dashboard("Visor: Ready".into()));
        // nothing to assert beyond "no panic": the error is logged and dropped
    }

    #[tokio::test]
    async fn primary_render_failure_still_completes_job() {
        let (surface, arbiter) = setup();
        surface.set_failing(true);
        arbiter.show_notification("Mail", "body", None);
        surface.wait_for_calls(2).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!arbiter.is_busy(), "failed render must not wedge the arbiter");
    }

    #[tokio::test]
    async fn busy_window_reflects_page_count() {
        let (surface, arbiter) = setup();
        let text = "word ".repeat(120).trim_end().to_string();
        let pages = paginate(&text).len() as u64;

        arbiter.show_reply(&text);
        let status = arbiter.status();
        assert!(status.busy);
        assert!(status.busy_remaining_ms <= pages * 30 + 10);
        assert!(status.busy_remaining_ms > (pages - 1) * 30);
        let _ = surface;
    }
}

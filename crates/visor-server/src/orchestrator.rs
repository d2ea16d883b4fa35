//! Per-session orchestration: routes device events into the batcher,
//! the deduplicator, the transport, and the display arbiter, and owns
//! the session's voice-command and head-gesture behavior.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use visor_core::device::{DeviceEvent, HeadPosition};
use visor_core::reply::Reply;
use visor_core::turn::TurnPort;
use visor_ingest::{BatcherConfig, DedupConfig, InputBatcher, NotificationDedup, NotificationFlush};

use crate::sessions::BridgeSession;

/// Steers replies toward something readable on a four-line monochrome
/// panel.
const TURN_PREFIX: &str =
    "Wearable display reply: use two or three short plain sentences. No markdown, no emoji.\n\n";

/// Batched ambient speech gets a different framing: hints, not answers.
const COPILOT_PREFIX: &str = "Ambient mode: the wearer is in a conversation nearby and you are \
listening silently. Do not address them directly. Offer one or two very short contextual hints \
or facts only when genuinely useful.\n\nOverheard: ";

/// Phrases that flip copilot mode, after normalization.
const COPILOT_TOGGLES: &[&str] = &["copilot mode", "copilot on", "copilot off", "copilotmode"];

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// How long the head must stay up to toggle the mic.
    pub head_hold: Duration,
    /// Notification bodies are clipped to this many characters.
    pub notification_max_chars: usize,
    /// A word boundary earlier than this is ignored when clipping.
    pub notification_cut_floor: usize,
    pub turn_prefix: String,
    pub batcher: BatcherConfig,
    pub dedup: DedupConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            head_hold: Duration::from_secs(6),
            notification_max_chars: 150,
            notification_cut_floor: 80,
            turn_prefix: TURN_PREFIX.into(),
            batcher: BatcherConfig {
                prefix: COPILOT_PREFIX.into(),
                ..BatcherConfig::default()
            },
            dedup: DedupConfig::default(),
        }
    }
}

/// Keeps the orchestration tasks of one session alive.
pub struct OrchestratorHandle {
    events_task: JoinHandle<()>,
    flush_task: JoinHandle<()>,
    reply_task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Tear the session's tasks down (device disconnect).
    pub fn abort(&self) {
        self.events_task.abort();
        self.flush_task.abort();
        self.reply_task.abort();
    }
}

pub struct SessionOrchestrator {
    session: Arc<BridgeSession>,
    port: Arc<dyn TurnPort>,
    config: OrchestratorConfig,
    batcher: InputBatcher,
    dedup: NotificationDedup,
    head_timer: Mutex<Option<AbortHandle>>,
}

impl SessionOrchestrator {
    /// Wire one session and start consuming its device events.
    pub fn start(
        session: Arc<BridgeSession>,
        port: Arc<dyn TurnPort>,
        config: OrchestratorConfig,
        events: mpsc::Receiver<DeviceEvent>,
    ) -> OrchestratorHandle {
        let (flush_tx, flush_rx) = mpsc::channel::<NotificationFlush>(32);
        let (reply_tx, reply_rx) = mpsc::channel::<String>(16);

        let dedup = NotificationDedup::new(config.dedup.clone(), flush_tx);
        let batcher = InputBatcher::new(config.batcher.clone(), Arc::clone(&port), reply_tx);

        let orchestrator = Arc::new(Self {
            session: Arc::clone(&session),
            port,
            config,
            batcher,
            dedup,
            head_timer: Mutex::new(None),
        });

        session.display.show_welcome(if orchestrator.port.is_connected() {
            "Assistant connected."
        } else {
            "Assistant offline."
        });
        session.display.set_dashboard(session.dashboard_line());

        let events_task = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(orchestrator.run_events(events))
        };
        let flush_task = tokio::spawn(run_flushes(Arc::clone(&session), flush_rx));
        let reply_task = tokio::spawn(run_batch_replies(session, reply_rx));

        OrchestratorHandle {
            events_task,
            flush_task,
            reply_task,
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            tracing::debug!(session_id = %self.session.id, event = event.event_type(), "device event");
            match event {
                DeviceEvent::Transcription { text, is_final } => self.on_transcription(text, is_final),
                DeviceEvent::HeadPosition { position } => self.on_head(position),
                DeviceEvent::PhoneNotification { app, title, content } => {
                    self.on_notification(app, title, content)
                }
            }
        }
        tracing::info!(session_id = %self.session.id, "device event stream closed");
    }

    fn on_transcription(self: &Arc<Self>, text: String, is_final: bool) {
        if !is_final {
            return;
        }
        let text = text.trim().to_string();
        if text.is_empty() || !self.session.listening() {
            return;
        }

        let lower = text.to_lowercase();

        // Voice commands work in any mode.
        if lower.contains("new session") {
            self.session.display.show_status("New session...", None);
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                match orchestrator.port.send_command("/new".into()).await {
                    Ok(()) => orchestrator.session.display.show_status("Session reset.", None),
                    Err(e) => {
                        tracing::warn!(error = %e, "session reset command failed");
                        orchestrator.session.display.show_status("Reset failed.", None);
                    }
                }
            });
            return;
        }

        if is_copilot_toggle(&lower) {
            let on = self.session.toggle_copilot();
            tracing::info!(session_id = %self.session.id, copilot = on, "copilot toggled by voice");
            self.session
                .display
                .show_status(if on { "Copilot on" } else { "Copilot off" }, None);
            self.session.display.set_dashboard(self.session.dashboard_line());
            if !on {
                // Leaving copilot abandons anything half-gathered.
                let batcher = self.batcher.clone();
                tokio::spawn(async move { batcher.cancel().await });
            }
            return;
        }

        if self.session.copilot() {
            self.batcher.push(text);
            return;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_turn(text).await });
    }

    /// The normal-mode turn flow: thinking card, waiting hint at the
    /// soft timeout, then the classified reply (or nothing).
    async fn run_turn(self: Arc<Self>, text: String) {
        tracing::info!(session_id = %self.session.id, chars = text.len(), "user turn");
        self.session.display.show_thinking(&text);

        let (wait_tx, wait_rx) = oneshot::channel();
        {
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                if wait_rx.await.is_ok() {
                    session.display.show_waiting();
                }
            });
        }

        let message = format!("{}{}", self.config.turn_prefix, text);
        let raw = self.port.submit_turn(message, Some(wait_tx)).await;

        match Reply::classify(&raw) {
            Reply::Text(reply) => {
                tracing::info!(session_id = %self.session.id, chars = reply.len(), "assistant reply");
                self.session.display.show_reply(&reply);
            }
            Reply::Silent => {
                tracing::debug!(session_id = %self.session.id, "assistant declined to reply");
            }
        }
    }

    fn on_head(self: &Arc<Self>, position: HeadPosition) {
        match position {
            HeadPosition::Up => {
                let mut timer = self.head_timer.lock();
                if let Some(previous) = timer.take() {
                    previous.abort();
                }
                let orchestrator = Arc::clone(self);
                let hold = self.config.head_hold;
                *timer = Some(
                    tokio::spawn(async move {
                        tokio::time::sleep(hold).await;
                        orchestrator.head_timer.lock().take();
                        orchestrator.toggle_mic();
                    })
                    .abort_handle(),
                );
            }
            HeadPosition::Down => {
                if let Some(timer) = self.head_timer.lock().take() {
                    timer.abort();
                }
            }
        }
    }

    fn toggle_mic(&self) {
        let on = self.session.toggle_listening();
        tracing::info!(session_id = %self.session.id, listening = on, "mic toggled by head hold");
        self.session
            .display
            .show_status(if on { "Listening..." } else { "Mic off." }, None);
        self.session.display.set_dashboard(self.session.dashboard_line());
    }

    fn on_notification(&self, app: String, title: String, content: String) {
        let app = if app.is_empty() { "Notification".to_string() } else { app };
        let body = match (title.is_empty(), content.is_empty()) {
            (false, false) => format!("{title}: {content}"),
            (false, true) => title,
            (true, _) => content,
        };
        if body.is_empty() {
            return;
        }
        let body = clip_notification(
            &body,
            self.config.notification_max_chars,
            self.config.notification_cut_floor,
        );
        tracing::info!(session_id = %self.session.id, app = %app, "phone notification");
        self.dedup.add(app, body);
    }
}

async fn run_flushes(session: Arc<BridgeSession>, mut flushes: mpsc::Receiver<NotificationFlush>) {
    while let Some(flush) = flushes.recv().await {
        let body = if flush.count > 1 {
            format!("{} ({} updates)", flush.body, flush.count)
        } else {
            flush.body
        };
        session.display.show_notification(flush.source, body, None);
    }
}

async fn run_batch_replies(session: Arc<BridgeSession>, mut replies: mpsc::Receiver<String>) {
    while let Some(text) = replies.recv().await {
        session.display.show_reply(&text);
    }
}

/// Strict matching for the copilot toggle so ordinary sentences that
/// mention the word never flip the mode.
fn is_copilot_toggle(lower: &str) -> bool {
    let normalized: String = lower
        .chars()
        .filter(|c| !matches!(c, '-' | '.' | ',' | '!' | '?'))
        .collect();
    let normalized = normalized.trim();
    COPILOT_TOGGLES.iter().any(|p| normalized == *p)
}

/// Clip a notification body to `max` characters at a word boundary,
/// falling back to a hard cut when the last boundary is uselessly early.
fn clip_notification(body: &str, max: usize, floor: usize) -> String {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() <= max {
        return body.to_string();
    }
    let cut = chars[..=max]
        .iter()
        .rposition(|c| *c == ' ')
        .filter(|i| *i > floor)
        .unwrap_or(max);
    let mut clipped: String = chars[..cut].iter().collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use visor_core::errors::BridgeError;
    use visor_core::ids::SessionId;
    use visor_core::turn::WaitingSignal;
    use visor_display::mock::{MockSurface, SurfaceCall};
    use visor_display::{ArbiterConfig, DisplayArbiter, DisplaySurface};

    struct FakePort {
        submissions: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
        replies: Mutex<VecDeque<String>>,
        cancels: AtomicUsize,
    }

    impl FakePort {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                submissions: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                cancels: AtomicUsize::new(0),
            })
        }

        fn submissions(&self) -> Vec<String> {
            self.submissions.lock().clone()
        }
    }

    #[async_trait]
    impl TurnPort for FakePort {
        async fn submit_turn(&self, message: String, _waiting: Option<WaitingSignal>) -> String {
            self.submissions.lock().push(message);
            self.replies.lock().pop_front().unwrap_or_default()
        }

        async fn send_command(&self, message: String) -> Result<(), BridgeError> {
            self.commands.lock().push(message);
            Ok(())
        }

        async fn cancel_all(&self) -> usize {
            self.cancels.fetch_add(1, Ordering::Relaxed);
            0
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn fast_arbiter() -> ArbiterConfig {
        ArbiterConfig {
            page_dwell: Duration::from_millis(30),
            page_trail: Duration::from_millis(10),
            interactive_hold: Duration::from_millis(300),
            welcome_dwell: Duration::from_millis(20),
            status_dwell: Duration::from_millis(20),
            notification_dwell: Duration::from_millis(30),
            bitmap_dwell: Duration::from_millis(30),
            blackout_delay: Duration::from_millis(10),
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            head_hold: Duration::from_millis(60),
            batcher: BatcherConfig {
                quiet: Duration::from_millis(40),
                safety: Duration::from_millis(800),
                prefix: COPILOT_PREFIX.into(),
            },
            dedup: DedupConfig {
                window: Duration::from_millis(50),
            },
            ..OrchestratorConfig::default()
        }
    }

    struct Rig {
        surface: Arc<MockSurface>,
        session: Arc<BridgeSession>,
        port: Arc<FakePort>,
        events: mpsc::Sender<DeviceEvent>,
        _handle: OrchestratorHandle,
    }

    fn rig(replies: Vec<&str>) -> Rig {
        let surface = Arc::new(MockSurface::new());
        let display = DisplayArbiter::new(
            Arc::clone(&surface) as Arc<dyn DisplaySurface>,
            fast_arbiter(),
        );
        let session = Arc::new(BridgeSession::new(SessionId::new(), display));
        let port = FakePort::new(replies);
        let (events, events_rx) = mpsc::channel(32);
        let handle = SessionOrchestrator::start(
            Arc::clone(&session),
            Arc::clone(&port) as Arc<dyn TurnPort>,
            fast_config(),
            events_rx,
        );
        Rig {
            surface,
            session,
            port,
            events,
            _handle: handle,
        }
    }

    async fn transcribe(rig: &Rig, text: &str) {
        rig.events
            .send(DeviceEvent::Transcription {
                text: text.into(),
                is_final: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_start_shows_welcome_and_dashboard() {
        let r = rig(vec![]);
        r.surface.wait_for_calls(2).await;
        let calls = r.surface.calls();
        assert!(calls.contains(&SurfaceCall::Text("Assistant connected.".into())));
        assert!(calls.contains(&SurfaceCall::Dashboard("Visor: Ready".into())));
    }

    #[tokio::test]
    async fn final_transcription_runs_a_turn() {
        let r = rig(vec!["three o'clock"]);
        r.session.set_listening(true);
        transcribe(&r, "what time is it").await;

        for _ in 0..200 {
            let calls = r.surface.calls();
            if calls.contains(&SurfaceCall::Text("three o'clock".into())) {
                assert!(calls.iter().any(|c| matches!(
                    c,
                    SurfaceCall::Card { title, body } if title == "what time is it" && body == "Thinking..."
                )));
                let sent = r.port.submissions();
                assert_eq!(sent.len(), 1);
                assert!(sent[0].starts_with(TURN_PREFIX));
                assert!(sent[0].ends_with("what time is it"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reply never rendered: {:?}", r.surface.calls());
    }

    #[tokio::test]
    async fn interim_transcriptions_and_muted_mic_are_ignored() {
        let r = rig(vec!["should not be used"]);

        r.events
            .send(DeviceEvent::Transcription {
                text: "partial".into(),
                is_final: false,
            })
            .await
            .unwrap();
        // Mic off: even a final segment goes nowhere.
        transcribe(&r, "hello there").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(r.port.submissions().is_empty());
    }

    #[tokio::test]
    async fn silent_reply_renders_nothing() {
        let r = rig(vec!["NO_REPLY nothing worth saying"]);
        r.session.set_listening(true);
        transcribe(&r, "anything new").await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = r.surface.calls();
        assert!(
            !calls.iter().any(|c| matches!(c, SurfaceCall::Text(t) if t.contains("NO_REPLY"))),
            "sentinel reply leaked to the display: {calls:?}"
        );
    }

    #[tokio::test]
    async fn copilot_fragments_batch_into_one_prefixed_turn() {
        let r = rig(vec!["the venue opened in 1997"]);
        r.session.set_listening(true);
        r.session.toggle_copilot();

        transcribe(&r, "when did this place open").await;
        transcribe(&r, "I think in the nineties").await;

        for _ in 0..200 {
            if !r.port.submissions().is_empty() {
                let sent = r.port.submissions();
                assert_eq!(sent.len(), 1, "fragments must coalesce into one turn");
                assert!(sent[0].starts_with(COPILOT_PREFIX));
                assert!(sent[0].ends_with("when did this place open I think in the nineties"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("copilot batch never submitted");
    }

    #[tokio::test]
    async fn copilot_toggle_phrase_flips_mode_not_a_turn() {
        let r = rig(vec![]);
        r.session.set_listening(true);

        transcribe(&r, "Copilot on.").await;
        for _ in 0..100 {
            if r.session.copilot() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(r.session.copilot());
        assert!(r.port.submissions().is_empty(), "toggle phrase must not reach the backend");

        transcribe(&r, "copilot off").await;
        for _ in 0..100 {
            if !r.session.copilot() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!r.session.copilot());
    }

    #[tokio::test]
    async fn new_session_phrase_sends_reset_command() {
        let r = rig(vec![]);
        r.session.set_listening(true);
        transcribe(&r, "start a new session please").await;

        for _ in 0..100 {
            if !r.port.commands.lock().is_empty() {
                assert_eq!(r.port.commands.lock().clone(), vec!["/new"]);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reset command never sent");
    }

    #[tokio::test]
    async fn phone_notification_flows_through_dedup_to_display() {
        let r = rig(vec![]);
        r.events
            .send(DeviceEvent::PhoneNotification {
                app: "Messages".into(),
                title: "Ana".into(),
                content: "running late".into(),
            })
            .await
            .unwrap();

        for _ in 0..200 {
            let calls = r.surface.calls();
            if calls.iter().any(|c| matches!(
                c,
                SurfaceCall::Card { title, body } if title == "Messages" && body == "Ana: running late"
            )) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("notification never rendered: {:?}", r.surface.calls());
    }

    #[tokio::test]
    async fn head_hold_toggles_mic_and_early_drop_cancels() {
        let r = rig(vec![]);
        assert!(!r.session.listening());

        // Early drop: no toggle.
        r.events
            .send(DeviceEvent::HeadPosition {
                position: HeadPosition::Up,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        r.events
            .send(DeviceEvent::HeadPosition {
                position: HeadPosition::Down,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!r.session.listening(), "early head drop must cancel the hold");

        // Full hold: toggles on.
        r.events
            .send(DeviceEvent::HeadPosition {
                position: HeadPosition::Up,
            })
            .await
            .unwrap();
        for _ in 0..100 {
            if r.session.listening() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("head hold never toggled the mic");
    }

    #[test]
    fn copilot_toggle_matching_is_strict() {
        assert!(is_copilot_toggle("copilot on"));
        assert!(is_copilot_toggle("copilot off!"));
        assert!(is_copilot_toggle("co-pilot mode"));
        assert!(is_copilot_toggle("copilot mode."));
        assert!(!is_copilot_toggle("turn the copilot thing on please"));
        assert!(!is_copilot_toggle("copilot"));
    }

    #[test]
    fn notification_clipping_prefers_word_boundaries() {
        let short = "fits entirely";
        assert_eq!(clip_notification(short, 150, 80), short);

        let long = "word ".repeat(60); // 300 chars
        let clipped = clip_notification(long.trim_end(), 150, 80);
        assert!(clipped.ends_with("..."));
        assert!(clipped.chars().count() <= 154);
        assert!(!clipped.trim_end_matches("...").ends_with(' '));

        let unbroken = "x".repeat(300);
        let clipped = clip_notification(&unbroken, 150, 80);
        assert_eq!(clipped.chars().count(), 153, "hard cut at the limit plus ellipsis");
    }
}

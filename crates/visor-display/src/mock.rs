//! Recording display surface for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use visor_core::errors::BridgeError;

use crate::surface::DisplaySurface;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SurfaceCall {
    Text(String),
    Card { title: String, body: String },
    Bitmap(String),
    Clear,
    Dashboard(String),
}

/// Records every call; can be flipped into a failing mode to exercise
/// error paths.
#[derive(Default)]
pub struct MockSurface {
    calls: Mutex<Vec<SurfaceCall>>,
    failing: AtomicBool,
}

impl MockSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Poll until at least `n` calls were recorded. Panics after ~5s.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.call_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} surface calls, saw {:?}", self.calls());
    }

    fn record(&self, call: SurfaceCall) -> Result<(), BridgeError> {
        self.calls.lock().push(call);
        if self.failing.load(Ordering::Relaxed) {
            Err(BridgeError::DisplayUnavailable("mock failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DisplaySurface for MockSurface {
    async fn show_text(&self, body: &str) -> Result<(), BridgeError> {
        self.record(SurfaceCall::Text(body.to_string()))
    }

    async fn show_card(&self, title: &str, body: &str) -> Result<(), BridgeError> {
        self.record(SurfaceCall::Card {
            title: title.to_string(),
            body: body.to_string(),
        })
    }

    async fn show_bitmap(&self, base64_bmp: &str) -> Result<(), BridgeError> {
        self.record(SurfaceCall::Bitmap(base64_bmp.to_string()))
    }

    async fn clear(&self) -> Result<(), BridgeError> {
        self.record(SurfaceCall::Clear)
    }

    async fn write_dashboard(&self, line: &str) -> Result<(), BridgeError> {
        self.record(SurfaceCall::Dashboard(line.to_string()))
    }
}

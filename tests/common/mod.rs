#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use autoplay::action::{KeyCode, MouseActionKind, MouseButton};
use autoplay::hal::{
    Frame, HalResult, InputDriver, Point, Recognizer, Region, ScreenCapture, Template,
};
use autoplay::RecognitionResult;
use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ tracing を初期化
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Input driver that records what was sent and when, relative to its creation.
pub struct RecordingDriver {
    started: Instant,
    calls: Mutex<Vec<(Duration, String)>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Duration, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn offsets_ms(&self) -> Vec<u128> {
        self.calls().iter().map(|(at, _)| at.as_millis()).collect()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap()
            .push((self.started.elapsed(), call));
    }
}

#[async_trait]
impl InputDriver for RecordingDriver {
    async fn set_key_state(&self, code: KeyCode, pressed: bool) -> HalResult<()> {
        self.record(format!("key {} {}", code, if pressed { "down" } else { "up" }));
        Ok(())
    }

    async fn set_mouse_state(
        &self,
        button: MouseButton,
        action: MouseActionKind,
        position: Option<Point>,
        scroll_delta: i32,
    ) -> HalResult<()> {
        self.record(format!(
            "mouse {} {} {:?} {}",
            button, action, position, scroll_delta
        ));
        Ok(())
    }
}

pub struct BlankCapture;

#[async_trait]
impl ScreenCapture for BlankCapture {
    async fn capture_region(&self, region: Region) -> HalResult<Frame> {
        Ok(Frame::new(region, vec![0u8; 16]))
    }
}

/// Recognizes templates listed in `visible` with a fixed confidence.
pub struct ListRecognizer {
    pub visible: Vec<&'static str>,
}

#[async_trait]
impl Recognizer for ListRecognizer {
    async fn recognize(&self, frame: &Frame, template: &Template) -> HalResult<RecognitionResult> {
        let success = self.visible.contains(&template.name.as_str());
        let confidence = if success { 0.92 } else { 0.15 };
        Ok(RecognitionResult::new(template.name.clone(), success, confidence).with_region(frame.region))
    }
}

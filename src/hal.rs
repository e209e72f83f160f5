//! # Platform collaborators
//!
//! The engine never talks to an operating system or a vision library
//! directly. It drives these traits instead:
//!
//! * [`InputDriver`]: executes exactly one key or mouse state change.
//! * [`ScreenCapture`]: grabs a region of the screen as a [`Frame`].
//! * [`Recognizer`]: matches one [`Template`] against one [`Frame`].
//!
//! The sequencer only uses [`InputDriver`]; capture and recognition belong to
//! the sense side of the orchestration loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::action::{KeyCode, MouseActionKind, MouseButton};
use crate::context::RecognitionResult;
use crate::timestamp::Timestamp;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HalError {
    #[error("Input device error: {message}")]
    Device { message: String },
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },
    #[error("Screen capture failed: {message}")]
    Capture { message: String },
    #[error("Recognition of template {template} failed: {message}")]
    Recognition { template: String, message: String },
}

pub type HalResult<T> = Result<T, HalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    pub fn contains(&self, point: Point) -> bool {
        let dx = i64::from(point.x) - i64::from(self.x);
        let dy = i64::from(point.y) - i64::from(self.y);
        dx >= 0 && dy >= 0 && dx < i64::from(self.width) && dy < i64::from(self.height)
    }
}

/// Captured pixels of a screen region. The pixel layout is owned by the
/// capture backend; the engine passes frames through untouched.
#[derive(Debug, Clone)]
pub struct Frame {
    pub region: Region,
    pub pixels: Arc<[u8]>,
    pub captured_at: Timestamp,
}

impl Frame {
    pub fn new(region: Region, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            region,
            pixels: pixels.into(),
            captured_at: Timestamp::now(),
        }
    }
}

/// A named reference image plus the score above which a match counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub image: Vec<u8>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Vec::new(),
            threshold: default_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

fn default_threshold() -> f64 {
    0.8
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn set_key_state(&self, code: KeyCode, pressed: bool) -> HalResult<()>;

    async fn set_mouse_state(
        &self,
        button: MouseButton,
        action: MouseActionKind,
        position: Option<Point>,
        scroll_delta: i32,
    ) -> HalResult<()>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture_region(&self, region: Region) -> HalResult<Frame>;
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, frame: &Frame, template: &Template) -> HalResult<RecognitionResult>;
}

/// Input driver that only logs what it would do. Used for dry runs.
#[derive(Debug, Default, Clone)]
pub struct LoggingInputDriver;

#[async_trait]
impl InputDriver for LoggingInputDriver {
    async fn set_key_state(&self, code: KeyCode, pressed: bool) -> HalResult<()> {
        info!(%code, pressed, "key");
        Ok(())
    }

    async fn set_mouse_state(
        &self,
        button: MouseButton,
        action: MouseActionKind,
        position: Option<Point>,
        scroll_delta: i32,
    ) -> HalResult<()> {
        info!(%button, %action, ?position, scroll_delta, "mouse");
        Ok(())
    }
}

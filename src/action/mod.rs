//! # Input actions
//!
//! A [`GameAction`] is one recorded input event: a key state change, a mouse
//! event, or an explicit pause. Actions are immutable values. Every
//! "modification" (`with_delay`, `with_position`, ...) returns a new value,
//! so a sequence that is currently being played can never change under the
//! player's feet.
//!
//! The `delay` of an action is its offset from the start of the recording
//! (cumulative capture time). The player waits for the difference between two
//! consecutive offsets.

pub mod library;
pub mod sequence;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hal::Point;
use crate::timestamp::Timestamp;

pub use library::ActionLibrary;
pub use sequence::ActionSequence;

/// Platform virtual key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyCode(pub u32);

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    X1,
    X2,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum MouseActionKind {
    Press,
    Release,
    Move,
    Scroll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    Key {
        code: KeyCode,
        pressed: bool,
    },
    Mouse {
        button: MouseButton,
        action: MouseActionKind,
        #[serde(default)]
        position: Option<Point>,
        #[serde(default)]
        scroll_delta: i32,
    },
    Delay {
        #[serde(with = "crate::config::duration_ms")]
        duration: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAction {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(default)]
    created_at: Timestamp,
    #[serde(with = "crate::config::duration_ms")]
    delay: Duration,
    kind: ActionKind,
}

impl GameAction {
    pub fn new(kind: ActionKind, delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Timestamp::now(),
            delay,
            kind,
        }
    }

    pub fn key_down(code: KeyCode, delay: Duration) -> Self {
        Self::new(
            ActionKind::Key {
                code,
                pressed: true,
            },
            delay,
        )
    }

    pub fn key_up(code: KeyCode, delay: Duration) -> Self {
        Self::new(
            ActionKind::Key {
                code,
                pressed: false,
            },
            delay,
        )
    }

    pub fn mouse(
        button: MouseButton,
        action: MouseActionKind,
        position: Option<Point>,
        delay: Duration,
    ) -> Self {
        Self::new(
            ActionKind::Mouse {
                button,
                action,
                position,
                scroll_delta: 0,
            },
            delay,
        )
    }

    pub fn mouse_move(position: Point, delay: Duration) -> Self {
        Self::mouse(
            MouseButton::Left,
            MouseActionKind::Move,
            Some(position),
            delay,
        )
    }

    pub fn scroll(scroll_delta: i32, position: Option<Point>, delay: Duration) -> Self {
        Self::new(
            ActionKind::Mouse {
                button: MouseButton::Middle,
                action: MouseActionKind::Scroll,
                position,
                scroll_delta,
            },
            delay,
        )
    }

    pub fn pause(duration: Duration, delay: Duration) -> Self {
        Self::new(ActionKind::Delay { duration }, delay)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Same action (same id) recorded at a different offset.
    pub fn with_delay(&self, delay: Duration) -> Self {
        Self {
            delay,
            ..self.clone()
        }
    }

    /// Same action moved to `position`. Non-mouse actions are returned unchanged.
    pub fn with_position(&self, position: Point) -> Self {
        match &self.kind {
            ActionKind::Mouse {
                button,
                action,
                scroll_delta,
                ..
            } => Self {
                kind: ActionKind::Mouse {
                    button: *button,
                    action: *action,
                    position: Some(position),
                    scroll_delta: *scroll_delta,
                },
                ..self.clone()
            },
            _ => self.clone(),
        }
    }

    /// Same key action with the given pressed state.
    pub fn with_key_state(&self, pressed: bool) -> Self {
        match &self.kind {
            ActionKind::Key { code, .. } => Self {
                kind: ActionKind::Key {
                    code: *code,
                    pressed,
                },
                ..self.clone()
            },
            _ => self.clone(),
        }
    }
}

impl fmt::Display for GameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offset = self.delay.as_millis();
        match &self.kind {
            ActionKind::Key { code, pressed } => {
                let state = if *pressed { "down" } else { "up" };
                write!(f, "+{}ms key {} {}", offset, code, state)
            }
            ActionKind::Mouse {
                button,
                action,
                position,
                scroll_delta,
            } => {
                write!(f, "+{}ms mouse {} {}", offset, button, action)?;
                if let Some(p) = position {
                    write!(f, " at ({}, {})", p.x, p.y)?;
                }
                if *scroll_delta != 0 {
                    write!(f, " by {}", scroll_delta)?;
                }
                Ok(())
            }
            ActionKind::Delay { duration } => {
                write!(f, "+{}ms wait {}ms", offset, duration.as_millis())
            }
        }
    }
}

//! # Action sequencer
//!
//! Replays an [`ActionSequence`] through an [`InputDriver`].
//!
//! Action delays are offsets from the start of the recording. Before each
//! action the player waits `(delay - previous delay) / speed`. Waits are
//! scheduled against absolute deadlines measured from the start of the
//! pass, so time spent inside the driver does not accumulate as drift.
//!
//! Playback is cooperative: the cancellation token is checked before every
//! wait and every dispatch, and a wait is interrupted as soon as the token
//! fires. A sequencer plays at most one sequence at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::sequence::scale;
use crate::action::{ActionKind, ActionSequence, GameAction};
use crate::config::EngineConfig;
use crate::event_bus::{EventBus, EventReceiver};
use crate::hal::{HalResult, InputDriver};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Playback speed must be a positive number, got {speed}")]
    InvalidSpeed { speed: f64 },
    #[error("A sequence is already playing")]
    AlreadyPlaying,
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayOptions {
    pub speed: f64,
    pub repeat: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            repeat: false,
        }
    }
}

impl PlayOptions {
    pub fn with_speed(speed: f64) -> Self {
        Self {
            speed,
            ..Self::default()
        }
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    fn validate(&self) -> PlaybackResult<()> {
        if self.speed.is_finite() && self.speed > 0.0 {
            Ok(())
        } else {
            Err(PlaybackError::InvalidSpeed { speed: self.speed })
        }
    }
}

/// How a playback ended. A stop requested through the token is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started {
        sequence: String,
        action_count: usize,
    },
    ActionPlayed {
        index: usize,
        action: GameAction,
        /// Time since the start of the current pass.
        elapsed: Duration,
    },
    RepeatStarted {
        pass: u32,
    },
    Completed {
        sequence: String,
    },
    Stopped {
        sequence: String,
    },
}

type ActiveToken = Arc<Mutex<Option<CancellationToken>>>;

fn lock(active: &ActiveToken) -> MutexGuard<'_, Option<CancellationToken>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the playback slot. Dropping it frees the slot, whether the playback
/// ended or its future was dropped (task aborted, never polled).
struct ActiveSlot {
    active: ActiveToken,
    token: CancellationToken,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        lock(&self.active).take();
    }
}

pub struct ActionSequencer {
    driver: Arc<dyn InputDriver>,
    events: EventBus<PlaybackEvent>,
    active: ActiveToken,
    repeat_delay: Duration,
}

impl ActionSequencer {
    pub fn new(driver: Arc<dyn InputDriver>) -> Self {
        Self::from_config(driver, &EngineConfig::default())
    }

    pub fn from_config(driver: Arc<dyn InputDriver>, config: &EngineConfig) -> Self {
        Self {
            driver,
            events: EventBus::new(config.event_buffer_size),
            active: Arc::new(Mutex::new(None)),
            repeat_delay: config.playback.repeat_delay,
        }
    }

    pub fn with_repeat_delay(mut self, repeat_delay: Duration) -> Self {
        self.repeat_delay = repeat_delay;
        self
    }

    pub fn subscribe(&self) -> EventReceiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Cancels the active playback, if any. Calling it again, or when nothing
    /// plays, does nothing.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.active).as_ref() {
            if !token.is_cancelled() {
                info!("stop requested");
                token.cancel();
            }
        }
    }

    /// Validates the options and claims the single playback slot.
    fn begin(&self, options: &PlayOptions, cancel: &CancellationToken) -> PlaybackResult<ActiveSlot> {
        options.validate()?;
        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(PlaybackError::AlreadyPlaying);
        }
        let token = cancel.child_token();
        *active = Some(token.clone());
        Ok(ActiveSlot {
            active: Arc::clone(&self.active),
            token,
        })
    }

    /// Plays `sequence` to completion, or until `cancel` (or [`stop`]) fires.
    ///
    /// [`stop`]: ActionSequencer::stop
    #[tracing::instrument(level = "debug", skip_all, fields(sequence = %sequence.name(), speed = options.speed, repeat = options.repeat))]
    pub async fn play(
        &self,
        sequence: &ActionSequence,
        options: PlayOptions,
        cancel: CancellationToken,
    ) -> PlaybackResult<PlaybackOutcome> {
        let slot = self.begin(&options, &cancel)?;
        Ok(self.run(sequence, options, &slot.token).await)
    }

    /// Starts playback on a background task. Invalid options and a busy
    /// sequencer are reported immediately.
    pub fn spawn(
        self: &Arc<Self>,
        sequence: ActionSequence,
        options: PlayOptions,
        cancel: CancellationToken,
    ) -> PlaybackResult<JoinHandle<PlaybackOutcome>> {
        let slot = self.begin(&options, &cancel)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            this.run(&sequence, options, &slot.token).await
        }))
    }

    async fn run(
        &self,
        sequence: &ActionSequence,
        options: PlayOptions,
        token: &CancellationToken,
    ) -> PlaybackOutcome {
        info!(
            sequence = %sequence.name(),
            actions = sequence.action_count(),
            speed = options.speed,
            repeat = options.repeat,
            "playback started"
        );
        self.events.publish(PlaybackEvent::Started {
            sequence: sequence.name().to_string(),
            action_count: sequence.action_count(),
        });

        let mut pass = 1u32;
        loop {
            if self.play_pass(sequence, options.speed, token).await == PlaybackOutcome::Stopped {
                return self.finish(sequence, PlaybackOutcome::Stopped);
            }
            // 空のシーケンスは繰り返さない
            if !options.repeat || sequence.is_empty() {
                return self.finish(sequence, PlaybackOutcome::Completed);
            }
            if !wait_until(Instant::now() + self.repeat_delay, token).await {
                return self.finish(sequence, PlaybackOutcome::Stopped);
            }
            pass = pass.saturating_add(1);
            debug!(pass, "repeat");
            self.events.publish(PlaybackEvent::RepeatStarted { pass });
        }
    }

    async fn play_pass(
        &self,
        sequence: &ActionSequence,
        speed: f64,
        token: &CancellationToken,
    ) -> PlaybackOutcome {
        let start = Instant::now();
        let mut deadline = start;
        let mut last_delay = Duration::ZERO;

        for (index, action) in sequence.actions().iter().enumerate() {
            if token.is_cancelled() {
                return PlaybackOutcome::Stopped;
            }
            deadline += scale(action.delay().saturating_sub(last_delay), speed);
            last_delay = action.delay();

            if !wait_until(deadline, token).await || token.is_cancelled() {
                return PlaybackOutcome::Stopped;
            }

            if let Err(error) = self.dispatch(action).await {
                warn!(index, %action, %error, "dispatch failed");
            }
            let elapsed = start.elapsed();
            debug!(index, %action, ?elapsed, "action played");
            self.events.publish(PlaybackEvent::ActionPlayed {
                index,
                action: action.clone(),
                elapsed,
            });
        }
        PlaybackOutcome::Completed
    }

    async fn dispatch(&self, action: &GameAction) -> HalResult<()> {
        match action.kind() {
            ActionKind::Key { code, pressed } => self.driver.set_key_state(*code, *pressed).await,
            ActionKind::Mouse {
                button,
                action,
                position,
                scroll_delta,
            } => {
                self.driver
                    .set_mouse_state(*button, *action, *position, *scroll_delta)
                    .await
            }
            // 待ち時間はオフセットに含まれている
            ActionKind::Delay { .. } => Ok(()),
        }
    }

    fn finish(&self, sequence: &ActionSequence, outcome: PlaybackOutcome) -> PlaybackOutcome {
        let name = sequence.name().to_string();
        match outcome {
            PlaybackOutcome::Completed => {
                info!(sequence = %name, "playback completed");
                self.events.publish(PlaybackEvent::Completed { sequence: name });
            }
            PlaybackOutcome::Stopped => {
                info!(sequence = %name, "playback stopped");
                self.events.publish(PlaybackEvent::Stopped { sequence: name });
            }
        }
        outcome
    }
}

/// Sleeps until `deadline`. Returns `false` when the token fired first.
async fn wait_until(deadline: Instant, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = time::sleep_until(deadline) => true,
    }
}

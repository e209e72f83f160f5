//! # Orchestration loop
//!
//! One decision cycle is Sense → Judge → Act:
//!
//! 1. every [`SenseOperation`] captures its region and recognizes its
//!    templates (concurrently, each step bounded by the recognition timeout);
//! 2. the results and the caller's variables become a fresh
//!    [`JudgmentContext`];
//! 3. the rule engine selects at most one rule, then every bound state
//!    machine takes one step;
//! 4. the resulting action names are resolved through the
//!    [`ActionLibrary`] and played in order.
//!
//! The context lives for exactly one cycle.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{self, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::ActionLibrary;
use crate::condition::Value;
use crate::config::{ConfigResult, EngineConfig, OrchestratorConfig};
use crate::context::{JudgmentContext, RecognitionResult, SenseResult};
use crate::error::InternalResult;
use crate::event_bus::{EventBus, EventReceiver};
use crate::hal::{Frame, Recognizer, Region, ScreenCapture, Template};
use crate::rule::{RuleEngine, RuleEvaluationResult};
use crate::sequencer::{ActionSequencer, PlayOptions, PlaybackError, PlaybackOutcome};
use crate::state_machine::{StateMachineEngine, StateMachineResult};

/// A named screen region and the templates looked for inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseOperation {
    pub name: String,
    pub region: Region,
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl SenseOperation {
    pub fn new(name: impl Into<String>, region: Region) -> Self {
        Self {
            name: name.into(),
            region,
            templates: Vec::new(),
        }
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    RuleSelected {
        cycle: Uuid,
        rule_id: String,
        actions: Vec<String>,
    },
    StateChanged {
        cycle: Uuid,
        machine_id: String,
        state_id: String,
    },
    ActionMissing {
        cycle: Uuid,
        name: String,
    },
    CycleCompleted {
        cycle: Uuid,
        actions_played: usize,
    },
    CycleFailed {
        cycle: Uuid,
        error: String,
    },
}

/// What one decision cycle saw, decided and played.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub context: JudgmentContext,
    pub rule: Option<RuleEvaluationResult>,
    pub state_machines: Vec<StateMachineResult>,
    /// Action names in play order, including missing ones.
    pub actions: Vec<String>,
    pub missing_actions: Vec<String>,
    pub actions_played: usize,
    /// `None` when nothing was played.
    pub outcome: Option<PlaybackOutcome>,
    /// Set when the sequencer refused a play request during the Act step.
    /// The judged actions above still stand.
    pub playback_error: Option<String>,
}

impl CycleReport {
    pub fn cycle_id(&self) -> Uuid {
        self.context.id
    }
}

pub struct Orchestrator {
    capture: Arc<dyn ScreenCapture>,
    recognizer: Arc<dyn Recognizer>,
    sequencer: Arc<ActionSequencer>,
    rules: Arc<RuleEngine>,
    state_machines: Arc<StateMachineEngine>,
    library: Arc<ActionLibrary>,
    bound_machines: Vec<String>,
    events: EventBus<CycleEvent>,
    config: OrchestratorConfig,
    speed: f64,
}

impl Orchestrator {
    /// Fails when `config` does not validate (for example a non-positive
    /// playback speed).
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        recognizer: Arc<dyn Recognizer>,
        sequencer: Arc<ActionSequencer>,
        config: &EngineConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            capture,
            recognizer,
            sequencer,
            rules: Arc::new(RuleEngine::new(config.rules.clone())),
            state_machines: Arc::new(StateMachineEngine::new()),
            library: Arc::new(ActionLibrary::new()),
            bound_machines: Vec::new(),
            events: EventBus::new(config.event_buffer_size),
            config: config.orchestrator.clone(),
            speed: config.playback.default_speed,
        })
    }

    pub fn with_rule_engine(mut self, rules: Arc<RuleEngine>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_state_machine_engine(mut self, state_machines: Arc<StateMachineEngine>) -> Self {
        self.state_machines = state_machines;
        self
    }

    pub fn with_library(mut self, library: Arc<ActionLibrary>) -> Self {
        self.library = library;
        self
    }

    /// Runs the machine on every cycle, after rule selection. Machines run in
    /// binding order.
    pub fn bind_state_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.bound_machines.push(machine_id.into());
        self
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn state_machines(&self) -> &Arc<StateMachineEngine> {
        &self.state_machines
    }

    pub fn library(&self) -> &Arc<ActionLibrary> {
        &self.library
    }

    pub fn sequencer(&self) -> &Arc<ActionSequencer> {
        &self.sequencer
    }

    pub fn subscribe(&self) -> EventReceiver<CycleEvent> {
        self.events.subscribe()
    }

    /// Runs one decision cycle.
    #[tracing::instrument(level = "debug", skip_all, fields(operations = operations.len()))]
    pub async fn run_cycle<I, K, V>(
        &self,
        operations: &[SenseOperation],
        variables: I,
        cancel: &CancellationToken,
    ) -> InternalResult<CycleReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut context = JudgmentContext::new();
        let cycle = context.id;
        match self.judge_and_act(&mut context, operations, variables, cancel).await {
            Ok(report) => {
                self.events.publish(CycleEvent::CycleCompleted {
                    cycle,
                    actions_played: report.actions_played,
                });
                Ok(report)
            }
            Err(error) => {
                warn!(%cycle, %error, "cycle failed");
                self.events.publish(CycleEvent::CycleFailed {
                    cycle,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn judge_and_act<I, K, V>(
        &self,
        context: &mut JudgmentContext,
        operations: &[SenseOperation],
        variables: I,
        cancel: &CancellationToken,
    ) -> InternalResult<CycleReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let cycle = context.id;

        // Sense
        let sensed = join_all(operations.iter().map(|op| self.sense(op))).await;
        for result in sensed {
            context.insert_sense_result(result)?;
        }
        for (name, value) in variables {
            context.set_variable(name, value)?;
        }

        // 状態機械を進める前に、再生できない状態を弾く
        if self.sequencer.is_playing() {
            return Err(PlaybackError::AlreadyPlaying.into());
        }

        // Judge
        let mut actions = Vec::new();
        let rule = self.rules.select(&*context);
        if let Some(selected) = &rule {
            info!(%cycle, rule_id = %selected.rule_id, "rule selected");
            self.events.publish(CycleEvent::RuleSelected {
                cycle,
                rule_id: selected.rule_id.clone(),
                actions: selected.actions.clone(),
            });
            actions.extend(selected.actions.iter().cloned());
        }

        let mut state_machines = Vec::with_capacity(self.bound_machines.len());
        for machine_id in &self.bound_machines {
            let result = self.state_machines.process(machine_id, &*context);
            if !result.success {
                warn!(%cycle, machine_id, error = ?result.error, "state machine step failed");
            } else if result.transitioned {
                self.events.publish(CycleEvent::StateChanged {
                    cycle,
                    machine_id: machine_id.clone(),
                    state_id: result.current_state_id.clone(),
                });
            }
            actions.extend(result.triggered_actions.iter().cloned());
            state_machines.push(result);
        }

        // Act
        let resolved = self.library.resolve(&actions);
        for name in &resolved.missing {
            warn!(%cycle, action = %name, "unknown action");
            self.events.publish(CycleEvent::ActionMissing {
                cycle,
                name: name.clone(),
            });
        }

        let mut outcome = None;
        let mut actions_played = 0;
        let mut playback_error = None;
        for (name, sequence) in &resolved.sequences {
            debug!(%cycle, action = %name, "playing");
            let played = match self
                .sequencer
                .play(sequence, PlayOptions::with_speed(self.speed), cancel.clone())
                .await
            {
                Ok(played) => played,
                Err(error) => {
                    warn!(%cycle, action = %name, %error, "playback refused");
                    playback_error = Some(error.to_string());
                    break;
                }
            };
            outcome = Some(played);
            if played == PlaybackOutcome::Stopped {
                break;
            }
            actions_played += 1;
        }

        Ok(CycleReport {
            context: context.clone(),
            rule,
            state_machines,
            actions,
            missing_actions: resolved.missing,
            actions_played,
            outcome,
            playback_error,
        })
    }

    /// Captures and recognizes one operation. Capture or recognition failures
    /// and timeouts become failed results, never errors.
    async fn sense(&self, operation: &SenseOperation) -> SenseResult {
        let limit = self.config.recognition_timeout;
        let frame = match timeout(limit, self.capture.capture_region(operation.region)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(error)) => {
                warn!(operation = %operation.name, %error, "capture failed");
                return failed_sense(operation);
            }
            Err(_) => {
                warn!(operation = %operation.name, ?limit, "capture timed out");
                return failed_sense(operation);
            }
        };

        let results = join_all(
            operation
                .templates
                .iter()
                .map(|template| self.recognize(&operation.name, &frame, template)),
        )
        .await;
        debug!(
            operation = %operation.name,
            matched = results.iter().filter(|r| r.success).count(),
            "sensed"
        );
        SenseResult::new(operation.name.clone(), results)
    }

    async fn recognize(&self, operation: &str, frame: &Frame, template: &Template) -> RecognitionResult {
        let limit = self.config.recognition_timeout;
        match timeout(limit, self.recognizer.recognize(frame, template)).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                warn!(operation, template = %template.name, %error, "recognition failed");
                RecognitionResult::failed(template.name.clone())
            }
            Err(_) => {
                warn!(operation, template = %template.name, ?limit, "recognition timed out");
                RecognitionResult::failed(template.name.clone())
            }
        }
    }

    /// Repeats cycles every `cycle_interval` until `cancel` fires. Returns
    /// the number of cycles run. A failed cycle is reported through the event
    /// bus and the loop keeps going.
    pub async fn run(
        &self,
        operations: &[SenseOperation],
        cancel: CancellationToken,
    ) -> InternalResult<u64> {
        info!(
            operations = operations.len(),
            interval = ?self.config.cycle_interval,
            "orchestrator started"
        );
        let mut cycles = 0u64;
        while !cancel.is_cancelled() {
            let started = time::Instant::now();
            if let Err(error) = self
                .run_cycle(operations, Vec::<(String, Value)>::new(), &cancel)
                .await
            {
                debug!(%error, "continuing after failed cycle");
            }
            cycles += 1;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep_until(started + self.config.cycle_interval) => {}
            }
        }
        info!(cycles, "orchestrator stopped");
        Ok(cycles)
    }
}

fn failed_sense(operation: &SenseOperation) -> SenseResult {
    SenseResult::new(
        operation.name.clone(),
        operation
            .templates
            .iter()
            .map(|t| RecognitionResult::failed(t.name.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionSequence, GameAction, KeyCode};
    use crate::hal::{HalError, HalResult, LoggingInputDriver};
    use crate::rule::DecisionRule;
    use crate::state_machine::{State, StateMachine, Transition};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticCapture;

    #[async_trait]
    impl ScreenCapture for StaticCapture {
        async fn capture_region(&self, region: Region) -> HalResult<Frame> {
            Ok(Frame::new(region, vec![0u8; 4]))
        }
    }

    /// Matches templates whose name starts with `hit`; `slow` never answers.
    struct NameRecognizer;

    #[async_trait]
    impl Recognizer for NameRecognizer {
        async fn recognize(&self, frame: &Frame, template: &Template) -> HalResult<RecognitionResult> {
            if template.name.starts_with("slow") {
                time::sleep(Duration::from_secs(3600)).await;
            }
            if template.name.starts_with("broken") {
                return Err(HalError::Recognition {
                    template: template.name.clone(),
                    message: "corrupt".to_string(),
                });
            }
            let success = template.name.starts_with("hit");
            Ok(
                RecognitionResult::new(template.name.clone(), success, if success { 0.95 } else { 0.2 })
                    .with_region(frame.region),
            )
        }
    }

    fn orchestrator() -> Orchestrator {
        let config = EngineConfig::default();
        let sequencer = Arc::new(ActionSequencer::from_config(
            Arc::new(LoggingInputDriver),
            &config,
        ));
        Orchestrator::new(Arc::new(StaticCapture), Arc::new(NameRecognizer), sequencer, &config).unwrap()
    }

    fn press(name: &str) -> ActionSequence {
        ActionSequence::new(
            name,
            vec![
                GameAction::key_down(KeyCode(0x0D), Duration::ZERO),
                GameAction::key_up(KeyCode(0x0D), Duration::from_millis(20)),
            ],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sense_degrades_failures() {
        let orchestrator = orchestrator();
        let operation = SenseOperation::new("Menu", Region::new(0, 0, 10, 10))
            .with_template(Template::new("hit_start"))
            .with_template(Template::new("slow_banner"))
            .with_template(Template::new("broken_icon"));

        let sensed = orchestrator.sense(&operation).await;
        assert_eq!(sensed.results.len(), 3);
        assert!(sensed.results[0].success);
        assert!(!sensed.results[1].success);
        assert!(!sensed.results[2].success);
        assert_eq!(sensed.success_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_selects_rule_and_steps_machine() {
        let orchestrator = orchestrator().bind_state_machine("flow");
        orchestrator.library().register("press_enter", press("press_enter"));
        orchestrator
            .rules()
            .add_rule(
                DecisionRule::parse("start", "start", "recognition.Menu.Success == true")
                    .unwrap()
                    .with_then_actions(["press_enter", "missing_one"]),
            )
            .unwrap();
        orchestrator
            .state_machines()
            .create_state_machine(
                StateMachine::new("flow", "flow", "title")
                    .with_state(State::new("title", "Title"))
                    .with_state(State::new("menu", "Menu").with_entry_actions(["press_enter"]))
                    .with_transition(Transition::new("title", "menu", "recognition.*.Success == true")),
            )
            .unwrap();
        let mut events = orchestrator.subscribe();

        let operations = vec![SenseOperation::new("Menu", Region::new(0, 0, 10, 10))
            .with_template(Template::new("hit_menu"))];
        let report = orchestrator
            .run_cycle(&operations, [("retries", 1)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.rule.as_ref().unwrap().rule_id, "start");
        assert_eq!(report.state_machines[0].current_state_id, "menu");
        assert_eq!(report.actions, vec!["press_enter", "missing_one", "press_enter"]);
        assert_eq!(report.missing_actions, vec!["missing_one"]);
        assert_eq!(report.actions_played, 2);
        assert_eq!(report.outcome, Some(PlaybackOutcome::Completed));
        assert_eq!(report.context.lookup("retries"), Some(Value::Integer(1)));

        let events = events.drain();
        assert!(matches!(events[0], CycleEvent::RuleSelected { .. }));
        assert!(matches!(events[1], CycleEvent::StateChanged { .. }));
        assert!(matches!(events[2], CycleEvent::ActionMissing { .. }));
        assert!(matches!(
            events[3],
            CycleEvent::CycleCompleted { actions_played: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_sequencer_leaves_machines_untouched() {
        let orchestrator = orchestrator().bind_state_machine("greeter");
        orchestrator.library().register("greet", press("greet"));
        orchestrator
            .state_machines()
            .create_state_machine(
                StateMachine::new("greeter", "greeter", "idle")
                    .with_state(State::new("idle", "Idle"))
                    .with_state(State::new("seen", "Seen").with_entry_actions(["greet"]))
                    .with_transition(Transition::new("idle", "seen", "")),
            )
            .unwrap();

        let long = ActionSequence::new(
            "long",
            vec![GameAction::key_down(KeyCode(0x20), Duration::from_secs(60))],
        );
        let background = orchestrator
            .sequencer()
            .spawn(long, PlayOptions::default(), CancellationToken::new())
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;

        let result = orchestrator
            .run_cycle(&[], Vec::<(String, Value)>::new(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(crate::Error::Playback(PlaybackError::AlreadyPlaying))
        ));
        assert_eq!(
            orchestrator
                .state_machines()
                .get_state_machine("greeter")
                .unwrap()
                .current_state_id(),
            "idle"
        );

        orchestrator.sequencer().stop();
        background.await.unwrap();
        let report = orchestrator
            .run_cycle(&[], Vec::<(String, Value)>::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state_machines[0].current_state_id, "seen");
        assert_eq!(report.actions, vec!["greet"]);
        assert_eq!(report.actions_played, 1);
        assert_eq!(report.playback_error, None);
    }

    #[test]
    fn test_invalid_speed_rejected_at_construction() {
        let mut config = EngineConfig::default();
        config.playback.default_speed = 0.0;
        let sequencer = Arc::new(ActionSequencer::from_config(
            Arc::new(LoggingInputDriver),
            &config,
        ));
        let result = Orchestrator::new(
            Arc::new(StaticCapture),
            Arc::new(NameRecognizer),
            sequencer,
            &config,
        );
        assert!(matches!(
            result,
            Err(crate::config::ConfigError::Invalid { field: "playback.default_speed", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_operation_fails_cycle() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();
        let operation = SenseOperation::new("Twice", Region::default());
        let result = orchestrator
            .run_cycle(
                &[operation.clone(), operation],
                Vec::<(String, Value)>::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(crate::Error::Context(_))));
        assert!(matches!(
            events.drain().last(),
            Some(CycleEvent::CycleFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let orchestrator = Arc::new(orchestrator());
        let cancel = CancellationToken::new();
        let handle = {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run(&[], cancel).await })
        };
        // Cycles at 0, 500, 1000 ms.
        time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }
}

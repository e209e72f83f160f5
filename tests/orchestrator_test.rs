mod common;

use std::sync::Arc;
use std::time::Duration;

use autoplay::action::KeyCode;
use autoplay::hal::{Region, Template};
use autoplay::state_machine::{State, Transition};
use autoplay::{
    ActionLibrary, ActionSequence, ActionSequencer, CycleEvent, DecisionRule, EngineConfig,
    GameAction, Orchestrator, PlaybackOutcome, RuleEngine, SenseOperation, StateMachine,
    StateMachineEngine,
};
use common::{BlankCapture, ListRecognizer, RecordingDriver};
use pretty_assertions::assert_eq;
use tokio::time;
use tokio_util::sync::CancellationToken;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn tap(name: &str, code: u32, hold: u64) -> ActionSequence {
    ActionSequence::new(
        name,
        vec![
            GameAction::key_down(KeyCode(code), ms(0)),
            GameAction::key_up(KeyCode(code), ms(hold)),
        ],
    )
}

fn operations() -> Vec<SenseOperation> {
    vec![
        SenseOperation::new("Dialog", Region::new(0, 0, 640, 120))
            .with_template(Template::new("ok_button"))
            .with_template(Template::new("cancel_button")),
        SenseOperation::new("Map", Region::new(0, 120, 640, 360)).with_template(Template::new("map_icon")),
    ]
}

struct Harness {
    orchestrator: Orchestrator,
    driver: Arc<RecordingDriver>,
}

fn harness(visible: Vec<&'static str>, config: EngineConfig) -> Harness {
    let driver = Arc::new(RecordingDriver::new());
    let sequencer = Arc::new(ActionSequencer::from_config(driver.clone(), &config));

    let library = Arc::new(ActionLibrary::new());
    library.register("confirm", tap("confirm", 0x0D, 30));
    library.register("open_map", tap("open_map", 0x4D, 20));

    let rules = Arc::new(RuleEngine::new(config.rules.clone()));
    rules
        .add_rule(
            DecisionRule::parse("confirm_dialog", "Confirm dialog", "recognition.Dialog.Success == true")
                .unwrap()
                .with_then_actions(["confirm"])
                .with_priority(50),
        )
        .unwrap();

    let machines = Arc::new(StateMachineEngine::new());
    machines
        .create_state_machine(
            StateMachine::new("explore", "Exploration", "Town")
                .with_state(State::new("Town", "Town"))
                .with_state(State::new("Field", "Field").with_entry_actions(["open_map"]))
                .with_transition(Transition::new(
                    "Town",
                    "Field",
                    "recognition.Map.Confidence > 0.5",
                )),
        )
        .unwrap();

    let orchestrator = Orchestrator::new(
        Arc::new(BlankCapture),
        Arc::new(ListRecognizer { visible }),
        sequencer,
        &config,
    )
    .unwrap()
    .with_rule_engine(rules)
    .with_state_machine_engine(machines)
    .with_library(library)
    .bind_state_machine("explore");

    Harness {
        orchestrator,
        driver,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cycle_plays_rule_then_machine_actions() {
    let Harness {
        orchestrator,
        driver,
    } = harness(vec!["ok_button", "map_icon"], EngineConfig::default());
    let mut events = orchestrator.subscribe();

    let report = orchestrator
        .run_cycle(&operations(), [("turn", 3)], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.rule.as_ref().unwrap().rule_id, "confirm_dialog");
    assert_eq!(report.actions, vec!["confirm", "open_map"]);
    assert!(report.missing_actions.is_empty());
    assert_eq!(report.actions_played, 2);
    assert_eq!(report.outcome, Some(PlaybackOutcome::Completed));
    assert_eq!(report.state_machines[0].current_state_id, "Field");
    assert_eq!(report.context.sense_result("Dialog").unwrap().success_count(), 1);

    // Sequences play back to back: confirm at 0/30, open_map at 30/50.
    assert_eq!(driver.offsets_ms(), vec![0, 30, 30, 50]);

    let events = events.drain();
    assert!(matches!(&events[0], CycleEvent::RuleSelected { rule_id, .. } if rule_id == "confirm_dialog"));
    assert!(matches!(&events[1], CycleEvent::StateChanged { state_id, .. } if state_id == "Field"));
    assert!(matches!(
        events[2],
        CycleEvent::CycleCompleted { actions_played: 2, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_seen_plays_nothing() {
    let Harness {
        orchestrator,
        driver,
    } = harness(vec![], EngineConfig::default());

    let report = orchestrator
        .run_cycle(&operations(), Vec::<(String, i64)>::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.rule.is_none());
    assert!(report.actions.is_empty());
    assert_eq!(report.outcome, None);
    assert_eq!(report.state_machines[0].current_state_id, "Town");
    assert!(driver.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_cycle_playback() {
    let Harness {
        orchestrator,
        driver,
    } = harness(vec!["ok_button", "map_icon"], EngineConfig::default());
    orchestrator
        .library()
        .register("confirm", tap("confirm", 0x0D, 5000));
    let orchestrator = Arc::new(orchestrator);
    let cancel = CancellationToken::new();

    let handle = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run_cycle(&operations(), Vec::<(String, i64)>::new(), &cancel)
                .await
        })
    };
    time::sleep(ms(100)).await;
    cancel.cancel();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, Some(PlaybackOutcome::Stopped));
    assert_eq!(report.actions_played, 0);
    // Only the key-down of `confirm` went out.
    assert_eq!(driver.offsets_ms(), vec![0]);
    assert!(!orchestrator.sequencer().is_playing());
}

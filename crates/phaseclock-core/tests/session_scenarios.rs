//! End-to-end session scenarios.
//!
//! Every test runs the public controller against an in-memory store and a
//! manual clock, so "waiting" is just moving the clock.

use std::sync::Arc;
use std::time::Duration;

use phaseclock_core::storage::{encode_state, LoadSource};
use phaseclock_core::tone::RecordingToneEmitter;
use phaseclock_core::{
    BranchPolicy, Branching, ControllerOptions, Cue, Event, KeyValueStore, ManualClock,
    MemoryStore, Phase, PhaseKind, ReloadPolicy, RuntimeState, SessionController,
    SessionDefinition, SessionStatus, SessionType,
};

// ============================================================================
// Fixtures
// ============================================================================

fn three_phase() -> SessionDefinition {
    SessionDefinition::new(
        "three-phase",
        SessionType::Focus,
        vec![
            Phase::new("first", PhaseKind::Work, 2_000),
            Phase::new("second", PhaseKind::Break, 3_000),
            Phase::new("third", PhaseKind::Work, 1_000),
        ],
    )
    .unwrap()
}

fn single(duration_ms: u64, session_type: SessionType) -> SessionDefinition {
    SessionDefinition::new(
        "single",
        session_type,
        vec![
            Phase::new("only", PhaseKind::Work, duration_ms),
            Phase::new("after", PhaseKind::Break, 10_000),
        ],
    )
    .unwrap()
}

fn dialogue() -> SessionDefinition {
    SessionDefinition::new(
        "dialogue",
        SessionType::Dialogue,
        vec![
            Phase::new("a", PhaseKind::Speaking, 1_000),
            Phase::new("switch-a", PhaseKind::Transition, 100),
            Phase::new("b", PhaseKind::Speaking, 1_000),
            Phase::new("switch-b", PhaseKind::Transition, 100),
            Phase::new("closing", PhaseKind::Closing, 500),
        ],
    )
    .unwrap()
    .with_branching(Branching::Alternating { slots_per_party: 2 })
    .unwrap()
}

fn options(clock: &ManualClock) -> ControllerOptions {
    ControllerOptions::default().with_clock(Arc::new(clock.clone()))
}

fn open(
    definition: SessionDefinition,
    store: &MemoryStore,
    clock: &ManualClock,
) -> SessionController {
    SessionController::open(definition, Arc::new(store.clone()), options(clock))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn three_phase_session_runs_to_completion() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    let mut session = open(three_phase(), &store, &clock);

    session.start().unwrap();
    clock.advance(2_000);
    session.tick();
    assert_eq!(session.state().current_index, 1);
    assert_eq!(session.snapshot().phase_duration_ms, 3_000);

    clock.advance(3_000);
    session.tick();
    assert_eq!(session.state().current_index, 2);

    clock.advance(1_000);
    session.tick();
    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(session.state().remaining_ms, 0);
    assert_eq!(session.state().started_at, None);
    assert_eq!(session.state().current_index, 2);
}

#[test]
fn late_tick_carries_overrun_into_next_phase() {
    let clock = ManualClock::new(0);
    let mut session = open(single(5_000, SessionType::Focus), &MemoryStore::new(), &clock);
    session.start().unwrap();

    // Only a handful of irregular ticks before the boundary.
    for at in [16, 900, 2_500] {
        clock.set(at);
        session.tick();
    }
    clock.set(5_001);
    let events = session.tick();

    assert!(matches!(events[0], Event::PhaseAdvanced { from_index: 0, to_index: 1, .. }));
    assert_eq!(session.state().current_index, 1);
    assert_eq!(session.snapshot().remaining_ms, 10_000 - 1);
}

#[test]
fn pause_does_not_leak_wall_clock_time() {
    let clock = ManualClock::new(0);
    let mut session = open(single(5_000, SessionType::Focus), &MemoryStore::new(), &clock);
    session.start().unwrap();

    clock.advance(2_000);
    session.pause().unwrap();
    assert_eq!(session.snapshot().remaining_ms, 3_000);

    clock.advance(10_000);
    session.tick();
    session.resume().unwrap();
    assert_eq!(session.snapshot().remaining_ms, 3_000);

    clock.advance(1_000);
    session.tick();
    assert_eq!(session.snapshot().remaining_ms, 2_000);
}

#[test]
fn pause_twice_equals_pause_once() {
    let clock = ManualClock::new(0);
    let mut session = open(three_phase(), &MemoryStore::new(), &clock);
    session.start().unwrap();
    clock.advance(500);
    session.pause().unwrap();
    let once = session.state().clone();
    session.pause().unwrap();
    assert_eq!(session.state(), &once);
}

#[test]
fn reload_subtracts_time_spent_away() {
    let clock = ManualClock::new(10_000);
    let store = MemoryStore::new();
    let definition = single(5_000, SessionType::Focus);

    let mut saved = RuntimeState::fresh(&definition);
    saved.status = SessionStatus::Running;
    saved.remaining_ms = 4_000;
    saved.started_at = Some(10_000 - 1_000);
    store
        .set(&definition.storage_key(), &encode_state(&saved).unwrap())
        .unwrap();

    clock.set(10_000 + 2_000);
    let session = open(definition, &store, &clock);

    assert_eq!(session.load_source(), LoadSource::Restored);
    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(session.snapshot().remaining_ms, 1_000);
}

#[test]
fn reload_of_dialogue_comes_back_paused() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    {
        let mut first = open(dialogue(), &store, &clock);
        first.start().unwrap();
        clock.advance(400);
        first.tick();
    }

    clock.advance(300);
    let session = open(dialogue(), &store, &clock);
    assert_eq!(session.status(), SessionStatus::Paused);
    assert_eq!(session.state().remaining_ms, 300);
}

#[test]
fn reload_policy_can_be_overridden() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    {
        let mut first = open(dialogue(), &store, &clock);
        first.start().unwrap();
    }
    clock.advance(250);
    let session = SessionController::open(
        dialogue(),
        Arc::new(store.clone()),
        options(&clock).with_reload_policy(ReloadPolicy::Resume),
    );
    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(session.snapshot().remaining_ms, 750);
}

#[test]
fn reload_after_whole_session_elapsed_completes() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    {
        let mut first = open(three_phase(), &store, &clock);
        first.start().unwrap();
    }
    clock.advance(60_000);
    let mut session = open(three_phase(), &store, &clock);
    let events = session.tick();
    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(matches!(events.last(), Some(Event::SessionCompleted { .. })));
}

#[test]
fn corrupt_payload_starts_fresh() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    let definition = three_phase();
    store
        .set(&definition.storage_key(), r#"{"version":99,"sessionId":"three-phase"}"#)
        .unwrap();

    let session = open(definition.clone(), &store, &clock);
    assert_eq!(session.load_source(), LoadSource::Discarded);
    assert_eq!(session.state(), &RuntimeState::fresh(&definition));
}

#[test]
fn write_failure_degrades_to_memory_only() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::with_quota(8);
    let mut session = open(three_phase(), &store, &clock);

    session.start().unwrap();
    session.flush();
    assert!(session.is_memory_only());

    // The session keeps working without the store.
    clock.advance(2_000);
    session.tick();
    assert_eq!(session.state().current_index, 1);
    assert_eq!(store.get(&three_phase().storage_key()).unwrap(), None);
}

#[test]
fn debounced_writes_land_after_the_window() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    let key = three_phase().storage_key();
    let mut session = open(three_phase(), &store, &clock);

    session.start().unwrap();
    session.pause().unwrap();
    session.resume().unwrap();
    assert_eq!(store.get(&key).unwrap(), None);

    clock.advance(150);
    session.tick();
    assert!(store.get(&key).unwrap().is_some());
}

#[test]
fn reset_clears_stored_state() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::new();
    let mut session = open(three_phase(), &store, &clock);
    session.start().unwrap();
    session.flush();
    assert!(store.get(&three_phase().storage_key()).unwrap().is_some());

    session.reset();
    assert_eq!(store.get(&three_phase().storage_key()).unwrap(), None);
    assert_eq!(session.status(), SessionStatus::Idle);
    assert_eq!(session.state().remaining_ms, 2_000);
}

#[test]
fn reset_after_write_failure_still_clears_stored_state() {
    let key = three_phase().storage_key();
    let first_write = {
        let sizing = MemoryStore::new();
        let mut session = open(three_phase(), &sizing, &ManualClock::new(0));
        session.start().unwrap();
        session.flush();
        key.len() + sizing.get(&key).unwrap().unwrap().len()
    };

    // Room for the first RUNNING payload and nothing longer.
    let clock = ManualClock::new(0);
    let store = MemoryStore::with_quota(first_write);
    let mut session = open(three_phase(), &store, &clock);
    session.start().unwrap();
    session.flush();
    assert!(!session.is_memory_only());

    clock.advance(2_000);
    session.tick();
    session.flush();
    assert!(session.is_memory_only());

    session.reset();
    assert_eq!(store.get(&key).unwrap(), None);

    let reopened = open(three_phase(), &store.connect(), &clock);
    assert_eq!(reopened.load_source(), LoadSource::Fresh);
    assert_eq!(reopened.status(), SessionStatus::Idle);
}

#[test]
fn alternating_dialogue_cycles_then_closes() {
    let clock = ManualClock::new(0);
    let mut session = open(dialogue(), &MemoryStore::new(), &clock);
    session.start().unwrap();

    let mut visited = vec![session.state().current_index];
    for _ in 0..12 {
        session.skip().unwrap();
        visited.push(session.state().current_index);
        if session.status() == SessionStatus::Completed {
            break;
        }
    }
    assert_eq!(visited, vec![0, 1, 2, 3, 0, 1, 2, 3, 4, 4]);
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[test]
fn custom_branch_policy_is_honoured() {
    let clock = ManualClock::new(0);
    // Jump straight from the first phase to the last.
    let policy = BranchPolicy::custom(|state, definition| {
        (state.current_index == 0).then(|| definition.last_index())
    });
    let mut session = SessionController::open(
        three_phase(),
        Arc::new(MemoryStore::new()),
        options(&clock).with_policy(policy),
    );
    session.start().unwrap();
    session.skip().unwrap();
    assert_eq!(session.state().current_index, 2);
    session.skip().unwrap();
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[test]
fn tones_follow_the_two_tone_convention() {
    let clock = ManualClock::new(0);
    let tones = RecordingToneEmitter::new();
    let definition = SessionDefinition::new(
        "tones",
        SessionType::MultiTimer,
        vec![
            Phase::new("boil", PhaseKind::Custom("boil".into()), 1_000),
            Phase::new("rest", PhaseKind::Cooldown, 1_000).with_cue("chime"),
        ],
    )
    .unwrap();
    let mut session = SessionController::open(
        definition,
        Arc::new(MemoryStore::new()),
        options(&clock).with_tones(Arc::new(tones.clone())),
    );
    session.start().unwrap();
    clock.advance(2_500);
    session.tick();
    assert_eq!(tones.played(), vec![Cue::named("chime"), Cue::High]);
}

// ============================================================================
// Cross-context
// ============================================================================

#[test]
fn pause_in_one_tab_is_seen_by_the_other() {
    let clock = ManualClock::new(0);
    let tab_a_store = MemoryStore::new();
    let tab_b_store = tab_a_store.connect();
    let mut tab_a = open(three_phase(), &tab_a_store, &clock);
    let mut tab_b = open(three_phase(), &tab_b_store, &clock);

    tab_a.start().unwrap();
    tab_a.flush();
    let events = tab_b.tick();
    assert!(matches!(events[0], Event::RemoteStateApplied { status: SessionStatus::Running, .. }));

    clock.advance(700);
    tab_a.pause().unwrap();
    tab_a.flush();
    tab_b.tick();
    assert_eq!(tab_b.status(), SessionStatus::Paused);
    assert_eq!(tab_b.state().remaining_ms, 1_300);
}

#[test]
fn last_write_wins_between_tabs() {
    let clock = ManualClock::new(0);
    let tab_a_store = MemoryStore::new();
    let tab_b_store = tab_a_store.connect();
    let mut tab_a = open(three_phase(), &tab_a_store, &clock);
    let mut tab_b = open(three_phase(), &tab_b_store, &clock);

    tab_a.start().unwrap();
    tab_a.flush();
    tab_b.skip().unwrap();
    tab_b.flush();

    tab_a.tick();
    assert_eq!(tab_a.state(), tab_b.state());
    assert_eq!(tab_a.state().current_index, 1);
}

#[test]
fn reset_in_one_tab_resets_the_other() {
    let clock = ManualClock::new(0);
    let tab_a_store = MemoryStore::new();
    let tab_b_store = tab_a_store.connect();
    let mut tab_a = open(three_phase(), &tab_a_store, &clock);
    let mut tab_b = open(three_phase(), &tab_b_store, &clock);

    tab_a.start().unwrap();
    tab_a.flush();
    tab_b.tick();
    assert_eq!(tab_b.status(), SessionStatus::Running);

    tab_a.reset();
    tab_b.tick();
    assert_eq!(tab_b.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn run_loop_applies_remote_pause() {
    let clock = ManualClock::new(0);
    let tab_a_store = MemoryStore::new();
    let tab_b_store = tab_a_store.connect();
    let mut tab_a = open(three_phase(), &tab_a_store, &clock);
    let mut tab_b = open(three_phase(), &tab_b_store, &clock);

    tab_a.start().unwrap();
    tab_a.pause().unwrap();
    tab_a.flush();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut seen_paused = false;
    let mut stop_tx = Some(stop_tx);
    let shutdown = async {
        let _ = stop_rx.await;
    };
    tokio::time::timeout(
        Duration::from_millis(500),
        tab_b.run_until(shutdown, |_, snapshot| {
            if snapshot.status == SessionStatus::Paused {
                seen_paused = true;
                if let Some(tx) = stop_tx.take() {
                    let _ = tx.send(());
                }
            }
        }),
    )
    .await
    .expect("remote pause within propagation bound");

    assert!(seen_paused);
    assert_eq!(tab_b.status(), SessionStatus::Paused);
}

//! Performance benchmarks for the hot paths of the session host

use serde_json::json;
use server::game::{self, GameState, ADD_POINTS};
use server::pipeline::Reducer;
use shared::frame::{encode_frame, Frame, FrameDecoder, DEFAULT_MAX_PAYLOAD};
use shared::replay::{replay, Recording};
use shared::{Action, CanonicalState, InternalAction, PlayerId, StateUpdate};
use std::time::Instant;

fn joined(id: &str) -> Action {
    Action::internal(InternalAction::PlayerJoined)
        .from_player(PlayerId::new(id))
        .with_payload(json!({ "name": id }))
}

fn points(id: &str, amount: i64) -> Action {
    Action::new(ADD_POINTS)
        .from_player(PlayerId::new(id))
        .with_payload(json!({ "amount": amount }))
}

/// Benchmarks masked frame encoding and streaming decode
#[test]
fn benchmark_frame_codec() {
    let payload = json!({ "type": "ACTION", "payload": { "type": ADD_POINTS, "payload": { "amount": 5 } } })
        .to_string();
    let iterations = 50_000;

    let start = Instant::now();
    let mut wire = Vec::new();
    for i in 0..iterations {
        let key = (i as u32).to_be_bytes();
        wire.extend(encode_frame(&Frame::text(payload.clone()), Some(key)));
    }

    let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
    let mut decoded = 0;
    for chunk in wire.chunks(4096) {
        decoder.extend(chunk);
        while let Some(frame) = decoder.next_frame().unwrap() {
            assert_eq!(frame.payload.len(), payload.len());
            decoded += 1;
        }
    }
    let duration = start.elapsed();

    println!(
        "Frame codec: {} frames in {:?} ({:.2} μs/frame)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(decoded, iterations);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks dispatch through the full middleware chain
#[test]
fn benchmark_pipeline_dispatch() {
    let mut pipeline = game::build_pipeline();
    for i in 0..8 {
        pipeline.dispatch(joined(&format!("player-{}", i)));
    }

    let iterations = 20_000;
    let start = Instant::now();
    for i in 0..iterations {
        let id = format!("player-{}", i % 8);
        pipeline.dispatch(points(&id, 1));
    }
    let duration = start.elapsed();

    println!(
        "Pipeline dispatch: {} actions in {:?} ({:.2} μs/action)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    let total: i64 = pipeline.state().app.scores.values().sum();
    assert_eq!(total, iterations as i64);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks state serialization for a batched broadcast
#[test]
fn benchmark_state_update_encoding() {
    let mut pipeline = game::build_pipeline();
    for i in 0..16 {
        pipeline.dispatch(joined(&format!("player-{}", i)));
    }
    let state = serde_json::to_value(pipeline.state().as_ref()).unwrap();
    let batch: Vec<Action> = (0..10).map(|i| points("player-0", i)).collect();

    let iterations = 5_000;
    let start = Instant::now();
    let mut bytes = 0;
    for i in 0..iterations {
        let update = StateUpdate::new(state.clone(), i, batch.clone());
        bytes += serde_json::to_string(&update).unwrap().len();
    }
    let duration = start.elapsed();

    println!(
        "State update encoding: {} updates ({} bytes) in {:?}",
        iterations, bytes, duration
    );

    assert!(bytes > 0);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks offline replay of a long recording
#[test]
fn benchmark_replay() {
    let mut recording = Recording::new(CanonicalState::new(GameState::default()), 0);
    recording.record(joined("ada"), 0);
    recording.record(joined("bob"), 1);

    let actions = 20_000u64;
    for i in 0..actions {
        let id = if i % 2 == 0 { "ada" } else { "bob" };
        recording.record(points(id, 1), i + 2);
    }
    recording.finish(actions + 2);

    let reducer = game::root_reducer();
    let start = Instant::now();
    let result = replay(&recording, |state, action| reducer.reduce(state, action));
    let duration = start.elapsed();

    println!(
        "Replay: {} actions in {:?} ({:.2} μs/action)",
        result.action_count,
        duration,
        duration.as_micros() as f64 / result.action_count as f64
    );

    assert_eq!(result.action_count, actions as usize + 2);
    assert_eq!(result.final_state.app.scores[&PlayerId::new("ada")], 10_000);
    assert!(result.final_state.players[&PlayerId::new("ada")].is_host);
    assert!(duration.as_millis() < 3000);
}

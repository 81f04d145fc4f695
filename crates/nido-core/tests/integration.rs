//! Integration tests for nido-core routing.
//!
//! Drives whole routers through their root engine: signal flow between
//! clients, fan-in merging, twin/graph agreement, nested contexts with rate
//! conversion, failure propagation and a live host thread.

use nido_core::{
    BridgeSide, ClientId, ContextRouter, CycleError, EngineConfig, HostThread, NamePolicy,
    PortDirection, PortId, PortType, ProcessError, ProcessHandler, ProcessScope, RtEngine,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const FRAMES: usize = 64;

/// Writes a constant to one audio output.
struct Constant {
    port: PortId,
    value: f32,
}

impl ProcessHandler for Constant {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        if let Some(out) = scope.audio_mut(self.port) {
            out.fill(self.value);
        }
        Ok(())
    }
}

/// Records the last cycle seen on one audio input.
struct Recorder {
    port: PortId,
    seen: Arc<Mutex<Vec<f32>>>,
}

impl ProcessHandler for Recorder {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        if let Some(input) = scope.audio(self.port) {
            let mut seen = self.seen.lock();
            seen.clear();
            seen.extend_from_slice(input);
        }
        Ok(())
    }
}

/// Emits the same MIDI events every cycle.
struct MidiSource {
    port: PortId,
    events: Vec<(u32, [u8; 3])>,
}

impl ProcessHandler for MidiSource {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        let Some(out) = scope.midi_mut(self.port) else {
            return Ok(());
        };
        for (time, bytes) in &self.events {
            out.write(*time, bytes).map_err(|_| ProcessError(1))?;
        }
        Ok(())
    }
}

/// Records `(time, status)` of every MIDI event on one input.
struct MidiRecorder {
    port: PortId,
    seen: Arc<Mutex<Vec<(u32, u8)>>>,
}

impl ProcessHandler for MidiRecorder {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        if let Some(input) = scope.midi(self.port) {
            let mut seen = self.seen.lock();
            seen.clear();
            seen.extend(input.iter().map(|e| (e.time, e.bytes[0])));
        }
        Ok(())
    }
}

/// Always fails with the given code.
struct Failing(i32);

impl ProcessHandler for Failing {
    fn process(&mut self, _: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        Err(ProcessError(self.0))
    }
}

fn setup() -> (ContextRouter, RtEngine) {
    let config = EngineConfig {
        frames: FRAMES,
        ..EngineConfig::default()
    };
    ContextRouter::new(config)
}

fn source(r: &mut ContextRouter, name: &str, value: f32) -> (ClientId, PortId) {
    let c = r.open_client(name, NamePolicy::Exact).unwrap();
    let out = r.register_port(c, "out", PortType::Audio, PortDirection::Output).unwrap();
    r.set_process_handler(c, Constant { port: out, value }).unwrap();
    r.activate(c).unwrap();
    (c, out)
}

fn sink(r: &mut ContextRouter, name: &str) -> (ClientId, PortId, Arc<Mutex<Vec<f32>>>) {
    let c = r.open_client(name, NamePolicy::Exact).unwrap();
    let input = r.register_port(c, "in", PortType::Audio, PortDirection::Input).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    r.set_process_handler(
        c,
        Recorder {
            port: input,
            seen: Arc::clone(&seen),
        },
    )
    .unwrap();
    r.activate(c).unwrap();
    (c, input, seen)
}

fn assert_twin_agrees(r: &ContextRouter, engine: &RtEngine) {
    let mut expected = r.active_connections(r.root()).unwrap();
    let mut actual = engine.snapshot().connections;
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);

    let mut active: Vec<ClientId> = r
        .clients(r.root())
        .unwrap()
        .into_iter()
        .filter(|c| c.active)
        .map(|c| c.id)
        .collect();
    let mut twin = engine.snapshot().clients;
    active.sort();
    twin.sort();
    assert_eq!(twin, active);
}

// ============================================================================
// 1. Signal flow in one context
// ============================================================================

#[test]
fn audio_flows_from_source_to_sink() {
    let (mut r, mut engine) = setup();
    let (_, out) = source(&mut r, "osc", 0.5);
    let (_, input, seen) = sink(&mut r, "scope");
    r.connect(out, input).unwrap();

    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![0.5; FRAMES]);
}

#[test]
fn fan_in_sums_audio() {
    let (mut r, mut engine) = setup();
    let (_, a) = source(&mut r, "a", 0.25);
    let (_, b) = source(&mut r, "b", 0.5);
    let (_, input, seen) = sink(&mut r, "mix");
    r.connect(a, input).unwrap();
    r.connect(b, input).unwrap();

    engine.process(FRAMES).unwrap();
    assert!(seen.lock().iter().all(|&s| (s - 0.75).abs() < 1e-6));
}

#[test]
fn sink_created_first_still_sees_this_cycle() {
    let (mut r, mut engine) = setup();
    let (_, input, seen) = sink(&mut r, "scope");
    let (_, out) = source(&mut r, "osc", 1.0);
    r.connect(out, input).unwrap();

    engine.process(FRAMES).unwrap();
    assert_eq!(seen.lock().first().copied(), Some(1.0));
}

#[test]
fn midi_fan_in_is_time_ordered() {
    let (mut r, mut engine) = setup();
    let late = r.open_client("late", NamePolicy::Exact).unwrap();
    let late_out = r.register_port(late, "out", PortType::Midi, PortDirection::Output).unwrap();
    r.set_process_handler(
        late,
        MidiSource {
            port: late_out,
            events: vec![(10, [0x90, 60, 100])],
        },
    )
    .unwrap();
    let early = r.open_client("early", NamePolicy::Exact).unwrap();
    let early_out = r.register_port(early, "out", PortType::Midi, PortDirection::Output).unwrap();
    r.set_process_handler(
        early,
        MidiSource {
            port: early_out,
            events: vec![(2, [0xB0, 1, 64]), (10, [0x80, 60, 0])],
        },
    )
    .unwrap();
    let listener = r.open_client("listener", NamePolicy::Exact).unwrap();
    let listener_in = r.register_port(listener, "in", PortType::Midi, PortDirection::Input).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    r.set_process_handler(
        listener,
        MidiRecorder {
            port: listener_in,
            seen: Arc::clone(&seen),
        },
    )
    .unwrap();
    for c in [late, early, listener] {
        r.activate(c).unwrap();
    }
    r.connect(late_out, listener_in).unwrap();
    r.connect(early_out, listener_in).unwrap();

    engine.process(FRAMES).unwrap();
    // ties go to the earlier connection
    assert_eq!(*seen.lock(), vec![(2, 0xB0), (10, 0x90), (10, 0x80)]);
}

// ============================================================================
// 2. Twin agreement
// ============================================================================

#[test]
fn twin_follows_graph_changes() {
    let (mut r, mut engine) = setup();
    let (osc, out) = source(&mut r, "osc", 0.5);
    let (scope, input, _) = sink(&mut r, "scope");
    let (_, input2, _) = sink(&mut r, "meter");
    r.connect(out, input).unwrap();
    r.connect(out, input2).unwrap();
    engine.process(FRAMES).unwrap();
    assert_twin_agrees(&r, &engine);

    r.deactivate(scope).unwrap();
    engine.process(FRAMES).unwrap();
    assert_twin_agrees(&r, &engine);
    // connections survive deactivation in the graph
    assert_eq!(r.connections(input).unwrap(), vec!["osc:out"]);

    r.activate(scope).unwrap();
    r.disconnect(out, input2).unwrap();
    r.close_client(osc).unwrap();
    engine.process(FRAMES).unwrap();
    assert_twin_agrees(&r, &engine);
    assert!(r.connections(input).unwrap().is_empty());
}

#[test]
fn twin_catches_up_after_offline_build_overflows_channel() {
    let (mut r, mut engine) = ContextRouter::new(EngineConfig {
        frames: FRAMES,
        channel_capacity: 16,
        reclaim_capacity: 16,
        ..EngineConfig::default()
    });
    let (_, mix, _) = sink(&mut r, "mix");
    for n in 0..24 {
        let (_, out) = source(&mut r, &format!("osc{n}"), 0.125);
        let (_, input, _) = sink(&mut r, &format!("scope{n}"));
        r.connect(out, input).unwrap();
        r.connect(out, mix).unwrap();
    }
    // no host has run yet, so most of the build waits on the control side
    assert!(r.backlogged_events(r.root()).unwrap() > 0);

    let mut cycles = 0;
    while r.pending_events(r.root()).unwrap() > 0 {
        r.flush();
        engine.process(FRAMES).unwrap();
        cycles += 1;
        assert!(cycles < 100, "backlog never drained");
    }
    engine.process(FRAMES).unwrap();
    assert_eq!(r.backlogged_events(r.root()).unwrap(), 0);
    assert_eq!(engine.snapshot().connections.len(), 48);
    assert_twin_agrees(&r, &engine);
}

#[test]
fn reactivated_fan_in_source_keeps_its_place() {
    let (mut r, mut engine) = setup();
    let midi_source = |r: &mut ContextRouter, name: &str, events| {
        let c = r.open_client(name, NamePolicy::Exact).unwrap();
        let out = r.register_port(c, "out", PortType::Midi, PortDirection::Output).unwrap();
        r.set_process_handler(c, MidiSource { port: out, events }).unwrap();
        r.activate(c).unwrap();
        (c, out)
    };
    let (first, first_out) = midi_source(&mut r, "first", vec![(10, [0x90, 60, 100])]);
    let (_, second_out) = midi_source(&mut r, "second", vec![(10, [0x80, 60, 0])]);
    let listener = r.open_client("listener", NamePolicy::Exact).unwrap();
    let listener_in = r.register_port(listener, "in", PortType::Midi, PortDirection::Input).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    r.set_process_handler(
        listener,
        MidiRecorder {
            port: listener_in,
            seen: Arc::clone(&seen),
        },
    )
    .unwrap();
    r.activate(listener).unwrap();
    r.connect(first_out, listener_in).unwrap();
    r.connect(second_out, listener_in).unwrap();
    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![(10, 0x90), (10, 0x80)]);

    r.deactivate(first).unwrap();
    engine.process(FRAMES).unwrap();
    assert_twin_agrees(&r, &engine);
    assert_eq!(*seen.lock(), vec![(10, 0x80)]);

    r.activate(first).unwrap();
    engine.process(FRAMES).unwrap();
    assert_twin_agrees(&r, &engine);
    // the earlier connection still wins the tie
    assert_eq!(*seen.lock(), vec![(10, 0x90), (10, 0x80)]);
    assert_eq!(r.connections(listener_in).unwrap(), vec!["first:out", "second:out"]);
}

#[test]
fn inactive_client_keeps_handler() {
    let (mut r, mut engine) = setup();
    let (osc, out) = source(&mut r, "osc", 0.5);
    let (_, input, seen) = sink(&mut r, "scope");
    r.connect(out, input).unwrap();
    r.deactivate(osc).unwrap();
    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![0.0; FRAMES]);

    r.activate(osc).unwrap();
    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![0.5; FRAMES]);
}

// ============================================================================
// 3. Failures
// ============================================================================

#[test]
fn failing_client_reports_code() {
    let (mut r, mut engine) = setup();
    let bad = r.open_client("bad", NamePolicy::Exact).unwrap();
    r.set_process_handler(bad, Failing(7)).unwrap();
    r.activate(bad).unwrap();
    assert_eq!(
        engine.process(FRAMES),
        Err(CycleError::ClientFailed { client: bad, code: 7 })
    );
}

#[test]
fn nested_failure_surfaces_as_macro_failure() {
    let (mut r, mut engine) = setup();
    let fx = r.push("fx", 2).unwrap();
    let bad = r.open_client("bad", NamePolicy::Exact).unwrap();
    r.set_process_handler(bad, Failing(3)).unwrap();
    r.activate(bad).unwrap();
    r.pop().unwrap();

    let mac = r.macro_client(fx).unwrap();
    assert_eq!(
        engine.process(FRAMES),
        Err(CycleError::ClientFailed { client: mac, code: 3 })
    );
}

// ============================================================================
// 4. Nesting
// ============================================================================

/// Builds `osc -> fx (passthrough at `factor`) -> scope` and returns what the scope saw.
fn nested_passthrough(
    r: &mut ContextRouter,
    factor: u32,
    value: f32,
) -> Arc<Mutex<Vec<f32>>> {
    r.push("fx", factor).unwrap();
    r.connect_by_name("inlet:audio_1", "outlet:audio_1").unwrap();
    r.pop().unwrap();

    source(r, "osc", value);
    let (_, _, seen) = sink(r, "scope");
    r.connect_by_name("osc:out", "fx:inlet_audio_1").unwrap();
    r.connect_by_name("fx:outlet_audio_1", "scope:in").unwrap();
    seen
}

#[test]
fn nested_context_passes_dc_through_rate_change() {
    let (mut r, mut engine) = setup();
    let seen = nested_passthrough(&mut r, 2, 0.5);
    for _ in 0..3 {
        engine.process(FRAMES).unwrap();
    }
    let seen = seen.lock();
    assert_eq!(seen.len(), FRAMES);
    assert!(seen.iter().all(|&s| (s - 0.5).abs() < 1e-3), "{seen:?}");
}

#[test]
fn unit_factor_is_transparent() {
    let (mut r, mut engine) = setup();
    let seen = nested_passthrough(&mut r, 1, 0.25);
    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![0.25; FRAMES]);
}

#[test]
fn nested_midi_keeps_parent_timing() {
    let (mut r, mut engine) = setup();
    r.push("fx", 4).unwrap();
    r.connect_by_name("inlet:midi_1", "outlet:midi_1").unwrap();
    r.pop().unwrap();

    let kbd = r.open_client("kbd", NamePolicy::Exact).unwrap();
    let out = r.register_port(kbd, "out", PortType::Midi, PortDirection::Output).unwrap();
    r.set_process_handler(
        kbd,
        MidiSource {
            port: out,
            events: vec![(3, [0x90, 64, 90]), (17, [0x80, 64, 0])],
        },
    )
    .unwrap();
    let listener = r.open_client("listener", NamePolicy::Exact).unwrap();
    let input = r.register_port(listener, "in", PortType::Midi, PortDirection::Input).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    r.set_process_handler(
        listener,
        MidiRecorder {
            port: input,
            seen: Arc::clone(&seen),
        },
    )
    .unwrap();
    r.activate(kbd).unwrap();
    r.activate(listener).unwrap();
    r.connect_by_name("kbd:out", "fx:inlet_midi_1").unwrap();
    r.connect_by_name("fx:outlet_midi_1", "listener:in").unwrap();

    engine.process(FRAMES).unwrap();
    assert_eq!(*seen.lock(), vec![(3, 0x90), (17, 0x80)]);
}

#[test]
fn bridge_clients_always_offer_free_ports() {
    let (mut r, _engine) = setup();
    let fx = r.push("fx", 1).unwrap();
    for n in 0..4 {
        let c = r.open_client(&format!("fx{n}"), NamePolicy::Exact).unwrap();
        r.register_port(c, "in", PortType::Audio, PortDirection::Input).unwrap();
        r.register_port(c, "midi", PortType::Midi, PortDirection::Input).unwrap();
        let free_audio = r.ports(Some("^inlet:audio_"), None, None).unwrap();
        let free_midi = r.ports(Some("^inlet:midi_"), None, None).unwrap();
        r.connect_by_name(free_audio.last().unwrap(), &format!("fx{n}:in")).unwrap();
        r.connect_by_name(free_midi.last().unwrap(), &format!("fx{n}:midi")).unwrap();
    }
    for side in [BridgeSide::Inlet, BridgeSide::Outlet] {
        let client = r.bridge_client(fx, side).unwrap();
        let ports = r.client_info(client).unwrap().ports;
        for t in [PortType::Audio, PortType::Midi] {
            assert!(
                ports.iter().any(|p| p.port_type == t && p.connections.is_empty()),
                "{side:?} has no free {t:?} port"
            );
        }
    }
    assert_eq!(r.bridge_ports(fx).unwrap().len(), 8);
    r.pop().unwrap();
    assert_eq!(r.client_info(r.macro_client(fx).unwrap()).unwrap().ports.len(), 8);
}

#[test]
fn nested_contexts_multiply_rates() {
    let (mut r, _engine) = setup();
    let a = r.push("a", 2).unwrap();
    let b = r.push("b", 3).unwrap();
    assert_eq!(r.frames(a).unwrap(), FRAMES * 2);
    assert_eq!(r.frames(b).unwrap(), FRAMES * 6);
    assert_eq!(r.sample_rate(b).unwrap(), 48000.0 * 6.0);
    assert_eq!(r.children(a).unwrap(), vec![b]);
}

// ============================================================================
// 5. Live host
// ============================================================================

#[test]
fn live_host_applies_changes_before_returning() {
    let (mut r, engine) = setup();
    let host = HostThread::spawn(engine, FRAMES, Duration::from_micros(200));
    assert!(r.is_live(r.root()).unwrap());

    let (_, out) = source(&mut r, "osc", 0.5);
    let (_, input, seen) = sink(&mut r, "scope");
    r.connect(out, input).unwrap();
    let fx = r.push("fx", 2).unwrap();
    assert!(r.is_live(fx).unwrap());
    r.connect_by_name("inlet:audio_1", "outlet:audio_1").unwrap();
    assert_eq!(r.pending_events(fx).unwrap(), 0);
    r.pop().unwrap();

    host.wait_cycles(2);
    assert_eq!(*seen.lock(), vec![0.5; FRAMES]);

    r.unregister_port(input).unwrap();
    host.wait_cycles(2);
    r.delete(fx).unwrap();
    // every change was applied before its call returned
    r.reclaim();
    assert_eq!(r.pending_free(), 0);
    assert_eq!(host.failures(), 0);

    let engine = host.stop().unwrap();
    assert!(!engine.is_live());
    assert_twin_agrees(&r, &engine);
}

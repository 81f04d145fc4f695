//! Built-in client factories.
//!
//! | id         | ports                                   | state          |
//! |------------|-----------------------------------------|----------------|
//! | `gain`     | audio `in` → `out`                      | level (f32 LE) |
//! | `thru`     | audio `in` → `out`, MIDI `midi_in` → `midi_out` | none   |
//! | `constant` | audio `out`                             | level (f32 LE) |
//!
//! Levels live in a shared [`Levels`] table so the control thread can change
//! them while the handler runs.

use crate::{ClientFactory, ClientRegistry, FactoryDescriptor, FactoryError};
use nido_core::{
    ClientId, ContextRouter, NamePolicy, PortDirection, PortId, PortType, ProcessError,
    ProcessHandler, ProcessScope,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free level per client, shared with the process handlers.
#[derive(Debug, Default)]
pub struct Levels {
    table: Mutex<HashMap<ClientId, Arc<AtomicU32>>>,
}

impl Levels {
    fn insert(&self, client: ClientId, level: f32) -> Arc<AtomicU32> {
        let cell = Arc::new(AtomicU32::new(level.to_bits()));
        self.table.lock().insert(client, Arc::clone(&cell));
        cell
    }

    /// Current level of a client.
    pub fn get(&self, client: ClientId) -> Option<f32> {
        let table = self.table.lock();
        let cell = table.get(&client)?;
        Some(f32::from_bits(cell.load(Ordering::Relaxed)))
    }

    /// Changes a client's level. Returns false if the client has none.
    pub fn set(&self, client: ClientId, level: f32) -> bool {
        match self.table.lock().get(&client) {
            Some(cell) => {
                cell.store(level.to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn encode(&self, client: ClientId) -> Vec<u8> {
        self.get(client).map_or_else(Vec::new, |l| l.to_le_bytes().to_vec())
    }

    fn decode(&self, factory: &str, client: ClientId, state: &[u8]) -> Result<(), FactoryError> {
        if state.is_empty() {
            return Ok(());
        }
        let bytes: [u8; 4] = state.try_into().map_err(|_| FactoryError::InvalidState {
            factory: factory.to_owned(),
            reason: format!("expected 4 bytes, got {}", state.len()),
        })?;
        self.set(client, f32::from_le_bytes(bytes));
        Ok(())
    }
}

/// Opens a client and runs `setup` on it, closing it again if `setup` fails.
fn build(
    router: &mut ContextRouter,
    name: &str,
    setup: impl FnOnce(&mut ContextRouter, ClientId) -> Result<(), FactoryError>,
) -> Result<ClientId, FactoryError> {
    let client = router.open_client(name, NamePolicy::Exact)?;
    if let Err(e) = setup(router, client) {
        let _ = router.close_client(client);
        return Err(e);
    }
    Ok(client)
}

// --- gain ---

struct GainHandler {
    input: PortId,
    output: PortId,
    level: Arc<AtomicU32>,
}

impl ProcessHandler for GainHandler {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        let gain = f32::from_bits(self.level.load(Ordering::Relaxed));
        if let Some((input, output)) = scope.audio_pair(self.input, self.output) {
            for (o, &i) in output.iter_mut().zip(input) {
                *o = i * gain;
            }
        }
        Ok(())
    }
}

struct Gain {
    levels: Arc<Levels>,
}

impl ClientFactory for Gain {
    fn create(&self, router: &mut ContextRouter, name: &str) -> Result<ClientId, FactoryError> {
        build(router, name, |router, client| {
            let input = router.register_port(client, "in", PortType::Audio, PortDirection::Input)?;
            let output =
                router.register_port(client, "out", PortType::Audio, PortDirection::Output)?;
            let level = self.levels.insert(client, 1.0);
            router.set_process_handler(
                client,
                GainHandler {
                    input,
                    output,
                    level,
                },
            )?;
            Ok(())
        })
    }

    fn save_state(&self, _: &ContextRouter, client: ClientId) -> Result<Vec<u8>, FactoryError> {
        Ok(self.levels.encode(client))
    }

    fn load_state(
        &self,
        _: &mut ContextRouter,
        client: ClientId,
        state: &[u8],
    ) -> Result<(), FactoryError> {
        self.levels.decode("gain", client, state)
    }
}

// --- thru ---

struct ThruHandler {
    audio: (PortId, PortId),
    midi: (PortId, PortId),
}

impl ProcessHandler for ThruHandler {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        if let Some((input, output)) = scope.audio_pair(self.audio.0, self.audio.1) {
            output.copy_from_slice(input);
        }
        if let Some((input, output)) = scope.midi_pair(self.midi.0, self.midi.1) {
            for event in input.iter() {
                // overflow is counted in the output buffer
                let _ = output.write(event.time, event.bytes);
            }
        }
        Ok(())
    }
}

struct Thru;

impl ClientFactory for Thru {
    fn create(&self, router: &mut ContextRouter, name: &str) -> Result<ClientId, FactoryError> {
        build(router, name, |router, client| {
            let mut port = |short: &str, port_type, direction| {
                router.register_port(client, short, port_type, direction)
            };
            let audio_in = port("in", PortType::Audio, PortDirection::Input)?;
            let audio_out = port("out", PortType::Audio, PortDirection::Output)?;
            let midi_in = port("midi_in", PortType::Midi, PortDirection::Input)?;
            let midi_out = port("midi_out", PortType::Midi, PortDirection::Output)?;
            router.set_process_handler(
                client,
                ThruHandler {
                    audio: (audio_in, audio_out),
                    midi: (midi_in, midi_out),
                },
            )?;
            Ok(())
        })
    }
}

// --- constant ---

struct ConstantHandler {
    output: PortId,
    level: Arc<AtomicU32>,
}

impl ProcessHandler for ConstantHandler {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        if let Some(output) = scope.audio_mut(self.output) {
            output.fill(f32::from_bits(self.level.load(Ordering::Relaxed)));
        }
        Ok(())
    }
}

struct Constant {
    levels: Arc<Levels>,
}

impl ClientFactory for Constant {
    fn create(&self, router: &mut ContextRouter, name: &str) -> Result<ClientId, FactoryError> {
        build(router, name, |router, client| {
            let output =
                router.register_port(client, "out", PortType::Audio, PortDirection::Output)?;
            let level = self.levels.insert(client, 0.0);
            router.set_process_handler(client, ConstantHandler { output, level })?;
            Ok(())
        })
    }

    fn save_state(&self, _: &ContextRouter, client: ClientId) -> Result<Vec<u8>, FactoryError> {
        Ok(self.levels.encode(client))
    }

    fn load_state(
        &self,
        _: &mut ContextRouter,
        client: ClientId,
        state: &[u8],
    ) -> Result<(), FactoryError> {
        self.levels.decode("constant", client, state)
    }
}

/// Registers every built-in factory.
pub(crate) fn register(registry: &mut ClientRegistry) {
    let levels = Arc::clone(registry.levels());

    registry.register(
        FactoryDescriptor {
            id: "gain",
            name: "Gain",
            description: "Scales an audio signal by an adjustable level",
        },
        Gain {
            levels: Arc::clone(&levels),
        },
    );

    registry.register(
        FactoryDescriptor {
            id: "thru",
            name: "Thru",
            description: "Copies audio and MIDI from input to output",
        },
        Thru,
    );

    registry.register(
        FactoryDescriptor {
            id: "constant",
            name: "Constant",
            description: "Writes a constant level to an audio output",
        },
        Constant { levels },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use nido_core::{EngineConfig, RtEngine};

    fn setup() -> (ClientRegistry, ContextRouter, RtEngine) {
        let (router, engine) = ContextRouter::new(EngineConfig {
            frames: 16,
            ..EngineConfig::default()
        });
        (ClientRegistry::with_builtins(), router, engine)
    }

    #[test]
    fn test_constant_into_gain() {
        let (registry, mut router, mut engine) = setup();
        let src = registry.create("constant", &mut router, "dc").unwrap();
        let gain = registry.create("gain", &mut router, "vol").unwrap();
        let thru = registry.create("thru", &mut router, "thru").unwrap();
        registry.levels().set(src, 0.8);
        registry.levels().set(gain, 0.5);

        let seen = Arc::new(Mutex::new(0.0f32));
        let sink = router.open_client("sink", NamePolicy::Exact).unwrap();
        let input = router
            .register_port(sink, "in", PortType::Audio, PortDirection::Input)
            .unwrap();
        let slot = Arc::clone(&seen);
        router
            .set_process_handler(
                sink,
                move |scope: &mut ProcessScope<'_>| -> Result<(), ProcessError> {
                    if let Some(buf) = scope.audio(input) {
                        *slot.lock() = buf[0];
                    }
                    Ok(())
                },
            )
            .unwrap();

        for c in [src, gain, thru, sink] {
            router.activate(c).unwrap();
        }
        router.connect_by_name("dc:out", "vol:in").unwrap();
        router.connect_by_name("vol:out", "thru:in").unwrap();
        router.connect_by_name("thru:out", "sink:in").unwrap();
        engine.process(16).unwrap();
        assert!((*seen.lock() - 0.4).abs() < 1e-6);

        registry.levels().set(gain, 0.25);
        engine.process(16).unwrap();
        assert!((*seen.lock() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_level_state_round_trip() {
        let (registry, mut router, _engine) = setup();
        let gain = registry.create("gain", &mut router, "vol").unwrap();
        registry.levels().set(gain, 0.25);
        let state = registry.save_state("gain", &router, gain).unwrap();
        assert_eq!(state, 0.25f32.to_le_bytes().to_vec());

        let other = registry.create("gain", &mut router, "vol2").unwrap();
        registry.load_state("gain", &mut router, other, &state).unwrap();
        assert_eq!(registry.levels().get(other), Some(0.25));
    }

    #[test]
    fn test_bad_state_is_rejected() {
        let (registry, mut router, _engine) = setup();
        let gain = registry.create("gain", &mut router, "vol").unwrap();
        assert!(matches!(
            registry.load_state("gain", &mut router, gain, &[1, 2, 3]),
            Err(FactoryError::InvalidState { .. })
        ));
        assert_eq!(registry.levels().get(gain), Some(1.0));
    }

    #[test]
    fn test_failed_build_leaves_nothing() {
        let registry = ClientRegistry::with_builtins();
        // room for "name:in" but not "name:out"
        let (mut router, _engine) = ContextRouter::new(EngineConfig {
            max_port_name: 7,
            ..EngineConfig::default()
        });
        assert!(registry.create("thru", &mut router, "name").is_err());
        assert!(router.client_by_name("name").is_none());
    }

    #[test]
    fn test_levels_unknown_client() {
        let (_, mut router, _engine) = setup();
        let plain = router.open_client("plain", NamePolicy::Exact).unwrap();
        let levels = Levels::default();
        assert!(!levels.set(plain, 1.0));
        assert_eq!(levels.get(plain), None);
        assert!(levels.encode(plain).is_empty());
    }
}

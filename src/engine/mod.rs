// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! The MIDI engine: host-facing surface over the output scheduler and the
//! input funnel.
//!
//! [`MidiEngine`] owns the two worker threads, the engine clock and the
//! platform backend. Construction starts the workers; dropping the engine
//! (or calling [`MidiEngine::shutdown`]) stops them, closing every open
//! device. All methods are callable from any thread.

pub(crate) mod input;
pub mod notemap;
pub(crate) mod output;

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::debug;

pub use input::ReceivedMessage;

use crate::midi::{self, MidiBackend, DEV_LOOPBACK};
use crate::timing::Clock;

/// Real-time MIDI I/O engine.
///
/// Output devices accept time-stamped messages through
/// [`queue_message`](MidiEngine::queue_message); two virtual device
/// numbers are always available: [`DEV_DUMMY`](crate::DEV_DUMMY) discards
/// everything, [`DEV_LOOPBACK`](crate::DEV_LOOPBACK) re-routes dispatched
/// messages into the receive path.
pub struct MidiEngine {
    backend: Arc<dyn MidiBackend>,
    output: Arc<output::OutputEngine>,
    input: Arc<input::InputFunnel>,
    workers: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl MidiEngine {
    /// Start an engine on the platform's MIDI backend.
    pub fn new() -> Result<Self> {
        let clock = Arc::new(Clock::new());
        let backend = midi::platform_backend(Arc::clone(&clock))?;
        Self::with_backend_and_clock(backend, clock)
    }

    /// Start an engine on a caller-supplied backend.
    pub fn with_backend(backend: Arc<dyn MidiBackend>) -> Result<Self> {
        Self::with_backend_and_clock(backend, Arc::new(Clock::new()))
    }

    fn with_backend_and_clock(backend: Arc<dyn MidiBackend>, clock: Arc<Clock>) -> Result<Self> {
        let output = Arc::new(output::OutputEngine::new(Arc::clone(&clock), Arc::clone(&backend)));
        let input = Arc::new(input::InputFunnel::new(Arc::clone(&backend)));

        let out_worker = {
            let output = Arc::clone(&output);
            let funnel = Arc::clone(&input);
            std::thread::Builder::new()
                .name("midio-out".into())
                .spawn(move || output.run_worker(&funnel))?
        };
        let in_worker = {
            let input = Arc::clone(&input);
            let output = Arc::clone(&output);
            std::thread::Builder::new()
                .name("midio-in".into())
                .spawn(move || input.run_worker(&output))?
        };
        debug!("MIDI engine started");

        Ok(Self {
            backend,
            output,
            input,
            workers: Mutex::new(Some((out_worker, in_worker))),
        })
    }

    /// Names of the available output devices.
    pub fn output_devices(&self) -> Vec<String> {
        self.backend.output_devices()
    }

    /// Names of the available input devices.
    pub fn input_devices(&self) -> Vec<String> {
        self.backend.input_devices()
    }

    /// Number of the default output device, or -1 if none exist.
    pub fn default_output_device(&self) -> i32 {
        self.backend.default_output_device()
    }

    /// Number of the default input device, or -1 if none exist.
    pub fn default_input_device(&self) -> i32 {
        self.backend.default_input_device()
    }

    pub fn open_output_device(&self, device: i32) -> Result<()> {
        self.output.open_device(device)
    }

    pub fn close_output_device(&self, device: i32) {
        self.output.close_device(device)
    }

    pub fn is_opened_output_device(&self, device: i32) -> bool {
        self.output.is_opened_device(device)
    }

    pub fn open_input_device(&self, device: i32) -> Result<()> {
        self.input.open_device(device)
    }

    pub fn close_input_device(&self, device: i32) {
        self.input.close_device(device)
    }

    pub fn is_opened_input_device(&self, device: i32) -> bool {
        self.input.is_opened_device(device)
    }

    /// Queue a message for dispatch at a tick time.
    ///
    /// The message must be a channel-voice message of its status-implied
    /// length, a `0xF0...` system-exclusive message, or a `0xFF...` meta
    /// message (loopback-addressed messages are exempt and may carry any
    /// payload). The device must be opened unless it is one of the virtual
    /// devices.
    pub fn queue_message(&self, device: i32, ticks: f64, track: i32, msg: &[u8]) -> Result<()> {
        if device != DEV_LOOPBACK && !midi::is_valid_message(msg) {
            bail!("invalid MIDI (or meta) message");
        }
        self.output.queue_message(device, ticks, track, msg.to_vec())
    }

    /// The current time in ticks.
    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// The current tempo in beats per minute.
    pub fn current_tempo(&self) -> f64 {
        self.output.current_tempo()
    }

    /// The current tempo-scale multiplier.
    pub fn current_tempo_scale(&self) -> f64 {
        self.output.tempo_scale()
    }

    /// Change the tempo-scale multiplier (clamped to be non-negative; zero
    /// pauses dispatch). The underlying mapping stays continuous.
    pub fn set_tempo_scale(&self, scale: f64) {
        self.output.set_tempo_scale(scale)
    }

    /// Convert a tick time to milliseconds on the engine clock.
    pub fn ticks_to_msecs(&self, ticks: f64) -> f64 {
        self.output.ticks_to_msecs(ticks)
    }

    /// Convert a millisecond time on the engine clock to ticks.
    pub fn msecs_to_ticks(&self, msecs: f64) -> f64 {
        self.output.msecs_to_ticks(msecs)
    }

    /// Remove every queued message for a device and track
    /// ([`ALL_TRACKS`](crate::ALL_TRACKS) matches any track) and silence
    /// the matching sounding notes and held pedals.
    pub fn cancel_messages(&self, device: i32, track: i32) {
        self.output.cancel_messages(device, track)
    }

    /// Enable or disable note retriggering. Implies a stop of everything
    /// sounding or queued.
    pub fn set_retrigger(&self, enable: bool) {
        self.output.set_retrigger(enable)
    }

    /// Stop all sound: silence every open output device, drop the output
    /// queue, and interrupt any blocked receive.
    pub fn stop(&self) {
        self.output.stop_all();
        self.input.interrupt();
    }

    /// Whether a received message is waiting.
    pub fn recv_ready(&self) -> bool {
        self.input.receive_ready()
    }

    /// Block until a message is received from an input device (or the
    /// loopback), or until Ctrl-C / `interrupt_recv_message` ends the wait
    /// with the `DEV_DUMMY` sentinel. The previous Ctrl-C behavior is
    /// restored on return.
    pub fn recv_message(&self) -> ReceivedMessage {
        let funnel = Arc::clone(&self.input);
        crate::signal::set_sigint_action(move || funnel.interrupt());
        let received = self.input.receive_message();
        crate::signal::clear_sigint_action();
        received
    }

    /// Make a blocked `recv_message` return the interrupt sentinel, and
    /// clear pending input.
    pub fn interrupt_recv_message(&self) {
        self.input.interrupt()
    }

    /// Stop both workers and close every device. Queued messages are
    /// silently dropped; call [`stop`](MidiEngine::stop) first for
    /// silence. Idempotent, also invoked by `Drop`.
    pub fn shutdown(&self) {
        if let Some((out_worker, in_worker)) = self.workers.lock().take() {
            self.output.request_shutdown();
            if out_worker.join().is_err() {
                tracing::warn!("output worker panicked during shutdown");
            }
            self.input.shutdown();
            if in_worker.join().is_err() {
                tracing::warn!("input worker panicked during shutdown");
            }
            debug!("MIDI engine stopped");
        }
    }
}

impl Drop for MidiEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

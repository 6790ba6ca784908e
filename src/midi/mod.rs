// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! MIDI message model and the device backend abstraction.
//!
//! This module defines the raw message payload exchanged with OS MIDI
//! drivers, the validation rules applied at the host boundary, and the
//! trait surface each platform backend implements. Backends are selected
//! statically by target OS; all of them share identical semantics for
//! enumeration, open/close, send/receive and the blocking device wait.

#[cfg(target_os = "linux")]
pub mod alsa_backend;
#[cfg(target_os = "macos")]
pub mod coremidi_backend;
pub mod generic_backend;
#[cfg(windows)]
pub mod winmm_backend;

use std::sync::Arc;

use anyhow::Result;

use crate::timing::Clock;

/// Track wildcard accepted by cancellation operations.
pub const ALL_TRACKS: i32 = -1;

/// Virtual output device that silently discards every message.
pub const DEV_DUMMY: i32 = -1;

/// Virtual output device that re-routes dispatched messages into the
/// input funnel.
pub const DEV_LOOPBACK: i32 = -2;

/// MIDI status and controller constants
pub mod messages {
    // Channel Voice Messages (upper nibble, lower nibble is channel 0-15)
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const POLY_AFTERTOUCH: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_AFTERTOUCH: u8 = 0xD0;
    pub const PITCH_BEND: u8 = 0xE0;

    // System messages
    pub const SYSEX_START: u8 = 0xF0;
    pub const SYSEX_END: u8 = 0xF7;

    // Controllers
    pub const C_SUSTAIN: u8 = 64;
    pub const C_ALL_SOUND_OFF: u8 = 120;
    pub const C_ALL_NOTES_OFF: u8 = 123;

    // Meta messages (queued but never transmitted)
    pub const META: u8 = 0xFF;
    pub const META_TEMPO: u8 = 0x51;
}

/// A raw MIDI message as exchanged with a device backend.
///
/// `bytes` holds the complete message; for a system-exclusive message this
/// includes the leading `0xF0` and the terminating `0xF7`. Backends deliver
/// received sysex payloads *without* the leading `0xF0` (the input funnel
/// restores it), mirroring how the drivers hand the data over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPayload {
    pub bytes: Vec<u8>,
    pub is_sysex: bool,
}

impl MidiPayload {
    pub fn short(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            is_sysex: false,
        }
    }

    pub fn sysex(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            is_sysex: true,
        }
    }
}

/// Number of bytes in a short message, determined by its status byte.
///
/// Returns 0 for `0xF0` (system exclusive, variable length).
pub fn short_message_len(status: u8) -> usize {
    const TABLE: [usize; 8] = [3, 3, 3, 3, 2, 2, 3, 0];
    let len = TABLE[((status >> 4) & 7) as usize];
    if len != 0 {
        return len;
    }
    match status {
        messages::SYSEX_START => 0,
        0xF1 | 0xF3 => 2,
        0xF2 => 3,
        _ => 1,
    }
}

/// Check a message against the rules enforced at the enqueue boundary.
///
/// A valid message is a channel-voice message of exactly its status-implied
/// length, a system-exclusive message starting with `0xF0`, or a meta
/// message starting with `0xFF`.
pub fn is_valid_message(msg: &[u8]) -> bool {
    match msg.first() {
        None => false,
        Some(&status) if (0x80..0xF0).contains(&status) => {
            msg.len() == short_message_len(status)
        }
        Some(&messages::SYSEX_START) | Some(&messages::META) => true,
        Some(_) => false,
    }
}

/// Outcome of a blocking [`MidiBackend::device_wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The input device with this number has at least one queued message.
    MidiIn(usize),
    /// `terminate_device_wait` was invoked.
    Terminated,
}

/// Trait for MIDI output device handles.
///
/// Dropping a handle closes the device.
pub trait MidiOutput: Send {
    /// Send a MIDI message to the device.
    ///
    /// The scheduler treats send errors as best-effort: they are logged and
    /// playback continues.
    fn send(&mut self, message: &MidiPayload) -> Result<()>;
}

/// Trait for MIDI input device handles.
///
/// Dropping a handle closes the device.
pub trait MidiInput: Send {
    /// Pop the next received message together with its arrival time in
    /// milliseconds on the engine clock.
    ///
    /// Returns `None` when the device queue is empty or the device has been
    /// closed. Should only be called after `device_wait` reported this
    /// device ready.
    fn recv(&mut self) -> Option<(MidiPayload, f64)>;
}

/// Uniform facade over one operating system's MIDI services.
pub trait MidiBackend: Send + Sync {
    /// Names of the available output devices, indexed by device number.
    fn output_devices(&self) -> Vec<String>;

    /// Names of the available input devices, indexed by device number.
    fn input_devices(&self) -> Vec<String>;

    /// Device number of the default output device, or -1 if none exist.
    fn default_output_device(&self) -> i32;

    /// Device number of the default input device, or -1 if none exist.
    fn default_input_device(&self) -> i32;

    /// Open an output device.
    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>>;

    /// Open an input device.
    fn open_input(&self, device: usize) -> Result<Box<dyn MidiInput>>;

    /// Block until an opened input device has queued input or
    /// [`MidiBackend::terminate_device_wait`] is invoked.
    fn device_wait(&self) -> WaitEvent;

    /// Make a pending or future `device_wait` return `Terminated`.
    fn terminate_device_wait(&self);
}

/// Construct the backend for the current platform.
///
/// The clock is shared so backends can express driver timestamps in engine
/// time regardless of the platform's native time domain.
pub fn platform_backend(clock: Arc<Clock>) -> Result<Arc<dyn MidiBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(alsa_backend::AlsaBackend::new(clock)?))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(coremidi_backend::CoreMidiBackend::new(clock)?))
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(winmm_backend::WinMmBackend::new(clock)?))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = clock;
        Ok(Arc::new(generic_backend::GenericBackend::new()))
    }
}

// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! MIDIO - Real-time MIDI I/O engine.
//!
//! MIDIO converts musical-tick time to wall-clock time under a live-editable
//! tempo and dispatches time-stamped MIDI messages to OS MIDI drivers. It
//! runs two worker threads: an output scheduler that owns the tempo mapping
//! and a min-heap of pending messages, and an input funnel that streams
//! inbound device messages (tick-stamped) to the host.
//!
//! The entry point is [`MidiEngine`]. A typical session:
//!
//! ```no_run
//! use midio::MidiEngine;
//!
//! let engine = MidiEngine::new()?;
//! engine.open_output_device(0)?;
//! // middle C, one quarter note at the default tempo
//! engine.queue_message(0, 0.0, 0, &[0x90, 60, 100])?;
//! engine.queue_message(0, 480.0, 0, &[0x90, 60, 0])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod engine;
pub mod midi;
pub mod signal;
pub mod timing;

pub use engine::{MidiEngine, ReceivedMessage};
pub use midi::{ALL_TRACKS, DEV_DUMMY, DEV_LOOPBACK};
pub use timing::TICKS_PER_QUARTER;

// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! MIDI input funnel.
//!
//! A single worker thread blocks in the backend's device wait and, for
//! each inbound message, converts its arrival time from milliseconds to
//! ticks through the output engine's tempo mapping and appends it to a
//! FIFO. The host consumes that FIFO with [`InputFunnel::receive_message`],
//! which can be interrupted by Ctrl-C or by another thread.
//!
//! Loopback-addressed output is fed into the same FIFO by the output
//! scheduler, so a host reading the funnel sees device input and loopback
//! traffic merged in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex};

use super::output::OutputEngine;
use crate::midi::{messages, MidiBackend, MidiInput, WaitEvent, DEV_DUMMY};

/// A message delivered to the host by [`InputFunnel::receive_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Source device number (`DEV_DUMMY` for the interrupt sentinel,
    /// `DEV_LOOPBACK` for loopback traffic).
    pub device: i32,
    /// Arrival time in ticks.
    pub ticks: f64,
    /// Track number carried by the message (0 for device input).
    pub track: i32,
    /// Raw message bytes; empty for the interrupt sentinel.
    pub message: Vec<u8>,
}

struct InEntry {
    device: i32,
    ticks: f64,
    track: i32,
    msg: Vec<u8>,
}

struct InputState {
    fifo: VecDeque<InEntry>,
    handles: Vec<Option<Box<dyn MidiInput>>>,
    receiving: bool,
}

/// The input funnel shared between the host, the input worker and the
/// output scheduler (for loopback).
pub(crate) struct InputFunnel {
    backend: Arc<dyn MidiBackend>,
    state: Mutex<InputState>,
    cond: Condvar,
}

impl InputFunnel {
    pub fn new(backend: Arc<dyn MidiBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(InputState {
                fifo: VecDeque::new(),
                handles: Vec::new(),
                receiving: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Open an input device; opening an already-open or virtual device is
    /// a no-op.
    pub fn open_device(&self, device: i32) -> Result<()> {
        if device < 0 {
            return Ok(());
        }
        let index = device as usize;
        if index >= self.backend.input_devices().len() {
            bail!("MIDI input device {} not found", device);
        }
        let mut st = self.state.lock();
        if st.handles.len() <= index {
            st.handles.resize_with(index + 1, || None);
        }
        if st.handles[index].is_none() {
            let handle = self
                .backend
                .open_input(index)
                .with_context(|| format!("failed to open MIDI input device {}", device))?;
            st.handles[index] = Some(handle);
        }
        Ok(())
    }

    /// Close an input device, discarding its queued messages.
    pub fn close_device(&self, device: i32) {
        if device < 0 {
            return;
        }
        let mut st = self.state.lock();
        if let Some(slot) = st.handles.get_mut(device as usize) {
            *slot = None;
        }
        st.fifo.retain(|entry| entry.device != device);
    }

    pub fn is_opened_device(&self, device: i32) -> bool {
        if device < 0 {
            return true;
        }
        let st = self.state.lock();
        st.handles
            .get(device as usize)
            .map_or(false, |slot| slot.is_some())
    }

    /// Whether a message is waiting in the FIFO.
    pub fn receive_ready(&self) -> bool {
        !self.state.lock().fifo.is_empty()
    }

    /// Append a message to the FIFO and wake a waiting receiver.
    pub fn enqueue(&self, device: i32, ticks: f64, track: i32, msg: Vec<u8>) {
        let mut st = self.state.lock();
        st.fifo.push_back(InEntry {
            device,
            ticks,
            track,
            msg,
        });
        self.cond.notify_one();
    }

    /// Block until a message arrives or the wait is interrupted.
    ///
    /// An interrupted wait returns the sentinel `(DEV_DUMMY, 0, 0, empty)`
    /// message instead of an error. The caller arranges for Ctrl-C to
    /// route to [`InputFunnel::interrupt`] for the duration of the wait.
    pub fn receive_message(&self) -> ReceivedMessage {
        let mut st = self.state.lock();
        st.receiving = true;
        while st.fifo.is_empty() && st.receiving {
            self.cond.wait(&mut st);
        }
        let received = if st.receiving {
            st.receiving = false;
            // the loop only exits with `receiving` still set when the FIFO
            // has an entry
            match st.fifo.pop_front() {
                Some(entry) => ReceivedMessage {
                    device: entry.device,
                    ticks: entry.ticks,
                    track: entry.track,
                    message: entry.msg,
                },
                None => interrupt_sentinel(),
            }
        } else {
            interrupt_sentinel()
        };
        drop(st);
        received
    }

    /// Clear all pending input and make a blocked `receive_message` return
    /// the interrupt sentinel.
    pub fn interrupt(&self) {
        let mut st = self.state.lock();
        st.fifo.clear();
        st.receiving = false;
        self.cond.notify_one();
    }

    /// Worker thread body; exits when the backend reports termination.
    pub fn run_worker(&self, output: &OutputEngine) {
        loop {
            match self.backend.device_wait() {
                WaitEvent::MidiIn(device) => {
                    // pull under the funnel lock, convert outside it: this
                    // lock and the scheduler's are never held together
                    let received = {
                        let mut st = self.state.lock();
                        st.handles
                            .get_mut(device)
                            .and_then(|slot| slot.as_mut())
                            .and_then(|handle| handle.recv())
                    };
                    if let Some((payload, stamp_ms)) = received {
                        let ticks = output.msecs_to_ticks(stamp_ms);
                        let mut bytes = payload.bytes;
                        if payload.is_sysex {
                            bytes.insert(0, messages::SYSEX_START);
                        }
                        self.enqueue(device as i32, ticks, 0, bytes);
                    }
                }
                WaitEvent::Terminated => break,
            }
        }
    }

    /// Close all devices and stop the worker's device wait.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            for slot in st.handles.iter_mut() {
                *slot = None;
            }
        }
        self.backend.terminate_device_wait();
    }
}

fn interrupt_sentinel() -> ReceivedMessage {
    ReceivedMessage {
        device: DEV_DUMMY,
        ticks: 0.0,
        track: 0,
        message: Vec::new(),
    }
}

// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Fallback backend without MIDI I/O.
//!
//! Used on platforms with no supported MIDI driver, and by tests. It
//! exposes zero devices; `device_wait` blocks until
//! `terminate_device_wait` is invoked. The virtual dummy and loopback
//! devices keep working on top of it, so the engine remains fully
//! exercisable without hardware.

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};

use super::{MidiBackend, MidiInput, MidiOutput, WaitEvent};

/// Backend with no devices.
pub struct GenericBackend {
    terminated: Mutex<bool>,
    cond: Condvar,
}

impl GenericBackend {
    pub fn new() -> Self {
        Self {
            terminated: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Default for GenericBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiBackend for GenericBackend {
    fn output_devices(&self) -> Vec<String> {
        Vec::new()
    }

    fn input_devices(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_output_device(&self) -> i32 {
        -1
    }

    fn default_input_device(&self) -> i32 {
        -1
    }

    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>> {
        bail!("no MIDI output devices available (device {})", device)
    }

    fn open_input(&self, device: usize) -> Result<Box<dyn MidiInput>> {
        bail!("no MIDI input devices available (device {})", device)
    }

    fn device_wait(&self) -> WaitEvent {
        let mut terminated = self.terminated.lock();
        while !*terminated {
            self.cond.wait(&mut terminated);
        }
        *terminated = false;
        WaitEvent::Terminated
    }

    fn terminate_device_wait(&self) {
        let mut terminated = self.terminated.lock();
        *terminated = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_devices() {
        let backend = GenericBackend::new();
        assert!(backend.output_devices().is_empty());
        assert!(backend.input_devices().is_empty());
        assert_eq!(backend.default_output_device(), -1);
        assert_eq!(backend.default_input_device(), -1);
        assert!(backend.open_output(0).is_err());
        assert!(backend.open_input(0).is_err());
    }

    #[test]
    fn test_device_wait_terminates() {
        use std::sync::Arc;

        let backend = Arc::new(GenericBackend::new());
        let waiter = Arc::clone(&backend);
        let handle = std::thread::spawn(move || waiter.device_wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        backend.terminate_device_wait();
        assert_eq!(handle.join().unwrap(), WaitEvent::Terminated);
    }
}

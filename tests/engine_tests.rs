// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Integration tests for the MIDI engine.
//!
//! These run the real scheduler and funnel threads against a recording
//! backend, so they exercise the full dispatch path without MIDI
//! hardware. Timing assertions use generous upper bounds to stay robust
//! on loaded machines; lower bounds are tight because the scheduler must
//! never dispatch early.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use midio::midi::{MidiBackend, MidiInput, MidiOutput, MidiPayload, WaitEvent};
use midio::{MidiEngine, ALL_TRACKS, DEV_DUMMY, DEV_LOOPBACK};

#[derive(Debug, Clone)]
struct SentMessage {
    device: usize,
    bytes: Vec<u8>,
    at: Instant,
}

/// Backend with virtual outputs that records everything sent to them.
struct RecordingBackend {
    outputs: usize,
    sent: Arc<Mutex<Vec<SentMessage>>>,
    wait: waitflag::WaitFlag,
}

/// Minimal flag + condvar used for the no-device wait.
mod waitflag {
    use std::sync::{Condvar, Mutex};

    pub struct WaitFlag {
        terminated: Mutex<bool>,
        cond: Condvar,
    }

    impl WaitFlag {
        pub fn new() -> Self {
            Self {
                terminated: Mutex::new(false),
                cond: Condvar::new(),
            }
        }

        pub fn wait(&self) {
            let mut terminated = self.terminated.lock().unwrap();
            while !*terminated {
                terminated = self.cond.wait(terminated).unwrap();
            }
            *terminated = false;
        }

        pub fn set(&self) {
            *self.terminated.lock().unwrap() = true;
            self.cond.notify_one();
        }
    }
}

impl RecordingBackend {
    fn new(outputs: usize) -> (Arc<Self>, Arc<Mutex<Vec<SentMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(Self {
            outputs,
            sent: Arc::clone(&sent),
            wait: waitflag::WaitFlag::new(),
        });
        (backend, sent)
    }
}

impl MidiBackend for RecordingBackend {
    fn output_devices(&self) -> Vec<String> {
        (0..self.outputs).map(|i| format!("Recorder {}", i)).collect()
    }

    fn input_devices(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_output_device(&self) -> i32 {
        if self.outputs > 0 {
            0
        } else {
            -1
        }
    }

    fn default_input_device(&self) -> i32 {
        -1
    }

    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>> {
        if device >= self.outputs {
            bail!("no such device");
        }
        Ok(Box::new(RecordingOutput {
            device,
            sent: Arc::clone(&self.sent),
        }))
    }

    fn open_input(&self, _device: usize) -> Result<Box<dyn MidiInput>> {
        bail!("recording backend has no inputs")
    }

    fn device_wait(&self) -> WaitEvent {
        self.wait.wait();
        WaitEvent::Terminated
    }

    fn terminate_device_wait(&self) {
        self.wait.set();
    }
}

struct RecordingOutput {
    device: usize,
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

impl MidiOutput for RecordingOutput {
    fn send(&mut self, message: &MidiPayload) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage {
            device: self.device,
            bytes: message.bytes.clone(),
            at: Instant::now(),
        });
        Ok(())
    }
}

fn engine_with_recorder(outputs: usize) -> (MidiEngine, Arc<Mutex<Vec<SentMessage>>>) {
    let (backend, sent) = RecordingBackend::new(outputs);
    let engine = MidiEngine::with_backend(backend).expect("engine start");
    (engine, sent)
}

fn recorded(sent: &Arc<Mutex<Vec<SentMessage>>>) -> Vec<SentMessage> {
    sent.lock().unwrap().clone()
}

#[test]
fn test_tempo_math_default_mapping() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    // at 125 bpm and 480 ticks per quarter, one tick is one millisecond
    assert!((engine.ticks_to_msecs(480.0) - 480.0).abs() < 1.0);

    let enqueue = Instant::now();
    let at = engine.current_time() + 480.0;
    engine.queue_message(0, at, 0, &[0x90, 60, 100]).unwrap();
    thread::sleep(Duration::from_millis(900));

    let sent = recorded(&sent);
    assert_eq!(sent.len(), 1);
    let elapsed = sent[0].at.duration_since(enqueue);
    assert!(elapsed >= Duration::from_millis(460), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1500), "{:?}", elapsed);

    engine.shutdown();
}

#[test]
fn test_fifo_within_equal_time() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    // identical (past) timestamps dispatch in enqueue order
    engine.queue_message(0, 100.0, 0, &[0x90, 60, 1]).unwrap();
    engine.queue_message(0, 100.0, 0, &[0x90, 62, 2]).unwrap();
    engine.queue_message(0, 100.0, 0, &[0x90, 64, 3]).unwrap();
    thread::sleep(Duration::from_millis(200));

    let notes: Vec<u8> = recorded(&sent).iter().map(|m| m.bytes[1]).collect();
    assert_eq!(notes, vec![60, 62, 64]);

    engine.shutdown();
}

#[test]
fn test_meta_tempo_change_mid_queue() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    let t0 = engine.current_time() + 50.0;
    // FF 51 with 1,000,000 us per quarter note = 60 bpm
    engine
        .queue_message(0, t0, 0, &[0xFF, 0x51, 0x0F, 0x42, 0x40])
        .unwrap();
    // a quarter note after the change: 1000 ms at 60 bpm
    engine
        .queue_message(0, t0 + 480.0, 0, &[0x90, 60, 100])
        .unwrap();
    let enqueue = Instant::now();
    thread::sleep(Duration::from_millis(1600));

    assert!((engine.current_tempo() - 60.0).abs() < 1e-6);
    let sent = recorded(&sent);
    assert_eq!(sent.len(), 1, "meta message must not be transmitted");
    let elapsed = sent[0].at.duration_since(enqueue);
    assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2500), "{:?}", elapsed);

    engine.shutdown();
}

#[test]
fn test_cancellation_silences_sounding_notes() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    let now = engine.current_time();
    engine
        .queue_message(0, now + 50.0, 1, &[0x91, 60, 100])
        .unwrap();
    engine
        .queue_message(0, now + 5000.0, 1, &[0x91, 60, 0])
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorded(&sent).len(), 1, "only the note-on so far");

    engine.cancel_messages(0, ALL_TRACKS);
    thread::sleep(Duration::from_millis(200));

    let messages: Vec<Vec<u8>> = recorded(&sent).iter().map(|m| m.bytes.clone()).collect();
    assert_eq!(messages, vec![vec![0x91, 60, 100], vec![0x91, 60, 0]]);

    // the queued note-off must never arrive
    thread::sleep(Duration::from_millis(300));
    engine.shutdown();
    assert_eq!(recorded(&sent).len(), 2);
}

#[test]
fn test_cancellation_releases_held_pedal() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    let now = engine.current_time();
    // sustain pedal down on channel 3
    engine
        .queue_message(0, now + 20.0, 2, &[0xB3, 64, 127])
        .unwrap();
    thread::sleep(Duration::from_millis(150));

    engine.cancel_messages(0, 2);
    thread::sleep(Duration::from_millis(150));

    let messages: Vec<Vec<u8>> = recorded(&sent).iter().map(|m| m.bytes.clone()).collect();
    assert_eq!(messages, vec![vec![0xB3, 64, 127], vec![0xB3, 64, 0]]);

    engine.shutdown();
}

#[test]
fn test_loopback_round_trip() {
    let (engine, _sent) = engine_with_recorder(0);

    engine
        .queue_message(DEV_LOOPBACK, 0.0, 7, &[0x90, 60, 100])
        .unwrap();
    let received = engine.recv_message();
    assert_eq!(received.device, DEV_LOOPBACK);
    assert_eq!(received.ticks, 0.0);
    assert_eq!(received.track, 7);
    assert_eq!(received.message, vec![0x90, 60, 100]);

    engine.shutdown();
}

#[test]
fn test_recv_ready() {
    let (engine, _sent) = engine_with_recorder(0);

    assert!(!engine.recv_ready());
    engine
        .queue_message(DEV_LOOPBACK, 0.0, 0, &[0xF8])
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(engine.recv_ready());
    let _ = engine.recv_message();
    assert!(!engine.recv_ready());

    engine.shutdown();
}

#[test]
fn test_interrupt_during_receive() {
    let (engine, _sent) = engine_with_recorder(0);
    let engine = Arc::new(engine);

    let interrupter = Arc::clone(&engine);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        interrupter.interrupt_recv_message();
    });

    let received = engine.recv_message();
    assert_eq!(received.device, DEV_DUMMY);
    assert_eq!(received.ticks, 0.0);
    assert!(received.message.is_empty());

    handle.join().unwrap();
    engine.shutdown();
}

#[test]
fn test_retrigger_sequence() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    // two overlapping note-ons for the same key, then their note-offs
    let t0 = engine.current_time() + 80.0;
    engine.queue_message(0, t0, 0, &[0x90, 60, 100]).unwrap();
    engine
        .queue_message(0, t0 + 120.0, 0, &[0x90, 60, 100])
        .unwrap();
    engine
        .queue_message(0, t0 + 240.0, 0, &[0x90, 60, 0])
        .unwrap();
    engine
        .queue_message(0, t0 + 360.0, 0, &[0x90, 60, 0])
        .unwrap();
    thread::sleep(Duration::from_millis(800));

    let messages: Vec<Vec<u8>> = recorded(&sent).iter().map(|m| m.bytes.clone()).collect();
    // the second note-on is preceded by a clean note-off; the first queued
    // note-off is absorbed because a retriggered note is still sounding
    assert_eq!(
        messages,
        vec![
            vec![0x90, 60, 100],
            vec![0x90, 60, 0],
            vec![0x90, 60, 100],
            vec![0x90, 60, 0],
        ]
    );

    engine.shutdown();
}

#[test]
fn test_retrigger_disabled_passes_overlaps_through() {
    let (engine, sent) = engine_with_recorder(1);
    // disable before opening so the implied stop has nothing to sweep
    engine.set_retrigger(false);
    thread::sleep(Duration::from_millis(100));
    engine.open_output_device(0).unwrap();

    let t0 = engine.current_time() + 50.0;
    engine.queue_message(0, t0, 0, &[0x90, 60, 100]).unwrap();
    engine
        .queue_message(0, t0 + 100.0, 0, &[0x90, 60, 100])
        .unwrap();
    engine
        .queue_message(0, t0 + 200.0, 0, &[0x90, 60, 0])
        .unwrap();
    thread::sleep(Duration::from_millis(500));

    let messages: Vec<Vec<u8>> = recorded(&sent).iter().map(|m| m.bytes.clone()).collect();
    assert_eq!(
        messages,
        vec![
            vec![0x90, 60, 100],
            vec![0x90, 60, 100],
            vec![0x90, 60, 0],
        ]
    );

    engine.shutdown();
}

#[test]
fn test_stop_all_totality() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    let now = engine.current_time();
    engine.queue_message(0, now + 20.0, 0, &[0x90, 60, 100]).unwrap();
    engine.queue_message(0, now + 20.0, 0, &[0x90, 64, 100]).unwrap();
    // note-offs far in the future; stop must preempt them
    engine.queue_message(0, now + 9000.0, 0, &[0x90, 60, 0]).unwrap();
    engine.queue_message(0, now + 9000.0, 0, &[0x90, 64, 0]).unwrap();
    thread::sleep(Duration::from_millis(200));

    engine.stop();
    thread::sleep(Duration::from_millis(200));

    let messages: Vec<Vec<u8>> = recorded(&sent).iter().map(|m| m.bytes.clone()).collect();
    // two note-ons, their explicit silencing note-offs, then the all-off
    // controller triple on each of the sixteen channels
    assert_eq!(messages.len(), 2 + 2 + 16 * 3);
    assert_eq!(messages[0], vec![0x90, 60, 100]);
    assert_eq!(messages[1], vec![0x90, 64, 100]);
    assert_eq!(messages[2], vec![0x90, 60, 0]);
    assert_eq!(messages[3], vec![0x90, 64, 0]);
    for ch in 0..16usize {
        assert_eq!(messages[4 + ch * 3], vec![0xB0 | ch as u8, 123, 0]);
        assert_eq!(messages[4 + ch * 3 + 1], vec![0xB0 | ch as u8, 64, 0]);
        assert_eq!(messages[4 + ch * 3 + 2], vec![0xB0 | ch as u8, 120, 0]);
    }

    // nothing queued survives the stop
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorded(&sent).len(), 2 + 2 + 16 * 3);

    engine.shutdown();
}

#[test]
fn test_tempo_scale_zero_pauses_dispatch() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    engine.set_tempo_scale(0.0);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.current_tempo_scale(), 0.0);

    let at = engine.current_time() + 10.0;
    engine.queue_message(0, at, 0, &[0x90, 60, 100]).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(recorded(&sent).is_empty(), "paused engine must not dispatch");

    engine.set_tempo_scale(1.0);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(recorded(&sent).len(), 1);

    engine.shutdown();
}

#[test]
fn test_time_is_monotonic_across_scale_changes() {
    let (engine, _sent) = engine_with_recorder(0);

    let mut last = engine.current_time();
    for scale in [2.0, 0.5, 0.0, 1.0] {
        engine.set_tempo_scale(scale);
        thread::sleep(Duration::from_millis(50));
        for _ in 0..10 {
            let now = engine.current_time();
            assert!(
                now >= last - 1e-6,
                "time went backwards: {} -> {}",
                last,
                now
            );
            last = now;
        }
    }

    engine.shutdown();
}

#[test]
fn test_time_round_trip() {
    let (engine, _sent) = engine_with_recorder(0);

    engine.set_tempo_scale(0.75);
    thread::sleep(Duration::from_millis(100));
    for ticks in [0.0, 480.0, 12345.0] {
        let back = engine.msecs_to_ticks(engine.ticks_to_msecs(ticks));
        assert!((back - ticks).abs() < 1e-6);
    }

    engine.shutdown();
}

#[test]
fn test_queue_message_validation() {
    let (engine, _sent) = engine_with_recorder(1);

    // device not opened
    assert!(engine.queue_message(0, 0.0, 0, &[0x90, 60, 100]).is_err());
    engine.open_output_device(0).unwrap();
    assert!(engine.queue_message(0, 0.0, 0, &[0x90, 60, 100]).is_ok());

    // malformed messages
    assert!(engine.queue_message(0, 0.0, 0, &[]).is_err());
    assert!(engine.queue_message(0, 0.0, 0, &[0x90, 60]).is_err());
    assert!(engine.queue_message(0, 0.0, 0, &[0x40, 60, 100]).is_err());

    // virtual devices need no open; the loopback takes any payload
    assert!(engine.queue_message(DEV_DUMMY, 0.0, 0, &[0x80, 60, 0]).is_ok());
    assert!(engine
        .queue_message(DEV_LOOPBACK, 0.0, 0, b"opaque".as_ref())
        .is_ok());

    engine.shutdown();
}

#[test]
fn test_virtual_devices_always_open() {
    let (engine, _sent) = engine_with_recorder(0);

    assert!(engine.open_output_device(DEV_DUMMY).is_ok());
    assert!(engine.open_output_device(DEV_LOOPBACK).is_ok());
    assert!(engine.is_opened_output_device(DEV_DUMMY));
    assert!(engine.is_opened_input_device(DEV_LOOPBACK));
    assert!(!engine.is_opened_output_device(0));
    assert!(engine.open_output_device(99).is_err());

    engine.shutdown();
}

#[test]
fn test_dummy_device_discards() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    engine
        .queue_message(DEV_DUMMY, 0.0, 0, &[0x90, 60, 100])
        .unwrap();
    thread::sleep(Duration::from_millis(150));
    assert!(recorded(&sent).is_empty());
    assert!(!engine.recv_ready());

    engine.shutdown();
}

#[test]
fn test_shutdown_drops_queued_messages() {
    let (engine, sent) = engine_with_recorder(1);
    engine.open_output_device(0).unwrap();

    let now = engine.current_time();
    engine
        .queue_message(0, now + 60000.0, 0, &[0x90, 60, 100])
        .unwrap();
    engine.shutdown();
    assert!(recorded(&sent).is_empty());
}

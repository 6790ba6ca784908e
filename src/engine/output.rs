// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Real-time MIDI output scheduler.
//!
//! A single worker thread owns a min-heap of time-stamped outgoing
//! messages and the authoritative tempo mapping. The worker sleeps until
//! the heap's earliest entry is due (or until signalled), drains every
//! control request posted by the host, and then dispatches all entries
//! that have come due. Equal-time entries leave in enqueue order thanks to
//! a per-engine insertion counter.
//!
//! The worker is the only writer of the tempo map and the only caller of
//! the backend's send routine; the host reads the map and posts requests
//! under the same mutex.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use super::input::InputFunnel;
use super::notemap::{NoteMap, PEDAL};
use crate::midi::{messages, MidiBackend, MidiOutput, MidiPayload, ALL_TRACKS, DEV_LOOPBACK};
use crate::timing::{Clock, TempoMap};

/// A queued outgoing message.
///
/// Heap order is earliest tick first; among equal ticks, lowest insertion
/// counter first (FIFO).
struct OutEntry {
    device: i32,
    ticks: f64,
    counter: u64,
    track: i32,
    msg: Vec<u8>,
}

impl Ord for OutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so that BinaryHeap pops the minimum
        other
            .ticks
            .total_cmp(&self.ticks)
            .then_with(|| other.counter.cmp(&self.counter))
    }
}

impl PartialOrd for OutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OutEntry {}

struct OutputState {
    heap: BinaryHeap<OutEntry>,
    next_counter: u64,
    tempo: TempoMap,
    retrigger: bool,
    retrigger_map: NoteMap,
    cancel_map: NoteMap,
    handles: Vec<Option<Box<dyn MidiOutput>>>,
    shutdown_request: bool,
    stop_request: bool,
    scale_request: Option<f64>,
    retrigger_request: Option<bool>,
    cancel_requests: Vec<(i32, i32)>,
}

/// The MIDI output engine shared between the host and the worker thread.
pub(crate) struct OutputEngine {
    clock: Arc<Clock>,
    backend: Arc<dyn MidiBackend>,
    state: Mutex<OutputState>,
    cond: Condvar,
}

impl OutputEngine {
    pub fn new(clock: Arc<Clock>, backend: Arc<dyn MidiBackend>) -> Self {
        Self {
            clock,
            backend,
            state: Mutex::new(OutputState {
                heap: BinaryHeap::new(),
                next_counter: 0,
                tempo: TempoMap::default(),
                retrigger: true,
                retrigger_map: NoteMap::new(),
                cancel_map: NoteMap::new(),
                handles: Vec::new(),
                shutdown_request: false,
                stop_request: false,
                scale_request: None,
                retrigger_request: None,
                cancel_requests: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Open an output device; opening an already-open or virtual device is
    /// a no-op.
    pub fn open_device(&self, device: i32) -> Result<()> {
        if device < 0 {
            return Ok(());
        }
        let index = device as usize;
        if index >= self.backend.output_devices().len() {
            bail!("MIDI output device {} not found", device);
        }
        let mut st = self.state.lock();
        if st.handles.len() <= index {
            st.handles.resize_with(index + 1, || None);
        }
        if st.handles[index].is_none() {
            let handle = self
                .backend
                .open_output(index)
                .with_context(|| format!("failed to open MIDI output device {}", device))?;
            st.handles[index] = Some(handle);
        }
        Ok(())
    }

    pub fn close_device(&self, device: i32) {
        if device < 0 {
            return;
        }
        let mut st = self.state.lock();
        if let Some(slot) = st.handles.get_mut(device as usize) {
            *slot = None;
        }
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

    /// Put a message in the output queue.
    ///
    /// The worker is signalled only when the earliest queued time changed,
    /// which keeps enqueue bursts from thrashing it with wake-ups.
    pub fn queue_message(&self, device: i32, ticks: f64, track: i32, msg: Vec<u8>) -> Result<()> {
        if msg.is_empty() {
            bail!("invalid MIDI (or meta) message");
        }
        let mut st = self.state.lock();
        if device >= 0 {
            let opened = st
                .handles
                .get(device as usize)
                .map_or(false, |slot| slot.is_some());
            if !opened {
                bail!("device {} is not opened", device);
            }
        }
        let counter = st.next_counter;
        st.next_counter += 1;
        let previous_top = st.heap.peek().map(|e| e.ticks);
        st.heap.push(OutEntry {
            device,
            ticks,
            counter,
            track,
            msg,
        });
        let top_changed = match previous_top {
            None => true,
            Some(t) => st.heap.peek().map_or(true, |e| e.ticks != t),
        };
        if top_changed {
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Request removal of every queued message for a device and track
    /// (or all tracks), silencing its sounding notes and held pedals.
    pub fn cancel_messages(&self, device: i32, track: i32) {
        let mut st = self.state.lock();
        st.cancel_requests.push((device, track));
        self.cond.notify_one();
    }

    /// Request a stop of everything currently sounding or queued.
    pub fn stop_all(&self) {
        let mut st = self.state.lock();
        st.stop_request = true;
        self.cond.notify_one();
    }

    /// Request a tempo-scale change, clamped to be non-negative.
    pub fn set_tempo_scale(&self, scale: f64) {
        let mut st = self.state.lock();
        st.scale_request = Some(scale.max(0.0));
        self.cond.notify_one();
    }

    /// Request a retrigger-mode change. This forces a stop first so that no
    /// note can straddle the policy switch.
    pub fn set_retrigger(&self, enable: bool) {
        let mut st = self.state.lock();
        st.stop_request = true;
        st.retrigger_request = Some(enable);
        self.cond.notify_one();
    }

    pub fn request_shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown_request = true;
        self.cond.notify_one();
    }

    pub fn ticks_to_msecs(&self, ticks: f64) -> f64 {
        self.state.lock().tempo.ticks_to_msecs(ticks)
    }

    pub fn msecs_to_ticks(&self, msecs: f64) -> f64 {
        self.state.lock().tempo.msecs_to_ticks(msecs)
    }

    pub fn current_tempo(&self) -> f64 {
        self.state.lock().tempo.bpm
    }

    pub fn tempo_scale(&self) -> f64 {
        self.state.lock().tempo.scale
    }

    /// The current time in ticks.
    pub fn current_time(&self) -> f64 {
        let now = self.clock.now_ms();
        self.state.lock().tempo.msecs_to_ticks(now)
    }

    /// Worker thread body. Returns when a shutdown request is seen, closing
    /// every open device as its last act.
    pub fn run_worker(&self, funnel: &InputFunnel) {
        raise_thread_priority();

        let mut st = self.state.lock();
        loop {
            // Sleep until the top of the heap is due. A zero or negative
            // effective tempo, an empty heap, or a +inf top parks the
            // worker until the next signal.
            let mut timed_out = false;
            let mut wake_ms = 0.0;
            let mut wake_ticks = 0.0;
            match st.heap.peek().map(|e| e.ticks) {
                None => self.cond.wait(&mut st),
                Some(ticks) => {
                    if st.tempo.effective_bpm() <= 0.0 || (ticks.is_infinite() && ticks > 0.0) {
                        self.cond.wait(&mut st);
                    } else {
                        wake_ticks = if ticks.is_infinite() { 0.0 } else { ticks };
                        wake_ms = st.tempo.ticks_to_msecs(wake_ticks);
                        let deadline = self.clock.instant_at_ms(wake_ms);
                        timed_out = self.cond.wait_until(&mut st, deadline).timed_out();
                    }
                }
            }

            if st.shutdown_request {
                break;
            }
            if let Some(scale) = st.scale_request.take() {
                let now = self.clock.now_ms();
                st.tempo.rescale(now, scale);
            }
            if st.stop_request {
                Self::do_stop_all(&mut st);
                st.stop_request = false;
                if let Some(enable) = st.retrigger_request.take() {
                    st.retrigger = enable;
                }
            }
            if !st.cancel_requests.is_empty() {
                let requests = std::mem::take(&mut st.cancel_requests);
                for (device, track) in requests {
                    Self::do_cancel(&mut st, device, track);
                }
            }
            if !timed_out {
                // a signal means the heap or the map may have changed;
                // recompute the wake time
                continue;
            }

            // Dispatch everything that has come due, compared in ticks
            // against the snapshot used for the wait.
            loop {
                match st.heap.peek() {
                    Some(e) if e.ticks <= wake_ticks => {}
                    _ => break,
                }
                let Some(entry) = st.heap.pop() else { break };
                self.dispatch(&mut st, entry, wake_ms, wake_ticks, funnel);
            }
        }

        for handle in st.handles.iter_mut() {
            *handle = None;
        }
    }

    fn dispatch(
        &self,
        st: &mut MutexGuard<'_, OutputState>,
        entry: OutEntry,
        wake_ms: f64,
        wake_ticks: f64,
        funnel: &InputFunnel,
    ) {
        if entry.device == DEV_LOOPBACK {
            // hand off outside the scheduler lock; the funnel lock and this
            // one are never held together
            let OutEntry {
                device,
                ticks,
                track,
                msg,
                ..
            } = entry;
            MutexGuard::unlocked(st, || funnel.enqueue(device, ticks, track, msg));
        } else if entry.msg[0] == messages::META {
            if entry.msg.len() >= 5 && entry.msg[1] == messages::META_TEMPO {
                let usecs_per_quarter = u32::from(entry.msg[2]) << 16
                    | u32::from(entry.msg[3]) << 8
                    | u32::from(entry.msg[4]);
                st.tempo
                    .change_tempo(wake_ms, wake_ticks, 6e7 / usecs_per_quarter as f64);
            }
            // other meta-events are discarded
        } else if entry.device >= 0 {
            let opened = st
                .handles
                .get(entry.device as usize)
                .map_or(false, |slot| slot.is_some());
            if opened {
                let payload = if entry.msg[0] == messages::SYSEX_START {
                    MidiPayload::sysex(entry.msg)
                } else {
                    MidiPayload::short(entry.msg)
                };
                Self::send_with_bookkeeping(st, entry.device, entry.track, &payload);
            }
        }
        // DEV_DUMMY drops silently
    }

    /// Send a channel message with retrigger processing and note/pedal
    /// bookkeeping.
    fn send_with_bookkeeping(st: &mut OutputState, device: i32, track: i32, payload: &MidiPayload) {
        let OutputState {
            handles,
            retrigger,
            retrigger_map,
            cancel_map,
            ..
        } = st;

        let mut suppress = false;
        if !payload.is_sysex {
            let status = payload.bytes[0];
            let ch = i32::from(status & 0x0F);
            match status & 0xF0 {
                messages::NOTE_OFF | messages::NOTE_ON => {
                    let note = i32::from(payload.bytes[1]);
                    let velocity = payload.bytes[2];
                    if status & 0xF0 == messages::NOTE_OFF || velocity == 0 {
                        // A positive remaining pile count means a
                        // retriggered note-on is still sounding; this off
                        // must not cut it short.
                        if *retrigger && retrigger_map.pop(device, 0, ch, note) >= 1 {
                            suppress = true;
                        }
                        cancel_map.pop(device, track, ch, note);
                    } else {
                        // Overlapping note-on: silence the sounding
                        // instance first so the device restarts the note.
                        if *retrigger && retrigger_map.push(device, 0, ch, note) >= 1 {
                            let mut off = payload.clone();
                            off.bytes[2] = 0;
                            raw_send(handles, device, &off);
                        }
                        cancel_map.push(device, track, ch, note);
                    }
                }
                messages::CONTROL_CHANGE => {
                    let controller = payload.bytes[1];
                    if controller == messages::C_ALL_NOTES_OFF
                        || controller == messages::C_ALL_SOUND_OFF
                    {
                        if *retrigger {
                            retrigger_map.clear_channel(device, 0, ch);
                        }
                        // The cancel map is kept: some synthesizers ignore
                        // all-notes-off, and cancellation must still be able
                        // to emit explicit note-offs.
                    } else if controller == messages::C_SUSTAIN {
                        if payload.bytes[2] == 0 {
                            cancel_map.pop(device, track, ch, PEDAL);
                        } else {
                            cancel_map.set(device, track, ch, PEDAL, 1);
                        }
                    }
                }
                _ => {}
            }
        }

        if !suppress {
            raw_send(handles, device, payload);
        }
    }

    /// Silence everything: explicit note-offs and sustain-offs for the
    /// bookkept notes and pedals, the all-off controller triple on every
    /// channel of every open device, then clear the queue and both maps.
    fn do_stop_all(st: &mut OutputState) {
        let OutputState {
            heap,
            retrigger,
            retrigger_map,
            cancel_map,
            handles,
            ..
        } = st;

        for device in 0..handles.len() {
            if handles[device].is_none() {
                continue;
            }
            let d = device as i32;
            cancel_map.clear_and_call(d, ALL_TRACKS, |dev, _track, ch, note, count| {
                cancel_note(handles, retrigger_map, *retrigger, dev, ch, note, count);
            });
            for ch in 0..16u8 {
                for controller in [
                    messages::C_ALL_NOTES_OFF,
                    messages::C_SUSTAIN,
                    messages::C_ALL_SOUND_OFF,
                ] {
                    let msg = MidiPayload::short(vec![messages::CONTROL_CHANGE | ch, controller, 0]);
                    raw_send(handles, d, &msg);
                }
            }
        }

        heap.clear();
        retrigger_map.clear();
        cancel_map.clear();
    }

    /// Remove queued entries matching a cancellation request and silence
    /// the matching sounding notes and pedals.
    fn do_cancel(st: &mut OutputState, device: i32, track: i32) {
        st.heap
            .retain(|e| !(e.device == device && (track == ALL_TRACKS || e.track == track)));

        let opened = device >= 0
            && st
                .handles
                .get(device as usize)
                .map_or(false, |slot| slot.is_some());
        if opened {
            let OutputState {
                retrigger,
                retrigger_map,
                cancel_map,
                handles,
                ..
            } = st;
            cancel_map.clear_and_call(device, track, |dev, _track, ch, note, count| {
                cancel_note(handles, retrigger_map, *retrigger, dev, ch, note, count);
            });
        }
    }
}

/// Emit the silencing messages for one removed note-map entry: sustain-off
/// for a pedal key, `count` explicit note-offs for a note key.
fn cancel_note(
    handles: &mut [Option<Box<dyn MidiOutput>>],
    retrigger_map: &mut NoteMap,
    retrigger: bool,
    device: i32,
    ch: i32,
    note: i32,
    count: i32,
) {
    if note == PEDAL {
        let msg = MidiPayload::short(vec![
            messages::CONTROL_CHANGE | ch as u8,
            messages::C_SUSTAIN,
            0,
        ]);
        raw_send(handles, device, &msg);
    } else {
        for _ in 0..count {
            let msg = MidiPayload::short(vec![messages::NOTE_ON | ch as u8, note as u8, 0]);
            raw_send(handles, device, &msg);
            // keep the retrigger pile in step so a note-off still out in
            // the queue will not double-cancel
            if retrigger {
                retrigger_map.pop(device, 0, ch, note);
            }
        }
    }
}

/// Best-effort send: failures are logged and playback continues.
fn raw_send(handles: &mut [Option<Box<dyn MidiOutput>>], device: i32, payload: &MidiPayload) {
    if let Some(handle) = handles
        .get_mut(device as usize)
        .and_then(|slot| slot.as_mut())
    {
        if let Err(err) = handle.send(payload) {
            warn!("MIDI send to device {} failed: {:#}", device, err);
        }
    }
}

#[cfg(unix)]
fn raise_thread_priority() {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_RR);
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) != 0 {
            warn!("could not raise the output worker's scheduling priority");
        }
    }
}

#[cfg(windows)]
fn raise_thread_priority() {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe {
        if SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) == 0 {
            warn!("could not raise the output worker's scheduling priority");
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn raise_thread_priority() {}

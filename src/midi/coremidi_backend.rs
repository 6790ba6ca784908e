// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Core MIDI backend for macOS.
//!
//! Outputs send packet lists directly to their destination. Inputs run a
//! driver-thread callback that reassembles sysex runs byte by byte and
//! posts complete messages into a per-device queue guarded by one shared
//! mutex; `device_wait` blocks on the matching condition variable.
//!
//! Core MIDI stamps packets in the host-time domain. Timestamps are
//! converted to engine milliseconds through the mach timebase; packets
//! dated before the engine started (the IAC bus uses 0 for "immediate")
//! are rewritten to the current time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use coremidi::{Client, Destination, Destinations, InputPort, OutputPort, PacketBuffer, Source, Sources};
use parking_lot::{Condvar, Mutex};

use super::{short_message_len, messages, MidiBackend, MidiInput, MidiOutput, MidiPayload, WaitEvent};
use crate::timing::Clock;

struct InputQueues {
    queues: BTreeMap<usize, VecDeque<(MidiPayload, f64)>>,
    terminated: bool,
}

struct InputShared {
    state: Mutex<InputQueues>,
    cond: Condvar,
}

/// macOS Core MIDI backend.
pub struct CoreMidiBackend {
    shared: Arc<InputShared>,
    /// Host time when the engine clock was zeroed.
    host_base: u64,
    timebase_numer: u32,
    timebase_denom: u32,
    base_ms: f64,
}

impl CoreMidiBackend {
    pub fn new(clock: Arc<Clock>) -> Result<Self> {
        let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
        unsafe {
            libc::mach_timebase_info(&mut info);
        }
        let host_base = unsafe { libc::mach_absolute_time() };
        let base_ms = clock.now_ms();

        Ok(Self {
            shared: Arc::new(InputShared {
                state: Mutex::new(InputQueues {
                    queues: BTreeMap::new(),
                    terminated: false,
                }),
                cond: Condvar::new(),
            }),
            host_base,
            timebase_numer: info.numer.max(1),
            timebase_denom: info.denom.max(1),
            base_ms,
        })
    }

    fn host_time_to_ms(&self, host_time: u64) -> f64 {
        let elapsed = host_time.saturating_sub(self.host_base) as u128;
        let nanos = elapsed * self.timebase_numer as u128 / self.timebase_denom as u128;
        self.base_ms + nanos as f64 / 1e6
    }
}

impl MidiBackend for CoreMidiBackend {
    fn output_devices(&self) -> Vec<String> {
        Destinations
            .into_iter()
            .enumerate()
            .map(|(i, dest)| dest.display_name().unwrap_or_else(|| format!("Unknown {}", i)))
            .collect()
    }

    fn input_devices(&self) -> Vec<String> {
        Sources
            .into_iter()
            .enumerate()
            .map(|(i, src)| src.display_name().unwrap_or_else(|| format!("Unknown {}", i)))
            .collect()
    }

    fn default_output_device(&self) -> i32 {
        if Destinations::count() > 0 {
            0
        } else {
            -1
        }
    }

    fn default_input_device(&self) -> i32 {
        if Sources::count() > 0 {
            0
        } else {
            -1
        }
    }

    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>> {
        let client = Client::new("midio")
            .map_err(|e| anyhow!("failed to create MIDI client: {:?}", e))?;
        let output_port = client
            .output_port("midio output")
            .map_err(|e| anyhow!("failed to create output port: {:?}", e))?;
        let destination = Destination::from_index(device)
            .ok_or_else(|| anyhow!("MIDI destination {} not found", device))?;

        Ok(Box::new(CoreMidiOutput {
            _client: client,
            output_port,
            destination,
        }))
    }

    fn open_input(&self, device: usize) -> Result<Box<dyn MidiInput>> {
        let client = Client::new("midio")
            .map_err(|e| anyhow!("failed to create MIDI client: {:?}", e))?;
        let source = Source::from_index(device)
            .ok_or_else(|| anyhow!("MIDI source {} not found", device))?;

        let shared = Arc::clone(&self.shared);
        let assembler = Mutex::new(SysexAssembler::default());
        let host_base = self.host_base;
        let numer = self.timebase_numer;
        let denom = self.timebase_denom;
        let base_ms = self.base_ms;

        let port = client
            .input_port("midio input", move |packet_list| {
                let mut assembler = assembler.lock();
                for packet in packet_list.iter() {
                    assembler.feed(packet.data(), packet.timestamp(), |payload, stamp| {
                        // past-dated packets (IAC "immediate") get the
                        // current time instead
                        let stamp = if stamp < host_base {
                            unsafe { libc::mach_absolute_time() }
                        } else {
                            stamp
                        };
                        let nanos = (stamp.saturating_sub(host_base) as u128) * numer as u128
                            / denom as u128;
                        let stamp_ms = base_ms + nanos as f64 / 1e6;

                        let mut st = shared.state.lock();
                        if let Some(queue) = st.queues.get_mut(&device) {
                            queue.push_back((payload, stamp_ms));
                            shared.cond.notify_one();
                        }
                    });
                }
            })
            .map_err(|e| anyhow!("failed to create input port: {:?}", e))?;

        port.connect_source(&source)
            .map_err(|e| anyhow!("failed to connect to source: {:?}", e))?;

        self.shared
            .state
            .lock()
            .queues
            .insert(device, VecDeque::new());

        Ok(Box::new(CoreMidiInput {
            _client: client,
            port,
            source,
            shared: Arc::clone(&self.shared),
            device,
        }))
    }

    fn device_wait(&self) -> WaitEvent {
        let mut st = self.shared.state.lock();
        loop {
            if let Some((&device, _)) = st.queues.iter().find(|(_, q)| !q.is_empty()) {
                return WaitEvent::MidiIn(device);
            }
            if st.terminated {
                st.terminated = false;
                return WaitEvent::Terminated;
            }
            self.shared.cond.wait(&mut st);
        }
    }

    fn terminate_device_wait(&self) {
        let mut st = self.shared.state.lock();
        st.terminated = true;
        self.shared.cond.notify_one();
    }
}

/// Core MIDI output handle.
struct CoreMidiOutput {
    _client: Client,
    output_port: OutputPort,
    destination: Destination,
}

impl MidiOutput for CoreMidiOutput {
    fn send(&mut self, message: &MidiPayload) -> Result<()> {
        // timestamp 0 sends immediately
        let packet_buffer = PacketBuffer::new(0, &message.bytes);
        self.output_port
            .send(&self.destination, &packet_buffer)
            .map_err(|e| anyhow!("failed to send MIDI message: {:?}", e))?;
        Ok(())
    }
}

impl Drop for CoreMidiOutput {
    fn drop(&mut self) {
        // silence the device before the port goes away
        for ch in 0..16u8 {
            for controller in [messages::C_ALL_NOTES_OFF, messages::C_SUSTAIN] {
                let packet =
                    PacketBuffer::new(0, &[messages::CONTROL_CHANGE | ch, controller, 0]);
                let _ = self.output_port.send(&self.destination, &packet);
            }
        }
    }
}

/// Core MIDI input handle.
struct CoreMidiInput {
    _client: Client,
    port: InputPort,
    source: Source,
    shared: Arc<InputShared>,
    device: usize,
}

impl MidiInput for CoreMidiInput {
    fn recv(&mut self) -> Option<(MidiPayload, f64)> {
        let mut st = self.shared.state.lock();
        st.queues.get_mut(&self.device)?.pop_front()
    }
}

impl Drop for CoreMidiInput {
    fn drop(&mut self) {
        let _ = self.port.disconnect_source(&self.source);
        self.shared.state.lock().queues.remove(&self.device);
    }
}

/// Stateful byte-level parser for one input stream.
///
/// Collects `0xF0..0xF7` runs across packet boundaries (without the start
/// byte; the funnel restores it), passes short messages through, and skips
/// real-time bytes embedded in a sysex run. A status byte other than
/// `0xF7` terminates a run abnormally and is reprocessed.
#[derive(Default)]
struct SysexAssembler {
    buf: Option<Vec<u8>>,
    stamp: u64,
}

impl SysexAssembler {
    fn feed(&mut self, data: &[u8], packet_ts: u64, mut emit: impl FnMut(MidiPayload, u64)) {
        let mut k = 0;
        while k < data.len() {
            if let Some(buf) = self.buf.as_mut() {
                let byte = data[k];
                k += 1;
                if byte < 0x80 {
                    buf.push(byte);
                } else if byte < 0xF8 {
                    if byte != messages::SYSEX_END {
                        k -= 1; // abnormal termination
                    }
                    let mut bytes = self.buf.take().unwrap_or_default();
                    bytes.push(messages::SYSEX_END);
                    emit(MidiPayload::sysex(bytes), self.stamp);
                }
                // real-time bytes inside a sysex run are ignored
            } else {
                let status = data[k];
                k += 1;
                if status == messages::SYSEX_START {
                    self.stamp = packet_ts;
                    self.buf = Some(Vec::new());
                } else if (0x80..0xF0).contains(&status) {
                    let len = short_message_len(status);
                    let mut bytes = vec![status];
                    while bytes.len() < len && k < data.len() {
                        bytes.push(data[k]);
                        k += 1;
                    }
                    emit(MidiPayload::short(bytes), packet_ts);
                } else {
                    // other system messages are ignored
                    match status {
                        0xF2 => k += 2,
                        0xF1 | 0xF3 => k += 1,
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut SysexAssembler, data: &[u8]) -> Vec<MidiPayload> {
        let mut out = Vec::new();
        assembler.feed(data, 0, |p, _| out.push(p));
        out
    }

    #[test]
    fn test_short_messages_pass_through() {
        let mut asm = SysexAssembler::default();
        let out = collect(&mut asm, &[0x90, 60, 100, 0x80, 60, 0]);
        assert_eq!(
            out,
            vec![
                MidiPayload::short(vec![0x90, 60, 100]),
                MidiPayload::short(vec![0x80, 60, 0]),
            ]
        );
    }

    #[test]
    fn test_sysex_across_packets() {
        let mut asm = SysexAssembler::default();
        assert!(collect(&mut asm, &[0xF0, 0x7E, 0x7F]).is_empty());
        let out = collect(&mut asm, &[0x09, 0xF7]);
        // delivered without the start byte, like the drivers do
        assert_eq!(out, vec![MidiPayload::sysex(vec![0x7E, 0x7F, 0x09, 0xF7])]);
    }

    #[test]
    fn test_abnormal_sysex_termination_reprocesses_status() {
        let mut asm = SysexAssembler::default();
        let out = collect(&mut asm, &[0xF0, 0x01, 0x90, 60, 100]);
        assert_eq!(
            out,
            vec![
                MidiPayload::sysex(vec![0x01, 0xF7]),
                MidiPayload::short(vec![0x90, 60, 100]),
            ]
        );
    }

    #[test]
    fn test_realtime_inside_sysex_is_skipped() {
        let mut asm = SysexAssembler::default();
        let out = collect(&mut asm, &[0xF0, 0x01, 0xF8, 0x02, 0xF7]);
        assert_eq!(out, vec![MidiPayload::sysex(vec![0x01, 0x02, 0xF7])]);
    }
}

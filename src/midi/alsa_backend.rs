// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! ALSA sequencer backend for Linux.
//!
//! One sequencer client serves the whole engine. Output devices are
//! reached through per-open application ports subscribed to the
//! destination port; input devices are subscribed to a single shared
//! application port through a started queue, so inbound events carry
//! real-time timestamps. `device_wait` polls the sequencer's descriptors
//! and stashes the decoded event for the following `recv` call; a
//! self-addressed event serves as the termination kick.

use std::ffi::CString;
use std::sync::Arc;

use alsa::seq::{
    Addr, ClientIter, EvCtrl, EvNote, Event, EventType, PortCap, PortIter, PortSubscribe,
    PortType, Seq,
};
use alsa::{Direction, PollDescriptors};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::warn;

use super::{messages, MidiBackend, MidiInput, MidiOutput, MidiPayload, WaitEvent};
use crate::timing::Clock;

struct DevInfo {
    addr: Addr,
    name: String,
}

struct PendingEvent {
    device: usize,
    payload: MidiPayload,
    stamp_ms: f64,
}

enum Decoded {
    Terminated,
    Pending(PendingEvent),
}

struct AlsaShared {
    seq: Option<Mutex<Seq>>,
    client_id: i32,
    input_port: i32,
    queue: i32,
    outputs: Vec<DevInfo>,
    inputs: Vec<DevInfo>,
    /// Engine-clock reading when the timestamp queue was started.
    base_ms: f64,
    clock: Arc<Clock>,
    pending: Mutex<Option<PendingEvent>>,
}

/// Linux ALSA sequencer backend.
pub struct AlsaBackend {
    shared: Arc<AlsaShared>,
}

impl AlsaBackend {
    /// Open the sequencer. When the sound system is unavailable the
    /// backend degrades to zero devices instead of failing, so the engine
    /// (and its virtual devices) keeps working.
    pub fn new(clock: Arc<Clock>) -> Result<Self> {
        let shared = match Self::open_sequencer(&clock) {
            Ok(shared) => shared,
            Err(err) => {
                warn!("could not open the ALSA sequencer: {:#}", err);
                AlsaShared {
                    seq: None,
                    client_id: -1,
                    input_port: -1,
                    queue: -1,
                    outputs: Vec::new(),
                    inputs: Vec::new(),
                    base_ms: 0.0,
                    clock,
                    pending: Mutex::new(None),
                }
            }
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    fn open_sequencer(clock: &Arc<Clock>) -> Result<AlsaShared> {
        let seq = Seq::open(None, None, false).context("snd_seq_open failed")?;
        seq.set_client_name(&CString::new("midio")?)?;
        let client_id = seq.client_id()?;

        let (inputs, outputs) = enumerate_devices(&seq, client_id);

        // queue driving the real-time timestamps of subscribed inputs;
        // base_ms anchors it to the engine clock
        let queue = seq.alloc_queue().context("could not allocate a queue")?;
        seq.control_queue(queue, EventType::Start, 0, None)?;
        seq.drain_output()?;
        let base_ms = clock.now_ms();

        let input_port = seq
            .create_simple_port(
                &CString::new("midio input")?,
                PortCap::WRITE,
                PortType::MIDI_GENERIC | PortType::APPLICATION,
            )
            .context("could not create the input port")?;

        Ok(AlsaShared {
            seq: Some(Mutex::new(seq)),
            client_id,
            input_port,
            queue,
            outputs,
            inputs,
            base_ms,
            clock: Arc::clone(clock),
            pending: Mutex::new(None),
        })
    }

    fn decode_event(&self, ev: &Event) -> Option<Decoded> {
        let source = ev.get_source();
        if source.client == self.shared.client_id {
            return Some(Decoded::Terminated);
        }
        let device = self
            .shared
            .inputs
            .iter()
            .position(|d| d.addr.client == source.client && d.addr.port == source.port);
        let Some(device) = device else {
            warn!("event received from an unregistered MIDI-input source");
            return None;
        };

        let payload = decode_payload(ev)?;
        let stamp_ms = match ev.get_time() {
            Some(time) => self.shared.base_ms + time.as_secs_f64() * 1e3,
            None => self.shared.clock.now_ms(),
        };
        Some(Decoded::Pending(PendingEvent {
            device,
            payload,
            stamp_ms,
        }))
    }
}

impl MidiBackend for AlsaBackend {
    fn output_devices(&self) -> Vec<String> {
        self.shared.outputs.iter().map(|d| d.name.clone()).collect()
    }

    fn input_devices(&self) -> Vec<String> {
        self.shared.inputs.iter().map(|d| d.name.clone()).collect()
    }

    fn default_output_device(&self) -> i32 {
        default_device(&self.shared.outputs)
    }

    fn default_input_device(&self) -> i32 {
        default_device(&self.shared.inputs)
    }

    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>> {
        let shared = &self.shared;
        let seq_mutex = shared.seq.as_ref().ok_or_else(|| anyhow!("no sequencer"))?;
        let dest = shared
            .outputs
            .get(device)
            .map(|d| d.addr)
            .ok_or_else(|| anyhow!("no such output device: {}", device))?;

        let port = {
            let seq = seq_mutex.lock();
            seq.create_simple_port(
                &CString::new("midio output")?,
                PortCap::READ | PortCap::SUBS_READ,
                PortType::MIDI_GENERIC | PortType::APPLICATION,
            )?
        };

        let subs = PortSubscribe::empty()?;
        subs.set_sender(Addr {
            client: shared.client_id,
            port,
        });
        subs.set_dest(dest);
        let result = {
            let seq = seq_mutex.lock();
            seq.subscribe_port(&subs)
        };
        if let Err(err) = result {
            let seq = seq_mutex.lock();
            let _ = seq.delete_port(port);
            return Err(err).context("could not subscribe the output port");
        }

        Ok(Box::new(AlsaOutput {
            shared: Arc::clone(shared),
            port,
            dest,
        }))
    }

    fn open_input(&self, device: usize) -> Result<Box<dyn MidiInput>> {
        let shared = &self.shared;
        let seq_mutex = shared.seq.as_ref().ok_or_else(|| anyhow!("no sequencer"))?;
        let sender = shared
            .inputs
            .get(device)
            .map(|d| d.addr)
            .ok_or_else(|| anyhow!("no such input device: {}", device))?;

        let subs = PortSubscribe::empty()?;
        subs.set_sender(sender);
        subs.set_dest(Addr {
            client: shared.client_id,
            port: shared.input_port,
        });
        // timestamp through the started queue, in real time
        subs.set_queue(shared.queue);
        subs.set_time_update(true);
        subs.set_time_real(true);
        {
            let seq = seq_mutex.lock();
            seq.subscribe_port(&subs)
                .context("could not subscribe the input port")?;
        }

        Ok(Box::new(AlsaInput {
            shared: Arc::clone(shared),
            device,
            sender,
        }))
    }

    fn device_wait(&self) -> WaitEvent {
        let Some(seq_mutex) = self.shared.seq.as_ref() else {
            return WaitEvent::Terminated;
        };

        // a bounded number of retries guards against a receive storm of
        // undecodable events (buffer overrun posture)
        for _ in 0..100 {
            let mut ready = false;
            while !ready {
                // check the user-space buffer under the lock, poll the
                // descriptors without it
                let fds = {
                    let seq = seq_mutex.lock();
                    match seq.input().event_input_pending(false) {
                        Ok(n) if n > 0 => {
                            ready = true;
                            continue;
                        }
                        Ok(_) | Err(_) => {}
                    }
                    match (&*seq, Some(Direction::Capture)).get() {
                        Ok(fds) => fds,
                        Err(err) => {
                            warn!("could not get sequencer poll descriptors: {}", err);
                            return WaitEvent::Terminated;
                        }
                    }
                };
                let mut fds = fds;
                if let Ok(n) = alsa::poll::poll(&mut fds, -1) {
                    ready = n > 0;
                }
            }

            let decoded = {
                let seq = seq_mutex.lock();
                let mut input = seq.input();
                match input.event_input() {
                    Ok(ev) => self.decode_event(&ev),
                    Err(err) => {
                        warn!("failed to receive from a MIDI input device: {}", err);
                        None
                    }
                }
            };
            match decoded {
                Some(Decoded::Terminated) => return WaitEvent::Terminated,
                Some(Decoded::Pending(pending)) => {
                    let device = pending.device;
                    *self.shared.pending.lock() = Some(pending);
                    return WaitEvent::MidiIn(device);
                }
                None => continue,
            }
        }
        WaitEvent::Terminated
    }

    fn terminate_device_wait(&self) {
        let Some(seq_mutex) = self.shared.seq.as_ref() else {
            return;
        };
        // any self-addressed event works as the kick; device_wait checks
        // the source client before looking at the type
        let mut ev = Event::new(
            EventType::Controller,
            &EvCtrl {
                channel: 0,
                param: 0,
                value: 0,
            },
        );
        ev.set_source(self.shared.input_port);
        ev.set_dest(Addr {
            client: self.shared.client_id,
            port: self.shared.input_port,
        });
        ev.set_direct();
        let seq = seq_mutex.lock();
        if seq.event_output(&mut ev).and(seq.drain_output()).is_err() {
            warn!("could not kick the sequencer out of its wait");
        }
    }
}

struct AlsaOutput {
    shared: Arc<AlsaShared>,
    port: i32,
    dest: Addr,
}

impl MidiOutput for AlsaOutput {
    fn send(&mut self, message: &MidiPayload) -> Result<()> {
        let Some(seq_mutex) = self.shared.seq.as_ref() else {
            return Ok(());
        };
        let mut ev = if message.is_sysex {
            Event::new_ext(EventType::Sysex, &message.bytes[..])
        } else {
            let status = message.bytes[0];
            let channel = status & 0x0F;
            match status & 0xF0 {
                messages::NOTE_OFF => Event::new(
                    EventType::Noteoff,
                    &EvNote {
                        channel,
                        note: message.bytes[1],
                        velocity: message.bytes[2],
                        off_velocity: 0,
                        duration: 0,
                    },
                ),
                messages::NOTE_ON => Event::new(
                    EventType::Noteon,
                    &EvNote {
                        channel,
                        note: message.bytes[1],
                        velocity: message.bytes[2],
                        off_velocity: 0,
                        duration: 0,
                    },
                ),
                messages::POLY_AFTERTOUCH => Event::new(
                    EventType::Keypress,
                    &EvNote {
                        channel,
                        note: message.bytes[1],
                        velocity: message.bytes[2],
                        off_velocity: 0,
                        duration: 0,
                    },
                ),
                messages::CONTROL_CHANGE => Event::new(
                    EventType::Controller,
                    &EvCtrl {
                        channel,
                        param: u32::from(message.bytes[1]),
                        value: i32::from(message.bytes[2]),
                    },
                ),
                messages::PROGRAM_CHANGE => Event::new(
                    EventType::Pgmchange,
                    &EvCtrl {
                        channel,
                        param: 0,
                        value: i32::from(message.bytes[1]),
                    },
                ),
                messages::CHANNEL_AFTERTOUCH => Event::new(
                    EventType::Chanpress,
                    &EvCtrl {
                        channel,
                        param: 0,
                        value: i32::from(message.bytes[1]),
                    },
                ),
                messages::PITCH_BEND => Event::new(
                    EventType::Pitchbend,
                    &EvCtrl {
                        channel,
                        param: 0,
                        value: i32::from(message.bytes[1]) + (i32::from(message.bytes[2]) << 7)
                            - 8192,
                    },
                ),
                // system messages are not routable through the sequencer
                _ => return Ok(()),
            }
        };
        ev.set_source(self.port);
        ev.set_subs();
        ev.set_direct();

        let seq = seq_mutex.lock();
        seq.event_output(&mut ev)?;
        seq.drain_output()?;
        Ok(())
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        if let Some(seq_mutex) = self.shared.seq.as_ref() {
            let seq = seq_mutex.lock();
            let _ = seq.unsubscribe_port(
                Addr {
                    client: self.shared.client_id,
                    port: self.port,
                },
                self.dest,
            );
            let _ = seq.delete_port(self.port);
        }
    }
}

struct AlsaInput {
    shared: Arc<AlsaShared>,
    device: usize,
    sender: Addr,
}

impl MidiInput for AlsaInput {
    fn recv(&mut self) -> Option<(MidiPayload, f64)> {
        let mut pending = self.shared.pending.lock();
        if pending.as_ref().map(|p| p.device) == Some(self.device) {
            let event = pending.take()?;
            Some((event.payload, event.stamp_ms))
        } else {
            None
        }
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        if let Some(seq_mutex) = self.shared.seq.as_ref() {
            let seq = seq_mutex.lock();
            let _ = seq.unsubscribe_port(
                self.sender,
                Addr {
                    client: self.shared.client_id,
                    port: self.shared.input_port,
                },
            );
        }
    }
}

fn enumerate_devices(seq: &Seq, client_id: i32) -> (Vec<DevInfo>, Vec<DevInfo>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for client in ClientIter::new(seq) {
        let cid = client.get_client();
        if cid == client_id {
            continue;
        }
        let client_name = client.get_name().unwrap_or_default().to_string();
        for port in PortIter::new(seq, cid) {
            let caps = port.get_capability();
            if !port.get_type().contains(PortType::MIDI_GENERIC)
                || !caps.intersects(PortCap::SUBS_READ | PortCap::SUBS_WRITE)
            {
                continue;
            }
            let addr = port.addr();
            let port_name = port.get_name().unwrap_or_default().to_string();
            // supply the client name only when the port name does not
            // already carry it
            let name = if port_name.starts_with(&client_name) {
                format!("{}:{} {}", addr.client, addr.port, port_name)
            } else {
                format!("{}:{} ({}) {}", addr.client, addr.port, client_name, port_name)
            };
            if caps.contains(PortCap::SUBS_READ) {
                inputs.push(DevInfo {
                    addr,
                    name: name.clone(),
                });
            }
            if caps.contains(PortCap::SUBS_WRITE) {
                outputs.push(DevInfo { addr, name });
            }
        }
    }

    (inputs, outputs)
}

fn default_device(devices: &[DevInfo]) -> i32 {
    devices
        .iter()
        .position(|d| !d.name.contains("Through Port"))
        .map_or(-1, |i| i as i32)
}

fn decode_payload(ev: &Event) -> Option<MidiPayload> {
    let bytes = match ev.get_type() {
        EventType::Noteoff => {
            let data: EvNote = ev.get_data()?;
            vec![
                messages::NOTE_OFF | (data.channel & 0x0F),
                data.note,
                data.velocity,
            ]
        }
        EventType::Noteon => {
            let data: EvNote = ev.get_data()?;
            vec![
                messages::NOTE_ON | (data.channel & 0x0F),
                data.note,
                data.velocity,
            ]
        }
        EventType::Keypress => {
            let data: EvNote = ev.get_data()?;
            vec![
                messages::POLY_AFTERTOUCH | (data.channel & 0x0F),
                data.note,
                data.velocity,
            ]
        }
        EventType::Controller => {
            let data: EvCtrl = ev.get_data()?;
            vec![
                messages::CONTROL_CHANGE | (data.channel & 0x0F),
                data.param as u8,
                data.value as u8,
            ]
        }
        EventType::Pgmchange => {
            let data: EvCtrl = ev.get_data()?;
            vec![
                messages::PROGRAM_CHANGE | (data.channel & 0x0F),
                data.value as u8,
            ]
        }
        EventType::Chanpress => {
            let data: EvCtrl = ev.get_data()?;
            vec![
                messages::CHANNEL_AFTERTOUCH | (data.channel & 0x0F),
                data.value as u8,
            ]
        }
        EventType::Pitchbend => {
            let data: EvCtrl = ev.get_data()?;
            let value = (data.value + 8192).clamp(0, 16383);
            vec![
                messages::PITCH_BEND | (data.channel & 0x0F),
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ]
        }
        EventType::Sysex => {
            let data = ev.get_ext()?;
            let mut bytes = data.to_vec();
            // the funnel restores the start byte on delivery
            if bytes.first() == Some(&messages::SYSEX_START) {
                bytes.remove(0);
            }
            return Some(MidiPayload::sysex(bytes));
        }
        _ => return None,
    };
    Some(MidiPayload::short(bytes))
}

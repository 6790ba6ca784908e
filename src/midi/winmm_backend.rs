// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Windows Multimedia (MME) backend.
//!
//! Device 0 is the MIDI mapper; the driver's own devices follow from 1.
//! Short messages go out through `midiOutShortMsg`; a system-exclusive
//! message borrows one driver-owned buffer at a time, so each send first
//! waits for the previous sysex transmission to complete. Inputs keep a
//! ring of pre-posted sysex receive buffers that are recycled after each
//! message is consumed; buffers returned empty by `midiInReset` during
//! close are quarantined in a trash list and freed once the device is
//! closed.
//!
//! Driver callbacks run on driver-owned threads and only post into the
//! shared, lock-guarded queues; `device_wait` blocks on the matching
//! condition variable.

#![allow(clippy::missing_safety_doc)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use windows_sys::Win32::Media::Audio::{
    midiInAddBuffer, midiInClose, midiInGetDevCapsW, midiInGetNumDevs, midiInOpen,
    midiInPrepareHeader, midiInReset, midiInStart, midiInStop, midiInUnprepareHeader,
    midiOutClose, midiOutGetDevCapsW, midiOutGetNumDevs, midiOutLongMsg, midiOutOpen,
    midiOutPrepareHeader, midiOutReset, midiOutShortMsg, midiOutUnprepareHeader, HMIDIIN,
    HMIDIOUT, MIDIHDR, MIDIINCAPSW, MIDIOUTCAPSW,
};
use windows_sys::Win32::Media::{timeBeginPeriod, timeEndPeriod};

use super::{messages, MidiBackend, MidiInput, MidiOutput, MidiPayload, WaitEvent};
use crate::timing::Clock;

const MMSYSERR_NOERROR: u32 = 0;
const CALLBACK_FUNCTION: u32 = 0x0003_0000;
const CALLBACK_NULL: u32 = 0;
const MIDI_MAPPER: u32 = u32::MAX;

// driver-to-callback message codes (mmsystem.h)
const MIM_DATA: u32 = 0x3C3;
const MIM_LONGDATA: u32 = 0x3C4;
const MOM_DONE: u32 = 0x3C9;

const SYSEX_BUFFER_LEN: usize = 256;
const NUM_SYSEX_BUFFERS: usize = 16;

/// Raw `MIDIHDR` pointer that may travel between threads; the protocol in
/// this module guarantees a single owner at any time.
struct HeaderPtr(*mut MIDIHDR);
unsafe impl Send for HeaderPtr {}

enum InElem {
    Short { packed: u32, stamp: u32 },
    Long { header: HeaderPtr, stamp: u32 },
}

struct InQueues {
    queues: BTreeMap<usize, VecDeque<InElem>>,
    /// Buffers returned by `midiInReset` after close started.
    trash: Vec<HeaderPtr>,
    terminated: bool,
}

struct InputShared {
    state: Mutex<InQueues>,
    cond: Condvar,
}

/// Windows MME backend.
pub struct WinMmBackend {
    shared: Arc<InputShared>,
    clock: Arc<Clock>,
}

impl WinMmBackend {
    pub fn new(clock: Arc<Clock>) -> Result<Self> {
        unsafe {
            timeBeginPeriod(1);
        }
        Ok(Self {
            shared: Arc::new(InputShared {
                state: Mutex::new(InQueues {
                    queues: BTreeMap::new(),
                    trash: Vec::new(),
                    terminated: false,
                }),
                cond: Condvar::new(),
            }),
            clock,
        })
    }
}

impl MidiBackend for WinMmBackend {
    fn output_devices(&self) -> Vec<String> {
        // device 0 is the MIDI mapper, the driver's devices follow
        let count = unsafe { midiOutGetNumDevs() } as usize + 1;
        (0..count).map(output_device_name).collect()
    }

    fn input_devices(&self) -> Vec<String> {
        let count = unsafe { midiInGetNumDevs() } as usize;
        (0..count).map(input_device_name).collect()
    }

    fn default_output_device(&self) -> i32 {
        0 // the MIDI mapper
    }

    fn default_input_device(&self) -> i32 {
        if unsafe { midiInGetNumDevs() } > 0 {
            0
        } else {
            -1
        }
    }

    fn open_output(&self, device: usize) -> Result<Box<dyn MidiOutput>> {
        if device > unsafe { midiOutGetNumDevs() } as usize {
            return Err(anyhow!("MIDI output device {} not found", device));
        }
        let driver_id = if device == 0 {
            MIDI_MAPPER
        } else {
            device as u32 - 1
        };

        let done = Arc::new(SysexDone {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });
        let ctx = Box::into_raw(Box::new(WinOutCtx {
            done: Arc::clone(&done),
        }));

        let mut hmo: HMIDIOUT = std::ptr::null_mut();
        let result = unsafe {
            midiOutOpen(
                &mut hmo,
                driver_id,
                midi_out_callback as usize,
                ctx as usize,
                CALLBACK_FUNCTION,
            )
        };
        if result != MMSYSERR_NOERROR {
            unsafe {
                drop(Box::from_raw(ctx));
            }
            return Err(anyhow!(
                "could not open MIDI output device {} (err={})",
                device,
                result
            ));
        }

        Ok(Box::new(WinMmOutput {
            hmo,
            ctx,
            done,
            pending: None,
        }))
    }

    fn open_input(&self, device: usize) -> Result<Box<dyn MidiInput>> {
        if device >= unsafe { midiInGetNumDevs() } as usize {
            return Err(anyhow!("MIDI input device {} not found", device));
        }
        let driver_id = device as u32;

        // Some drivers queue messages arriving before the open; an
        // open/start/reset/close cycle flushes them.
        unsafe {
            let mut flush: HMIDIIN = std::ptr::null_mut();
            if midiInOpen(&mut flush, driver_id, 0, 0, CALLBACK_NULL) == MMSYSERR_NOERROR {
                midiInStart(flush);
                midiInReset(flush);
                midiInClose(flush);
            }
        }

        let ctx = Box::into_raw(Box::new(WinInCtx {
            shared: Arc::clone(&self.shared),
            device,
        }));
        let mut hmi: HMIDIIN = std::ptr::null_mut();
        let result = unsafe {
            midiInOpen(
                &mut hmi,
                driver_id,
                midi_in_callback as usize,
                ctx as usize,
                CALLBACK_FUNCTION,
            )
        };
        if result != MMSYSERR_NOERROR {
            unsafe {
                drop(Box::from_raw(ctx));
            }
            return Err(anyhow!(
                "could not open MIDI input device {} (err={})",
                device,
                result
            ));
        }

        // pre-post the sysex receive buffers
        let mut buffers = Vec::with_capacity(NUM_SYSEX_BUFFERS);
        for _ in 0..NUM_SYSEX_BUFFERS {
            let header = unsafe { alloc_sysex_header() };
            unsafe {
                midiInPrepareHeader(hmi, header, std::mem::size_of::<MIDIHDR>() as u32);
                midiInAddBuffer(hmi, header, std::mem::size_of::<MIDIHDR>() as u32);
            }
            buffers.push(HeaderPtr(header));
        }

        self.shared
            .state
            .lock()
            .queues
            .insert(device, VecDeque::new());
        let start_ms = self.clock.now_ms();
        unsafe {
            midiInStart(hmi);
        }

        Ok(Box::new(WinMmInput {
            hmi,
            ctx,
            shared: Arc::clone(&self.shared),
            device,
            start_ms,
            _buffers: buffers,
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
        {
            let mut st = self.shared.state.lock();
            st.terminated = true;
        }
        self.shared.cond.notify_one();
        unsafe {
            timeEndPeriod(1);
        }
    }
}

struct SysexDone {
    done: Mutex<bool>,
    cond: Condvar,
}

struct WinOutCtx {
    done: Arc<SysexDone>,
}

extern "system" fn midi_out_callback(
    _hmo: HMIDIOUT,
    wmsg: u32,
    dwinstance: usize,
    _dwparam1: usize,
    _dwparam2: usize,
) {
    if wmsg == MOM_DONE && dwinstance != 0 {
        let ctx = unsafe { &*(dwinstance as *const WinOutCtx) };
        let mut done = ctx.done.done.lock();
        *done = true;
        ctx.done.cond.notify_one();
    }
}

struct PendingSysex {
    header: *mut MIDIHDR,
    data: Box<[u8]>,
}

struct WinMmOutput {
    hmo: HMIDIOUT,
    ctx: *mut WinOutCtx,
    done: Arc<SysexDone>,
    pending: Option<PendingSysex>,
}

unsafe impl Send for WinMmOutput {}

impl WinMmOutput {
    /// Wait until the previously-queued sysex message is transmitted and
    /// release its buffer.
    fn wait_for_sysex_done(&mut self) {
        if let Some(pending) = self.pending.take() {
            {
                let mut done = self.done.done.lock();
                while !*done {
                    self.done.cond.wait(&mut done);
                }
            }
            unsafe {
                midiOutUnprepareHeader(
                    self.hmo,
                    pending.header,
                    std::mem::size_of::<MIDIHDR>() as u32,
                );
                drop(Box::from_raw(pending.header));
            }
            drop(pending.data);
        }
    }
}

impl MidiOutput for WinMmOutput {
    fn send(&mut self, message: &MidiPayload) -> Result<()> {
        self.wait_for_sysex_done();

        if !message.is_sysex {
            let mut packed = u32::from(message.bytes[0]);
            if let Some(&b1) = message.bytes.get(1) {
                packed |= u32::from(b1) << 8;
            }
            if let Some(&b2) = message.bytes.get(2) {
                packed |= u32::from(b2) << 16;
            }
            let result = unsafe { midiOutShortMsg(self.hmo, packed) };
            if result != MMSYSERR_NOERROR {
                return Err(anyhow!("midiOutShortMsg failed (err={})", result));
            }
        } else {
            let mut data: Box<[u8]> = message.bytes.clone().into_boxed_slice();
            let header = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<MIDIHDR>() }));
            unsafe {
                (*header).lpData = data.as_mut_ptr();
                (*header).dwBufferLength = data.len() as u32;
                (*header).dwFlags = 0;
                midiOutPrepareHeader(self.hmo, header, std::mem::size_of::<MIDIHDR>() as u32);
            }
            *self.done.done.lock() = false;
            let result =
                unsafe { midiOutLongMsg(self.hmo, header, std::mem::size_of::<MIDIHDR>() as u32) };
            if result != MMSYSERR_NOERROR {
                unsafe {
                    midiOutUnprepareHeader(
                        self.hmo,
                        header,
                        std::mem::size_of::<MIDIHDR>() as u32,
                    );
                    drop(Box::from_raw(header));
                }
                return Err(anyhow!("midiOutLongMsg failed (err={})", result));
            }
            self.pending = Some(PendingSysex { header, data });
        }
        Ok(())
    }
}

impl Drop for WinMmOutput {
    fn drop(&mut self) {
        unsafe {
            midiOutReset(self.hmo);
        }
        self.wait_for_sysex_done();
        unsafe {
            midiOutClose(self.hmo);
            drop(Box::from_raw(self.ctx));
        }
    }
}

struct WinInCtx {
    shared: Arc<InputShared>,
    device: usize,
}

extern "system" fn midi_in_callback(
    _hmi: HMIDIIN,
    wmsg: u32,
    dwinstance: usize,
    dwparam1: usize,
    dwparam2: usize,
) {
    if dwinstance == 0 {
        return;
    }
    let ctx = unsafe { &*(dwinstance as *const WinInCtx) };
    match wmsg {
        MIM_DATA => {
            // system messages are discarded
            if dwparam1 & 0xFF < 0xF0 {
                let mut st = ctx.shared.state.lock();
                if let Some(queue) = st.queues.get_mut(&ctx.device) {
                    queue.push_back(InElem::Short {
                        packed: dwparam1 as u32,
                        stamp: dwparam2 as u32,
                    });
                    ctx.shared.cond.notify_one();
                }
            }
        }
        MIM_LONGDATA => {
            let header = dwparam1 as *mut MIDIHDR;
            let mut st = ctx.shared.state.lock();
            if unsafe { (*header).dwBytesRecorded } == 0 {
                // buffer thrown back by midiInReset during close
                st.trash.push(HeaderPtr(header));
            } else if let Some(queue) = st.queues.get_mut(&ctx.device) {
                queue.push_back(InElem::Long {
                    header: HeaderPtr(header),
                    stamp: dwparam2 as u32,
                });
                ctx.shared.cond.notify_one();
            } else {
                st.trash.push(HeaderPtr(header));
            }
        }
        _ => {}
    }
}

struct WinMmInput {
    hmi: HMIDIIN,
    ctx: *mut WinInCtx,
    shared: Arc<InputShared>,
    device: usize,
    /// Engine-clock reading when `midiInStart` ran; driver timestamps are
    /// relative to it.
    start_ms: f64,
    _buffers: Vec<HeaderPtr>,
}

unsafe impl Send for WinMmInput {}

impl MidiInput for WinMmInput {
    fn recv(&mut self) -> Option<(MidiPayload, f64)> {
        let elem = {
            let mut st = self.shared.state.lock();
            st.queues.get_mut(&self.device)?.pop_front()?
        };
        match elem {
            InElem::Short { packed, stamp } => {
                let bytes = vec![
                    (packed & 0xFF) as u8,
                    ((packed >> 8) & 0xFF) as u8,
                    ((packed >> 16) & 0xFF) as u8,
                ];
                Some((
                    MidiPayload::short(bytes),
                    self.start_ms + f64::from(stamp),
                ))
            }
            InElem::Long { header, stamp } => {
                let header = header.0;
                let mut bytes = unsafe {
                    let len = (*header).dwBytesRecorded as usize;
                    std::slice::from_raw_parts((*header).lpData, len).to_vec()
                };
                // the funnel restores the start byte on delivery
                if bytes.first() == Some(&messages::SYSEX_START) {
                    bytes.remove(0);
                }
                unsafe {
                    // recycle the buffer; without the dwBytesRecorded
                    // reset, new messages are appended to the old one
                    midiInUnprepareHeader(
                        self.hmi,
                        header,
                        std::mem::size_of::<MIDIHDR>() as u32,
                    );
                    (*header).dwFlags = 0;
                    (*header).dwBytesRecorded = 0;
                    midiInPrepareHeader(self.hmi, header, std::mem::size_of::<MIDIHDR>() as u32);
                    midiInAddBuffer(self.hmi, header, std::mem::size_of::<MIDIHDR>() as u32);
                }
                Some((
                    MidiPayload::sysex(bytes),
                    self.start_ms + f64::from(stamp),
                ))
            }
        }
    }
}

impl Drop for WinMmInput {
    fn drop(&mut self) {
        unsafe {
            midiInStop(self.hmi);
            // returns every still-posted sysex buffer through the callback
            // with zero bytes recorded, landing it in the trash
            midiInReset(self.hmi);
        }
        {
            let mut st = self.shared.state.lock();
            for HeaderPtr(header) in st.trash.drain(..) {
                unsafe {
                    midiInUnprepareHeader(
                        self.hmi,
                        header,
                        std::mem::size_of::<MIDIHDR>() as u32,
                    );
                    free_sysex_header(header);
                }
            }
            if let Some(queue) = st.queues.remove(&self.device) {
                for elem in queue {
                    if let InElem::Long { header, .. } = elem {
                        unsafe {
                            midiInUnprepareHeader(
                                self.hmi,
                                header.0,
                                std::mem::size_of::<MIDIHDR>() as u32,
                            );
                            free_sysex_header(header.0);
                        }
                    }
                }
            }
        }
        unsafe {
            midiInClose(self.hmi);
            drop(Box::from_raw(self.ctx));
        }
    }
}

/// Allocate a `MIDIHDR` with an attached receive buffer.
unsafe fn alloc_sysex_header() -> *mut MIDIHDR {
    let data = Box::into_raw(vec![0u8; SYSEX_BUFFER_LEN].into_boxed_slice());
    let header = Box::into_raw(Box::new(std::mem::zeroed::<MIDIHDR>()));
    (*header).lpData = data as *mut u8;
    (*header).dwBufferLength = SYSEX_BUFFER_LEN as u32;
    (*header).dwBytesRecorded = 0;
    (*header).dwFlags = 0;
    header
}

/// Free a header allocated by [`alloc_sysex_header`].
unsafe fn free_sysex_header(header: *mut MIDIHDR) {
    let data = std::slice::from_raw_parts_mut((*header).lpData, SYSEX_BUFFER_LEN) as *mut [u8];
    drop(Box::from_raw(data));
    drop(Box::from_raw(header));
}

fn output_device_name(device: usize) -> String {
    let driver_id = if device == 0 {
        MIDI_MAPPER as usize
    } else {
        device - 1
    };
    let mut caps: MIDIOUTCAPSW = unsafe { std::mem::zeroed() };
    let result = unsafe {
        midiOutGetDevCapsW(
            driver_id,
            &mut caps,
            std::mem::size_of::<MIDIOUTCAPSW>() as u32,
        )
    };
    if result == MMSYSERR_NOERROR {
        utf16_name(&caps.szPname)
    } else {
        "*Invalid device*".to_string()
    }
}

fn input_device_name(device: usize) -> String {
    let mut caps: MIDIINCAPSW = unsafe { std::mem::zeroed() };
    let result = unsafe {
        midiInGetDevCapsW(
            device,
            &mut caps,
            std::mem::size_of::<MIDIINCAPSW>() as u32,
        )
    };
    if result == MMSYSERR_NOERROR {
        utf16_name(&caps.szPname)
    } else {
        "*Invalid device*".to_string()
    }
}

fn utf16_name(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

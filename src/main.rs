// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use midio::config::EngineConfig;
use midio::{MidiEngine, ALL_TRACKS, DEV_DUMMY, TICKS_PER_QUARTER};

fn print_usage() {
    println!("MIDIO - Real-time MIDI I/O Engine");
    println!();
    println!("Usage: midio [--config FILE] COMMAND");
    println!();
    println!("Commands:");
    println!("  --list-midi         List available MIDI output devices");
    println!("  --list-sources      List available MIDI input devices");
    println!("  --test-note [N]     Send a test note to output device N");
    println!("  --demo [N]          Play a scheduled demo run on output device N");
    println!("  --monitor [N]       Monitor MIDI input from device N");
    println!("  --help              Show this help message");
    println!();
    println!("Without N, the configured device (or the system default) is used.");
}

fn print_devices(names: &[String], default: i32, kind: &str) {
    if names.is_empty() {
        println!("No MIDI {} devices found.", kind);
        return;
    }
    println!("Available MIDI {} devices:", kind);
    for (i, name) in names.iter().enumerate() {
        let marker = if i as i32 == default { " (default)" } else { "" };
        println!("  {}: {}{}", i, name, marker);
    }
}

fn send_test_note(engine: &MidiEngine, device: i32) -> Result<()> {
    println!("Opening MIDI output device {}...", device);
    engine.open_output_device(device)?;

    let channel = 0u8; // MIDI channel 1
    let note = 60u8; // Middle C
    let velocity = 100u8;

    println!("Sending test note (Middle C, velocity {})...", velocity);
    let now = engine.current_time();
    engine.queue_message(device, now, 0, &[0x90 | channel, note, velocity])?;
    engine.queue_message(
        device,
        now + f64::from(TICKS_PER_QUARTER),
        0,
        &[0x90 | channel, note, 0],
    )?;

    // at the default tempo one quarter note is 480 ms
    thread::sleep(Duration::from_millis(700));
    println!("Test complete!");
    Ok(())
}

fn play_demo(engine: &Arc<MidiEngine>, device: i32) -> Result<()> {
    println!("Opening MIDI output device {}...", device);
    engine.open_output_device(device)?;

    // Ctrl-C during playback silences everything before exiting
    let stopper = Arc::clone(engine);
    midio::signal::set_sigint_action(move || stopper.stop());

    println!("Playing a two-octave run with a tempo change halfway...");
    let start = engine.current_time();
    let quarter = f64::from(TICKS_PER_QUARTER);
    let scale = [0, 2, 4, 5, 7, 9, 11, 12, 14, 16, 17, 19, 21, 23, 24];
    for (i, degree) in scale.iter().enumerate() {
        let at = start + i as f64 * quarter / 2.0;
        let note = 60 + *degree as u8;
        engine.queue_message(device, at, 0, &[0x90, note, 96])?;
        engine.queue_message(device, at + quarter / 2.0, 0, &[0x90, note, 0])?;
    }
    // drop to 60 bpm for the second octave: FF 51 with 1,000,000 us/quarter
    let halfway = start + 7.0 * quarter / 2.0;
    engine.queue_message(DEV_DUMMY, halfway, 0, &[0xFF, 0x51, 0x0F, 0x42, 0x40])?;

    while engine.current_time() < start + (scale.len() as f64 + 1.0) * quarter / 2.0 {
        thread::sleep(Duration::from_millis(50));
    }
    engine.cancel_messages(device, ALL_TRACKS);
    midio::signal::clear_sigint_action();
    println!("Demo complete!");
    Ok(())
}

fn monitor_input(engine: &MidiEngine, device: i32) -> Result<()> {
    println!("Opening MIDI input device {}...", device);
    engine.open_input_device(device)?;

    println!("Monitoring MIDI input (press Ctrl+C to stop)...");
    println!();
    loop {
        let received = engine.recv_message();
        if received.device == DEV_DUMMY && received.message.is_empty() {
            // interrupted
            break;
        }
        println!(
            "dev {} @ {:10.1} ticks: {:02X?}",
            received.device, received.ticks, received.message
        );
    }
    println!();
    println!("Monitor complete!");
    Ok(())
}

/// Pick a device from the command line, falling back to the configured
/// name and then to the system default.
fn pick_device(
    args: &[String],
    index: usize,
    names: &[String],
    preferred: Option<&String>,
    default: i32,
) -> Result<i32> {
    if let Some(arg) = args.get(index) {
        return arg
            .parse()
            .map_err(|_| anyhow!("Invalid device number: {}", arg));
    }
    if let Some(wanted) = preferred {
        return EngineConfig::resolve_device(names, wanted)
            .ok_or_else(|| anyhow!("No MIDI device matching '{}' found", wanted));
    }
    if default < 0 {
        return Err(anyhow!("No MIDI devices available"));
    }
    Ok(default)
}

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().collect();

    let mut config = EngineConfig::default();
    if args.len() >= 3 && args[1] == "--config" {
        config = EngineConfig::load(&args[2])?;
        args.drain(1..3);
    }

    let filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| "midio=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if args.len() < 2 {
        println!("MIDIO - Real-time MIDI I/O Engine");
        println!("Run with --help for usage information");
        return Ok(());
    }

    let engine = Arc::new(MidiEngine::new()?);
    engine.set_tempo_scale(config.tempo_scale);
    engine.set_retrigger(config.retrigger);

    match args[1].as_str() {
        "--list-midi" => {
            print_devices(
                &engine.output_devices(),
                engine.default_output_device(),
                "output",
            );
        }
        "--list-sources" => {
            print_devices(
                &engine.input_devices(),
                engine.default_input_device(),
                "input",
            );
        }
        "--test-note" => {
            let device = pick_device(
                &args,
                2,
                &engine.output_devices(),
                config.output_device.as_ref(),
                engine.default_output_device(),
            )?;
            send_test_note(&engine, device)?;
        }
        "--demo" => {
            let device = pick_device(
                &args,
                2,
                &engine.output_devices(),
                config.output_device.as_ref(),
                engine.default_output_device(),
            )?;
            play_demo(&engine, device)?;
        }
        "--monitor" => {
            let device = pick_device(
                &args,
                2,
                &engine.input_devices(),
                config.input_device.as_ref(),
                engine.default_input_device(),
            )?;
            monitor_input(&engine, device)?;
        }
        "--help" | "-h" => {
            print_usage();
        }
        other => {
            eprintln!("Unknown option: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }

    engine.stop();
    engine.shutdown();
    Ok(())
}

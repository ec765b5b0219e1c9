//! bandplayer - a remote-controllable MIDI band player.
//!
//! Plays a Standard MIDI File through MIDI output ports in sync with a
//! transport clock. In remote-control mode (`-x`) the player is driven
//! over a pipe-based text protocol: commands on stdin, feedback tokens
//! on a named pipe, with documents shipped inline over the command
//! stream.

mod clock;
mod config;
mod driver;
mod edit;
mod error;
mod loader;
mod marker;
mod midi;
mod playback;
mod remote;
mod sched;
mod song;
mod sync;

use std::io::{self, BufReader};
use std::sync::Arc;
use std::{env, fs, process, thread};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{InternalClock, Transport};
use crate::config::PlayerConfig;
use crate::driver::DriverSettings;
use crate::error::{Result, EX_OK, EX_USAGE};
use crate::midi::MidiOut;
use crate::playback::Player;

const PROGRAM_NAME: &str = "bandplayer";

/// Documents with more instrument tracks than this fall back to the
/// global port only.
const MAX_TRACK_PORTS: usize = 128;

struct Args {
    autoconnect: Option<String>,
    debug: bool,
    start_stopped: bool,
    quiet: bool,
    rate_limit: Option<f64>,
    single_output: bool,
    use_transport: bool,
    remote_control: bool,
    /// SMF path, or the feedback pipe path in remote-control mode.
    file_name: String,
}

fn usage() -> ! {
    eprintln!(
        "usage: {} [-dnqstx] [-a <output port>] [-r <rate>] <file name | feedback pipe>",
        PROGRAM_NAME
    );
    process::exit(EX_USAGE);
}

fn parse_args() -> Args {
    let mut args = Args {
        autoconnect: None,
        debug: false,
        start_stopped: false,
        quiet: false,
        rate_limit: None,
        single_output: false,
        use_transport: true,
        remote_control: false,
        file_name: String::new(),
    };

    let mut file_name = None;
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-a" => args.autoconnect = Some(iter.next().unwrap_or_else(|| usage())),
            "-d" => args.debug = true,
            "-n" => args.start_stopped = true,
            "-q" => args.quiet = true,
            "-r" => {
                let value = iter.next().unwrap_or_else(|| usage());
                match value.parse::<f64>() {
                    Ok(rate) if rate > 0.0 => args.rate_limit = Some(rate),
                    _ => {
                        eprintln!("{}: invalid rate limit specified", PROGRAM_NAME);
                        process::exit(EX_USAGE);
                    }
                }
            }
            "-s" => args.single_output = true,
            "-t" => args.use_transport = false,
            "-x" => args.remote_control = true,
            "-V" => {
                println!("{} {}", PROGRAM_NAME, env!("CARGO_PKG_VERSION"));
                process::exit(EX_OK);
            }
            _ if arg.starts_with('-') => usage(),
            _ => file_name = Some(arg),
        }
    }

    match file_name {
        Some(name) => args.file_name = name,
        None => {
            eprintln!("{}: no file name given", PROGRAM_NAME);
            usage();
        }
    }
    args
}

fn init_logging(args: &Args) {
    let level = if args.debug {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let args = parse_args();
    init_logging(&args);
    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(e.exit_code());
    }
}

fn run(args: Args) -> Result<()> {
    let config = PlayerConfig::load(PlayerConfig::default_path())?;
    let rate_limit = args.rate_limit.unwrap_or(config.rate_limit);
    let mut single_output = args.single_output;

    let (notice_tx, notice_rx) = crossbeam::channel::unbounded();
    let player = Player::new(config.sample_rate, notice_tx);
    player.set_follow_transport(args.use_transport);
    player.set_intro_bars(config.intro_bars);

    let file_song = if args.remote_control {
        None
    } else {
        let song = loader::load_file(&args.file_name)?;
        if song.instrument_tracks() > MAX_TRACK_PORTS {
            warn!(
                "number of tracks ({}) exceeds maximum for per-track output; \
                 implying single-output mode",
                song.instrument_tracks()
            );
            single_output = true;
        }
        Some(song)
    };

    let port_match = args
        .autoconnect
        .as_deref()
        .or(config.output_device.as_deref());
    let mut outputs = vec![MidiOut::connect(PROGRAM_NAME, port_match)?];
    info!("MIDI output connected to {}", outputs[0].port_name);

    if !single_output {
        if let Some(song) = &file_song {
            #[cfg(unix)]
            for track in 1..=song.instrument_tracks() {
                let name = format!("track_{}_midi_out", track);
                outputs.push(MidiOut::virtual_port(PROGRAM_NAME, &name)?);
            }
            #[cfg(not(unix))]
            if song.instrument_tracks() > 0 {
                warn!("per-track ports are not supported on this platform; using the global port");
            }
        }
        // Remote-control mode registers no per-track ports; the global
        // port carries all traffic.
    }

    let clock = Arc::new(InternalClock::new());

    if let Some(song) = file_song {
        player.install(song, None);
    }

    let settings = DriverSettings {
        sample_rate: config.sample_rate,
        buffer_frames: config.buffer_frames,
        rate_limit,
        single_output,
    };
    let driver = driver::spawn(player.clone(), clock.clone(), outputs, settings);

    if args.use_transport && !args.start_stopped {
        clock.locate(0);
        clock.start();
    }
    if !args.use_transport {
        player.set_anchor(clock.frame_time() as i64);
    }

    if args.remote_control {
        let feedback = fs::OpenOptions::new()
            .write(true)
            .open(&args.file_name)?;
        debug!("feedback pipe: '{}'", args.file_name);
        {
            let player = player.clone();
            thread::spawn(move || remote::forward_notices(&player, &notice_rx, feedback));
        }

        let input = BufReader::new(io::stdin());
        let mut session = remote::Session::new(input, player.clone(), clock.clone());
        let result = session.run();

        // FINISH or a fatal protocol error: run the shutdown drain so
        // no notes are left hanging, then let the driver wind down.
        player.request_abort();
        let _ = driver.join();
        result
    } else {
        // No feedback stream in file mode; deferred warnings still
        // need draining onto the log.
        {
            let player = player.clone();
            thread::spawn(move || remote::forward_notices(&player, &notice_rx, io::sink()));
        }

        // File mode: the driver runs the song to its end (internal
        // clock) or indefinitely under the transport.
        let _ = driver.join();
        Ok(())
    }
}

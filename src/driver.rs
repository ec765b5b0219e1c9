//! Clock driver.
//!
//! Stands in for the audio server's callback thread: wakes once per
//! buffer, settles pending transport relocations, runs the scheduler,
//! forwards the scheduled bytes to the MIDI outputs, publishes the
//! timebase, and advances the clock. Exits once the scheduler reports
//! that the shutdown drain has completed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::clock::{BufferSink, InternalClock, Transport, TransportState};
use crate::midi::MidiOut;
use crate::playback::Player;
use crate::sched::{CycleOutcome, Scheduler};
use crate::sync::{self, BbtPos, Timebase};

/// Warn when the wait between cycles exceeds this.
const MAX_TIME_BETWEEN_CYCLES: Duration = Duration::from_millis(100);
/// Warn when one cycle's processing exceeds this.
const MAX_PROCESSING_TIME: Duration = Duration::from_millis(10);

/// Per-cycle byte capacity of each output buffer.
const SINK_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub rate_limit: f64,
    pub single_output: bool,
}

/// Spawn the cycle thread. `outputs[0]` is the global port; any further
/// entries receive the per-track copies.
pub fn spawn(
    player: Player,
    clock: Arc<InternalClock>,
    outputs: Vec<MidiOut>,
    settings: DriverSettings,
) -> JoinHandle<()> {
    thread::spawn(move || run(player, clock, outputs, settings))
}

fn run(player: Player, clock: Arc<InternalClock>, mut outputs: Vec<MidiOut>, s: DriverSettings) {
    let mut scheduler = Scheduler::new(s.sample_rate, s.rate_limit, s.single_output);
    let mut sinks: Vec<BufferSink> = (0..outputs.len())
        .map(|_| BufferSink::new(SINK_CAPACITY))
        .collect();
    let mut timebase = Timebase::new();
    let mut pos = BbtPos {
        frame_rate: s.sample_rate,
        ..Default::default()
    };

    let period = Duration::from_secs_f64(f64::from(s.buffer_frames) / f64::from(s.sample_rate));
    let mut next_wake = Instant::now();
    let mut last_cycle: Option<Instant> = None;
    let mut was_rolling = false;

    loop {
        next_wake += period;
        let now = Instant::now();
        if next_wake > now {
            thread::sleep(next_wake - now);
        }

        let cycle_start = Instant::now();
        if let Some(previous) = last_cycle {
            if cycle_start.duration_since(previous) > MAX_TIME_BETWEEN_CYCLES {
                warn!("had to wait too long between cycles; scheduling problem?");
            }
        }
        last_cycle = Some(cycle_start);

        // Settle a pending relocation before this cycle schedules.
        clock.settle(|frame| sync::position_request(&player, frame));

        let last_frame_time = clock.frame_time();
        let outcome = scheduler.run_cycle(
            &player,
            &*clock,
            s.buffer_frames,
            last_frame_time,
            &mut sinks,
        );

        for (sink, output) in sinks.iter_mut().zip(outputs.iter_mut()) {
            for (offset, bytes) in sink.take() {
                trace!(offset, port = %output.port_name, "midi out");
                if let Err(e) = output.send(&bytes) {
                    warn!("{}", e);
                }
            }
        }

        let (state, transport_frame) = clock.query();
        let rolling = state == TransportState::Rolling;
        if rolling {
            if let Some(guard) = player.try_active() {
                if let Some(active) = guard.as_ref() {
                    pos.frame = transport_frame;
                    timebase.update(
                        &mut pos,
                        s.buffer_frames,
                        !was_rolling,
                        &active.song,
                        &active.cursor,
                    );
                    trace!(bar = pos.bar, beat = pos.beat, tick = pos.tick, "timebase");
                }
            }
        }
        was_rolling = rolling;

        clock.advance(s.buffer_frames);

        if cycle_start.elapsed() > MAX_PROCESSING_TIME {
            warn!("processing took too long; scheduling problem?");
        }

        if outcome == CycleOutcome::Terminate {
            debug!("shutdown drain complete");
            break;
        }
    }
}

//! # Mock card
//!
//! A software model of the K8090 faithful enough to exercise the engine
//! without hardware: relay state, button modes, per-relay timers with
//! near-simultaneous coalescing, a randomized response delay, and chunked
//! delivery of queued responses.
//!
//! The mock implements [`crate::transport::Transport`] directly, so the
//! engine drives it exactly as it would a real serial port.
//!
//! ## Available Methods
//! - [`MockCard::new`], [`MockCard::with_seed`] - construct with a fresh or seeded RNG
//! - [`MockCard::on_write`] - feed outbound wire bytes to the device model
//! - [`MockCard::drain_into`] - pull whatever response bytes are ready

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution};

use crate::command::CommandId;
use crate::frame;
use crate::relay::RelaySet;

const MIN_RESPONSE_DELAY_MS: u64 = 2;
const TIMER_DELTA: Duration = Duration::from_millis(100);
const DEFAULT_DELAY_SECONDS: u16 = 5;

struct QueuedResponse {
    ready_at: Instant,
    bytes: [u8; frame::FRAME_LEN],
}

struct TimerEntry {
    relay: u8,
    fires_at: Instant,
}

/// In-process emulation of the relay card, standing in for a real serial
/// port in tests and in the `k8090-mock` reserved port name.
pub struct MockCard {
    on: RelaySet,
    momentary: RelaySet,
    toggle: RelaySet,
    timed: RelaySet,
    default_delays: [u16; 8],
    remaining_delays: [u16; 8],
    timers: Vec<TimerEntry>,
    jumper_on: bool,
    firmware: (u8, u8),
    pending: VecDeque<QueuedResponse>,
    out_buffer: VecDeque<u8>,
    rng: StdRng,
}

impl MockCard {
    /// Construct a mock in factory-default state with a fresh RNG.
    pub fn new() -> Self {
        MockCard::with_rng(StdRng::from_entropy())
    }

    /// Construct a mock with a deterministic RNG, for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        MockCard::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Self {
        let default_delays = [DEFAULT_DELAY_SECONDS; 8];
        let mut remaining_delays = [0u16; 8];
        for slot in remaining_delays.iter_mut() {
            *slot = rng.gen_range(0..=DEFAULT_DELAY_SECONDS);
        }
        MockCard {
            on: RelaySet::NONE,
            momentary: RelaySet::NONE,
            toggle: RelaySet::ALL,
            timed: RelaySet::NONE,
            default_delays,
            remaining_delays,
            timers: Vec::new(),
            jumper_on: false,
            firmware: (18, 26),
            pending: VecDeque::new(),
            out_buffer: VecDeque::new(),
            rng,
        }
    }

    /// Feed outbound wire bytes (what the engine would have written to a
    /// real port) into the device model. Invalid frames are ignored.
    pub fn on_write(&mut self, bytes: &[u8]) {
        let Ok(f) = frame::decode(bytes) else { return };
        let Some(id) = CommandId::from_wire_code(f.cmd) else { return };
        self.handle(id, f.mask, f.param1, f.param2);
    }

    /// Advance internal timers and move any now-ready queued responses into
    /// the output buffer, then copy as many bytes as fit into `buf`.
    pub fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        self.tick();
        let mut n = 0;
        while n < buf.len() {
            match self.out_buffer.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn tick(&mut self) {
        self.fire_due_timers();
        self.deliver_due_responses();
    }

    fn enqueue_response(&mut self, cmd_byte: u8, mask: u8, param1: u8, param2: u8) {
        let raw = Binomial::new(8, 0.3).expect("valid binomial params").sample(&mut self.rng);
        let delay_ms = MIN_RESPONSE_DELAY_MS + raw;
        let bytes = frame::encode(cmd_byte, mask, param1, param2);
        self.pending.push_back(QueuedResponse {
            ready_at: Instant::now() + Duration::from_millis(delay_ms),
            bytes,
        });
    }

    fn deliver_due_responses(&mut self) {
        let now = Instant::now();
        if !matches!(self.pending.front(), Some(r) if r.ready_at <= now) {
            return;
        }
        let chunk_len = self.rng.gen_range(1..=3).min(self.pending.len());
        for _ in 0..chunk_len {
            match self.pending.front() {
                Some(r) if r.ready_at <= now => {
                    let r = self.pending.pop_front().expect("checked non-empty above");
                    self.out_buffer.extend(r.bytes);
                }
                _ => break,
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let Some(first_due) = self
            .timers
            .iter()
            .filter(|t| t.fires_at <= now)
            .map(|t| t.fires_at)
            .min()
        else {
            return;
        };
        let (due, still_pending): (Vec<_>, Vec<_>) = self.timers.drain(..).partition(|t| {
            t.fires_at <= now || t.fires_at.saturating_duration_since(first_due) <= TIMER_DELTA
        });
        self.timers = still_pending;
        if due.is_empty() {
            return;
        }
        let previous = self.on;
        let mut cleared = RelaySet::NONE;
        for t in &due {
            cleared = cleared | RelaySet::relay(t.relay);
        }
        self.on = self.on.difference(cleared);
        self.emit_relay_status(previous, self.on);
    }

    fn active_timers_set(&self) -> RelaySet {
        self.timers.iter().fold(RelaySet::NONE, |acc, t| acc | RelaySet::relay(t.relay))
    }

    fn emit_relay_status(&mut self, previous: RelaySet, current: RelaySet) {
        let timed = self.active_timers_set();
        self.enqueue_response(0x51, previous.bits(), current.bits(), timed.bits());
    }

    fn cancel_timer(&mut self, relay: u8) {
        self.timers.retain(|t| t.relay != relay);
    }

    fn start_timer_for(&mut self, relay: u8, delay_seconds: u16) {
        self.cancel_timer(relay);
        let seconds = if delay_seconds == 0 {
            self.default_delays[(relay - 1) as usize]
        } else {
            delay_seconds
        };
        self.remaining_delays[(relay - 1) as usize] = seconds;
        self.timers.push(TimerEntry {
            relay,
            fires_at: Instant::now() + Duration::from_secs(seconds as u64),
        });
    }

    fn handle(&mut self, id: CommandId, mask: u8, param1: u8, param2: u8) {
        use CommandId::*;
        let set = RelaySet::from_bits(mask);
        match id {
            RelayOn => {
                let previous = self.on;
                self.on = self.on.union(set);
                if self.on != previous {
                    self.emit_relay_status(previous, self.on);
                }
            }
            RelayOff => {
                let previous = self.on;
                for relay in set.iter() {
                    self.cancel_timer(relay);
                }
                self.on = self.on.difference(set);
                if self.on != previous {
                    self.emit_relay_status(previous, self.on);
                }
            }
            ToggleRelay => {
                let previous = self.on;
                for relay in set.iter() {
                    if previous.contains(relay) {
                        self.cancel_timer(relay);
                    }
                }
                self.on = self.on.symmetric_difference(set);
                if self.on != previous {
                    self.emit_relay_status(previous, self.on);
                }
            }
            SetButtonMode => {
                let new_momentary = mask;
                let new_toggle = param1 & !new_momentary;
                let new_timed = param2 & !new_toggle & !new_momentary;
                self.momentary = RelaySet::from_bits(new_momentary);
                self.toggle = RelaySet::from_bits(new_toggle);
                self.timed = RelaySet::from_bits(new_timed);
            }
            QueryButtonMode => {
                self.enqueue_response(0x22, self.momentary.bits(), self.toggle.bits(), self.timed.bits());
            }
            StartTimer => {
                let previous = self.on;
                let delay = u16::from_be_bytes([param1, param2]);
                for relay in set.iter() {
                    self.start_timer_for(relay, delay);
                }
                self.on = self.on.union(set);
                if self.on != previous {
                    self.emit_relay_status(previous, self.on);
                }
            }
            SetTimer => {
                let delay = u16::from_be_bytes([param1, param2]);
                for relay in set.iter() {
                    self.default_delays[(relay - 1) as usize] = delay;
                }
            }
            QueryTimer => {
                let remaining = param1 & 1 != 0;
                for relay in set.iter() {
                    let idx = (relay - 1) as usize;
                    let seconds = if !remaining {
                        self.default_delays[idx]
                    } else if let Some(timer) = self.timers.iter().find(|t| t.relay == relay) {
                        let left = timer.fires_at.saturating_duration_since(Instant::now());
                        left.as_secs() as u16 + u16::from(left.subsec_nanos() > 0)
                    } else {
                        self.remaining_delays[idx]
                    };
                    let [hi, lo] = seconds.to_be_bytes();
                    self.enqueue_response(0x44, 1 << (relay - 1), hi, lo);
                }
            }
            QueryRelay => {
                let timed = self.active_timers_set();
                self.enqueue_response(0x51, self.on.bits(), self.on.bits(), timed.bits());
            }
            ResetFactoryDefaults => {
                let previous = self.on;
                self.momentary = RelaySet::NONE;
                self.toggle = RelaySet::ALL;
                self.timed = RelaySet::NONE;
                self.default_delays = [DEFAULT_DELAY_SECONDS; 8];
                self.timers.clear();
                self.on = RelaySet::NONE;
                if previous != RelaySet::NONE {
                    self.emit_relay_status(previous, RelaySet::NONE);
                }
            }
            QueryJumperStatus => {
                self.enqueue_response(0x70, 0, u8::from(self.jumper_on), 0);
            }
            QueryFirmwareVersion => {
                self.enqueue_response(0x71, 0, self.firmware.0, self.firmware.1);
            }
            CommandId::None => {}
        }
    }
}

impl Default for MockCard {
    fn default() -> Self {
        MockCard::new()
    }
}

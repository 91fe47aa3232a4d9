//! # Driver
//!
//! The public, caller-facing handle. Owns the engine thread and the shared
//! command queue / transport, and translates the high-level API (switch
//! relays, manage timers, run queries) into [`Command`] records pushed
//! across the thread boundary.
//!
//! ## Available Methods
//! - [`Driver::new`] - build a driver with a caller-supplied event sink
//! - [`Driver::connect`] / [`Driver::disconnect`] - manage the link
//! - [`Driver::switch_on`], [`Driver::switch_off`], [`Driver::toggle`] - relay power
//! - [`Driver::start_timer`], [`Driver::set_timer_delay`] - per-relay timers
//! - [`Driver::pending_command_count`] - inspect the queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::command::{Command, CommandId};
use crate::engine::{Engine, EngineRequest, EventSink};
use crate::queue::ConcurrentQueue;
use crate::relay::RelaySet;
use crate::settings::EngineSettings;
use crate::transport::TransportFacade;

/// Caller-facing handle to a running protocol engine. Cloning is not
/// supported; share a `Driver` behind an `Arc` if multiple owners are
/// needed, same as the queue and transport it wraps internally.
pub struct Driver {
    requests: mpsc::Sender<EngineRequest>,
    queue: Arc<ConcurrentQueue>,
    transport: Arc<TransportFacade>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Wraps a caller's [`EventSink`] to additionally track connection state,
/// so [`Driver::is_connected`] doesn't need to cross back into the engine
/// thread.
struct TrackingSink {
    inner: Box<dyn EventSink>,
    connected: Arc<AtomicBool>,
}

impl EventSink for TrackingSink {
    fn handle(&self, event: crate::engine::Event) {
        use crate::engine::Event::*;
        match event {
            Connected => self.connected.store(true, Ordering::SeqCst),
            Disconnected | ConnectionFailed => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        self.inner.handle(event);
    }
}

impl Driver {
    /// Spawns the engine thread and returns a handle to it. `sink` receives
    /// every event the engine publishes for the lifetime of the driver.
    pub fn new(sink: Box<dyn EventSink>, settings: EngineSettings) -> Self {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(ConcurrentQueue::new());
        let transport = Arc::new(TransportFacade::new(""));
        let connected = Arc::new(AtomicBool::new(false));
        let tracking = Box::new(TrackingSink { inner: sink, connected: connected.clone() });
        let engine = Engine::new(transport.clone(), queue.clone(), tracking, settings);
        let worker = std::thread::spawn(move || engine.run(rx));
        Driver {
            requests: tx,
            queue,
            transport,
            connected,
            worker: Some(worker),
        }
    }

    fn send(&self, request: EngineRequest) {
        let _ = self.requests.send(request);
    }

    /// Opens `port_name` (or routes to the mock if it matches the reserved
    /// mock port name) and begins the seed-query sequence.
    pub fn connect(&self, port_name: impl Into<String>) {
        self.send(EngineRequest::Connect(port_name.into()));
    }

    /// Hard stop: cancels timers, drops the in-flight command, empties the
    /// queue, and closes the transport.
    pub fn disconnect(&self) {
        self.send(EngineRequest::Disconnect);
    }

    /// True once the engine has announced `Connected` and not since
    /// disconnected or failed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Equivalent to calling [`Driver::disconnect`] followed by
    /// [`Driver::connect`] with a new port name.
    pub fn set_port_name(&self, port_name: impl Into<String>) {
        self.connect(port_name);
    }

    pub fn set_command_delay(&self, delay: Duration) {
        self.send(EngineRequest::SetCommandDelay(delay));
    }

    pub fn set_failure_delay(&self, delay: Duration) {
        self.send(EngineRequest::SetFailureDelay(delay));
    }

    pub fn set_max_failure_count(&self, count: u32) {
        self.send(EngineRequest::SetMaxFailures(count));
    }

    /// Switches the given relays on.
    pub fn switch_on(&self, relays: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::RelayOn, relays.bits(), 0, 0)));
    }

    /// Switches the given relays off.
    pub fn switch_off(&self, relays: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::RelayOff, relays.bits(), 0, 0)));
    }

    /// Toggles the given relays.
    pub fn toggle(&self, relays: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::ToggleRelay, relays.bits(), 0, 0)));
    }

    /// Assigns button behavior: each relay's button falls under exactly one
    /// of `momentary`, `toggle`, or `timed` (momentary takes precedence on
    /// overlap, then toggle, then timed; see [`crate::command::Command::merge`]
    /// for the same precedence applied when two `SetButtonMode` calls race).
    pub fn set_button_mode(&self, momentary: RelaySet, toggle: RelaySet, timed: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(
            CommandId::SetButtonMode,
            momentary.bits(),
            toggle.bits(),
            timed.bits(),
        )));
    }

    /// Starts a one-shot timer on `relays`. `delay_seconds == 0` uses each
    /// relay's stored default delay.
    pub fn start_timer(&self, relays: RelaySet, delay_seconds: u16) {
        let [hi, lo] = delay_seconds.to_be_bytes();
        self.send(EngineRequest::Enqueue(Command::new(CommandId::StartTimer, relays.bits(), hi, lo)));
    }

    /// Stores a new default timer delay for `relays`, used the next time
    /// `start_timer` is called with `delay_seconds == 0`.
    pub fn set_timer_delay(&self, relays: RelaySet, delay_seconds: u16) {
        let [hi, lo] = delay_seconds.to_be_bytes();
        self.send(EngineRequest::Enqueue(Command::new(CommandId::SetTimer, relays.bits(), hi, lo)));
    }

    /// Queries the stored default delay for `relays`.
    pub fn query_total_timer_delay(&self, relays: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryTimer, relays.bits(), 0, 0)));
    }

    /// Queries the remaining delay on `relays`' active timers.
    pub fn query_remaining_timer_delay(&self, relays: RelaySet) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryTimer, relays.bits(), 1, 0)));
    }

    pub fn query_relay_status(&self) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryRelay, 0, 0, 0)));
    }

    pub fn query_button_modes(&self) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryButtonMode, 0, 0, 0)));
    }

    pub fn query_jumper_status(&self) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryJumperStatus, 0, 0, 0)));
    }

    pub fn query_firmware_version(&self) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::QueryFirmwareVersion, 0, 0, 0)));
    }

    pub fn reset_factory_defaults(&self) {
        self.send(EngineRequest::Enqueue(Command::new(CommandId::ResetFactoryDefaults, 0, 0, 0)));
    }

    /// Re-runs the same seed-query sequence issued at connect time.
    pub fn refresh_all_info(&self) {
        self.query_relay_status();
        self.query_button_modes();
        self.query_total_timer_delay(RelaySet::ALL);
        self.query_remaining_timer_delay(RelaySet::ALL);
        self.query_jumper_status();
        self.query_firmware_version();
    }

    /// Number of pending commands with `id`, for tests and diagnostics.
    pub fn pending_command_count(&self, id: CommandId) -> usize {
        self.queue.get(id).len()
    }

    /// Exposes the shared transport facade, e.g. for a test that wants to
    /// assert `is_open()` independently of the `Connected` event.
    pub fn transport(&self) -> &Arc<TransportFacade> {
        &self.transport
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.send(EngineRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

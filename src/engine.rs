//! # Protocol engine
//!
//! The state machine that serializes commands into frames, parses incoming
//! frames, correlates responses to in-flight commands, and enforces
//! inter-command pacing. Runs on its own thread; callers cross into it by
//! sending an [`EngineRequest`] and receive results asynchronously as
//! [`Event`]s pushed to a caller-supplied [`EventSink`].
//!
//! ## Available Methods
//! - [`Engine::new`] - build an engine around a transport, queue and sink
//! - [`Engine::run`] - drive the state machine until a `Shutdown` request

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::command::{Command, CommandId, ResponseId};
use crate::frame::{self, Frame};
use crate::queue::ConcurrentQueue;
use crate::relay::RelaySet;
use crate::settings::EngineSettings;
use crate::transport::TransportFacade;

/// Requests crossing the thread boundary from a [`crate::driver::Driver`]
/// handle into the engine thread.
pub enum EngineRequest {
    Connect(String),
    Disconnect,
    Enqueue(Command),
    SetCommandDelay(Duration),
    SetFailureDelay(Duration),
    SetMaxFailures(u32),
    Shutdown,
}

/// Typed events published by the engine. Mirrors the card's signal surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    ConnectionFailed,
    NotConnected,
    Disconnected,
    RelayStatus { previous: RelaySet, current: RelaySet, timed: RelaySet },
    ButtonStatus { state: RelaySet, pressed: RelaySet, released: RelaySet },
    TotalTimerDelay { relay: u8, seconds: u16 },
    RemainingTimerDelay { relay: u8, seconds: u16 },
    ButtonModes { momentary: RelaySet, toggle: RelaySet, timed: RelaySet },
    JumperStatus { on: bool },
    FirmwareVersion { year: u16, week: u8 },
}

/// A caller-supplied sink the engine publishes events to. Tests stub this;
/// a GUI layer would forward to its own signal mechanism.
pub trait EventSink: Send {
    fn handle(&self, event: Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    AwaitingResponse,
    AwaitingPacing,
    Idle,
}

struct InFlight {
    command: Command,
    expects: Option<ResponseId>,
}

/// Owns the queue, transport, and timers, and drives the state machine.
/// Lives on a dedicated thread; see [`crate::driver::Driver`] for the
/// cross-thread handle callers actually use.
pub struct Engine {
    transport: Arc<TransportFacade>,
    queue: Arc<ConcurrentQueue>,
    sink: Box<dyn EventSink>,
    settings: EngineSettings,
    state: State,
    in_flight: Option<InFlight>,
    failure_count: u32,
    failure_deadline: Option<Instant>,
    pacing_deadline: Option<Instant>,
    read_buf: Vec<u8>,
    announced_connected: bool,
    /// Delay-type flag (low bit of `param1`) of the most recently *sent*
    /// `QueryTimer` command. A single multi-relay `QueryTimer` elicits up to
    /// eight `Timer` response frames that can keep arriving after the
    /// command itself has already completed `in_flight` and a later command
    /// has been sent, so classification can't rely on `in_flight` alone.
    last_timer_remaining: bool,
}

impl Engine {
    /// Build an engine around a shared transport facade and command queue,
    /// publishing events to `sink`.
    pub fn new(
        transport: Arc<TransportFacade>,
        queue: Arc<ConcurrentQueue>,
        sink: Box<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        Engine {
            transport,
            queue,
            sink,
            settings,
            state: State::Disconnected,
            in_flight: None,
            failure_count: 0,
            failure_deadline: None,
            pacing_deadline: None,
            read_buf: Vec::new(),
            announced_connected: false,
            last_timer_remaining: false,
        }
    }

    /// Runs the state machine on the calling thread until a `Shutdown`
    /// request arrives or the request channel disconnects. Meant to be
    /// spawned on its own `std::thread`.
    pub fn run(mut self, requests: mpsc::Receiver<EngineRequest>) {
        loop {
            match requests.recv_timeout(Duration::from_millis(5)) {
                Ok(EngineRequest::Shutdown) => {
                    self.do_disconnect(false);
                    return;
                }
                Ok(request) => self.handle_request(request),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.do_disconnect(false);
                    return;
                }
            }
            self.poll();
        }
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Connect(port) => self.do_connect(port),
            EngineRequest::Disconnect => self.do_disconnect(false),
            EngineRequest::Enqueue(cmd) => self.enqueue(cmd),
            EngineRequest::SetCommandDelay(d) => self.settings.command_delay = d,
            EngineRequest::SetFailureDelay(d) => self.settings.failure_delay = d,
            EngineRequest::SetMaxFailures(n) => self.settings.max_failures = n,
            EngineRequest::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn enqueue(&mut self, command: Command) {
        if self.state == State::Disconnected {
            self.sink.handle(Event::NotConnected);
            return;
        }
        self.queue.push(command, true);
        if self.state == State::Idle {
            self.dequeue_and_send();
        }
    }

    fn do_connect(&mut self, port: String) {
        debug!("connecting to port {port:?}");
        self.transport.set_port_name(port);
        match self.transport.open() {
            Ok(()) => {
                self.announced_connected = false;
                self.failure_count = 0;
                self.seed_queries();
                self.state = State::Idle;
                self.dequeue_and_send();
            }
            Err(e) => {
                warn!("failed to open transport: {e}");
                self.state = State::Disconnected;
                self.sink.handle(Event::ConnectionFailed);
            }
        }
    }

    fn seed_queries(&mut self) {
        self.queue.push(Command::new(CommandId::QueryRelay, 0, 0, 0), false);
        self.queue.push(Command::new(CommandId::QueryButtonMode, 0, 0, 0), false);
        self.queue
            .push(Command::new(CommandId::QueryTimer, RelaySet::ALL.bits(), 0, 0), false);
        self.queue
            .push(Command::new(CommandId::QueryTimer, RelaySet::ALL.bits(), 1, 0), false);
        self.queue.push(Command::new(CommandId::QueryJumperStatus, 0, 0, 0), false);
        self.queue.push(Command::new(CommandId::QueryFirmwareVersion, 0, 0, 0), false);
    }

    fn do_disconnect(&mut self, failure: bool) {
        if self.state == State::Disconnected {
            return;
        }
        debug!("disconnecting (failure={failure})");
        self.transport.close();
        self.in_flight = None;
        self.failure_deadline = None;
        self.pacing_deadline = None;
        self.failure_count = 0;
        self.read_buf.clear();
        while self.queue.pop().is_some() {}
        self.state = State::Disconnected;
        if failure {
            self.sink.handle(Event::ConnectionFailed);
        } else {
            self.sink.handle(Event::Disconnected);
        }
    }

    fn dequeue_and_send(&mut self) {
        let Some(command) = self.queue.pop() else {
            self.state = State::Idle;
            return;
        };
        let bytes = frame::encode(
            command.id.wire_code().unwrap_or(0),
            command.mask,
            command.param1,
            command.param2,
        );
        if let Err(e) = self.transport.write(&bytes) {
            warn!("transport write failed: {e}");
            self.failure_count += 1;
            if self.failure_count >= self.settings.max_failures {
                self.do_disconnect(true);
            } else {
                self.queue.push(command, false);
                self.dequeue_and_send();
            }
            return;
        }
        if command.id == CommandId::QueryTimer {
            self.last_timer_remaining = command.param1 & 1 != 0;
        }
        let expects = command.id.response_id();
        let has_response = expects.is_some();
        self.in_flight = Some(InFlight { command, expects });
        if has_response {
            self.failure_deadline = Some(Instant::now() + self.settings.failure_delay);
            self.state = State::AwaitingResponse;
        } else {
            let delay = if command.id == CommandId::ResetFactoryDefaults {
                self.settings.factory_defaults_command_delay
            } else {
                self.settings.command_delay
            };
            self.pacing_deadline = Some(Instant::now() + delay);
            self.state = State::AwaitingPacing;
        }
    }

    fn poll(&mut self) {
        if self.state == State::Disconnected {
            return;
        }
        self.poll_transport();
        match self.state {
            State::AwaitingResponse => {
                if let Some(deadline) = self.failure_deadline {
                    if Instant::now() >= deadline {
                        self.on_failure_timeout();
                    }
                }
            }
            State::AwaitingPacing => {
                if let Some(deadline) = self.pacing_deadline {
                    if Instant::now() >= deadline {
                        self.pacing_deadline = None;
                        self.dequeue_and_send();
                    }
                }
            }
            State::Idle | State::Disconnected => {}
        }
    }

    fn on_failure_timeout(&mut self) {
        let Some(in_flight) = self.in_flight.take() else { return };
        self.failure_deadline = None;
        self.failure_count += 1;
        warn!(
            "no response to {:?} within failure_delay ({}/{})",
            in_flight.command.id, self.failure_count, self.settings.max_failures
        );
        if self.failure_count >= self.settings.max_failures {
            self.do_disconnect(true);
        } else {
            self.queue.push(in_flight.command, false);
            self.dequeue_and_send();
        }
    }

    fn poll_transport(&mut self) {
        let mut buf = [0u8; 64];
        if let Ok(n) = self.transport.read(&mut buf) {
            if n > 0 {
                self.read_buf.extend_from_slice(&buf[..n]);
                self.process_read_buf();
            }
        }
    }

    fn process_read_buf(&mut self) {
        while self.read_buf.len() >= frame::FRAME_LEN {
            match frame::decode(&self.read_buf[..frame::FRAME_LEN]) {
                Ok(f) => {
                    self.read_buf.drain(..frame::FRAME_LEN);
                    self.handle_frame(f);
                }
                Err(_) => {
                    trace!("dropping byte while resyncing on an invalid frame");
                    self.read_buf.remove(0);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let Some(response) = ResponseId::from_wire_code(frame.cmd) else { return };
        match response {
            ResponseId::RelayStatus => self.sink.handle(Event::RelayStatus {
                previous: RelaySet::from_bits(frame.mask),
                current: RelaySet::from_bits(frame.param1),
                timed: RelaySet::from_bits(frame.param2),
            }),
            ResponseId::ButtonStatus => self.sink.handle(Event::ButtonStatus {
                state: RelaySet::from_bits(frame.mask),
                pressed: RelaySet::from_bits(frame.param1),
                released: RelaySet::from_bits(frame.param2),
            }),
            ResponseId::Timer => {
                let relay = (frame.mask.trailing_zeros() as u8).saturating_add(1);
                let seconds = u16::from_be_bytes([frame.param1, frame.param2]);
                // A single multi-relay QueryTimer elicits one Timer frame per
                // relay, which can keep arriving after this command has
                // already completed in_flight, so the delay-type flag is
                // read from the last QueryTimer actually sent rather than
                // from whatever command happens to be in flight right now.
                if self.last_timer_remaining {
                    self.sink.handle(Event::RemainingTimerDelay { relay, seconds });
                } else {
                    self.sink.handle(Event::TotalTimerDelay { relay, seconds });
                }
            }
            ResponseId::ButtonMode => self.sink.handle(Event::ButtonModes {
                momentary: RelaySet::from_bits(frame.mask),
                toggle: RelaySet::from_bits(frame.param1),
                timed: RelaySet::from_bits(frame.param2),
            }),
            ResponseId::JumperStatus => {
                self.sink.handle(Event::JumperStatus { on: frame.param1 != 0 })
            }
            ResponseId::FirmwareVersion => {
                self.sink.handle(Event::FirmwareVersion {
                    year: 2000 + frame.param1 as u16,
                    week: frame.param2,
                });
                if !self.announced_connected {
                    self.announced_connected = true;
                    self.sink.handle(Event::Connected);
                }
            }
        }

        // ButtonStatus is unsolicited and never clears an in-flight command.
        if response == ResponseId::ButtonStatus {
            return;
        }
        if matches!(&self.in_flight, Some(f) if f.expects == Some(response)) {
            self.complete_in_flight();
        }
    }

    fn complete_in_flight(&mut self) {
        self.in_flight = None;
        self.failure_deadline = None;
        self.failure_count = 0;
        self.pacing_deadline = Some(Instant::now() + self.settings.command_delay);
        self.state = State::AwaitingPacing;
    }
}

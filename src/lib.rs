//! Command scheduler and protocol driver for the Velleman K8090 USB relay
//! card.
//!
//! The card exposes a virtual serial port speaking a 7-byte framed binary
//! protocol. This crate implements the three subsystems that sit between a
//! caller's high-level relay operations and that byte-oriented transport:
//!
//! - a [`queue`] that orders and coalesces pending commands,
//! - an [`engine`] that serializes commands to frames, paces the wire, and
//!   correlates responses back to the command that elicited them,
//! - a [`mock`] card that emulates the device closely enough to develop and
//!   test against without hardware.
//!
//! [`driver::Driver`] is the entry point most callers want.

pub mod command;
pub mod driver;
pub mod engine;
pub mod error;
pub mod frame;
pub mod mock;
pub mod queue;
pub mod relay;
pub mod settings;
pub mod transport;

pub use command::{Command, CommandId, ResponseId};
pub use driver::Driver;
pub use engine::{Event, EventSink};
pub use error::{FrameError, K8090Error};
pub use relay::RelaySet;
pub use settings::{EngineSettings, SerialPortSettings};

//! # Pacing and serial settings
//!
//! Small, plain setter-backed configuration structs. There is no config
//! file parsing here — that's a process-level/CLI concern and out of
//! scope for this crate (see spec §1).

use std::time::Duration;

/// Mandatory serial-port settings for the K8090: 19200 baud, 8 data bits,
/// no parity, 1 stop bit, no flow control. The mock backend rejects a
/// frame write attempted under any other configuration (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialPortSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialPortSettings {
    fn default() -> Self {
        SerialPortSettings {
            baud_rate: 19200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// Parity bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Stop bits setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Flow control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Pacing and retry parameters for the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Minimum spacing enforced between successive outbound frames.
    pub command_delay: Duration,
    /// Spacing used after `ResetFactoryDefaults`, which needs longer to settle.
    pub factory_defaults_command_delay: Duration,
    /// Time allowed for a response before a command is retried.
    pub failure_delay: Duration,
    /// Retry budget before the link is declared dead.
    pub max_failures: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            command_delay: Duration::from_millis(50),
            factory_defaults_command_delay: Duration::from_millis(100),
            failure_delay: Duration::from_millis(500),
            max_failures: 3,
        }
    }
}

//! # Transport façade
//!
//! A thin adapter presenting one byte-duplex interface over either a real
//! serial port or the [`crate::mock`] card. The façade itself only knows
//! how to pick a backend and cache settings across a backend swap — it
//! does not know the wire protocol (that's [`crate::frame`] and
//! [`crate::engine`]).
//!
//! ## Available Methods
//! - [`TransportFacade::open`] - open the configured port (real or mock)
//! - [`TransportFacade::close`] - close the current backend
//! - [`TransportFacade::set_port_name`] - select a port, caching settings across the swap

use std::io;
use std::sync::Mutex;

use log::debug;

use crate::error::K8090Error;
use crate::mock::MockCard;
use crate::settings::SerialPortSettings;

/// USB product id of the K8090.
pub const PRODUCT_ID: u16 = 32912;
/// USB vendor id of the K8090.
pub const VENDOR_ID: u16 = 4303;

/// Reserved port name that routes the façade to the in-process mock card
/// instead of a real serial port.
pub const MOCK_PORT_NAME: &str = "k8090-mock";

/// A byte-oriented duplex endpoint: a real serial port or the mock card.
/// The engine drives one of these; it never touches `serialport` or
/// [`MockCard`] directly.
pub trait Transport: Send {
    /// Write a full frame (or any byte slice) to the wire.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Non-blocking read of whatever bytes are currently available.
    /// Returns `Ok(0)` if nothing is ready yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Apply serial settings to this backend. The mock rejects anything
    /// other than the mandatory K8090 settings (spec §6).
    fn configure(&mut self, settings: SerialPortSettings) -> io::Result<()>;
}

#[cfg(feature = "serial")]
struct RealPort {
    inner: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl Transport for RealPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        std::io::Write::write(&mut self.inner, bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match std::io::Read::read(&mut self.inner, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn configure(&mut self, settings: SerialPortSettings) -> io::Result<()> {
        use serialport::{DataBits, FlowControl as SpFlow, Parity as SpParity, StopBits as SpStop};
        self.inner
            .set_baud_rate(settings.baud_rate)
            .map_err(io::Error::other)?;
        self.inner
            .set_data_bits(match settings.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            })
            .map_err(io::Error::other)?;
        self.inner
            .set_parity(match settings.parity {
                crate::settings::Parity::None => SpParity::None,
                crate::settings::Parity::Odd => SpParity::Odd,
                crate::settings::Parity::Even => SpParity::Even,
            })
            .map_err(io::Error::other)?;
        self.inner
            .set_stop_bits(match settings.stop_bits {
                crate::settings::StopBits::One => SpStop::One,
                crate::settings::StopBits::Two => SpStop::Two,
            })
            .map_err(io::Error::other)?;
        self.inner
            .set_flow_control(match settings.flow_control {
                crate::settings::FlowControl::None => SpFlow::None,
                crate::settings::FlowControl::Software => SpFlow::Software,
                crate::settings::FlowControl::Hardware => SpFlow::Hardware,
            })
            .map_err(io::Error::other)?;
        Ok(())
    }
}

impl Transport for MockCard {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.on_write(bytes);
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.drain_into(buf))
    }

    fn configure(&mut self, settings: SerialPortSettings) -> io::Result<()> {
        if settings != SerialPortSettings::default() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mock card only accepts the mandatory K8090 serial settings",
            ));
        }
        Ok(())
    }
}

struct FacadeState {
    port_name: String,
    settings: SerialPortSettings,
    backend: Option<Box<dyn Transport>>,
}

/// Thin real-or-mock transport selector. Serializes all access with a
/// single mutex so it is safe to share across the engine thread and
/// whatever thread owns the public [`crate::driver::Driver`] handle.
pub struct TransportFacade {
    state: Mutex<FacadeState>,
}

impl TransportFacade {
    /// Create a façade targeting `port_name`, not yet open.
    pub fn new(port_name: impl Into<String>) -> Self {
        TransportFacade {
            state: Mutex::new(FacadeState {
                port_name: port_name.into(),
                settings: SerialPortSettings::default(),
                backend: None,
            }),
        }
    }

    /// Change the target port name. Cached settings are re-applied to the
    /// newly selected backend the next time [`TransportFacade::open`] runs.
    pub fn set_port_name(&self, port_name: impl Into<String>) {
        let mut state = self.state.lock().expect("transport mutex poisoned");
        state.port_name = port_name.into();
        state.backend = None;
    }

    /// Opens the configured backend: the mock card if the port name
    /// matches [`MOCK_PORT_NAME`], otherwise a real serial port.
    pub fn open(&self) -> Result<(), K8090Error> {
        self.open_inner().map_err(|e| K8090Error::TransportOpen(e.to_string()))
    }

    fn open_inner(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("transport mutex poisoned");
        let settings = state.settings;
        let mut backend: Box<dyn Transport> = if state.port_name == MOCK_PORT_NAME {
            debug!("opening mock transport");
            Box::new(MockCard::new())
        } else {
            #[cfg(feature = "serial")]
            {
                let port = serialport::new(&state.port_name, settings.baud_rate)
                    .timeout(std::time::Duration::from_millis(10))
                    .open()
                    .map_err(io::Error::other)?;
                Box::new(RealPort { inner: port })
            }
            #[cfg(not(feature = "serial"))]
            {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "real serial backend disabled (build without the `serial` feature)",
                ));
            }
        };
        backend.configure(settings)?;
        state.backend = Some(backend);
        Ok(())
    }

    /// Closes the current backend, if any.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("transport mutex poisoned");
        state.backend = None;
    }

    /// True if a backend is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().expect("transport mutex poisoned").backend.is_some()
    }

    /// Write to the open backend.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, K8090Error> {
        let mut state = self.state.lock().expect("transport mutex poisoned");
        match state.backend.as_mut() {
            Some(backend) => backend.write(bytes).map_err(|e| K8090Error::TransportWrite(e.to_string())),
            None => Err(K8090Error::NotConnected),
        }
    }

    /// Non-blocking read from the open backend.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().expect("transport mutex poisoned");
        match state.backend.as_mut() {
            Some(backend) => backend.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport not open")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_port_name_routes_to_mock() {
        let facade = TransportFacade::new(MOCK_PORT_NAME);
        facade.open().expect("mock always opens");
        assert!(facade.is_open());
    }

    #[test]
    fn switching_port_closes_old_backend() {
        let facade = TransportFacade::new(MOCK_PORT_NAME);
        facade.open().unwrap();
        facade.set_port_name(MOCK_PORT_NAME);
        assert!(!facade.is_open());
    }
}

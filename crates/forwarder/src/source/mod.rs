//! Upstream source readers
//!
//! - [`TcpSource`]: newline-delimited text over TCP (ADS-B SBS1 from dump1090)
//! - [`SerialSource`]: CR/LF NMEA sentences from a UART (AIS)

pub mod framing;
pub mod serial;
pub mod tcp;

use marlink_metadata::SourceConfig;
use std::time::Duration;

pub use framing::LineBuffer;
pub use serial::{SerialLine, SerialSource};
pub use tcp::TcpSource;

use crate::traits::{RecordSource, SourceFactory};

/// Builds real TCP / serial sources from configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, config: &SourceConfig) -> Box<dyn RecordSource> {
        match config {
            SourceConfig::Tcp {
                host,
                port,
                connect_timeout_ms,
                read_timeout_ms,
            } => Box::new(TcpSource::new(
                host.clone(),
                *port,
                Duration::from_millis(*connect_timeout_ms),
                Duration::from_millis(*read_timeout_ms),
            )),
            SourceConfig::Serial {
                device,
                baud_rate,
                read_timeout_ms,
            } => Box::new(SerialSource::new(
                device.clone(),
                *baud_rate,
                Duration::from_millis(*read_timeout_ms),
            )),
        }
    }
}

//! NMEA serial source (AIS receiver on the Pi UART)
//!
//! `serialport` is blocking, so a dedicated reader thread owns the port, frames
//! lines and hands records to the async side over a channel. The thread polls
//! `bytes_to_read()` before every read and checks its stop flag in between, so
//! `close()` takes effect within one poll interval.

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::framing::LineBuffer;
use crate::error::SourceError;
use crate::record::Record;
use crate::traits::RecordSource;

/// Sleep between `bytes_to_read()` polls when the line is idle
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHANNEL_CAPACITY: usize = 256;

/// Byte-level port access used by the reader thread
pub trait SerialLine: Send {
    /// Bytes waiting in the receive buffer
    fn available(&mut self) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl SerialLine for Box<dyn SerialPort> {
    fn available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }
}

/// Open `device` at 8N1 without flow control
pub fn open_port(device: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>, SourceError> {
    let port = serialport::new(device, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open()?;
    Ok(port)
}

pub struct SerialSource {
    device: String,
    baud_rate: u32,
    read_timeout: Duration,
    rx: Option<mpsc::Receiver<Result<Record, SourceError>>>,
    stop: Arc<AtomicBool>,
}

impl SerialSource {
    pub fn new(device: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            read_timeout,
            rx: None,
            stop: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start the reader thread over an already opened line
    pub fn attach<L: SerialLine + 'static>(&mut self, line: L) -> Result<(), SourceError> {
        self.detach();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let name = self.device.clone();

        thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || read_loop(line, tx, thread_stop, &name))?;

        self.rx = Some(rx);
        self.stop = stop;
        Ok(())
    }

    fn detach(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.rx = None;
    }
}

fn read_loop<L: SerialLine>(
    mut line: L,
    tx: mpsc::Sender<Result<Record, SourceError>>,
    stop: Arc<AtomicBool>,
    device: &str,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 1024];

    while !stop.load(Ordering::SeqCst) {
        match line.available() {
            Ok(0) => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(SourceError::Io(e)));
                return;
            }
        }

        match line.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                lines.extend(&chunk[..n]);
                while let Some(record) = lines.next_record() {
                    if tx.blocking_send(record).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(SourceError::Io(e)));
                return;
            }
        }
    }
    debug!(device = %device, "Serial reader thread exiting");
}

#[async_trait]
impl RecordSource for SerialSource {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.device, self.baud_rate)
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        let device = self.device.clone();
        let baud_rate = self.baud_rate;
        let read_timeout = self.read_timeout;

        let port = tokio::task::spawn_blocking(move || open_port(&device, baud_rate, read_timeout))
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))??;

        self.attach(port)?;
        info!(source = %self.describe(), "Serial source opened");
        Ok(())
    }

    async fn read_record(&mut self) -> Result<Option<Record>, SourceError> {
        let rx = self.rx.as_mut().ok_or(SourceError::NotOpen)?;
        match timeout(self.read_timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(record))) => Ok(Some(record)),
            Ok(Some(Err(e))) => {
                if !matches!(e, SourceError::Decode(_)) {
                    warn!(source = %self.describe(), error = %e, "Serial read error");
                    self.detach();
                }
                Err(e)
            }
            Ok(None) => {
                self.detach();
                Err(SourceError::Closed)
            }
        }
    }

    async fn close(&mut self) {
        if self.rx.is_some() {
            debug!(source = %self.describe(), "Serial source closed");
        }
        self.detach();
    }
}

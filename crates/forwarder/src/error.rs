use thiserror::Error;

/// Upstream (dump1090 socket, AIS UART) failures. Never fatal: the engine
/// closes the session and retries after a fixed delay.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source closed the connection")]
    Closed,
    #[error("undecodable record: {0}")]
    Decode(String),
    #[error("source not open")]
    NotOpen,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for SourceError {
    fn from(e: serialport::Error) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

/// Per-endpoint, per-record delivery failure after the retry budget is spent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("send failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Control-plane rejections
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Service already running")]
    AlreadyRunning,
    #[error("Service not running")]
    NotRunning,
}

use async_trait::async_trait;
use marlink_metadata::SourceConfig;

use crate::error::SourceError;
use crate::record::Record;

/// Upstream record source (dump1090 TCP feed, AIS serial port, ...)
///
/// A source covers a single session: `open`, any number of `read_record`
/// calls, `close`. Reconnect and backoff belong to the engine.
#[async_trait]
pub trait RecordSource: Send {
    /// Human readable description used in log lines
    fn describe(&self) -> String;

    /// Establish the session
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Next complete record. Returns `Ok(None)` when the per-read timeout
    /// elapsed without a full record so the caller can check for shutdown
    /// and reload deadlines. Must be cancel safe.
    async fn read_record(&mut self) -> Result<Option<Record>, SourceError>;

    /// Tear the session down. Safe to call on a source that never opened.
    async fn close(&mut self);
}

/// Builds a fresh source for each (re)start of an engine
pub trait SourceFactory: Send + Sync {
    fn create(&self, config: &SourceConfig) -> Box<dyn RecordSource>;
}

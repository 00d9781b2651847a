//! Line-delimited TCP source (dump1090-fa SBS1 output)

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::framing::LineBuffer;
use crate::error::SourceError;
use crate::record::Record;
use crate::traits::RecordSource;

const READ_CHUNK: usize = 4096;

pub struct TcpSource {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    lines: LineBuffer,
    chunk: Vec<u8>,
}

impl TcpSource {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            read_timeout,
            stream: None,
            lines: LineBuffer::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl RecordSource for TcpSource {
    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        self.close().await;

        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            SourceError::Unavailable(format!(
                "connect to {} timed out after {:?}",
                self.describe(),
                self.connect_timeout
            ))
        })?
        .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.describe(), e)))?;

        info!(source = %self.describe(), "TCP source connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_record(&mut self) -> Result<Option<Record>, SourceError> {
        loop {
            if let Some(record) = self.lines.next_record() {
                return record.map(Some);
            }

            let stream = self.stream.as_mut().ok_or(SourceError::NotOpen)?;
            match timeout(self.read_timeout, stream.read(&mut self.chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(SourceError::Closed);
                }
                Ok(Ok(n)) => self.lines.extend(&self.chunk[..n]),
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(SourceError::Io(e));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(source = %self.describe(), "TCP source closed");
        }
        self.lines.clear();
    }
}

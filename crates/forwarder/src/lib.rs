//! marlink-forwarder: the record forwarding core
//!
//! Reads ADS-B (SBS1 over TCP) or AIS (NMEA over serial) records, applies the
//! instance filter and fans every surviving record out to the enabled
//! endpoints, each through its own worker with an independent retry policy.

pub mod engine;
pub mod error;
pub mod filter;
pub mod log_ring;
pub mod metrics;
pub mod record;
pub mod sender;
pub mod server;
pub mod source;
pub mod traits;
pub mod worker;

pub use engine::{EngineState, EngineStatus, ForwardingEngine};
pub use error::{EngineError, SendError, SourceError};
pub use filter::RecordFilter;
pub use log_ring::{LogEntry, LogLevel, LogRing};
pub use record::Record;
pub use sender::{EndpointConnectionState, EndpointSender};
pub use server::{create_router, run_server, ControlPlane};
pub use source::{DefaultSourceFactory, SerialSource, TcpSource};
pub use traits::{RecordSource, SourceFactory};
pub use worker::EndpointWorker;

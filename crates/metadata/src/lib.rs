//! marlink-metadata: persisted configuration for the forwarding instances
//!
//! Each protocol instance (ADS-B, AIS) is described by one YAML file holding its
//! source parameters, filter policy, retry policy and endpoint list. The
//! [`EndpointRegistry`] owns that file and is the only writer.

pub mod error;
pub mod instance;
pub mod registry;

pub use error::MetadataError;
pub use instance::{
    BackoffConfig, DeliveryMode, Endpoint, FilterMode, FilterPolicy, InstanceConfig, NewEndpoint,
    RecordFormat, RetryConfig, SourceConfig,
};
pub use registry::EndpointRegistry;

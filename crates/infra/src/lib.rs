//! Infrastructure layer: store connection, decoding, job store, configuration.

pub mod codec;
pub mod config;
pub mod jobs;
pub mod mongo;

mod integration_tests;

pub use codec::{DecodeError, DecodePolicy};
pub use config::{ConfigError, ConfigReader, EnvConfig, MapConfig, MongoSettings, StoreSettings};
pub use jobs::{
    InMemoryJobStore, JobStore, JobStoreError, JobStream, MongoJobStore, StreamError,
    StreamOptions, StreamStart,
};
pub use mongo::{connect, ConnectError};

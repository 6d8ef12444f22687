//! Streaming job store.
//!
//! ## Design
//!
//! - Jobs are appended once and never updated or deleted
//! - The store assigns identities at insert time
//! - `stream_jobs` turns the store into a live, insertion-ordered feed
//! - Shutdown is a cancellation token: store-wide, plus one scope per stream
//!
//! ## Components
//!
//! - `JobStore`: insert + stream + shutdown contract
//! - `MongoJobStore`: capped collection + tailable-await cursor
//! - `InMemoryJobStore`: same semantics for tests/dev
//! - `JobStream`: consumer side of one follow loop

pub mod in_memory;
pub mod mongo;
pub mod stream;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use mongo::{MongoJobStore, JOBS_COLLECTION};
pub use r#trait::{JobStore, JobStoreError};
pub use stream::{JobStream, StreamError, StreamOptions, StreamStart};

//! ember-proxy — gated pass-through from callers to the executor.
//!
//! The proxy forwards generate, pull, list and model-management calls to
//! the executor's HTTP endpoint. It reads the lifecycle through a
//! [`LifecycleObserver`](ember_lifecycle::LifecycleObserver) and refuses
//! traffic the current state cannot serve, without touching the network.
//!
//! Streaming responses are newline-delimited JSON. A reader task splits
//! the upstream body into records and pushes them through a bounded
//! channel; the caller drains it as an [`NdjsonStream`]. Dropping the
//! stream stops the reader and releases the upstream connection.

pub mod error;
pub mod proxy;
pub mod upstream;

pub use error::{ProxyError, ProxyResult};
pub use proxy::InferenceProxy;
pub use upstream::{GenerateStream, NdjsonStream, PullStream};

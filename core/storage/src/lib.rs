//! Storage connector abstraction for tokenvault.
//!
//! Each cloud backend that holds sealed token records is reached through a
//! [`Connector`]. The replication layer only ever talks to this trait, so a
//! provider SDK never leaks past its own adapter.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic outside the adapter
//! - Async operations: all I/O operations are async
//! - Concurrency: connectors are shared across tasks and must be `Send + Sync`
//! - Unified error semantics: failures carry provider and operation

pub mod connector;
pub mod local;
pub mod memory;
pub mod registry;
pub mod set;

pub use connector::{Connector, ConnectorMetrics, Operation};
pub use local::LocalConnector;
pub use memory::MemoryConnector;
pub use registry::{create_default_registry, ConnectorFactory, ConnectorRegistry};
pub use set::ConnectorSet;

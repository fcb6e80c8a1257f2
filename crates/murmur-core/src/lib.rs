//! # murmur-core
//!
//! The channel-scoped routing pipeline behind murmur.
//!
//! A submission takes this path:
//!
//! ```text
//! ┌────────┐   ┌────────────┐ filter  ┌──────────────┐   ┌─────────────┐
//! │ Ingest │──▶│ meta topic │────────▶│ channel queue│──▶│ Persistence │
//! └────────┘   └────────────┘ channel └──────────────┘   └─────────────┘
//!                                                          │         │
//!                                                          ▼         ▼
//!                                                  ┌──────────┐ ┌────────────────┐
//!                                                  │  table   │ │ endpoint topic │
//!                                                  └──────────┘ └────────────────┘
//! ```
//!
//! - [`infra`] - record store, broker, queue and parameter registry traits
//!   with in-memory implementations
//! - [`locator`] - resolves channel names to resource references
//! - [`directory`] - channel metadata and provisioning journal
//! - [`ingest`] / [`persist`] - the two stateless pipeline stages
//! - [`provision`] - channel create, rename and delete
//! - [`backend`] - wires it all together

pub mod backend;
pub mod channel;
pub mod directory;
pub mod infra;
pub mod ingest;
pub mod locator;
pub mod message;
pub mod persist;
pub mod provision;

pub use backend::{Backend, BackendError, Infrastructure, PipelineConfig};
pub use channel::{ChannelRefs, QueueRef, SubscriptionRef, TableRef, TopicRef};
pub use directory::{ChannelDirectory, ChannelRecord, ChannelStatus, DirectoryError};
pub use ingest::{IngestError, IngestHandler};
pub use locator::{LookupError, ServiceLocator};
pub use message::{Message, Record};
pub use persist::{PersistError, PersistenceHandler, WorkerConfig, WorkerPool};
pub use provision::{ProvisionConfig, ProvisionError, ProvisionStep, Provisioner};

//! Elohim Replica - peer-replicated, content-addressed file store
//!
//! Every node accepts uploads, deduplicates them by content hash and pushes
//! them to a configured set of peers in the background. A periodic
//! anti-entropy sweep compares per-day counters and hash sets with each
//! peer and repairs whatever the replication queues missed.
//!
//! ## Architecture
//!
//! - **Metadata store** (`metadata`): sled map from content hash (and path alias) to `FileRecord`
//! - **Ledgers** (`ledger`): per-day append-only logs, the durable source of truth
//! - **Counters** (`stats`): per-day file count and size, rebuilt from the ledgers on demand
//! - **Upload pipeline** (`upload`): place, hash, deduplicate, commit
//! - **Replication** (`queue`, `replication`): bounded queues drained by push and pull workers
//! - **Reconciliation** (`reconcile`): counter diff, then hash-set diff per day
//! - **Node** (`node`, `tasks`, `http`): lifecycle, supervised background tasks, HTTP surface
//!
//! ## Storage Layout
//!
//! ```text
//! <storage_dir>/
//! ├── files/                     # Committed files
//! │   └── <scene>/<yyyymmdd>/<hh>/<mm>/<name>
//! ├── data/
//! │   ├── <yyyymmdd>/            # committed.log, queued.log, errors.log
//! │   ├── metadata.sled/         # Metadata database
//! │   └── stat.json              # Counter snapshot
//! └── config.toml                # Configuration
//! ```

pub mod config;
pub mod digest;
pub mod error;
pub mod http;
pub mod ledger;
pub mod metadata;
pub mod node;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod replication;
pub mod stats;
pub mod tasks;
pub mod transport;
pub mod upload;

// Re-exports
pub use config::Config;
pub use digest::HashAlgorithm;
pub use error::StorageError;
pub use http::HttpServer;
pub use ledger::Ledger;
pub use metadata::MetadataDb;
pub use node::Node;
pub use queue::ReplicationQueues;
pub use reconcile::{ReconcileReport, Reconciler};
pub use record::{DayStat, Direction, FileRecord, LedgerCategory, NodeStatus, ReplicationJob};
pub use stats::StatAggregator;
pub use transport::{HttpTransport, PeerTransport};
pub use upload::{UploadOutcome, UploadPipeline, UploadRequest};

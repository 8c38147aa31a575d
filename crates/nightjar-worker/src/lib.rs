//! # nightjar-worker
//!
//! A distributed, horizontally-replicated daily batch exporter. Once
//! per calendar day, the elected leader extracts every row of a
//! relational view page by page, fans each page out to several
//! translated output files on a shared volume, and publishes one
//! completion event per file.
//!
//! ## Core Concepts
//!
//! - **Lease**: the exclusive, TTL-bounded right to act as leader,
//!   renewed by a heartbeat ([`lease`], [`heartbeat`])
//! - **Progress**: the fleet-visible record of each file's last durable
//!   page ([`progress`]), reconciled with the in-file marker
//!   ([`writer`]) by the crash-resume protocol
//! - **Fan-out**: one page read, many file writes, joined per page
//!   ([`orchestrator`])
//! - **Finalization**: marker removal, status completion, event
//!   publication, strictly in that order ([`orchestrator`],
//!   [`publish`])
//!
//! ## Guarantees
//!
//! - At most one replica writes at a time; work already flushed is
//!   never rewritten on takeover
//! - Resume after a crash is page-granular, without duplicates or gaps
//! - Event delivery is at-least-once, deduplicable by correlation id

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod health;
mod heartbeat;
pub mod lease;
pub mod metrics;
pub mod pg;
pub mod progress;
pub mod publish;
pub mod reader;
pub mod retry;
pub mod row;
pub mod translate;
pub mod trigger;
pub mod writer;

/// Event-driven orchestration of the lease, gate, extraction, and
/// finalization phases.
pub mod orchestrator;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{PolicyConfig, WorkerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::health::{HealthService, HealthState};
    pub use crate::lease::{LeaseRecord, LeaseStore};
    pub use crate::orchestrator::{Collaborators, Orchestrator, OutputTarget, RunPolicy};
    pub use crate::progress::{FileProgress, FileStatus, ProgressStore};
    pub use crate::publish::{CompletionEvent, EventPublisher};
    pub use crate::reader::PageReader;
    pub use crate::retry::RetryPolicy;
    pub use crate::row::{Row, RowColumn};
    pub use crate::translate::{Translator, TranslatorRegistry};
    pub use crate::trigger::{ProgressTriggerGuard, TriggerGuard};
    pub use crate::writer::{AppendOutcome, Footer, OutputWriter};
}

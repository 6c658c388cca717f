//! Sync module for multi-device synchronization
//!
//! Provides:
//! - Per-data-type versioning with a local ledger
//! - Batched push of several data types in one exchange
//! - Conflict detection on the server and resolution on the client
//!
//! # Sync Protocol
//!
//! 1. Client records local mutations; each bumps the type's pending count
//! 2. Client sends a `BatchRequest` with the changes and the server versions
//!    they were made against
//! 3. Server accepts changes made against its current version, reports the
//!    rest as conflicts and returns a `BatchResult`
//! 4. Client adopts accepted versions and resolves conflicts
//!    (`merge`, `local`, `server` or confirmed `manual`)
//! 5. Resolved data is pushed against the server's version on the next sync
//!
//! # Merge Rules
//!
//! - Record lists are unioned by `id`; an item changed on both sides keeps
//!   the copy with the later `updatedAt`
//! - Settings merge field by field, later `updatedAt` wins differing fields
//! - Equal or missing timestamps are a merge error, never a silent pick

mod batch;
mod client;
mod conflict;
mod ledger;
mod replica;
mod retry;
mod store;
mod types;

pub use batch::{record_path, BatchSyncOrchestrator, BATCH_PATH};
pub use client::SyncClient;
pub use conflict::{ConflictResolver, MergeRule, UserInput};
pub use ledger::{LedgerEntry, SyncGuard, VersionLedger, VersionRelation};
pub use replica::{record_key, LocalReplica, MemoryStore, ReplicaStore};
pub use retry::RetryPolicy;
pub use store::SyncRepository;
pub use types::{
    BatchChange, BatchRequest, BatchResult, Conflict, ConflictResolution, DataType,
    OperationType, RecordWrite, ResolutionStrategy, SyncOutcome, VersionedRecordSet,
};

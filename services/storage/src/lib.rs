//! Recording Storage Tiering
//!
//! Moves finalized camera recordings down an ordered chain of storage tiers
//! (for example SSD, then HDD, then NAS) and deletes them from the last tier.
//! Every tier carries its own age and size limits; one sweeper per
//! (camera, tier) evaluates those limits and hands the selected files to the
//! tier handler, which keeps the file system and the PostgreSQL catalog in step.
//!
//! ## Features
//!
//! - **Policy Evaluation**: Oldest-first eviction by max age and max size, with
//!   min age and min size acting as protection floors
//! - **Safe File Operations**: Every move or delete holds a row claim, so two
//!   workers never act on the same recording
//! - **Cascading Sweeps**: A tier that moved files wakes the next tier
//! - **Reconciliation**: Orphan rows and untracked files are cleaned up at startup
//! - **Health API**: Per-worker health, readiness and tier usage over HTTP
//!
//! ## Architecture
//!
//! ```text
//!  Segment writer                                 PostgreSQL
//! ┌──────────────┐                               ┌──────────────┐
//! │ register     │──────────────────────────────▶│ recordings   │
//! │ recording    │                               └──────────────┘
//! └──────────────┘                                  ▲        ▲
//!        │ wake                                     │ claim  │ list
//!        ▼                                          │        │
//! ┌──────────────┐  evict   ┌──────────────┐        │        │
//! │ Tier         │─────────▶│ Tier         │────────┘        │
//! │ Sweeper (N)  │          │ Handler      │                 │
//! └──────────────┘          └──────────────┘                 │
//!   │    ▲  │                  │        │                    │
//!   │    │  │ wake next        │ move / │ publish            │
//!   │    │  ▼                  ▼ delete ▼                    │
//!   │    │ Sweeper (N+1)   tier roots   TierEvent            │
//!   │    │                                                   │
//!   └────┴── Tier Policy (evaluate snapshot) ◀───────────────┘
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod events;
pub mod file_ops;
pub mod handler;
pub mod health;
pub mod policy;
pub mod reconcile;
pub mod service;
pub mod sweeper;
pub mod tier;

pub use api::AppState;
pub use catalog::{Catalog, CatalogClaim, CatalogError, MemoryCatalog, NewRecording, PgCatalog, Recording, TierUsage};
pub use config::Config;
pub use events::{BroadcastPublisher, EventPublisher, TierEvent};
pub use file_ops::{FileOpError, FileOutcome};
pub use handler::{HandleError, TierHandler};
pub use health::{HealthRegistry, WorkerHealth, WorkerKey};
pub use policy::{evaluate, evaluate_forced, Eviction, EvictionReason, TierSnapshot};
pub use reconcile::{ReconcileError, ReconcileReport};
pub use service::{TieringError, TieringService, TieringSettings};
pub use sweeper::{RetrySettings, SweepMode, SweepReport, SweepTrigger, TierSweeper};
pub use tier::{SharedChain, Tier, TierChain, TierLimits};

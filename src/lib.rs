//! Live aircraft-tracking aggregator.
//!
//! Repeatedly ingests positional reports from heterogeneous sources per
//! geographic region, reconciles them into one authoritative view,
//! enriches the view from a static aircraft registry, and publishes the
//! result to a keyed TTL cache for read-only query.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐  ┌───────────┐  ┌───────────────┐
//!  │ dump1090  │  │  OpenSky  │  │  push ingress │
//!  │  (poll)   │  │  (poll)   │  │  (pi-stations)│
//!  └─────┬─────┘  └─────┬─────┘  └──────┬────────┘
//!        │              │               │ buffer write
//!        └───────┬──────┘        ┌──────┴────────┐
//!                ▼               │     cache     │
//!        ┌───────────────┐  read │  (Redis, TTL) │
//!        │   scheduler   │◀──────┤               │
//!        │  (per region) │       └──────▲────────┘
//!        └───────┬───────┘              │ pipelined write
//!                ▼                      │
//!        blend ─▶ enrich ─▶ classify ───┘
//! ```
//!
//! Each region runs an independent scheduler: every tick fans out to the
//! configured sources concurrently, blends the reports (one record per
//! hex, priority wins, deterministic tie-breaks), joins the registry, and
//! publishes `{region}:flights`, `{region}:choppers`, per-aircraft point
//! lookups, and raw per-source snapshots in one pipelined write.

pub mod blender;
pub mod cache;
pub mod config;
pub mod dump1090;
pub mod enrich;
pub mod geo;
pub mod ingress;
pub mod model;
pub mod opensky;
pub mod registry;
pub mod scheduler;
pub mod stats;

pub use blender::{blend, BlendOutcome, SourceBatch};
pub use cache::{CacheClient, CacheError};
pub use config::{Config, ConfigError};
pub use geo::{distance_miles, BoundingBox, Position};
pub use model::{Aircraft, RegistryEntry, SourcePriority};
pub use registry::RegistryStore;
pub use scheduler::RegionScheduler;

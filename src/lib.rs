//! Feed update engine for transit data aggregation.
//!
//! The crate pulls GTFS static and GTFS-realtime feeds on a schedule, merges
//! each snapshot into a relational store behind the [`Querier`] trait, purges
//! entities the latest snapshot no longer confirms, and derives per-route
//! service maps (the ordered stations a route visits) by topological sort
//! over observed trip stop sequences.
//!
//! The main entry points are [`Scheduler`] for automatic updates and
//! [`update::create_and_run`] for a single one.
//!
//! [`Querier`]: db::querier::Querier
//! [`Scheduler`]: scheduler::Scheduler

pub mod db;
pub mod graph;
pub mod gtfs;
pub mod scheduler;
pub mod servicemaps;
pub mod update;

pub use db::querier::Querier;
pub use scheduler::{Scheduler, SchedulerHandle, UpdateFunc};
pub use update::{create_and_run, create_and_run_with_content, UpdateError, UpdateResult};

//! # drcal-jobs
//!
//! Durable job queue and background workers for the DrCal scheduling API.
//!
//! Provides the enqueue surface (QueueClient), the Postgres-backed queue
//! store with atomic claiming, per-entity advisory locks, a fixed-size
//! worker pool with retry/backoff, change-event ingestion, and
//! OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod handler;
pub mod ingest;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

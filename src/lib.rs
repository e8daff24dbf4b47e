//! Pulse - CRM background sync and insight pipeline.
//!
//! A polling job runner over a SQLite-backed queue: Gmail/Calendar sync,
//! raw-event normalization, contact extraction, embedding generation, and
//! AI insight generation, with retry/backoff, per-job timeouts, and batch
//! tracking. Correctness under at-least-once delivery comes from idempotent
//! writes (unique-key upserts) rather than ordering.

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod services;

pub use config::config;
pub use error::{Error, Result};

//! pipestore - embedded SQLite persistence for audio pipeline telemetry
//!
//! Stores metrics, events and playback sessions for a music bot's audio
//! pipelines in a single SQLite file:
//!
//! - [`store::MetricsStore`] - the façade: batched metric writes, direct
//!   event/session writes, queries and analytics
//! - [`store::MigrationEngine`] - versioned, checksummed schema migrations
//!   with pre-migration backups
//! - [`store::RetentionManager`] - prioritised cleanup policies on a timer
//! - [`store::SessionIndex`] - in-memory open-session index with orphan sweep
//!
//! Configuration lives in [`config`]; [`logging`] wires up `tracing`.

pub mod config;
pub mod logging;
pub mod store;

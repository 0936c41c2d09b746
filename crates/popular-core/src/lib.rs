//! popular-core library.
//!
//! Turns a log of content views into per-window popularity tallies for
//! categories, courses and modules, catching up incrementally from a
//! watermark.
//!
//! A run ([`run::TallyRun`]) reconciles deleted identities and users
//! ([`reconcile`]), folds new events ([`aggregate`]), and commits through
//! the persistence gateway ([`db::store`]). Rankings are served by
//! [`query`] from the gateway's per-kind cache.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums in [`error`] for library paths,
//!   `anyhow::Result` for file and database setup.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod lock;
pub mod model;
pub mod privacy;
pub mod query;
pub mod reconcile;
pub mod run;

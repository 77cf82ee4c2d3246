//! schemadiff - metadata snapshot store and incremental diff engine
//!
//! Extractors hand over one snapshot per sync of a database connection.
//! A diff run compares the two most recent completed snapshots level by level
//! (schemas, tables, columns) and persists the resulting change records
//! atomically, so the viewer only ever sees complete runs.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod differ;
pub mod error;
pub mod keys;
pub mod model;
pub mod models;
pub mod reconcile;
pub mod routes;
pub mod state;
pub mod store;

pub use coordinator::{DiffComputation, DiffCoordinator};
pub use error::{ApiResult, AppError};

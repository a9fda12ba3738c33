//! Persistencia durable de checkpoints sobre SQLite (Diesel + r2d2).
//!
//! Expone `DieselCheckpointStore`, que implementa el trait
//! `flow::CheckpointStore` con semántica put-if-version dentro de una
//! transacción `IMMEDIATE`. La implementación está en
//! `checkpoint_persistence.rs`.

mod checkpoint_persistence;
pub mod schema;

pub use checkpoint_persistence::{new_from_env, DieselCheckpointStore, MIGRATIONS};

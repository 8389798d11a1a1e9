//! Domain layer types and invariants.

pub mod commands;
pub mod entities;
pub mod error;
pub mod identity;
pub mod types;

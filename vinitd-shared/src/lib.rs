//! Shared types for the vinitd workspace.

pub mod errors;

pub use errors::{VinitdError, VinitdResult};

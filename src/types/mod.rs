//! Shared types for the Platewatch client

pub mod error;

pub use error::{PlatewatchError, Result};

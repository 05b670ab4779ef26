//! Permission model types.
//!
//! This module contains:
//! - Identifiers and permission codes (`resource:operation`)
//! - Operations and permission levels for resource grants
//! - The resolved permission set of a subject

mod types;
#[cfg(test)]
mod types_proptest;

pub use types::*;

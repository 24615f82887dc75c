//! `casefile-core` — shared building blocks for the investigation platform.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the collected-finding record the
//! AI pipeline reads from.

pub mod error;
pub mod finding;
pub mod id;

pub use error::DomainError;
pub use finding::Finding;
pub use id::{FindingId, InvestigationId, JobId};

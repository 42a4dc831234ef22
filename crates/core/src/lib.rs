//! `estimator-core`: domain building blocks for the estimation backend.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the estimate record, and input validation.

pub mod error;
pub mod estimate;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use estimate::{
    Estimate, EstimateInput, EstimatePatch, EstimateStatus, EstimateUpdate, MaterialLine,
};
pub use id::{EstimateId, UserId};

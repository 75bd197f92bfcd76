//! Audit trail and divergence records.

pub mod audit;
pub mod records;

//! Scheduled and operator-triggered batch jobs.

pub mod revenue;

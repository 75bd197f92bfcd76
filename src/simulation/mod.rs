//! Simulation helpers: an in-memory asset network and random holder sets.

pub mod holdings;
pub mod network;

pub mod distribution;
pub mod largest_remainder;
pub mod split;

pub mod ids;
pub mod money;
pub mod nav;
pub mod pool;
pub mod project;

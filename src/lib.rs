pub mod queue;
pub mod shared;

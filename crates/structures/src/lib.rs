//! Small data structures shared across the workspace.

pub mod generational_pool;

pub use generational_pool::{GenerationalPool, Handle};

//! Background tasks.
//!
//! # Tasks
//!
//! - `sweeper` - Periodically removes idle sessions and idle empty rooms

pub mod sweeper;

pub use sweeper::{start_expiry_sweeper, SweeperConfig};

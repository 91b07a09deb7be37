//! Time keeping: deadlines and the timeout registry.

pub mod timeout;

pub use timeout::{clock_tick, current_time, Timeout, DEADLINE_NEVER};

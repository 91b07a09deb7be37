//! Abstract data types shared across the kernel.

pub mod btree;
pub mod list;

pub use list::{Link, List};

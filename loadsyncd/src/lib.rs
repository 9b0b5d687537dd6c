pub mod config;
pub mod sync;

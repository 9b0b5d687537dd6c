pub mod backup;
pub mod engine;
pub mod hash_cache;
pub mod loadout_store;
pub mod locations;
pub mod retry;
pub mod state_store;

#[cfg(test)]
mod engine_tests;

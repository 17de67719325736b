// Engine: resource identity, cache store, per-resource transfers and the coordinator.

pub mod cache;
pub mod coordinator;
pub mod key;
pub mod stats;
pub mod transfer;

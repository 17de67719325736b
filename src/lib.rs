pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod source;

pub use engine::coordinator::Coordinator;
pub use engine::key::{Resource, ResourceKey};
pub use error::FetchError;

// Host-facing surface: logging setup and the playback-adapter session.

pub mod loader;
pub mod simple;

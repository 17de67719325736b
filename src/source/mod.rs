// Network seam: pluggable fetch backends behind the `Fetcher` trait.

pub mod http_source;
pub mod traits;

// Resource identity: stable digest of a resource's canonical URL.

use std::fmt;

use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// Hex SHA-256 of a canonical URL. Names cache artifacts and keys the active-transfer map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn from_url(url: &Url) -> Self {
        let digest = Sha256::digest(url.as_str().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fetchable resource: its canonical address plus the derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    url: Url,
    key: ResourceKey,
}

impl Resource {
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let url = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::from_url(url))
    }

    pub fn from_url(url: Url) -> Self {
        let key = ResourceKey::from_url(&url);
        Self { url, key }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::Url;

use crate::config::RANGE_HEADER_PREFIX;
use crate::error::FetchError;

/// Outbound GET for one resource, optionally resuming at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub offset: u64,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(url: Url, offset: u64) -> Self {
        Self {
            url,
            offset,
            headers: Vec::new(),
        }
    }

    /// `bytes=<offset>-` when resuming, nothing for a fetch from the start.
    pub fn range_header(&self) -> Option<String> {
        (self.offset > 0).then(|| format!("{}{}-", RANGE_HEADER_PREFIX, self.offset))
    }
}

/// Response metadata, available before the first body byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
}

impl ResponseHead {
    /// Authoritative size of the whole resource: the `total` of a
    /// `<start>-<end>/<total>` content range when present, else the
    /// declared content length.
    pub fn total_length(&self) -> Option<u64> {
        match self.content_range.as_deref() {
            Some(range) => parse_content_range_total(range).or(self.content_length),
            None => self.content_length,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server honoured a range request.
    pub fn is_partial_content(&self) -> bool {
        self.status == 206
    }

    /// Media type without parameters, e.g. `video/mp4` for `video/mp4; codecs=...`.
    pub fn mime_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
    }
}

fn parse_content_range_total(range: &str) -> Option<u64> {
    range.rsplit('/').next()?.trim().parse::<u64>().ok()
}

pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

pub struct FetchResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue the request and return once response metadata is known.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

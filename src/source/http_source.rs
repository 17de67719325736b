use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use super::traits::{FetchRequest, FetchResponse, Fetcher, ResponseHead};
use crate::error::FetchError;

/// `Fetcher` backed by a shared reqwest client.
///
/// Extra headers travel on each [`FetchRequest`]; the coordinator fills them
/// from `EngineConfig::request_headers`.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Plain GET that always revalidates with the origin, plus the Range
    /// header when resuming.
    fn build_request(&self, request: &FetchRequest) -> RequestBuilder {
        let mut req = self
            .client
            .get(request.url.clone())
            .header(CACHE_CONTROL, "no-cache");
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = request.range_header() {
            req = req.header(RANGE, range);
        }
        req
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn response_head(resp: &Response) -> ResponseHead {
    let header = |name| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ResponseHead {
        status: resp.status().as_u16(),
        content_type: header(CONTENT_TYPE),
        content_length: header(CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| resp.content_length()),
        content_range: header(CONTENT_RANGE),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let resp = self.build_request(&request).send().await.map_err(|e| {
            warn!("http fetch failed url={} offset={}: {}", request.url, request.offset, e);
            FetchError::from(e)
        })?;

        let head = response_head(&resp);
        debug!(
            "http response url={} status={} type={:?} length={:?} range={:?}",
            request.url, head.status, head.content_type, head.content_length, head.content_range
        );

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Ok(FetchResponse { head, body })
    }
}

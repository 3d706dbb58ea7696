//! reqwest-backed request handler

use async_trait::async_trait;
use std::time::Duration;

use super::{RawResponse, RequestHandler};
use crate::providers::{ProviderError, ProviderResult};

pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(timeout: Duration) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RequestHandler for HttpRequestHandler {
    async fn do_request(&self, url: &str) -> ProviderResult<RawResponse> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Request(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Request(format!("Failed to read body: {}", e)))?;
        Ok(RawResponse { status, body })
    }
}

//! reqwest-backed client for the InfluxDB 1.x `/query` endpoint.
//!
//! Chunked queries (`chunked=true`) stream newline-delimited JSON
//! documents; [`HttpChunkStream`] splits the byte stream and decodes one
//! document per [`ChunkStream::next_response`] call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{ChunkStream, ClientFactory, QueryResponse, SourceClient, SourceParams, SourceQuery};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client with a connect timeout but no overall request deadline:
/// a chunked extraction legitimately runs for a long time.
fn create_http_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for one InfluxDB server.
#[derive(Debug)]
pub struct HttpInfluxClient {
    params: SourceParams,
    client: Client,
}

impl HttpInfluxClient {
    /// Creates a client for `params` without touching the network.
    #[must_use]
    pub fn new(params: SourceParams) -> Self {
        Self {
            client: create_http_client(),
            params,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.params.url.trim_end_matches('/'), path)
    }

    fn query_request(&self, query: &SourceQuery) -> reqwest::RequestBuilder {
        let mut request = self.client.get(self.endpoint("query")).query(&[
            ("db", query.database.as_str()),
            ("q", query.command.as_str()),
        ]);
        if let Some(rp) = &query.retention_policy {
            request = request.query(&[("rp", rp.as_str())]);
        }
        if let Some(username) = &self.params.username {
            request = request.basic_auth(username, self.params.password.as_deref());
        }
        request
    }

    /// Verifies the server is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceConnection`] if the server cannot be
    /// reached or answers the ping with a failure status.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("ping"))
            .send()
            .await
            .map_err(|e| {
                Error::SourceConnection(format!(
                    "could not reach the source at {}: {e}",
                    self.params.url
                ))
            })?;
        if !response.status().is_success() {
            return Err(Error::SourceConnection(format!(
                "source ping returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceClient for HttpInfluxClient {
    async fn query(&self, query: &SourceQuery) -> Result<QueryResponse> {
        debug!("source query: {}", query.command);
        let response = self
            .query_request(query)
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("query request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::SourceConnection(format!(
                "source returned {status}: {body}"
            )));
        }

        let decoded: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::Extraction(format!("failed to decode query response: {e}")))?;
        if let Some(message) = &decoded.error {
            return Err(Error::SourceConnection(format!("query rejected: {message}")));
        }
        Ok(decoded)
    }

    async fn query_chunked(&self, query: &SourceQuery) -> Result<Box<dyn ChunkStream>> {
        let chunk_size = query.chunk_size.to_string();
        let response = self
            .query_request(query)
            .query(&[("chunked", "true"), ("chunk_size", chunk_size.as_str())])
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("chunked query request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::SourceConnection(format!(
                "source returned {status}: {body}"
            )));
        }

        Ok(Box::new(HttpChunkStream::new(response)))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Streaming reader over the newline-delimited documents of a chunked
/// query response.
struct HttpChunkStream {
    response: Option<reqwest::Response>,
    buffer: Vec<u8>,
}

impl HttpChunkStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response: Some(response),
            buffer: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let position = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
        line.pop();
        Some(line)
    }
}

fn decode_chunk(line: &[u8]) -> Result<QueryResponse> {
    serde_json::from_slice(line)
        .map_err(|e| Error::Extraction(format!("failed to decode chunk: {e}")))
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_response(&mut self) -> Result<Option<QueryResponse>> {
        loop {
            if let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return decode_chunk(&line).map(Some);
            }

            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };
            match response.chunk().await {
                Ok(Some(bytes)) => self.buffer.extend_from_slice(&bytes),
                Ok(None) => {
                    self.response = None;
                    if self.buffer.iter().all(u8::is_ascii_whitespace) {
                        self.buffer.clear();
                        return Ok(None);
                    }
                    // Final document without a trailing newline.
                    let line = std::mem::take(&mut self.buffer);
                    return decode_chunk(&line).map(Some);
                }
                Err(e) => {
                    return Err(Error::SourceConnection(format!("chunk read failed: {e}")));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.response = None;
        self.buffer.clear();
        Ok(())
    }
}

/// Creates [`HttpInfluxClient`]s, pinging the server before handing one
/// out.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClientFactory;

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn connect(&self, params: &SourceParams) -> Result<Box<dyn SourceClient>> {
        let client = HttpInfluxClient::new(params.clone());
        client.ping().await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
#[path = "influx_tests.rs"]
mod tests;

//! services/client/src/adapters/http.rs
//!
//! This module contains the adapter for the generation API over HTTP.
//! It implements the `GenerationTransport` port from the `core` crate.

use async_trait::async_trait;
use futures::StreamExt;
use page_forge_core::ports::{
    ByteStream, GenerateRequest, GenerationTransport, PortError, PortResult, RegenerateRequest,
};
use page_forge_core::{RecordId, WorkItem};
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::runner::protocol::{
    GenerateBody, RecordBody, RegenerateBody, RegenerateReply, RetryBody, StopReply, WirePage,
};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `GenerationTransport` port with `reqwest`.
#[derive(Clone)]
pub struct HttpGenerationAdapter {
    client: Client,
    base_url: String,
}

impl HttpGenerationAdapter {
    /// Creates a new `HttpGenerationAdapter` rooted at `base_url` (e.g. `http://host/api`).
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> PortResult<Response> {
        let url = self.endpoint(path);
        debug!(%url, "POST");

        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e: reqwest::Error| PortError::Unexpected(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> PortResult<Response> {
        let response = self.send(path, body).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortError::Status(status.as_u16()));
        }
        Ok(response)
    }

    /// Posts `body` and hands back the response body as it arrives.
    async fn open_stream<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> PortResult<ByteStream> {
        let response = self.post(path, body).await?;
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| PortError::Unexpected(e.to_string())));
        Ok(Box::pin(chunks))
    }
}

//=========================================================================================
// `GenerationTransport` Trait Implementation
//=========================================================================================

#[async_trait]
impl GenerationTransport for HttpGenerationAdapter {
    async fn generate(&self, request: GenerateRequest) -> PortResult<ByteStream> {
        info!(
            record_id = %request.record_id,
            pages = request.pages.len(),
            "Requesting image generation"
        );
        self.open_stream("generate", &GenerateBody::from(&request)).await
    }

    async fn continue_generation(&self, record_id: &RecordId) -> PortResult<ByteStream> {
        info!(%record_id, "Requesting continued generation");
        self.open_stream("continue-generation", &RecordBody { record_id })
            .await
    }

    async fn retry_failed(
        &self,
        record_id: &RecordId,
        pages: Vec<WorkItem>,
    ) -> PortResult<ByteStream> {
        info!(%record_id, pages = pages.len(), "Requesting retry of failed images");
        let body = RetryBody {
            record_id,
            pages: pages.iter().map(WirePage::from).collect(),
        };
        self.open_stream("retry-failed", &body).await
    }

    async fn stop(&self, record_id: &RecordId) -> PortResult<()> {
        let reply: StopReply = self
            .post("stop-generation", &RecordBody { record_id })
            .await?
            .json()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if reply.success {
            info!(%record_id, "Stop requested");
            Ok(())
        } else {
            let reason = reply
                .error
                .or(reply.message)
                .unwrap_or_else(|| "server refused to stop".to_string());
            Err(PortError::Unexpected(reason))
        }
    }

    async fn regenerate(&self, request: RegenerateRequest) -> PortResult<String> {
        info!(
            record_id = %request.record_id,
            position = request.page.position,
            "Requesting a single image"
        );
        let response = self
            .send("regenerate", &RegenerateBody::from(&request))
            .await?;
        let status = response.status();

        // The failure reason travels in the body of the error response.
        let reply: RegenerateReply = match response.json().await {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => return Err(PortError::Status(status.as_u16())),
            Err(e) => return Err(PortError::Unexpected(e.to_string())),
        };

        match reply.image_url {
            Some(url) if reply.success => Ok(url),
            _ => {
                let reason = reply
                    .error
                    .unwrap_or_else(|| "server could not regenerate the image".to_string());
                warn!(index = ?reply.index, %reason, "Regenerate failed");
                Err(PortError::Unexpected(reason))
            }
        }
    }
}

//! crates/page_forge_core/src/ports.rs
//!
//! Defines the service contracts (traits) the core relies on.
//! These traits form the boundary of the hexagonal architecture: the core never
//! talks to the network or the disk directly, only through these ports.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;

use crate::domain::{Attachment, RecordId, WorkItem};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Server responded with status {0}")]
    Status(u16),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// The raw body of a streaming response, as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = PortResult<Bytes>> + Send>>;

//=========================================================================================
// Request types
//=========================================================================================

/// Which image the server should use as a style reference for content pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    Custom,
    Cover,
    Previous,
}

/// Everything the server needs to start generating images for a record.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub record_id: RecordId,
    pub pages: Vec<WorkItem>,
    pub full_outline: String,
    pub user_topic: String,
    pub attachments: Vec<Attachment>,
    pub reference_mode: Option<ReferenceMode>,
}

/// Asks for a fresh image of one page, outside any stream.
#[derive(Debug, Clone)]
pub struct RegenerateRequest {
    pub record_id: RecordId,
    pub page: WorkItem,
    pub full_outline: String,
    pub user_topic: String,
    pub reference_mode: ReferenceMode,
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// A process-local keyed store for cached session snapshots.
///
/// Writes are synchronous and uncoordinated; concurrent writers are last-write-wins.
pub trait SessionStore: Send + Sync {
    fn read(&self, key: &str) -> PortResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> PortResult<()>;
    fn remove(&self, key: &str) -> PortResult<()>;
}

#[async_trait]
pub trait GenerationTransport: Send + Sync {
    /// Starts generating every page of the request and streams progress back.
    async fn generate(&self, request: GenerateRequest) -> PortResult<ByteStream>;

    /// Resumes a stopped record; the server picks the pages still missing.
    async fn continue_generation(&self, record_id: &RecordId) -> PortResult<ByteStream>;

    /// Regenerates the given failed pages.
    async fn retry_failed(&self, record_id: &RecordId, pages: Vec<WorkItem>)
        -> PortResult<ByteStream>;

    /// Asks the server to stop. The active stream ends with a `stopped` event
    /// once the server has honoured the request.
    async fn stop(&self, record_id: &RecordId) -> PortResult<()>;

    /// Regenerates a single page and returns the new image's locator.
    async fn regenerate(&self, request: RegenerateRequest) -> PortResult<String>;
}

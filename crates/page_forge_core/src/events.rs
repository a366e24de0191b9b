//! crates/page_forge_core/src/events.rs
//!
//! The closed set of events a generation stream can carry.

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::decoder::{RawEvent, StreamError};
use crate::domain::{PageId, RecordId};

/// Which page an item-level event addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Index into the page order the server was given when the stream started.
    Position(usize),
    /// Server identity of the page.
    Page(PageId),
}

fn target(position: Option<i64>, page_id: Option<PageId>) -> Option<Target> {
    // Newer servers address pages by id, which is immune to reordering.
    if let Some(id) = page_id {
        return Some(Target::Page(id));
    }
    position
        .and_then(|p| usize::try_from(p).ok())
        .map(Target::Position)
}

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressNotice {
    #[serde(default, alias = "index")]
    pub position: Option<i64>,
    pub page_id: Option<PageId>,
    #[serde(default)]
    pub status: String,
    pub message: Option<String>,
    pub current: Option<u32>,
    pub total: Option<u32>,
    pub record_id: Option<RecordId>,
}

impl ProgressNotice {
    pub fn target(&self) -> Option<Target> {
        target(self.position, self.page_id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompleteNotice {
    #[serde(default, alias = "index")]
    pub position: Option<i64>,
    pub page_id: Option<PageId>,
    #[serde(default, alias = "url")]
    pub image_url: String,
}

impl CompleteNotice {
    pub fn target(&self) -> Option<Target> {
        target(self.position, self.page_id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailureNotice {
    #[serde(default, alias = "index")]
    pub position: Option<i64>,
    pub page_id: Option<PageId>,
    #[serde(default, alias = "error")]
    pub message: String,
    #[serde(default = "retryable_by_default")]
    pub retryable: bool,
}

fn retryable_by_default() -> bool {
    true
}

impl FailureNotice {
    pub fn target(&self) -> Option<Target> {
        target(self.position, self.page_id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoppedNotice {
    pub record_id: Option<RecordId>,
    pub task_id: Option<RecordId>,
    pub message: Option<String>,
    pub completed: Option<u32>,
    pub pending: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FinishNotice {
    pub record_id: Option<RecordId>,
    pub task_id: Option<RecordId>,
    pub success: Option<bool>,
    pub total: Option<u32>,
    pub completed: Option<u32>,
    pub failed: Option<u32>,
    #[serde(default)]
    pub failed_indices: Vec<usize>,
}

impl FinishNotice {
    /// The record the run belongs to. Generation streams call it `record_id`,
    /// continuation streams `task_id`.
    pub fn record(&self) -> Option<&RecordId> {
        self.record_id.as_ref().or(self.task_id.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryStartNotice {
    pub total: Option<u32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContinueStartNotice {
    pub task_id: Option<RecordId>,
    pub pending_count: Option<u32>,
    pub total: Option<u32>,
    pub completed: Option<u32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryFinishNotice {
    pub success: Option<bool>,
    pub total: Option<u32>,
    pub completed: Option<u32>,
    pub failed: Option<u32>,
}

//=========================================================================================
// The event type
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressNotice),
    Complete(CompleteNotice),
    Failed(FailureNotice),
    Stopped(StoppedNotice),
    Finish(FinishNotice),
    RetryStart(RetryStartNotice),
    ContinueStart(ContinueStartNotice),
    RetryFinish(RetryFinishNotice),
    /// An event name this client does not know. Ignored downstream.
    Unrecognized { name: String },
}

impl StreamEvent {
    /// Types a raw frame by its event name.
    pub fn from_raw(raw: RawEvent) -> Result<Self, StreamError> {
        let RawEvent { name, payload } = raw;
        let body = Value::Object(payload);

        match name.as_str() {
            "progress" => decode(&name, body).map(Self::Progress),
            "complete" => decode(&name, body).map(Self::Complete),
            "error" => decode(&name, body).map(Self::Failed),
            "stopped" => decode(&name, body).map(Self::Stopped),
            "finish" => decode(&name, body).map(Self::Finish),
            "retry_start" => decode(&name, body).map(Self::RetryStart),
            "continue_start" => decode(&name, body).map(Self::ContinueStart),
            "retry_finish" => decode(&name, body).map(Self::RetryFinish),
            _ => Ok(Self::Unrecognized { name }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Failed(_) => "error",
            Self::Stopped(_) => "stopped",
            Self::Finish(_) => "finish",
            Self::RetryStart(_) => "retry_start",
            Self::ContinueStart(_) => "continue_start",
            Self::RetryFinish(_) => "retry_finish",
            Self::Unrecognized { name } => name,
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, body: Value) -> Result<T, StreamError> {
    serde_json::from_value(body).map_err(|source| StreamError::Payload {
        event: name.to_string(),
        source,
    })
}

/// Types a raw event stream. Events whose payload does not fit their type are
/// logged and dropped; transport errors pass through unchanged.
pub fn typed_events<S>(raw: S) -> impl Stream<Item = Result<StreamEvent, StreamError>>
where
    S: Stream<Item = Result<RawEvent, StreamError>>,
{
    raw.filter_map(|item| async move {
        match item {
            Ok(raw) => match StreamEvent::from_raw(raw) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable event");
                    None
                }
            },
            Err(e) => Some(Err(e)),
        }
    })
}

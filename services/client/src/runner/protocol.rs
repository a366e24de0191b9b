//! services/client/src/runner/protocol.rs
//!
//! Defines the JSON request bodies the client sends to the generation API, and the
//! plain (non-streaming) replies it reads back.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use page_forge_core::{
    Attachment, GenerateRequest, PageId, PageKind, RecordId, ReferenceMode, RegenerateRequest,
    WorkItem,
};
use serde::{Deserialize, Serialize};

//=========================================================================================
// Request bodies
//=========================================================================================

/// A page as the server sees it. The client-side key never leaves the process.
#[derive(Serialize, Debug)]
pub struct WirePage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<PageId>,
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: PageKind,
    pub content: &'a str,
}

impl<'a> From<&'a WorkItem> for WirePage<'a> {
    fn from(page: &'a WorkItem) -> Self {
        Self {
            id: page.identity,
            index: page.position,
            kind: page.kind,
            content: &page.text,
        }
    }
}

/// Body of `POST /generate`.
#[derive(Serialize, Debug)]
pub struct GenerateBody<'a> {
    pub record_id: &'a RecordId,
    pub pages: Vec<WirePage<'a>>,
    pub full_outline: &'a str,
    pub user_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_mode: Option<ReferenceMode>,
}

impl<'a> From<&'a GenerateRequest> for GenerateBody<'a> {
    fn from(request: &'a GenerateRequest) -> Self {
        let user_images = if request.attachments.is_empty() {
            None
        } else {
            Some(request.attachments.iter().map(data_url).collect())
        };

        Self {
            record_id: &request.record_id,
            pages: request.pages.iter().map(WirePage::from).collect(),
            full_outline: &request.full_outline,
            user_topic: &request.user_topic,
            user_images,
            reference_mode: request.reference_mode,
        }
    }
}

/// Body of `POST /retry-failed`.
#[derive(Serialize, Debug)]
pub struct RetryBody<'a> {
    pub record_id: &'a RecordId,
    pub pages: Vec<WirePage<'a>>,
}

/// Body of `POST /regenerate`.
#[derive(Serialize, Debug)]
pub struct RegenerateBody<'a> {
    pub record_id: &'a RecordId,
    pub page: WirePage<'a>,
    pub use_reference: bool,
    pub full_outline: &'a str,
    pub user_topic: &'a str,
    pub reference_mode: ReferenceMode,
}

impl<'a> From<&'a RegenerateRequest> for RegenerateBody<'a> {
    fn from(request: &'a RegenerateRequest) -> Self {
        Self {
            record_id: &request.record_id,
            page: WirePage::from(&request.page),
            use_reference: true,
            full_outline: &request.full_outline,
            user_topic: &request.user_topic,
            reference_mode: request.reference_mode,
        }
    }
}

/// Body of `POST /continue-generation` and `POST /stop-generation`.
#[derive(Serialize, Debug)]
pub struct RecordBody<'a> {
    pub record_id: &'a RecordId,
}

/// Encodes an attachment the way a browser `FileReader` would.
pub fn data_url(attachment: &Attachment) -> String {
    format!("data:{};base64,{}", attachment.mime, STANDARD.encode(&attachment.bytes))
}

//=========================================================================================
// Replies
//=========================================================================================

/// Reply of `POST /stop-generation`.
#[derive(Deserialize, Debug)]
pub struct StopReply {
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Reply of `POST /regenerate`. Failures arrive with a 500 status and this body.
#[derive(Deserialize, Debug)]
pub struct RegenerateReply {
    #[serde(default)]
    pub success: bool,
    pub index: Option<usize>,
    pub image_url: Option<String>,
    pub error: Option<String>,
}

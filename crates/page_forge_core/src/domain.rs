//! crates/page_forge_core/src/domain.rs
//!
//! Defines the pure, core data structures for page generation.
//! These structs carry no I/O. The `position` fields on pages and images are a
//! derived render order; the identity that survives edits is the `ItemKey`.

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Separator used when flattening page texts into the outline document.
pub const PAGE_SEPARATOR: &str = "\n\n<page>\n\n";

/// Section markers of the metadata block that may precede the pages of an outline.
const TITLE_MARKER: &str = "【小红书标题】";
const BODY_MARKER: &str = "【小红书正文】";
const TAGS_MARKER: &str = "【小红书标签】";

//=========================================================================================
// Identities
//=========================================================================================

/// Client-side stable identity of a page, minted when the page is created.
///
/// Generated images are associated with pages through this key, so reordering
/// pages never requires recomputing a second collection's indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(Uuid);

impl ItemKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side identity of a persisted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub i64);

/// Identity of the history record a generation run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a finished generation task, bound when the stream reports `finish`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RecordId> for TaskId {
    fn from(record: RecordId) -> Self {
        Self(record.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//=========================================================================================
// Pages (work items)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Cover,
    #[default]
    Content,
    Summary,
}

impl PageKind {
    /// Maps a page tag such as `[cover]` (without brackets) to a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "cover" | "封面" => Some(Self::Cover),
            "content" | "内容" => Some(Self::Content),
            "summary" | "总结" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// A reference to an image record the server already holds for a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: i64,
    pub filename: String,
    pub thumbnail_filename: String,
}

/// One page of the outline, slated for image generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default)]
    pub key: ItemKey,
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub identity: Option<PageId>,
    #[serde(rename = "index", default)]
    pub position: usize,
    #[serde(rename = "type", default)]
    pub kind: PageKind,
    #[serde(rename = "content", default)]
    pub text: String,
    #[serde(rename = "image", default)]
    pub linked_image: Option<ImageRef>,
}

impl WorkItem {
    /// Creates an unpersisted page. Its position is assigned on insertion.
    pub fn new(kind: PageKind, text: impl Into<String>) -> Self {
        Self {
            key: ItemKey::new(),
            identity: None,
            position: 0,
            kind,
            text: text.into(),
            linked_image: None,
        }
    }

    pub fn with_identity(mut self, identity: PageId) -> Self {
        self.identity = Some(identity);
        self
    }
}

//=========================================================================================
// Images (generation results)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    #[default]
    Generating,
    Done,
    Error,
    Retrying,
}

impl ImageStatus {
    /// Parses a per-item status as it appears on the wire. Stream-level
    /// statuses such as `batch_start` return `None`.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "generating" => Some(Self::Generating),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

/// The outcome of generating one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(default)]
    pub key: ItemKey,
    #[serde(rename = "index", default)]
    pub position: usize,
    #[serde(rename = "url", default)]
    pub locator: String,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl GenerationResult {
    pub fn pending(key: ItemKey, position: usize) -> Self {
        Self {
            key,
            position,
            locator: String::new(),
            status: ImageStatus::Generating,
            error_detail: None,
            retryable: true,
        }
    }
}

//=========================================================================================
// Progress and session stage
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Generating,
    Done,
    Error,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(rename = "current")]
    pub completed: u32,
    pub total: u32,
    pub status: TaskStatus,
}

impl TaskProgress {
    /// Overwrites both counters, keeping `completed <= total`.
    pub fn set_counts(&mut self, completed: u32, total: u32) {
        self.total = total;
        self.completed = completed.min(total);
    }

    pub fn set_total(&mut self, total: u32) {
        self.set_counts(self.completed, total);
    }

    pub fn record_completion(&mut self) {
        self.completed = (self.completed + 1).min(self.total);
    }

    pub fn forget_completion(&mut self) {
        self.completed = self.completed.saturating_sub(1);
    }
}

/// Coarse UI phase. Variants are declared in the order the session advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Input,
    Outline,
    Generating,
    Result,
}

//=========================================================================================
// Outline
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutlineMetadata {
    pub title: String,
    pub content: String,
    pub tags: String,
}

impl OutlineMetadata {
    /// Extracts the title/body/tags sections of an outline, if any are present.
    pub fn extract(text: &str) -> Option<Self> {
        static TITLE: OnceLock<Regex> = OnceLock::new();
        static BODY: OnceLock<Regex> = OnceLock::new();
        static TAGS: OnceLock<Regex> = OnceLock::new();

        let metadata = Self {
            title: section(&TITLE, TITLE_MARKER, text),
            content: section(&BODY, BODY_MARKER, text),
            tags: section(&TAGS, TAGS_MARKER, text),
        };

        if metadata == Self::default() {
            None
        } else {
            Some(metadata)
        }
    }
}

fn section(cell: &OnceLock<Regex>, marker: &str, text: &str) -> String {
    let re = cell.get_or_init(|| {
        Regex::new(&format!(
            r"(?s){}\s*\n+(.*?)(?:\n+【|<page>|\z)",
            regex::escape(marker)
        ))
        .expect("section pattern is valid")
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// The user-authored outline: the ordered pages plus a flattened text cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Outline {
    /// Joined page texts. Derived from `pages`; never a source of truth.
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub pages: Vec<WorkItem>,
    #[serde(default)]
    pub metadata: Option<OutlineMetadata>,
}

impl Outline {
    /// Splits a generated outline into pages.
    ///
    /// Pages are separated by `<page>` (case-insensitive), or by `---` in
    /// older outlines. A leading `[cover]`-style tag selects the page kind;
    /// untagged pages are content pages. The metadata block is not a page.
    pub fn parse(text: &str) -> Self {
        static PAGE_SPLIT: OnceLock<Regex> = OnceLock::new();
        static KIND_TAG: OnceLock<Regex> = OnceLock::new();

        let page_split =
            PAGE_SPLIT.get_or_init(|| Regex::new(r"(?i)<page>").expect("page pattern is valid"));
        let kind_tag =
            KIND_TAG.get_or_init(|| Regex::new(r"^\[([^\]\s]+)\]").expect("tag pattern is valid"));

        let chunks: Vec<&str> = if page_split.is_match(text) {
            page_split.split(text).collect()
        } else {
            text.split("---").collect()
        };

        let pages = chunks
            .into_iter()
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .filter(|chunk| {
                ![TITLE_MARKER, BODY_MARKER, TAGS_MARKER]
                    .iter()
                    .any(|marker| chunk.contains(marker))
            })
            .map(|chunk| {
                let kind = kind_tag
                    .captures(chunk)
                    .and_then(|c| c.get(1))
                    .and_then(|m| PageKind::from_tag(m.as_str()))
                    .unwrap_or_default();
                WorkItem::new(kind, chunk)
            })
            .collect();

        let mut outline = Self {
            raw: text.to_string(),
            pages,
            metadata: OutlineMetadata::extract(text),
        };
        outline.reindex();
        outline
    }

    /// Rewrites page positions as the dense sequence `0..N-1`.
    pub fn reindex(&mut self) {
        for (position, page) in self.pages.iter_mut().enumerate() {
            page.position = position;
        }
    }

    /// Regenerates the flattened document from the ordered pages.
    pub fn sync_raw(&mut self) {
        self.raw = self
            .pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR);
    }
}

//=========================================================================================
// Session
//=========================================================================================

/// A reference image supplied by the user. Held in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

/// Everything one generation session owns.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub stage: Stage,
    pub topic: String,
    pub outline: Outline,
    pub progress: TaskProgress,
    /// Generation results keyed by the page they belong to.
    pub images: HashMap<ItemKey, GenerationResult>,
    /// Page order as last submitted to the server. Stream positions index this.
    pub dispatch: Vec<ItemKey>,
    pub task_id: Option<TaskId>,
    pub record_id: Option<RecordId>,
    pub attachments: Vec<Attachment>,
}

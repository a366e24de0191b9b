//! crates/page_forge_core/src/reconciler.rs
//!
//! The Generation Reconciler: the single owner of a session's pages, images and
//! progress.
//!
//! User edits (insert/delete/move/update) and stream events (progress, completion,
//! failure, finish, stop) both land here and are applied synchronously, one at a
//! time, in the order they arrive. Images hang off pages by `ItemKey`; positions on
//! both sides are rewritten together after every edit, so image N always belongs to
//! page N.
//!
//! Stream events address pages by the position the server was given. Those
//! positions are resolved through the dispatch order captured when the pages were
//! last submitted, so an edit made mid-stream (or between a stop and a continue)
//! never redirects a late event to the wrong page, and an event for a page
//! deleted since is dropped.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, PersistedSession, SessionCache};
use crate::domain::{
    Attachment, GenerationResult, ImageStatus, ItemKey, OutlineMetadata, PageId, PageKind,
    RecordId, SessionState, Stage, TaskId, TaskProgress, TaskStatus, WorkItem,
};
use crate::events::{StreamEvent, Target};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Position {position} is out of range for {len} pages")]
    PositionOutOfRange { position: usize, len: usize },
}

/// The ordered collections after an edit.
#[derive(Debug)]
pub struct Layout<'a> {
    pub pages: &'a [WorkItem],
    /// Images in page order. Pages without an image are skipped.
    pub images: Vec<&'a GenerationResult>,
}

/// What applying a stream event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// An image was updated.
    Updated,
    /// The event addressed a page that is not (or no longer) present.
    Ignored,
    /// A stream-level notice; nothing item-level changed.
    Notice,
    /// The stream has nothing more to say.
    Terminal(Terminal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Finished,
    Stopped,
    RetryFinished,
}

const INTERRUPTED_RETRY: &str = "retry did not complete";

struct CacheBinding {
    cache: SessionCache,
    key: CacheKey,
}

pub struct Reconciler {
    state: SessionState,
    /// Pages whose completion has already been counted.
    counted: HashSet<ItemKey>,
    /// What each `retrying` image showed before its retry began.
    retry_stash: HashMap<ItemKey, GenerationResult>,
    binding: Option<CacheBinding>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::from_state(SessionState::default())
    }

    /// Adopts a session. A retry that was still in flight when the state was
    /// captured can no longer finish, so its images come back as failed.
    pub fn from_state(state: SessionState) -> Self {
        let mut reconciler = Self {
            state,
            counted: HashSet::new(),
            retry_stash: HashMap::new(),
            binding: None,
        };
        reconciler.reindex();
        reconciler.counted = reconciler.done_keys();
        if reconciler.state.dispatch.is_empty() {
            reconciler.state.dispatch = reconciler.current_order();
        }
        for image in reconciler.state.images.values_mut() {
            if image.status == ImageStatus::Retrying {
                image.status = ImageStatus::Error;
                image.error_detail = Some(INTERRUPTED_RETRY.to_string());
            }
        }
        reconciler
    }

    //=====================================================================================
    // Persistence
    //=====================================================================================

    /// Persists every subsequent mutation under `key`.
    pub fn attach_cache(&mut self, cache: SessionCache, key: CacheKey) {
        self.binding = Some(CacheBinding { cache, key });
    }

    /// Loads the session cached under `key` and keeps persisting to it.
    /// Returns `None` when nothing usable is cached.
    pub fn restore(cache: SessionCache, key: CacheKey) -> Option<Self> {
        let snapshot = cache.load(&key)?;
        let mut reconciler = Self::from_state(snapshot.into_state());
        reconciler.attach_cache(cache, key);
        Some(reconciler)
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.binding.as_ref().map(|b| &b.key)
    }

    pub fn snapshot(&self) -> PersistedSession {
        PersistedSession::capture(&self.state)
    }

    fn persist(&self) {
        let Some(binding) = &self.binding else {
            return;
        };
        if let Err(e) = binding.cache.save(&binding.key, &self.state) {
            error!(key = %binding.key, error = %e, "Failed to cache session state");
        }
    }

    //=====================================================================================
    // Read access
    //=====================================================================================

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn pages(&self) -> &[WorkItem] {
        &self.state.outline.pages
    }

    pub fn progress(&self) -> &TaskProgress {
        &self.state.progress
    }

    /// Images in page order.
    pub fn images(&self) -> Vec<&GenerationResult> {
        self.pages()
            .iter()
            .filter_map(|page| self.state.images.get(&page.key))
            .collect()
    }

    pub fn image_at(&self, position: usize) -> Option<&GenerationResult> {
        let page = self.pages().get(position)?;
        self.state.images.get(&page.key)
    }

    pub fn layout(&self) -> Layout<'_> {
        Layout {
            pages: self.pages(),
            images: self.images(),
        }
    }

    //=====================================================================================
    // Session setup
    //=====================================================================================

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.state.topic = topic.into();
        self.persist();
    }

    /// Replaces the outline. Images of pages that are not part of the new
    /// outline are dropped.
    pub fn set_outline(
        &mut self,
        raw: impl Into<String>,
        pages: Vec<WorkItem>,
        metadata: Option<OutlineMetadata>,
    ) {
        self.state.outline.raw = raw.into();
        self.state.outline.pages = pages;
        self.state.outline.metadata = metadata;

        let keys: HashSet<ItemKey> = self.pages().iter().map(|p| p.key).collect();
        self.state.images.retain(|key, _| keys.contains(key));
        self.counted.retain(|key| keys.contains(key));

        self.reindex();
        self.advance_stage(Stage::Outline);
        self.persist();
    }

    /// Records the backend record this session now belongs to. A session cached
    /// as a draft moves to the record's cache entry.
    pub fn bind_record(&mut self, record_id: RecordId) {
        self.state.record_id = Some(record_id.clone());

        if let Some(binding) = &mut self.binding {
            if binding.key == CacheKey::Draft {
                if let Err(e) = binding.cache.evict(&CacheKey::Draft) {
                    warn!(error = %e, "Failed to clear draft cache entry");
                }
                binding.key = CacheKey::Record(record_id);
            }
        }
        self.persist();
    }

    pub fn attach_images(&mut self, attachments: Vec<Attachment>) {
        self.state.attachments.extend(attachments);
    }

    pub fn clear_attachments(&mut self) {
        self.state.attachments.clear();
    }

    //=====================================================================================
    // Edits
    //=====================================================================================

    /// Inserts a page right after `after`, or at the head when `after` is `None`.
    pub fn insert_after(
        &mut self,
        after: Option<usize>,
        kind: PageKind,
        text: impl Into<String>,
    ) -> Result<Layout<'_>, ReconcileError> {
        let at = match after {
            None => 0,
            Some(position) => {
                self.check_position(position)?;
                position + 1
            }
        };
        self.state
            .outline
            .pages
            .insert(at, WorkItem::new(kind, text));
        self.after_edit();
        Ok(self.layout())
    }

    pub fn append(&mut self, kind: PageKind, text: impl Into<String>) -> Layout<'_> {
        self.state.outline.pages.push(WorkItem::new(kind, text));
        self.after_edit();
        self.layout()
    }

    /// Removes the page at `position` together with its image.
    pub fn delete(&mut self, position: usize) -> Result<Layout<'_>, ReconcileError> {
        self.check_position(position)?;

        let removed = self.state.outline.pages.remove(position);
        self.state.images.remove(&removed.key);
        self.retry_stash.remove(&removed.key);
        if self.counted.remove(&removed.key) {
            self.state.progress.forget_completion();
        }
        let total = self.page_count();
        self.state.progress.set_total(total);

        debug!(position, "Deleted page");
        self.after_edit();
        Ok(self.layout())
    }

    /// Moves the page at `from` to `to`; its image moves with it.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<Layout<'_>, ReconcileError> {
        self.check_position(from)?;
        self.check_position(to)?;

        if from != to {
            let page = self.state.outline.pages.remove(from);
            self.state.outline.pages.insert(to, page);
            self.after_edit();
        }
        Ok(self.layout())
    }

    pub fn update_text(
        &mut self,
        position: usize,
        text: impl Into<String>,
    ) -> Result<Layout<'_>, ReconcileError> {
        self.check_position(position)?;
        self.state.outline.pages[position].text = text.into();
        self.after_edit();
        Ok(self.layout())
    }

    fn check_position(&self, position: usize) -> Result<(), ReconcileError> {
        let len = self.pages().len();
        if position < len {
            Ok(())
        } else {
            Err(ReconcileError::PositionOutOfRange { position, len })
        }
    }

    fn after_edit(&mut self) {
        self.reindex();
        self.state.outline.sync_raw();
        self.persist();
    }

    fn reindex(&mut self) {
        let SessionState {
            outline, images, ..
        } = &mut self.state;
        for (position, page) in outline.pages.iter_mut().enumerate() {
            page.position = position;
            if let Some(image) = images.get_mut(&page.key) {
                image.position = position;
            }
        }
    }

    //=====================================================================================
    // Stream-driven transitions
    //=====================================================================================

    /// Starts a run: every page gets a fresh `generating` image.
    pub fn begin(&mut self) {
        let total = self.page_count();
        self.state.progress = TaskProgress {
            completed: 0,
            total,
            status: TaskStatus::Generating,
        };
        self.state.images = self
            .pages()
            .iter()
            .map(|page| (page.key, GenerationResult::pending(page.key, page.position)))
            .collect();
        self.counted.clear();
        self.retry_stash.clear();
        self.state.dispatch = self.current_order();
        self.advance_stage(Stage::Generating);

        info!(pages = total, "Generation started");
        self.persist();
    }

    /// Applies an item status reported by the stream for `position`.
    /// Returns `false` when no image is addressed.
    pub fn on_progress(
        &mut self,
        position: usize,
        status: ImageStatus,
        locator: Option<String>,
        error: Option<String>,
    ) -> bool {
        match self.key_for(Target::Position(position)) {
            Some(key) => self.update_image(key, status, locator, error, None),
            None => {
                debug!(position, "Ignoring update beyond the dispatched pages");
                false
            }
        }
    }

    /// Like `on_progress`, for servers that address pages by their id.
    pub fn on_progress_by_id(
        &mut self,
        page_id: PageId,
        status: ImageStatus,
        locator: Option<String>,
        error: Option<String>,
    ) -> bool {
        match self.key_for(Target::Page(page_id)) {
            Some(key) => self.update_image(key, status, locator, error, None),
            None => {
                debug!(page_id = page_id.0, "Ignoring update for an unknown page id");
                false
            }
        }
    }

    /// Marks the image the stream addresses at `position` as being retried.
    pub fn on_retry_start(&mut self, position: usize) -> bool {
        match self.key_for(Target::Position(position)) {
            Some(key) => self.update_image(key, ImageStatus::Retrying, None, None, None),
            None => false,
        }
    }

    /// Marks every failed image as retrying and returns the pages to resubmit.
    /// The submitted order becomes the dispatch order.
    pub fn retry_failed(&mut self) -> Vec<WorkItem> {
        let failed: Vec<WorkItem> = self.failed_pages().into_iter().cloned().collect();
        for page in &failed {
            self.mark_retrying(page.key);
        }
        self.state.dispatch = self.current_order();

        info!(pages = failed.len(), "Retrying failed images");
        self.persist();
        failed
    }

    /// Marks the image at the current `position` as being regenerated on its own
    /// and returns the page to submit.
    pub fn mark_regenerating(&mut self, position: usize) -> Result<WorkItem, ReconcileError> {
        self.check_position(position)?;
        let page = self.pages()[position].clone();
        self.state
            .images
            .entry(page.key)
            .or_insert_with(|| GenerationResult::pending(page.key, position));
        self.mark_retrying(page.key);

        debug!(position, "Regenerating image");
        self.persist();
        Ok(page)
    }

    /// Ends an in-flight retry that will not report back. Every `retrying` image
    /// returns to what it showed before the retry; one that had no outcome yet
    /// is marked failed with `reason`. Returns how many images were settled.
    pub fn abort_retry(&mut self, reason: &str) -> usize {
        let retrying: Vec<ItemKey> = self
            .state
            .images
            .iter()
            .filter(|(_, image)| image.status == ImageStatus::Retrying)
            .map(|(key, _)| *key)
            .collect();

        for key in &retrying {
            let previous = self
                .retry_stash
                .remove(key)
                .filter(|image| matches!(image.status, ImageStatus::Done | ImageStatus::Error));
            let Some(image) = self.state.images.get_mut(key) else {
                continue;
            };
            match previous {
                Some(previous) => {
                    image.status = previous.status;
                    image.locator = previous.locator;
                    image.error_detail = previous.error_detail;
                    image.retryable = previous.retryable;
                }
                None => {
                    image.status = ImageStatus::Error;
                    image.error_detail = Some(reason.to_string());
                }
            }
        }

        if !retrying.is_empty() {
            warn!(images = retrying.len(), reason, "Retry ended without a result");
            self.persist();
        }
        retrying.len()
    }

    fn mark_retrying(&mut self, key: ItemKey) {
        let Some(image) = self.state.images.get_mut(&key) else {
            return;
        };
        if image.status != ImageStatus::Retrying {
            self.retry_stash.insert(key, image.clone());
        }
        image.status = ImageStatus::Retrying;
        image.error_detail = None;
    }

    /// Resumes a paused run (or one cut short by a transport failure).
    pub fn resume(&mut self) -> bool {
        match self.state.progress.status {
            TaskStatus::Paused | TaskStatus::Error => {
                self.state.progress.status = TaskStatus::Generating;
                self.counted = self.done_keys();
                info!("Generation resumed");
                self.persist();
                true
            }
            status => {
                debug!(?status, "Resume ignored");
                false
            }
        }
    }

    /// Marks the run finished and binds the task identity, when one is known.
    pub fn finish(&mut self, task_id: Option<TaskId>) -> bool {
        match self.state.progress.status {
            TaskStatus::Generating | TaskStatus::Paused | TaskStatus::Done => {
                self.state.progress.status = TaskStatus::Done;
                if task_id.is_some() {
                    self.state.task_id = task_id;
                }
                self.advance_stage(Stage::Result);
                info!(
                    completed = self.state.progress.completed,
                    total = self.state.progress.total,
                    "Generation finished"
                );
                self.persist();
                true
            }
            status => {
                debug!(?status, "Finish ignored");
                false
            }
        }
    }

    /// Pauses the run.
    ///
    /// Images still `generating` stay `generating`: the server may or may not have
    /// completed them before the stop took effect, and nothing on the client can
    /// tell which. A later continue pass treats every non-`done` image as pending.
    pub fn stop(&mut self) -> bool {
        if self.state.progress.status != TaskStatus::Generating {
            debug!(status = ?self.state.progress.status, "Stop ignored");
            return false;
        }
        self.state.progress.status = TaskStatus::Paused;
        info!("Generation paused");
        self.persist();
        true
    }

    /// Records a stream-level failure. Progress already applied is kept.
    pub fn fail(&mut self, reason: &str) -> bool {
        if self.state.progress.status != TaskStatus::Generating {
            return false;
        }
        self.state.progress.status = TaskStatus::Error;
        warn!(reason, "Generation stream failed");
        self.persist();
        true
    }

    /// Installs a single regenerated image for the page at `position`.
    pub fn replace_image(
        &mut self,
        position: usize,
        locator: &str,
    ) -> Result<&GenerationResult, ReconcileError> {
        self.check_position(position)?;
        let key = self.pages()[position].key;

        let separator = if locator.contains('?') { '&' } else { '?' };
        let busted = format!("{locator}{separator}t={}", Utc::now().timestamp_millis());

        let image = self
            .state
            .images
            .entry(key)
            .or_insert_with(|| GenerationResult::pending(key, position));
        image.locator = busted;
        image.status = ImageStatus::Done;
        image.error_detail = None;
        self.retry_stash.remove(&key);

        if self.counted.insert(key) {
            self.state.progress.record_completion();
        }
        self.persist();
        Ok(&self.state.images[&key])
    }

    /// Clears the session back to an empty draft and evicts its cache entry.
    pub fn reset(&mut self) {
        self.state = SessionState::default();
        self.counted.clear();
        self.retry_stash.clear();

        if let Some(binding) = &mut self.binding {
            if let Err(e) = binding.cache.evict(&binding.key) {
                warn!(key = %binding.key, error = %e, "Failed to clear cached session state");
            }
            binding.key = CacheKey::Draft;
        }
        info!("Session reset");
    }

    //=====================================================================================
    // Event dispatch
    //=====================================================================================

    /// Applies one decoded stream event.
    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        match event {
            StreamEvent::Progress(notice) => {
                match (notice.target(), ImageStatus::from_wire(&notice.status)) {
                    (Some(target), Some(status)) => self.update_target(target, status, None, None, None),
                    _ => {
                        debug!(
                            status = %notice.status,
                            message = notice.message.as_deref().unwrap_or_default(),
                            "Stream progress notice"
                        );
                        Applied::Notice
                    }
                }
            }
            StreamEvent::Complete(notice) => match notice.target() {
                Some(target) => {
                    self.update_target(target, ImageStatus::Done, Some(notice.image_url), None, None)
                }
                None => Applied::Ignored,
            },
            StreamEvent::Failed(notice) => match notice.target() {
                Some(target) => self.update_target(
                    target,
                    ImageStatus::Error,
                    None,
                    Some(notice.message),
                    Some(notice.retryable),
                ),
                None => {
                    warn!(message = %notice.message, "Stream reported a failure for no page");
                    Applied::Notice
                }
            },
            StreamEvent::Stopped(notice) => {
                info!(
                    completed = notice.completed,
                    pending = notice.pending,
                    "Server stopped generation"
                );
                self.stop();
                Applied::Terminal(Terminal::Stopped)
            }
            StreamEvent::Finish(notice) => {
                let task_id = notice
                    .record()
                    .or(self.state.record_id.as_ref())
                    .cloned()
                    .map(TaskId::from);
                if !notice.failed_indices.is_empty() {
                    info!(failed = ?notice.failed_indices, "Some pages failed to generate");
                }
                self.finish(task_id);
                Applied::Terminal(Terminal::Finished)
            }
            StreamEvent::RetryStart(notice) => {
                info!(total = notice.total, "Server started retrying");
                Applied::Notice
            }
            StreamEvent::ContinueStart(notice) => {
                self.resume();
                self.sync_counts(notice.completed, notice.total);
                info!(pending = notice.pending_count, "Server continued generation");
                Applied::Notice
            }
            StreamEvent::RetryFinish(notice) => {
                info!(
                    completed = notice.completed,
                    failed = notice.failed,
                    "Server finished retrying"
                );
                self.abort_retry("no result reported for this page");
                Applied::Terminal(Terminal::RetryFinished)
            }
            StreamEvent::Unrecognized { name } => {
                debug!(event = %name, "Ignoring unrecognized event");
                Applied::Ignored
            }
        }
    }

    fn update_target(
        &mut self,
        target: Target,
        status: ImageStatus,
        locator: Option<String>,
        error: Option<String>,
        retryable: Option<bool>,
    ) -> Applied {
        let updated = match self.key_for(target) {
            Some(key) => self.update_image(key, status, locator, error, retryable),
            None => false,
        };
        if updated {
            Applied::Updated
        } else {
            debug!(?target, "Ignoring event for a page that is no longer present");
            Applied::Ignored
        }
    }

    fn key_for(&self, target: Target) -> Option<ItemKey> {
        match target {
            Target::Position(position) => self.state.dispatch.get(position).copied(),
            Target::Page(id) => self
                .pages()
                .iter()
                .find(|page| page.identity == Some(id))
                .map(|page| page.key),
        }
    }

    fn update_image(
        &mut self,
        key: ItemKey,
        status: ImageStatus,
        locator: Option<String>,
        error: Option<String>,
        retryable: Option<bool>,
    ) -> bool {
        if status == ImageStatus::Retrying {
            self.mark_retrying(key);
            self.persist();
            return self.state.images.contains_key(&key);
        }
        let Some(image) = self.state.images.get_mut(&key) else {
            return false;
        };
        self.retry_stash.remove(&key);
        image.status = status;
        if let Some(locator) = locator {
            image.locator = locator;
        }
        image.error_detail = if status == ImageStatus::Error { error } else { None };
        if let Some(retryable) = retryable {
            image.retryable = retryable;
        }

        if status == ImageStatus::Done && self.counted.insert(key) {
            self.state.progress.record_completion();
        }
        self.persist();
        true
    }

    /// Adopts the counters a continuation stream reports.
    fn sync_counts(&mut self, completed: Option<u32>, total: Option<u32>) {
        let total = total.unwrap_or(self.state.progress.total);
        let completed = completed.unwrap_or(self.counted.len() as u32);
        self.state.progress.set_counts(completed, total);
        self.persist();
    }

    //=====================================================================================
    // Derived queries
    //=====================================================================================

    /// Pages without a `done` image.
    pub fn pending_pages(&self) -> Vec<&WorkItem> {
        self.pages()
            .iter()
            .filter(|page| {
                self.state
                    .images
                    .get(&page.key)
                    .map_or(true, |image| image.status != ImageStatus::Done)
            })
            .collect()
    }

    /// Pages whose image failed.
    pub fn failed_pages(&self) -> Vec<&WorkItem> {
        self.pages()
            .iter()
            .filter(|page| {
                self.state
                    .images
                    .get(&page.key)
                    .is_some_and(|image| image.status == ImageStatus::Error)
            })
            .collect()
    }

    pub fn failed_results(&self) -> Vec<&GenerationResult> {
        self.images()
            .into_iter()
            .filter(|image| image.status == ImageStatus::Error)
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.state
            .images
            .values()
            .any(|image| image.status == ImageStatus::Error)
    }

    //=====================================================================================
    // Helpers
    //=====================================================================================

    fn page_count(&self) -> u32 {
        self.pages().len() as u32
    }

    fn current_order(&self) -> Vec<ItemKey> {
        self.pages().iter().map(|page| page.key).collect()
    }

    fn done_keys(&self) -> HashSet<ItemKey> {
        self.state
            .images
            .values()
            .filter(|image| image.status == ImageStatus::Done)
            .map(|image| image.key)
            .collect()
    }

    fn advance_stage(&mut self, stage: Stage) {
        if stage > self.state.stage {
            self.state.stage = stage;
        }
    }
}

//! services/client/src/runner/generation_task.rs
//!
//! The asynchronous "worker" side of a generation run: it opens a stream through
//! the transport and feeds every decoded event into the session's `Reconciler`,
//! one at a time, in arrival order.

use futures::{pin_mut, Stream, StreamExt};
use page_forge_core::ports::{ByteStream, GenerateRequest, ReferenceMode, RegenerateRequest};
use page_forge_core::reconciler::{Applied, Terminal};
use page_forge_core::{
    decode_stream, typed_events, CacheKey, FrameCodec, GenerationResult, RecordId, Reconciler,
    StreamError, StreamEvent, TaskStatus,
};
use std::path::Path;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use crate::runner::state::AppState;

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Finished,
    Stopped,
    RetryFinished,
    /// The transport closed before any terminal event arrived.
    Closed,
}

impl From<Terminal> for StreamOutcome {
    fn from(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Finished => Self::Finished,
            Terminal::Stopped => Self::Stopped,
            Terminal::RetryFinished => Self::RetryFinished,
        }
    }
}

const STREAM_CLOSED: &str = "stream closed before completion";

/// Decodes and types a transport byte stream.
pub fn event_stream(bytes: ByteStream) -> impl Stream<Item = Result<StreamEvent, StreamError>> {
    typed_events(decode_stream(bytes))
}

/// Applies `events` to `reconciler` until a terminal event or the end of the stream.
///
/// A transport failure marks the run failed and is returned; everything applied
/// before it stays applied. A stream that closes without a terminal event is
/// marked failed too, so it can be continued later. Either way, images still
/// waiting on a retry are settled.
pub async fn run_stream<S>(events: S, reconciler: &mut Reconciler) -> Result<StreamOutcome, ClientError>
where
    S: Stream<Item = Result<StreamEvent, StreamError>>,
{
    pin_mut!(events);
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Generation stream failed");
                let reason = e.to_string();
                reconciler.fail(&reason);
                reconciler.abort_retry(&reason);
                return Err(e.into());
            }
        };

        let name = event.name().to_string();
        match reconciler.apply(event) {
            Applied::Terminal(terminal) => {
                info!(event = %name, "Generation stream ended");
                return Ok(terminal.into());
            }
            Applied::Ignored => debug!(event = %name, "Event had no effect"),
            Applied::Updated | Applied::Notice => {}
        }
    }

    warn!("Generation stream closed without a terminal event");
    reconciler.fail(STREAM_CLOSED);
    reconciler.abort_retry(STREAM_CLOSED);
    Ok(StreamOutcome::Closed)
}

//=========================================================================================
// Generator
//=========================================================================================

/// Drives generation runs for sessions against the configured transport and cache.
#[derive(Clone)]
pub struct Generator {
    state: AppState,
}

impl Generator {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Restores the session cached under `key`, or starts an empty one bound to it.
    pub fn open_session(&self, key: CacheKey) -> Reconciler {
        if let Some(reconciler) = Reconciler::restore(self.state.cache.clone(), key.clone()) {
            return reconciler;
        }
        debug!(%key, "No cached session; starting fresh");
        let mut reconciler = Reconciler::new();
        reconciler.attach_cache(self.state.cache.clone(), key.clone());
        if let CacheKey::Record(record_id) = key {
            reconciler.bind_record(record_id);
        }
        reconciler
    }

    /// Generates every page of the session from scratch.
    pub async fn generate(
        &self,
        reconciler: &mut Reconciler,
        reference_mode: Option<ReferenceMode>,
    ) -> Result<StreamOutcome, ClientError> {
        let record_id = bound_record(reconciler)?;
        if reconciler.pages().is_empty() {
            return Err(ClientError::Internal("the outline has no pages".to_string()));
        }

        reconciler.begin();
        let session = reconciler.state();
        let request = GenerateRequest {
            record_id,
            pages: session.outline.pages.clone(),
            full_outline: session.outline.raw.clone(),
            user_topic: session.topic.clone(),
            attachments: session.attachments.clone(),
            reference_mode,
        };

        let opened = self.state.transport.generate(request).await;
        self.pump(opened, reconciler).await
    }

    /// Resumes a paused (or interrupted) run; the server regenerates what is missing.
    pub async fn continue_generation(
        &self,
        reconciler: &mut Reconciler,
    ) -> Result<StreamOutcome, ClientError> {
        let record_id = bound_record(reconciler)?;
        if reconciler.pending_pages().is_empty() {
            info!(%record_id, "Nothing left to generate");
            reconciler.finish(None);
            return Ok(StreamOutcome::Finished);
        }

        reconciler.resume();
        let opened = self.state.transport.continue_generation(&record_id).await;
        self.pump(opened, reconciler).await
    }

    /// Regenerates every failed image.
    pub async fn retry_failed(
        &self,
        reconciler: &mut Reconciler,
    ) -> Result<StreamOutcome, ClientError> {
        let record_id = bound_record(reconciler)?;
        let pages = reconciler.retry_failed();
        if pages.is_empty() {
            info!(%record_id, "No failed images to retry");
            return Ok(StreamOutcome::RetryFinished);
        }

        let opened = self.state.transport.retry_failed(&record_id, pages).await;
        self.pump(opened, reconciler).await
    }

    /// Regenerates the image at `position` on its own. On failure the page keeps
    /// the image it had before.
    pub async fn regenerate(
        &self,
        reconciler: &mut Reconciler,
        position: usize,
        reference_mode: ReferenceMode,
    ) -> Result<GenerationResult, ClientError> {
        let record_id = bound_record(reconciler)?;
        let page = reconciler.mark_regenerating(position)?;
        let session = reconciler.state();
        let request = RegenerateRequest {
            record_id,
            page,
            full_outline: session.outline.raw.clone(),
            user_topic: session.topic.clone(),
            reference_mode,
        };

        match self.state.transport.regenerate(request).await {
            Ok(locator) => Ok(reconciler.replace_image(position, &locator)?.clone()),
            Err(e) => {
                error!(position, error = %e, "Failed to regenerate image");
                reconciler.abort_retry(&e.to_string());
                Err(e.into())
            }
        }
    }

    /// Asks the server to stop generating for `record_id`. The stream of the run
    /// being stopped ends with a `stopped` event.
    pub async fn stop(&self, record_id: &RecordId) -> Result<(), ClientError> {
        self.state.transport.stop(record_id).await?;
        Ok(())
    }

    /// Feeds a captured stream from disk through the session, as if it had just
    /// arrived from the server in response to a fresh run.
    pub async fn replay(
        &self,
        capture: impl AsRef<Path>,
        reconciler: &mut Reconciler,
    ) -> Result<StreamOutcome, ClientError> {
        let file = tokio::fs::File::open(capture.as_ref()).await?;
        info!(path = %capture.as_ref().display(), "Replaying captured stream");

        if reconciler.progress().status != TaskStatus::Generating {
            reconciler.begin();
        }
        run_stream(typed_events(FramedRead::new(file, FrameCodec::new())), reconciler).await
    }

    async fn pump(
        &self,
        opened: page_forge_core::PortResult<ByteStream>,
        reconciler: &mut Reconciler,
    ) -> Result<StreamOutcome, ClientError> {
        match opened {
            Ok(bytes) => run_stream(event_stream(bytes), reconciler).await,
            Err(e) => {
                error!(error = %e, "Failed to open generation stream");
                let reason = e.to_string();
                reconciler.fail(&reason);
                reconciler.abort_retry(&reason);
                Err(e.into())
            }
        }
    }
}

fn bound_record(reconciler: &Reconciler) -> Result<RecordId, ClientError> {
    reconciler
        .state()
        .record_id
        .clone()
        .ok_or_else(|| ClientError::Internal("the session is not bound to a record".to_string()))
}

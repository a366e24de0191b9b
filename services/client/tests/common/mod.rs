//! Shared harness for runner integration tests.
//!
//! `ScriptedTransport` answers each transport call with the next queued script and
//! records what it was asked for. Streams are delivered in deliberately ragged
//! chunks so decoding never depends on chunk boundaries.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use client_lib::{
    adapters::MemorySessionStore,
    config::Config,
    runner::{AppState, Generator},
};
use futures::stream;
use page_forge_core::ports::{
    ByteStream, GenerateRequest, GenerationTransport, PortError, PortResult, RegenerateRequest,
};
use page_forge_core::{CacheKey, Outline, RecordId, Reconciler, SessionCache, WorkItem};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RECORD: &str = "rec-1";

/// What the transport does for one call.
pub enum Script {
    Stream(Vec<PortResult<Bytes>>),
    /// A single regenerated image at this locator.
    Image(String),
    Refuse(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Generate { record_id: String, pages: usize },
    Continue(String),
    Retry { record_id: String, positions: Vec<usize> },
    Stop(String),
    Regenerate { record_id: String, position: usize },
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next_script(&self, call: Call) -> PortResult<Script> {
        self.calls.lock().unwrap().push(call);
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Refuse(status)) => Err(PortError::Status(status)),
            Some(script) => Ok(script),
            None => Err(PortError::Unexpected("no script queued".to_string())),
        }
    }

    fn answer(&self, call: Call) -> PortResult<ByteStream> {
        match self.next_script(call)? {
            Script::Stream(chunks) => Ok(Box::pin(stream::iter(chunks))),
            _ => Err(PortError::Unexpected("expected a stream script".to_string())),
        }
    }
}

#[async_trait]
impl GenerationTransport for ScriptedTransport {
    async fn generate(&self, request: GenerateRequest) -> PortResult<ByteStream> {
        self.answer(Call::Generate {
            record_id: request.record_id.to_string(),
            pages: request.pages.len(),
        })
    }

    async fn continue_generation(&self, record_id: &RecordId) -> PortResult<ByteStream> {
        self.answer(Call::Continue(record_id.to_string()))
    }

    async fn retry_failed(&self, record_id: &RecordId, pages: Vec<WorkItem>) -> PortResult<ByteStream> {
        self.answer(Call::Retry {
            record_id: record_id.to_string(),
            positions: pages.iter().map(|p| p.position).collect(),
        })
    }

    async fn stop(&self, record_id: &RecordId) -> PortResult<()> {
        self.calls.lock().unwrap().push(Call::Stop(record_id.to_string()));
        Ok(())
    }

    async fn regenerate(&self, request: RegenerateRequest) -> PortResult<String> {
        let call = Call::Regenerate {
            record_id: request.record_id.to_string(),
            position: request.page.position,
        };
        match self.next_script(call)? {
            Script::Image(locator) => Ok(locator),
            _ => Err(PortError::Unexpected("expected an image script".to_string())),
        }
    }
}

/// Cuts `wire` into chunks of uneven sizes, splitting lines, markers and
/// multi-byte characters alike.
pub fn ragged(wire: &str) -> Vec<PortResult<Bytes>> {
    const SIZES: [usize; 6] = [1, 7, 3, 13, 2, 29];
    let bytes = wire.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while start < bytes.len() {
        let end = (start + SIZES[i % SIZES.len()]).min(bytes.len());
        chunks.push(Ok(Bytes::copy_from_slice(&bytes[start..end])));
        start = end;
        i += 1;
    }
    chunks
}

/// Builds one `event:`/`data:` frame.
pub fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

pub struct Harness {
    pub generator: Generator,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemorySessionStore>,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        let transport = ScriptedTransport::new(scripts);
        let store = Arc::new(MemorySessionStore::new());
        let config = Config {
            server_url: "http://127.0.0.1:12398/api".to_string(),
            cache_dir: PathBuf::from("./unused"),
            log_level: tracing::Level::DEBUG,
            request_timeout: Duration::from_secs(5),
        };
        let generator = Generator::new(AppState {
            config: Arc::new(config),
            transport: transport.clone(),
            cache: SessionCache::new(store.clone()),
        });
        Self {
            generator,
            transport,
            store,
        }
    }

    /// A session with the given outline, bound to `RECORD`.
    pub fn session(&self, outline: &str) -> Reconciler {
        let parsed = Outline::parse(outline);
        let mut reconciler = self.generator.open_session(CacheKey::Draft);
        reconciler.set_topic("weekend trip");
        reconciler.set_outline(parsed.raw, parsed.pages, parsed.metadata);
        reconciler.bind_record(RecordId::new(RECORD));
        reconciler
    }

    pub fn restore(&self) -> Reconciler {
        Reconciler::restore(self.generator.state().cache.clone(), CacheKey::Record(RecordId::new(RECORD)))
            .expect("session cached under the record")
    }
}

pub const THREE_PAGES: &str = "[cover]\nWeekend trip\n<page>\n[content]\nWhere to go\n<page>\n[summary]\nSee you there";

pub mod cache;
pub mod decoder;
pub mod domain;
pub mod events;
pub mod ports;
pub mod reconciler;

pub use cache::{CacheKey, PersistedSession, SessionCache};
pub use decoder::{decode_stream, EventDecoder, FrameCodec, RawEvent, StreamError};
pub use domain::{
    Attachment, GenerationResult, ImageStatus, ItemKey, Outline, OutlineMetadata, PageId,
    PageKind, RecordId, SessionState, Stage, TaskId, TaskProgress, TaskStatus, WorkItem,
};
pub use events::{typed_events, StreamEvent, Target};
pub use ports::{
    ByteStream, GenerateRequest, GenerationTransport, PortError, PortResult, ReferenceMode,
    RegenerateRequest, SessionStore,
};
pub use reconciler::{Applied, Layout, ReconcileError, Reconciler, Terminal};

pub mod generation_task;
pub mod protocol;
pub mod state;

pub use generation_task::{event_stream, run_stream, Generator, StreamOutcome};
pub use state::AppState;

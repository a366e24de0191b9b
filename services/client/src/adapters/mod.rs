pub mod file_store;
pub mod http;
pub mod memory_store;

pub use file_store::FileSessionStore;
pub use http::HttpGenerationAdapter;
pub use memory_store::MemorySessionStore;

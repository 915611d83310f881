pub mod metadata;
pub mod storage;
pub mod store;

pub use metadata::RecordSummary;
pub use storage::{FileHistoryBackend, MemoryHistoryBackend};
pub use store::{export_document, HistoryStore, DOCUMENT_EXTENSION};

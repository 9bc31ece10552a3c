pub mod database;
pub mod error;
pub mod index;
pub mod message_log;
pub mod row_helpers;
pub mod schema;
pub mod search;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use index::{MetadataIndex, SearchHit, Session, SessionPatch, SessionStatus};
pub use message_log::MessageLog;
pub use search::SearchEngine;
pub use store::{CreateSession, ExportFormat, SessionStore};

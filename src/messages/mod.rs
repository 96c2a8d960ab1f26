pub mod storage;
pub mod types;

pub use storage::SessionStore;
pub use types::{HistoryEntry, Role, Session, SessionSummary};

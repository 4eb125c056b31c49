//! Resume capability for upload sessions
//!
//! Provides persistent session state with atomic writes and file locking.

pub mod cache;
pub mod lock;
pub mod state;

pub use cache::ResumeCache;
pub use lock::CacheLock;
pub use state::{ResumeError, SeenInput, SessionState};

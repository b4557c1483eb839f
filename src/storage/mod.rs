//! Local persistence: the key/value collaborator and the two stores built on it.

pub mod kv;
pub mod progress;
pub mod session;

pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use progress::{ProgressEvent, ProgressStore, CLOUD_FILE, LOCAL_FILE};
pub use session::{Session, SessionStore, SESSION_FILE};

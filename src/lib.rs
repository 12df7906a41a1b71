//! memori - conversational memory layer for LLM applications
//!
//! Records every prompt/response pair, distills each exchange into a
//! structured searchable memory, and re-injects relevant prior memories
//! into subsequent prompts. Context arrives in two modes: *conscious*
//! (one-shot working-set priming per session) and *auto* (per-call dynamic
//! retrieval).

pub mod config;
pub mod conscious;
pub mod coordinator;
pub mod error;
pub mod inject;
pub mod intercept;
pub mod processing;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod types;

pub use config::MemoriConfig;
pub use coordinator::Memori;
pub use error::{MemoriError, Result};
pub use intercept::{ChatClient, ChatMessage, ChatResponse, ChatRole, RecordedClient};
pub use processing::{ProcessingClient, RuleBasedClient, StructuredReply};
pub use storage::Store;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

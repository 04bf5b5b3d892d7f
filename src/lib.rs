//! chronicler — a memory and status companion for chat-roleplay hosts.
//!
//! The host application owns the chat log, the variable store, the
//! knowledge/world-info store and the embedding backend; it hands them to
//! this crate through the trait seams in [`host`] and feeds lifecycle
//! signals into the [`coordinator`]. In return the crate maintains three
//! things per chat session:
//!
//! - rolling LLM summaries of consumed messages, persisted as world-info
//!   entries behind a monotonic watermark ([`summarize`], [`worldbook`]),
//! - a per-message structured status snapshot, validated and repaired
//!   against configurable rules ([`status`], [`repair`], [`snapshot`]),
//! - dual-track similarity retrieval injected into upcoming prompts
//!   ([`retrieval`]).

pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod llm;
pub mod prompt;
pub mod repair;
pub mod retrieval;
pub mod snapshot;
pub mod status;
pub mod summarize;
pub mod worldbook;

pub use config::{resolve, CharacterOverride, EffectiveConfig, GlobalConfig};
pub use coordinator::Coordinator;
pub use error::ChroniclerError;
pub use host::{Host, HostSignal};
pub use status::StatusEvent;
pub use summarize::SummarizeOptions;

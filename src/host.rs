//! Capability interfaces supplied by the host application.
//!
//! The chat log, variable store, knowledge store, embedding store and model
//! backend are all owned by the host; the core only sees these traits. The
//! in-memory implementations under [`mock`] back the crate's tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Assistant,
    System,
}

/// One entry of the host's chat log. Message ids are dense and ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: i64,
    pub author: Author,
    pub name: String,
    pub content: String,
    pub is_hidden: bool,
}

impl ChatMessage {
    pub fn is_user(&self) -> bool {
        self.author == Author::User
    }

    pub fn is_assistant(&self) -> bool {
        self.author == Author::Assistant
    }

    pub fn role_label(&self) -> &'static str {
        match self.author {
            Author::User => "user",
            Author::Assistant => "assistant",
            Author::System => "system",
        }
    }
}

/// Role of an outbound prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A chat-style prompt message sent to a model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

/// What a generation request is for; backends may route purposes to
/// different models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Chat,
    Status,
    Summary,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: &[LlmMessage], purpose: Purpose) -> Result<String>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn message_count(&self) -> Result<i64>;
    async fn message(&self, id: i64) -> Result<Option<ChatMessage>>;
    /// Inclusive range; ids outside the log are skipped.
    async fn messages_in_range(&self, start: i64, end: i64) -> Result<Vec<ChatMessage>>;
    /// Newest `count` messages in log order (oldest first).
    async fn newest(&self, count: usize) -> Result<Vec<ChatMessage>>;
    async fn set_hidden(&self, ids: &[i64], hidden: bool) -> Result<()>;
}

#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn message_variables(&self, message_id: i64) -> Result<serde_json::Map<String, Value>>;
    async fn replace_message_variables(
        &self,
        message_id: i64,
        vars: serde_json::Map<String, Value>,
    ) -> Result<()>;
    /// Read-only chat-scope variables (exposed to rule evaluation).
    async fn chat_variables(&self) -> Result<serde_json::Map<String, Value>>;
}

/// How the host decides to inject a knowledge entry into prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsertionStrategy {
    /// Injected whenever enabled.
    #[default]
    Constant,
    /// Injected when one of its keys matches recent context.
    Selective,
}

/// One entry of the host's knowledge/world-info store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LorebookEntry {
    pub name: String,
    pub content: String,
    pub enabled: bool,
    pub keys: Vec<String>,
    pub strategy: InsertionStrategy,
    pub position: i64,
    /// Opaque JSON metadata carried alongside the entry.
    pub extra: Value,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn entries(&self, book: &str) -> Result<Vec<LorebookEntry>>;
    async fn create_entries(&self, book: &str, entries: Vec<LorebookEntry>) -> Result<()>;
    async fn delete_entries(&self, book: &str, names: &[String]) -> Result<()>;
    /// Insert or replace by entry name.
    async fn upsert_entry(&self, book: &str, entry: LorebookEntry) -> Result<()>;
}

/// Insertion request for the embedding store.
#[derive(Debug, Clone)]
pub struct MemoryInsert {
    pub collection: String,
    pub unique_id: String,
    pub batch_id: u64,
    pub text: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// One similarity hit from either track of a dual query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// `"{batch}_{slice}"` for chat-history hits.
    pub index: String,
    pub doc_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DualQuery {
    pub search_text: String,
    pub collection: String,
    pub kb_collections: Vec<String>,
    pub exclude_ids: Vec<String>,
    pub top_k: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DualQueryResults {
    pub chat_hits: Vec<MemoryHit>,
    pub kb_hits: Vec<MemoryHit>,
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn insert_memory(&self, insert: MemoryInsert) -> Result<()>;
    async fn delete_memory(&self, collection: &str, unique_id: &str) -> Result<()>;
    async fn query_dual(&self, query: DualQuery) -> Result<DualQueryResults>;
}

/// Arbitrary JSON metadata persisted alongside the chat session.
#[async_trait]
pub trait SessionMeta: Send + Sync {
    async fn chat_id(&self) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// Lifecycle signals delivered by the host, in emission order.
#[derive(Debug, Clone)]
pub enum HostSignal {
    GenerationStarted { dry_run: bool, is_swipe: bool },
    GenerationStopped,
    GenerationEnded,
    UserMessageRendered { message_id: i64 },
    CharacterMessageRendered { message_id: i64 },
    ChatChanged { chat_id: String },
}

/// The bundle of capabilities handed to the core at startup.
#[derive(Clone)]
pub struct Host {
    pub generator: Arc<dyn TextGenerator>,
    pub log: Arc<dyn MessageLog>,
    pub variables: Arc<dyn VariableStore>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub embeddings: Arc<dyn EmbeddingStore>,
    pub meta: Arc<dyn SessionMeta>,
}

//! Layered configuration.
//!
//! Settings live in two scopes: a global TOML file and an optional
//! per-character override where every field is optional. [`resolve`] merges
//! them into one concrete [`EffectiveConfig`] with presence-wins semantics —
//! a `Some` field in the override always replaces the global value, field by
//! field, independent of any store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::host::Role;
use crate::repair::RepairRule;

/// Regex-based message filtering applied while building transcripts and
/// retrieval queries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TranscriptRules {
    /// Keep only the portions matching this pattern.
    #[serde(default)]
    pub extract_pattern: Option<String>,
    /// Remove the portions matching this pattern.
    #[serde(default)]
    pub strip_pattern: Option<String>,
    /// Message 0 (the opening scene) skips the extraction pattern.
    #[serde(default)]
    pub exempt_layer_zero: bool,
    /// User messages skip the extraction pattern.
    #[serde(default)]
    pub exempt_user: bool,
    /// The stronger switch: user messages are excluded entirely, exemptions
    /// notwithstanding.
    #[serde(default)]
    pub drop_user: bool,
}

/// One configured segment of an outbound prompt. Segments are assembled in
/// order; adjacent segments sharing a role are merged before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptSegment {
    CharPersona { role: Role },
    UserPersona { role: Role },
    /// The prior status snapshot, serialized as JSON, for context.
    PriorSnapshot { role: Role },
    /// The last `count` summary slices, for continuity.
    PriorSummaries { role: Role, count: usize },
    /// Recent chat turns formatted `role: content`.
    Context {
        role: Role,
        max_messages: usize,
        #[serde(default)]
        include_first: bool,
    },
    /// The assembled message transcript of the batch being summarized.
    Transcript { role: Role },
    /// Literal text; `{{chat_context}}` resolves to recent turns.
    Text { role: Role, content: String },
}

fn default_api_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

/// Backend connection settings for the default OpenAI-compatible client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used for status deltas; falls back to `model`.
    #[serde(default)]
    pub status_model: Option<String>,
    /// Model used for summarization; falls back to `model`.
    #[serde(default)]
    pub summary_model: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            api_key: None,
            status_model: None,
            summary_model: None,
        }
    }
}

fn default_lorebook() -> String {
    "chronicler".to_string()
}

fn default_collection() -> String {
    "chronicler-memories".to_string()
}

fn default_trigger_interval() -> i64 {
    10
}

fn default_continuity_slices() -> usize {
    2
}

fn default_batch_pause_ms() -> u64 {
    500
}

fn default_cooldown_ms() -> u64 {
    2_000
}

fn default_debounce_ms() -> u64 {
    1_500
}

fn default_min_reply_chars() -> usize {
    20
}

fn default_status_context_turns() -> usize {
    4
}

fn default_recent_history_slices() -> usize {
    3
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_historical_render_window() -> i64 {
    10
}

fn default_rag_template() -> String {
    "<past_events>\n{{rag}}\n</past_events>\n<recent_events>\n{{recent_history}}\n</recent_events>"
        .to_string()
}

fn default_summary_segments() -> Vec<PromptSegment> {
    vec![
        PromptSegment::CharPersona { role: Role::System },
        PromptSegment::UserPersona { role: Role::System },
        PromptSegment::PriorSummaries {
            role: Role::System,
            count: default_continuity_slices(),
        },
        PromptSegment::Text {
            role: Role::System,
            content: "Summarize the following roleplay transcript into concise \
                      narrative slices. Respond with a JSON array of objects, each \
                      {\"summary\": \"...\", \"tags\": [\"...\"]}."
                .to_string(),
        },
        PromptSegment::Transcript { role: Role::User },
    ]
}

fn default_status_segments() -> Vec<PromptSegment> {
    vec![
        PromptSegment::CharPersona { role: Role::System },
        PromptSegment::UserPersona { role: Role::System },
        PromptSegment::PriorSnapshot { role: Role::System },
        PromptSegment::Text {
            role: Role::User,
            content: "Given the latest exchange:\n{{chat_context}}\n\nRespond with a \
                      JSON object containing only the status fields that changed."
                .to_string(),
        },
    ]
}

fn default_query_segments() -> Vec<PromptSegment> {
    vec![PromptSegment::Context {
        role: Role::User,
        max_messages: 4,
        include_first: false,
    }]
}

/// The global configuration scope, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub llm: LlmSettings,
    pub lorebook: String,
    pub embedding_collection: String,
    /// Knowledge-base collections searched by the document retrieval track.
    pub kb_collections: Vec<String>,
    pub char_name: String,
    pub user_name: String,
    pub char_persona: String,
    pub user_persona: String,
    /// Messages per summarization batch.
    pub trigger_interval: i64,
    pub continuity_slices: usize,
    pub batch_pause_ms: u64,
    pub cooldown_ms: u64,
    pub debounce_ms: u64,
    pub vectorize: bool,
    pub min_reply_chars: usize,
    /// Expected terminator of a complete assistant reply, e.g. a closing tag.
    pub reply_terminator: Option<String>,
    pub status_context_turns: usize,
    pub summary_segments: Vec<PromptSegment>,
    pub status_segments: Vec<PromptSegment>,
    pub query_segments: Vec<PromptSegment>,
    pub transcript_rules: TranscriptRules,
    pub query_rules: TranscriptRules,
    /// Applied to raw model output when slice JSON parsing fails entirely.
    pub output_cleanup_pattern: Option<String>,
    pub rag_template: String,
    pub recent_history_slices: usize,
    pub retrieval_top_k: usize,
    /// Render events this far behind the frontier trigger a ghost sweep.
    pub historical_render_window: i64,
    pub repair_rules: Vec<RepairRule>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            lorebook: default_lorebook(),
            embedding_collection: default_collection(),
            kb_collections: Vec::new(),
            char_name: String::new(),
            user_name: String::new(),
            char_persona: String::new(),
            user_persona: String::new(),
            trigger_interval: default_trigger_interval(),
            continuity_slices: default_continuity_slices(),
            batch_pause_ms: default_batch_pause_ms(),
            cooldown_ms: default_cooldown_ms(),
            debounce_ms: default_debounce_ms(),
            vectorize: false,
            min_reply_chars: default_min_reply_chars(),
            reply_terminator: None,
            status_context_turns: default_status_context_turns(),
            summary_segments: default_summary_segments(),
            status_segments: default_status_segments(),
            query_segments: default_query_segments(),
            transcript_rules: TranscriptRules::default(),
            query_rules: TranscriptRules::default(),
            output_cleanup_pattern: None,
            rag_template: default_rag_template(),
            recent_history_slices: default_recent_history_slices(),
            retrieval_top_k: default_retrieval_top_k(),
            historical_render_window: default_historical_render_window(),
            repair_rules: Vec::new(),
        }
    }
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {:?}", path))?;
        tracing::info!("loaded config from {:?}", path);
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!("no usable config at {:?} ({error:#}), using defaults", path);
                Self::default()
            }
        }
    }
}

/// Per-character overrides. Every field optional; `Some` wins over global.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CharacterOverride {
    pub char_name: Option<String>,
    pub user_name: Option<String>,
    pub char_persona: Option<String>,
    pub user_persona: Option<String>,
    pub trigger_interval: Option<i64>,
    pub continuity_slices: Option<usize>,
    pub vectorize: Option<bool>,
    pub min_reply_chars: Option<usize>,
    pub reply_terminator: Option<String>,
    pub summary_segments: Option<Vec<PromptSegment>>,
    pub status_segments: Option<Vec<PromptSegment>>,
    pub query_segments: Option<Vec<PromptSegment>>,
    pub kb_collections: Option<Vec<String>>,
    pub transcript_rules: Option<TranscriptRules>,
    pub query_rules: Option<TranscriptRules>,
    pub output_cleanup_pattern: Option<String>,
    pub rag_template: Option<String>,
    pub repair_rules: Option<Vec<RepairRule>>,
}

/// The fully resolved configuration consumed by the engines.
pub type EffectiveConfig = GlobalConfig;

/// Merge the two scopes. Pure; field-by-field presence-wins.
pub fn resolve(global: &GlobalConfig, overrides: Option<&CharacterOverride>) -> EffectiveConfig {
    let mut effective = global.clone();
    let Some(ov) = overrides else {
        return effective;
    };

    macro_rules! take {
        ($field:ident) => {
            if let Some(value) = &ov.$field {
                effective.$field = value.clone();
            }
        };
    }

    take!(char_name);
    take!(user_name);
    take!(char_persona);
    take!(user_persona);
    take!(summary_segments);
    take!(status_segments);
    take!(query_segments);
    take!(kb_collections);
    take!(transcript_rules);
    take!(query_rules);
    take!(rag_template);
    take!(repair_rules);
    if let Some(value) = ov.trigger_interval {
        effective.trigger_interval = value;
    }
    if let Some(value) = ov.continuity_slices {
        effective.continuity_slices = value;
    }
    if let Some(value) = ov.vectorize {
        effective.vectorize = value;
    }
    if let Some(value) = ov.min_reply_chars {
        effective.min_reply_chars = value;
    }
    if ov.reply_terminator.is_some() {
        effective.reply_terminator = ov.reply_terminator.clone();
    }
    if ov.output_cleanup_pattern.is_some() {
        effective.output_cleanup_pattern = ov.output_cleanup_pattern.clone();
    }

    effective
}

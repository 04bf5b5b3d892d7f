//! Status reconciliation: ghost purging, reply integrity, and the status
//! update pipeline.
//!
//! Snapshots belong to assistant messages only. Interrupted or rolled-back
//! generations leave snapshots behind on user messages ("ghosts"); the sweeps
//! here heal those silently. The update pipeline asks a secondary model for a
//! partial delta, repairs it against the configured rules, merges it over the
//! prior snapshot and persists the result on the new assistant message.

use anyhow::{Context, Result};
use regex_lite::Regex;

use crate::config::EffectiveConfig;
use crate::error::{truncate_chars, ChroniclerError};
use crate::host::{ChatMessage, Host, Purpose};
use crate::prompt::{assemble, render_context, CompiledRules, SegmentContext};
use crate::repair::repair;
use crate::snapshot::{
    merge_delta, snapshot_from_variables, snapshot_into_variables, strip_snapshot, AliasNames,
    StatusSnapshot, SNAPSHOT_VAR_KEY,
};

const RAW_SNIPPET_CHARS: usize = 300;

/// Observer notifications emitted as snapshots change.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Updated {
        message_id: i64,
        snapshot: StatusSnapshot,
    },
    Purged {
        message_id: i64,
    },
    /// A swipe came back byte-identical; the prior snapshot is still in
    /// force and the host should re-render the message with it.
    SwipeCancelled {
        message_id: i64,
    },
}

/// A swipe that produced byte-identical content was cancelled by the host;
/// the cached pre-swipe text is the ground truth for that comparison.
pub fn swipe_rolled_back(pre_swipe: &str, post_swipe: &str) -> bool {
    pre_swipe == post_swipe
}

/// Reply integrity gate: minimum visible length, and when a terminator
/// pattern is configured it must match at the very end of the reply.
pub fn integrity_ok(content: &str, min_chars: usize, terminator: Option<&str>) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() < min_chars {
        return false;
    }
    match terminator {
        Some(term) if !term.is_empty() => match Regex::new(term) {
            Ok(re) => re
                .find_iter(trimmed)
                .last()
                .is_some_and(|m| m.end() == trimmed.len()),
            // An unparseable pattern degrades to a literal suffix check.
            Err(_) => trimmed.ends_with(term),
        },
        _ => true,
    }
}

pub struct StatusEngine {
    host: Host,
    events: Option<flume::Sender<StatusEvent>>,
}

impl StatusEngine {
    pub fn new(host: Host, events: Option<flume::Sender<StatusEvent>>) -> Self {
        Self { host, events }
    }

    fn notify(&self, event: StatusEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::debug!("status observer channel closed");
            }
        }
    }

    /// Tell observers a swipe was rolled back so the message is re-rendered
    /// with its unchanged snapshot.
    pub fn swipe_cancelled(&self, message_id: i64) {
        self.notify(StatusEvent::SwipeCancelled { message_id });
    }

    /// Remove a ghost snapshot from one message, keeping its other variables.
    /// Returns true when a snapshot key was actually present.
    pub async fn purge_ghost(&self, message_id: i64) -> Result<bool> {
        let mut vars = self.host.variables.message_variables(message_id).await?;
        if !vars.contains_key(SNAPSHOT_VAR_KEY) {
            return Ok(false);
        }
        let had_content = strip_snapshot(&mut vars);
        self.host
            .variables
            .replace_message_variables(message_id, vars)
            .await?;
        if had_content {
            tracing::warn!("purged ghost snapshot from message {message_id}");
        }
        self.notify(StatusEvent::Purged { message_id });
        Ok(true)
    }

    /// Before a generation starts: the newest user message must not carry a
    /// snapshot left over from an earlier failed run.
    pub async fn pre_generation_sweep(&self) -> Result<()> {
        let recent = self.host.log.newest(4).await?;
        if let Some(user) = recent.iter().rev().find(|m| m.is_user()) {
            self.purge_ghost(user.message_id).await?;
        }
        Ok(())
    }

    /// After a generation ends: purge ghosts among the newest two messages
    /// and hand back the new assistant reply. `None` means the generation
    /// failed or was rolled back and left no assistant frontier.
    pub async fn post_generation_check(&self) -> Result<Option<ChatMessage>> {
        let recent = self.host.log.newest(2).await?;
        for message in &recent {
            if message.is_user() {
                self.purge_ghost(message.message_id).await?;
            }
        }
        Ok(recent.last().filter(|m| m.is_assistant()).cloned())
    }

    /// The full status pipeline for one assistant message.
    pub async fn update_status(&self, cfg: &EffectiveConfig, message_id: i64) -> Result<()> {
        let target = self
            .host
            .log
            .message(message_id)
            .await?
            .filter(|m| m.is_assistant())
            .ok_or(ChroniclerError::StaleDataDetected { message_id })?;

        // A leftover snapshot on the target (from a swipe of this same slot)
        // must not leak into the merge base.
        self.purge_ghost(target.message_id).await?;

        let previous = self.prior_snapshot(message_id).await?;
        let history = self.host.log.messages_in_range(0, message_id).await?;
        let rules = CompiledRules::compile(&cfg.transcript_rules)?;
        let chat_context =
            render_context(&history, cfg.status_context_turns, true, Some(&rules));

        let ctx = SegmentContext {
            char_persona: &cfg.char_persona,
            user_persona: &cfg.user_persona,
            prior_snapshot: (!previous.is_empty()).then_some(&previous),
            chat_context: &chat_context,
            messages: &history,
            context_rules: Some(&rules),
            ..SegmentContext::default()
        };
        let prompt = assemble(&cfg.status_segments, &ctx);

        let raw = self
            .host
            .generator
            .generate(&prompt, Purpose::Status)
            .await
            .context("status model call failed")?;

        let delta: StatusSnapshot = serde_json::from_str(crate::llm::extract_json(&raw))
            .map_err(|_| ChroniclerError::MalformedModelOutput {
                raw: truncate_chars(&raw, RAW_SNIPPET_CHARS),
            })?;

        let names = AliasNames::new(cfg.user_name.clone(), cfg.char_name.clone());
        let repaired = repair(&delta, &previous, &cfg.repair_rules, &names)?;

        let mut merged = previous;
        merge_delta(&mut merged, &repaired);

        let mut vars = self.host.variables.message_variables(message_id).await?;
        snapshot_into_variables(&mut vars, &merged);
        self.host
            .variables
            .replace_message_variables(message_id, vars)
            .await?;
        tracing::debug!("status updated for message {message_id}");
        self.notify(StatusEvent::Updated {
            message_id,
            snapshot: merged,
        });
        Ok(())
    }

    /// The most recent snapshot carried by an assistant message before
    /// `message_id`, or empty when the chat has none yet.
    async fn prior_snapshot(&self, message_id: i64) -> Result<StatusSnapshot> {
        if message_id <= 0 {
            return Ok(StatusSnapshot::new());
        }
        let earlier = self.host.log.messages_in_range(0, message_id - 1).await?;
        for message in earlier.iter().rev().filter(|m| m.is_assistant()) {
            let vars = self.host.variables.message_variables(message.message_id).await?;
            if let Some(snapshot) = snapshot_from_variables(&vars) {
                if !snapshot.is_empty() {
                    return Ok(snapshot);
                }
            }
        }
        Ok(StatusSnapshot::new())
    }
}

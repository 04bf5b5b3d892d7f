//! The summarization ratchet.
//!
//! A per-chat watermark marks the last message fully summarized. The task
//! loop advances it one batch at a time, respecting conversational turn
//! boundaries, and reconciles it against the knowledge store before every
//! run — the store may be ahead after switching away from and back to a
//! session. The watermark only ever moves forward on its own; moving it back
//! takes an explicit reset.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EffectiveConfig;
use crate::error::{truncate_chars, ChroniclerError};
use crate::host::{Author, ChatMessage, Host, Purpose};
use crate::llm::extract_json;
use crate::prompt::{assemble, format_transcript, CompiledRules, SegmentContext};
use crate::worldbook::{
    external_watermark, load_slices, overlapping_batch, persist_batch, recent_slices, SummarySlice,
};

pub const WATERMARK_META_KEY: &str = "chronicler_watermark";

/// Diagnostic snippet length for surfaced parse failures.
const RAW_SNIPPET_CHARS: usize = 300;

/// The monotonic summarization pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Highest message id covered by a persisted batch; -1 before the first.
    pub last_summarized_id: i64,
    pub last_batch_index: u64,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            last_summarized_id: -1,
            last_batch_index: 0,
        }
    }
}

/// Where the next automatic batch should end, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPlan {
    Range { start: i64, end: i64 },
    /// Not enough new content yet.
    NotReady,
    /// The frontier message is an assistant reply with nothing after it —
    /// possibly still being generated or about to be swiped.
    Deferred,
}

/// Decide the next batch boundary. `messages` is the chat log (or enough of
/// its tail to cover the frontier).
///
/// A user-authored frontier message retreats the boundary by one so the next
/// batch still opens on that user turn; an assistant-authored frontier is
/// only accepted once the conversation has moved past it.
pub fn plan_next_batch(watermark: i64, interval: i64, messages: &[ChatMessage]) -> BatchPlan {
    let candidate_end = watermark + interval;
    let Some(frontier) = messages.iter().find(|m| m.message_id == candidate_end) else {
        return BatchPlan::NotReady;
    };

    let end = match frontier.author {
        Author::User => candidate_end - 1,
        _ => {
            let has_successor = messages.iter().any(|m| m.message_id == candidate_end + 1);
            if !has_successor {
                return BatchPlan::Deferred;
            }
            candidate_end
        }
    };

    let start = watermark + 1;
    if start > end {
        return BatchPlan::NotReady;
    }
    BatchPlan::Range { start, end }
}

/// Advisory single-flight lock with a short post-completion cooldown that
/// absorbs duplicate near-simultaneous triggers.
struct FlightLock {
    state: Mutex<FlightState>,
}

#[derive(Default)]
struct FlightState {
    running: bool,
    cooled_until: Option<Instant>,
}

impl FlightLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::default()),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return false;
        }
        if let Some(until) = state.cooled_until {
            if Instant::now() < until {
                return false;
            }
        }
        state.running = true;
        true
    }

    fn release(&self, cooldown: Duration) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.cooled_until = Some(Instant::now() + cooldown);
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeOptions {
    /// Summarize the trailing partial batch too, frontier rules permitting.
    pub force: bool,
    /// Manual mode: summarize exactly this inclusive message range.
    pub custom_range: Option<(i64, i64)>,
    /// Manual mode: persist under this batch index.
    pub manual_index: Option<u64>,
    /// Manual mode: overwrite a colliding batch without complaint.
    pub confirm_overwrite: bool,
}

pub struct Summarizer {
    host: Host,
    lock: FlightLock,
}

impl Summarizer {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            lock: FlightLock::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_running()
    }

    /// Explicit user-requested override. The one path by which the ratchet
    /// may move backward; automatic runs only ever advance it.
    pub async fn reset_watermark(&self, watermark: Watermark) -> Result<()> {
        tracing::info!(
            "watermark reset to id {} / batch {}",
            watermark.last_summarized_id,
            watermark.last_batch_index
        );
        self.store_watermark(watermark).await
    }

    /// Run the summarization task. A second invocation while one is in
    /// flight (or cooling down) returns immediately without doing anything.
    pub async fn run(&self, cfg: &EffectiveConfig, opts: SummarizeOptions) -> Result<()> {
        if !self.lock.try_acquire() {
            tracing::debug!("summarization already running, trigger ignored");
            return Ok(());
        }
        let result = self.run_inner(cfg, opts).await;
        self.lock.release(Duration::from_millis(cfg.cooldown_ms));
        if let Err(error) = &result {
            tracing::error!("summarization task failed: {error:#}");
        }
        result
    }

    async fn run_inner(&self, cfg: &EffectiveConfig, opts: SummarizeOptions) -> Result<()> {
        let captured_chat = self.host.meta.chat_id().await?;
        let mut slices = load_slices(self.host.knowledge.as_ref(), &cfg.lorebook).await?;
        let mut watermark = self.reconcile_watermark(cfg, &slices).await?;

        if let Some((start, end)) = opts.custom_range {
            return self
                .run_manual(cfg, &opts, &slices, &mut watermark, &captured_chat, start, end)
                .await;
        }

        loop {
            let count = self.host.log.message_count().await?;
            let messages = self.host.log.messages_in_range(0, count - 1).await?;
            let plan = plan_next_batch(watermark.last_summarized_id, cfg.trigger_interval, &messages);
            let (start, end, tail) = match plan {
                BatchPlan::Range { start, end } => (start, end, false),
                BatchPlan::NotReady | BatchPlan::Deferred => {
                    if opts.force {
                        match forced_tail_range(watermark.last_summarized_id, &messages) {
                            Some((start, end)) => (start, end, true),
                            None => break,
                        }
                    } else {
                        break;
                    }
                }
            };

            let batch_id = watermark.last_batch_index + 1;
            let batch = self
                .summarize_range(cfg, &slices, batch_id, start, end)
                .await?;

            let current_chat = self.host.meta.chat_id().await?;
            if current_chat != captured_chat {
                // Batch text is already in flight to the store; committing
                // the watermark or hiding messages now would hit the wrong
                // session's state.
                tracing::warn!(
                    "{}",
                    ChroniclerError::ConcurrentSessionSwitch {
                        expected: captured_chat.clone(),
                        actual: current_chat,
                    }
                );
                return Ok(());
            }

            let persisted = persist_batch(
                self.host.knowledge.as_ref(),
                self.vector_target(cfg),
                &cfg.lorebook,
                batch,
            )
            .await?;
            slices.extend(persisted);
            slices.sort_by_key(|s| (s.batch_id, s.slice_index));

            if end > watermark.last_summarized_id {
                watermark.last_summarized_id = end;
            }
            watermark.last_batch_index = batch_id;
            self.store_watermark(watermark).await?;
            self.hide_consumed(start, end).await?;

            // A tail range ends at the log frontier; nothing follows it.
            // A forced run keeps looping through any full intervals first.
            if tail {
                break;
            }
            tokio::time::sleep(Duration::from_millis(cfg.batch_pause_ms)).await;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_manual(
        &self,
        cfg: &EffectiveConfig,
        opts: &SummarizeOptions,
        slices: &[SummarySlice],
        watermark: &mut Watermark,
        captured_chat: &str,
        start: i64,
        end: i64,
    ) -> Result<()> {
        if start > end {
            anyhow::bail!("empty manual range {start}..={end}");
        }
        let batch_id = opts.manual_index.unwrap_or(watermark.last_batch_index + 1);

        let collides = slices.iter().any(|s| s.batch_id == batch_id);
        let overlap = overlapping_batch(slices, start, end, batch_id);
        if (collides || overlap.is_some()) && !opts.confirm_overwrite {
            return Err(ChroniclerError::BatchConflict {
                batch_id: overlap.unwrap_or(batch_id),
                start,
                end,
            }
            .into());
        }

        let batch = self
            .summarize_range(cfg, slices, batch_id, start, end)
            .await?;

        if self.host.meta.chat_id().await? != captured_chat {
            tracing::warn!("chat switched during manual summarization, skipping side effects");
            return Ok(());
        }

        persist_batch(
            self.host.knowledge.as_ref(),
            self.vector_target(cfg),
            &cfg.lorebook,
            batch,
        )
        .await?;

        // A manual re-run of an old range never regresses the ratchet.
        if end > watermark.last_summarized_id {
            watermark.last_summarized_id = end;
        }
        if batch_id > watermark.last_batch_index {
            watermark.last_batch_index = batch_id;
        }
        self.store_watermark(*watermark).await?;
        self.hide_consumed(start, end).await?;
        Ok(())
    }

    /// Compare the local watermark against the store's own progress and the
    /// hidden-message trail, adopting whichever is further along.
    async fn reconcile_watermark(
        &self,
        cfg: &EffectiveConfig,
        slices: &[SummarySlice],
    ) -> Result<Watermark> {
        let stored: Option<Watermark> = self
            .host
            .meta
            .get(WATERMARK_META_KEY)
            .await?
            .and_then(|v| serde_json::from_value(v).ok());

        let mut watermark = match stored {
            Some(wm) => wm,
            None => {
                // Watermark metadata lost but a prior run left hidden
                // messages: rebuild from the trail.
                let bootstrapped = self.bootstrap_from_hidden(cfg).await?;
                if let Some(wm) = bootstrapped {
                    tracing::info!(
                        "recovered watermark from hidden messages: id {}",
                        wm.last_summarized_id
                    );
                    self.store_watermark(wm).await?;
                    wm
                } else {
                    Watermark::default()
                }
            }
        };

        if let Some((store_end, store_batch)) = external_watermark(slices) {
            if store_end > watermark.last_summarized_id {
                tracing::info!(
                    "knowledge store is ahead ({} > {}), adopting its watermark",
                    store_end,
                    watermark.last_summarized_id
                );
                let replay_from = watermark.last_summarized_id + 1;
                watermark.last_summarized_id = store_end;
                watermark.last_batch_index = watermark.last_batch_index.max(store_batch);
                self.store_watermark(watermark).await?;
                // Replay the consumed-message side effect for the caught-up
                // range; no model call involved.
                self.hide_consumed(replay_from, store_end).await?;
            }
        }

        Ok(watermark)
    }

    async fn bootstrap_from_hidden(&self, cfg: &EffectiveConfig) -> Result<Option<Watermark>> {
        let count = self.host.log.message_count().await?;
        if count == 0 {
            return Ok(None);
        }
        let messages = self.host.log.messages_in_range(0, count - 1).await?;
        let highest_hidden = messages
            .iter()
            .filter(|m| m.is_hidden)
            .map(|m| m.message_id)
            .max();
        Ok(highest_hidden.map(|id| Watermark {
            last_summarized_id: id,
            last_batch_index: ((id + 1).max(0) as u64) / (cfg.trigger_interval.max(1) as u64),
        }))
    }

    async fn summarize_range(
        &self,
        cfg: &EffectiveConfig,
        slices: &[SummarySlice],
        batch_id: u64,
        start: i64,
        end: i64,
    ) -> Result<Vec<SummarySlice>> {
        let messages = self.host.log.messages_in_range(start, end).await?;
        let rules = CompiledRules::compile(&cfg.transcript_rules)?;
        let transcript = format_transcript(&messages, &rules);

        let continuity: Vec<String> = recent_slices(slices, cfg.continuity_slices)
            .iter()
            .map(|s| s.content.clone())
            .collect();

        let ctx = SegmentContext {
            char_persona: &cfg.char_persona,
            user_persona: &cfg.user_persona,
            prior_summaries: &continuity,
            transcript: &transcript,
            ..SegmentContext::default()
        };
        let prompt = assemble(&cfg.summary_segments, &ctx);

        let raw = self
            .host
            .generator
            .generate(&prompt, Purpose::Summary)
            .await
            .context("summarization model call failed")?;

        let cleanup = cfg
            .output_cleanup_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid output cleanup pattern")?;
        let drafts = parse_slices(&raw, cleanup.as_ref())?;

        let now = Utc::now();
        Ok(drafts
            .into_iter()
            .enumerate()
            .map(|(index, (content, tags))| SummarySlice {
                batch_id,
                slice_index: index as u64,
                content,
                tags,
                range_start: start,
                range_end: end,
                narrative_time: now,
                vectorized: false,
            })
            .collect())
    }

    fn vector_target<'a>(
        &'a self,
        cfg: &'a EffectiveConfig,
    ) -> Option<(&'a dyn crate::host::EmbeddingStore, &'a str)> {
        if cfg.vectorize {
            Some((self.host.embeddings.as_ref(), &cfg.embedding_collection))
        } else {
            None
        }
    }

    async fn store_watermark(&self, watermark: Watermark) -> Result<()> {
        self.host
            .meta
            .set(WATERMARK_META_KEY, serde_json::to_value(watermark)?)
            .await?;
        self.host.meta.flush().await
    }

    async fn hide_consumed(&self, start: i64, end: i64) -> Result<()> {
        if start > end {
            return Ok(());
        }
        let ids: Vec<i64> = (start..=end).collect();
        self.host.log.set_hidden(&ids, true).await
    }
}

/// The trailing range a forced run summarizes once no full interval remains.
/// Runs all the way to the newest message: a forced run is an explicit user
/// action, so the automatic planner's frontier deferral does not apply.
fn forced_tail_range(watermark: i64, messages: &[ChatMessage]) -> Option<(i64, i64)> {
    let newest = messages.iter().map(|m| m.message_id).max()?;
    let start = watermark + 1;
    if start > newest {
        return None;
    }
    Some((start, newest))
}

/// Parse model output into `(content, tags)` drafts. JSON first — an array
/// of slice objects or a bare object promoted to a one-element array — then
/// a raw-text fallback through the optional cleanup pattern.
pub fn parse_slices(
    raw: &str,
    cleanup: Option<&Regex>,
) -> Result<Vec<(String, Vec<String>)>, ChroniclerError> {
    let items: Option<Vec<Value>> = match serde_json::from_str::<Value>(extract_json(raw)) {
        Ok(Value::Array(items)) => Some(items),
        Ok(object @ Value::Object(_)) => Some(vec![object]),
        _ => None,
    };

    let drafts: Vec<(String, Vec<String>)> = match items {
        Some(items) => items.iter().filter_map(draft_from_value).collect(),
        None => {
            let mut text = raw.to_string();
            if let Some(cleanup) = cleanup {
                text = cleanup.replace_all(&text, "").into_owned();
            }
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![(trimmed.to_string(), Vec::new())]
            }
        }
    };

    if drafts.is_empty() {
        return Err(ChroniclerError::EmptyBatch {
            raw: truncate_chars(raw, RAW_SNIPPET_CHARS),
        });
    }
    Ok(drafts)
}

fn draft_from_value(item: &Value) -> Option<(String, Vec<String>)> {
    let object = item.as_object()?;
    let content = ["summary", "content", "text"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))?
        .trim()
        .to_string();
    if content.is_empty() {
        return None;
    }

    let tags = match (object.get("tags"), object.get("tag")) {
        (Some(Value::Array(values)), _) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        (Some(Value::String(tag)), _) | (None, Some(Value::String(tag))) => vec![tag.clone()],
        _ => Vec::new(),
    };
    Some((content, tags))
}

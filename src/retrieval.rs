//! Dual-track retrieval: query construction and result injection.
//!
//! One track searches past chat-summary slices, the other knowledge
//! documents. Both land in dedicated lorebook entries the host's prompt
//! pipeline picks up. The query text is built from the same segment
//! configuration the preview panel renders, so what the user sees is exactly
//! what is sent.

use anyhow::Result;

use crate::config::EffectiveConfig;
use crate::host::{ChatMessage, DualQuery, Host, InsertionStrategy, LorebookEntry, MemoryHit};
use crate::prompt::{assemble, CompiledRules, SegmentContext};
use crate::worldbook::{load_slices, parse_unique_id, recent_slices};

/// Injection entry holding retrieved chat-history summaries.
pub const CHAT_INJECTION_ENTRY: &str = "chronicler-rag-history";
/// Injection entry holding retrieved knowledge documents.
pub const KB_INJECTION_ENTRY: &str = "chronicler-rag-documents";

pub const RAG_PLACEHOLDER: &str = "{{rag}}";
pub const RECENT_HISTORY_PLACEHOLDER: &str = "{{recent_history}}";

/// Build the similarity-search query text from the configured segments.
pub fn build_query(
    messages: &[ChatMessage],
    cfg: &EffectiveConfig,
) -> Result<String> {
    let rules = CompiledRules::compile(&cfg.query_rules)?;
    let ctx = SegmentContext {
        messages,
        context_rules: Some(&rules),
        char_persona: &cfg.char_persona,
        user_persona: &cfg.user_persona,
        ..SegmentContext::default()
    };
    let assembled = assemble(&cfg.query_segments, &ctx);
    Ok(assembled
        .into_iter()
        .map(|m| m.content)
        .collect::<Vec<_>>()
        .join("\n\n"))
}

/// Sort hits for display: timestamp ascending, then numeric (batch, slice)
/// parsed from the index string — not lexicographic, so `"2_3"` sorts after
/// `"1_1"` even though the strings would not.
pub fn sort_hits(hits: &mut [MemoryHit]) {
    hits.sort_by_key(|hit| (hit.timestamp, numeric_index(&hit.index)));
}

fn numeric_index(index: &str) -> (u64, u64) {
    parse_unique_id(index).unwrap_or((u64::MAX, u64::MAX))
}

/// Prompt-ready text for both tracks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergedInjection {
    pub chat_text: String,
    pub kb_text: String,
}

/// Merge both result tracks into injection text. `recent` is the
/// independently fetched most-recent-slice block; its contents fill
/// `{{recent_history}}` and its ids were excluded from the similarity query.
pub fn merge_results(
    mut chat_hits: Vec<MemoryHit>,
    kb_hits: Vec<MemoryHit>,
    template: &str,
    recent: &[String],
) -> MergedInjection {
    sort_hits(&mut chat_hits);
    let rag_block = chat_hits
        .iter()
        .map(|hit| hit.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let recent_block = recent.join("\n\n");

    let chat_text = if rag_block.is_empty() && recent_block.is_empty() {
        String::new()
    } else {
        template
            .replace(RAG_PLACEHOLDER, &rag_block)
            .replace(RECENT_HISTORY_PLACEHOLDER, &recent_block)
    };

    let kb_text = kb_hits
        .iter()
        .map(|hit| {
            format!(
                "[Source: {}]\n{}",
                hit.doc_name.as_deref().unwrap_or("unknown"),
                hit.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    MergedInjection { chat_text, kb_text }
}

fn injection_entry(name: &str, content: String) -> LorebookEntry {
    LorebookEntry {
        name: name.to_string(),
        content,
        enabled: true,
        keys: Vec::new(),
        strategy: InsertionStrategy::Constant,
        position: 0,
        extra: serde_json::Value::Null,
    }
}

/// Write both injection entries. An empty track actively clears its target
/// so stale content never leaks into the next prompt.
pub async fn write_injections(host: &Host, book: &str, merged: &MergedInjection) -> Result<()> {
    host.knowledge
        .upsert_entry(book, injection_entry(CHAT_INJECTION_ENTRY, merged.chat_text.clone()))
        .await?;
    host.knowledge
        .upsert_entry(book, injection_entry(KB_INJECTION_ENTRY, merged.kb_text.clone()))
        .await
}

/// Clear both injection entries.
pub async fn clear_injections(host: &Host, book: &str) -> Result<()> {
    write_injections(host, book, &MergedInjection::default()).await
}

/// The retrieval interceptor: called by the host's prompt pipeline before
/// each generation. Mid-swipe the message being regenerated is omitted from
/// the query context.
pub async fn run_retrieval(
    host: &Host,
    cfg: &EffectiveConfig,
    messages: &[ChatMessage],
    is_swipe: bool,
) -> Result<()> {
    let mut window = messages;
    if is_swipe {
        if let Some((last, rest)) = messages.split_last() {
            if last.is_assistant() {
                window = rest;
            }
        }
    }

    let query = build_query(window, cfg)?;
    if query.trim().is_empty() {
        return clear_injections(host, &cfg.lorebook).await;
    }

    let slices = load_slices(host.knowledge.as_ref(), &cfg.lorebook).await?;
    let recent = recent_slices(&slices, cfg.recent_history_slices);
    let recent_texts: Vec<String> = recent.iter().map(|s| s.content.clone()).collect();
    let exclude_ids: Vec<String> = recent.iter().map(|s| s.unique_id()).collect();

    let results = host
        .embeddings
        .query_dual(DualQuery {
            search_text: query,
            collection: cfg.embedding_collection.clone(),
            kb_collections: cfg.kb_collections.clone(),
            exclude_ids,
            top_k: cfg.retrieval_top_k,
        })
        .await?;

    let merged = merge_results(
        results.chat_hits,
        results.kb_hits,
        &cfg.rag_template,
        &recent_texts,
    );
    write_injections(host, &cfg.lorebook, &merged).await
}

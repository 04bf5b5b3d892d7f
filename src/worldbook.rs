//! Summary persistence in the host's knowledge/world-info store.
//!
//! Each summary slice becomes one lorebook entry named `"{batch}_{slice}"`,
//! with range and timestamp metadata in the entry's extra field. Persisting a
//! batch is idempotent: any prior entries (and embedding rows) with the same
//! batch id are deleted before the new ones are written, so re-running a
//! summarization for a batch can never duplicate it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::{
    EmbeddingStore, InsertionStrategy, KnowledgeStore, LorebookEntry, MemoryInsert,
};

/// One sub-summary of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarySlice {
    pub batch_id: u64,
    pub slice_index: u64,
    pub content: String,
    pub tags: Vec<String>,
    pub range_start: i64,
    pub range_end: i64,
    pub narrative_time: DateTime<Utc>,
    pub vectorized: bool,
}

impl SummarySlice {
    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.batch_id, self.slice_index)
    }
}

/// Parse a `"{batch}_{slice}"` entry name. Non-conforming names belong to
/// other producers and are ignored.
pub fn parse_unique_id(name: &str) -> Option<(u64, u64)> {
    let (batch, slice) = name.split_once('_')?;
    Some((batch.parse().ok()?, slice.parse().ok()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SliceMeta {
    tags: Vec<String>,
    range_start: i64,
    range_end: i64,
    narrative_time: DateTime<Utc>,
    vectorized: bool,
}

fn entry_from_slice(slice: &SummarySlice) -> LorebookEntry {
    let meta = SliceMeta {
        tags: slice.tags.clone(),
        range_start: slice.range_start,
        range_end: slice.range_end,
        narrative_time: slice.narrative_time,
        vectorized: slice.vectorized,
    };
    LorebookEntry {
        name: slice.unique_id(),
        content: slice.content.clone(),
        enabled: true,
        keys: slice.tags.clone(),
        strategy: InsertionStrategy::Selective,
        position: slice.range_start,
        extra: serde_json::to_value(&meta).unwrap_or(serde_json::Value::Null),
    }
}

fn slice_from_entry(entry: &LorebookEntry) -> Option<SummarySlice> {
    let (batch_id, slice_index) = parse_unique_id(&entry.name)?;
    let meta: SliceMeta = serde_json::from_value(entry.extra.clone()).ok()?;
    Some(SummarySlice {
        batch_id,
        slice_index,
        content: entry.content.clone(),
        tags: meta.tags,
        range_start: meta.range_start,
        range_end: meta.range_end,
        narrative_time: meta.narrative_time,
        vectorized: meta.vectorized,
    })
}

/// Load every slice persisted in the book, ordered by (batch, slice).
pub async fn load_slices(store: &dyn KnowledgeStore, book: &str) -> Result<Vec<SummarySlice>> {
    let mut slices: Vec<SummarySlice> = store
        .entries(book)
        .await?
        .iter()
        .filter_map(slice_from_entry)
        .collect();
    slices.sort_by_key(|s| (s.batch_id, s.slice_index));
    Ok(slices)
}

/// The store's own idea of summarization progress: the maximum
/// `(range_end, batch_id)` across all persisted slices.
pub fn external_watermark(slices: &[SummarySlice]) -> Option<(i64, u64)> {
    slices
        .iter()
        .map(|s| (s.range_end, s.batch_id))
        .max()
}

/// The most recent `count` slices, in (batch, slice) order.
pub fn recent_slices(slices: &[SummarySlice], count: usize) -> &[SummarySlice] {
    let skip = slices.len().saturating_sub(count);
    &slices[skip..]
}

/// An existing batch (other than `batch_id` itself) whose message range
/// intersects `start..=end`, if any. Used to warn on partially overlapping
/// manual ranges instead of silently merging them.
pub fn overlapping_batch(
    slices: &[SummarySlice],
    start: i64,
    end: i64,
    batch_id: u64,
) -> Option<u64> {
    slices
        .iter()
        .find(|s| s.batch_id != batch_id && s.range_start <= end && s.range_end >= start)
        .map(|s| s.batch_id)
}

/// Persist a batch, replacing any prior version with the same batch id:
/// old entries and old embedding rows are deleted first, then the new slices
/// are vectorized (when a store is given) and written with their final
/// `vectorized` marks.
pub async fn persist_batch(
    knowledge: &dyn KnowledgeStore,
    embeddings: Option<(&dyn EmbeddingStore, &str)>,
    book: &str,
    mut slices: Vec<SummarySlice>,
) -> Result<Vec<SummarySlice>> {
    let Some(batch_id) = slices.first().map(|s| s.batch_id) else {
        return Ok(slices);
    };

    let stale: Vec<String> = knowledge
        .entries(book)
        .await?
        .iter()
        .filter(|e| parse_unique_id(&e.name).is_some_and(|(b, _)| b == batch_id))
        .map(|e| e.name.clone())
        .collect();
    if !stale.is_empty() {
        tracing::debug!("replacing {} stale entries of batch {batch_id}", stale.len());
        if let Some((store, collection)) = embeddings {
            for name in &stale {
                store.delete_memory(collection, name).await?;
            }
        }
        knowledge.delete_entries(book, &stale).await?;
    }

    if let Some((store, collection)) = embeddings {
        for slice in slices.iter_mut() {
            let insert = MemoryInsert {
                collection: collection.to_string(),
                unique_id: slice.unique_id(),
                batch_id: slice.batch_id,
                text: slice.content.clone(),
                tags: slice.tags.clone(),
                timestamp: slice.narrative_time,
            };
            match store.insert_memory(insert).await {
                Ok(()) => slice.vectorized = true,
                Err(error) => {
                    tracing::warn!(
                        "vector indexing failed for slice {}: {error:#}",
                        slice.unique_id()
                    );
                }
            }
        }
    }

    let entries = slices.iter().map(entry_from_slice).collect();
    knowledge.create_entries(book, entries).await?;
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{MockEmbeddings, MockKnowledge};
    use std::sync::Arc;

    fn slice(batch: u64, index: u64, start: i64, end: i64) -> SummarySlice {
        SummarySlice {
            batch_id: batch,
            slice_index: index,
            content: format!("events {start}..{end}"),
            tags: vec!["travel".to_string()],
            range_start: start,
            range_end: end,
            narrative_time: Utc::now(),
            vectorized: false,
        }
    }

    #[test]
    fn unique_ids_round_trip() {
        let s = slice(3, 1, 10, 14);
        assert_eq!(s.unique_id(), "3_1");
        assert_eq!(parse_unique_id("3_1"), Some((3, 1)));
        assert_eq!(parse_unique_id("injection-entry"), None);
    }

    #[test]
    fn external_watermark_takes_max_range_end_then_batch() {
        let slices = vec![slice(1, 0, 0, 4), slice(3, 0, 10, 14), slice(2, 0, 5, 9)];
        assert_eq!(external_watermark(&slices), Some((14, 3)));
        assert_eq!(external_watermark(&[]), None);
    }

    #[test]
    fn overlap_detection_ignores_same_batch() {
        let slices = vec![slice(1, 0, 0, 4), slice(2, 0, 5, 9)];
        assert_eq!(overlapping_batch(&slices, 3, 6, 9), Some(1));
        assert_eq!(overlapping_batch(&slices, 5, 9, 2), None);
        assert_eq!(overlapping_batch(&slices, 10, 12, 9), None);
    }

    #[tokio::test]
    async fn persist_is_idempotent_per_batch() {
        let knowledge = Arc::new(MockKnowledge::default());
        let embeddings = Arc::new(MockEmbeddings::default());

        let batch = vec![slice(1, 0, 0, 4), slice(1, 1, 0, 4)];
        persist_batch(
            knowledge.as_ref(),
            Some((embeddings.as_ref() as &dyn EmbeddingStore, "col")),
            "book",
            batch.clone(),
        )
        .await
        .unwrap();
        // Second run replaces, never duplicates.
        persist_batch(
            knowledge.as_ref(),
            Some((embeddings.as_ref() as &dyn EmbeddingStore, "col")),
            "book",
            batch,
        )
        .await
        .unwrap();

        let names = knowledge.entry_names("book");
        assert_eq!(names, vec!["1_0".to_string(), "1_1".to_string()]);
        assert_eq!(embeddings.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn vectorization_failure_marks_slice_unvectorized() {
        let knowledge = Arc::new(MockKnowledge::default());
        let embeddings = Arc::new(MockEmbeddings::default());
        *embeddings.fail_inserts.lock().unwrap() = true;

        let persisted = persist_batch(
            knowledge.as_ref(),
            Some((embeddings.as_ref() as &dyn EmbeddingStore, "col")),
            "book",
            vec![slice(1, 0, 0, 4)],
        )
        .await
        .unwrap();
        assert!(!persisted[0].vectorized);
        // The entry is still written.
        assert_eq!(knowledge.entry_names("book"), vec!["1_0".to_string()]);
    }

    #[tokio::test]
    async fn load_restores_slices_in_order() {
        let knowledge = Arc::new(MockKnowledge::default());
        persist_batch(knowledge.as_ref(), None, "book", vec![slice(2, 0, 5, 9)])
            .await
            .unwrap();
        persist_batch(knowledge.as_ref(), None, "book", vec![slice(1, 0, 0, 4)])
            .await
            .unwrap();
        let loaded = load_slices(knowledge.as_ref(), "book").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].batch_id, 1);
        assert_eq!(loaded[1].batch_id, 2);
        assert_eq!(recent_slices(&loaded, 1)[0].batch_id, 2);
    }
}

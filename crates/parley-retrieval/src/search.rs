// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hybrid query: dense + lexical candidates, RRF fusion, optional rerank,
//! discipline thresholding, citation metadata.
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_config::{DisciplineLevel, RetrievalConfig};
use parley_model::{Metering, ModelGateway};
use parley_store::{ScoredChunk, Store};

use crate::{rerank::Reranker, RetrievalError};

/// RRF constant from the original formulation.
pub const RRF_K: f64 = 60.0;

/// One retrieval result with everything needed to cite it.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: i64,
    pub document_id: Uuid,
    pub document_name: String,
    pub ordinal: i64,
    pub text: String,
    pub page: Option<i64>,
    pub score: f64,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// Citation entry attached to an assistant answer; `n` matches the inline
/// `[n]` markers the orchestrator instructs the model to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub n: usize,
    pub document_name: String,
    pub page: Option<i64>,
    pub chunk_id: i64,
    pub score: f64,
}

/// Number the results in order, 1-based.
pub fn package_citations(results: &[RetrievedChunk]) -> Vec<Citation> {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| Citation {
            n: i + 1,
            document_name: r.document_name.clone(),
            page: r.page,
            chunk_id: r.chunk_id,
            score: r.score,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<RetrievedChunk>,
    /// Metering for the query embedding (absent when the corpus was empty).
    pub metering: Option<Metering>,
    /// The reranker was configured but failed; RRF ordering was used.
    pub rerank_degraded: bool,
}

/// A fused candidate before chunk records are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: i64,
    /// Position within its document, carried through for the tie-break.
    pub ordinal: i64,
    pub rrf_score: f64,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// Reciprocal Rank Fusion over the two candidate lists:
/// `score(c) = Σ 1/(k + rank_i)` with 1-based ranks, k = 60.
pub fn fuse(dense: &[ScoredChunk], lexical: &[ScoredChunk]) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<i64, FusedCandidate> = HashMap::new();
    for (rank, c) in dense.iter().enumerate() {
        let e = by_id.entry(c.chunk_id).or_insert(FusedCandidate {
            chunk_id: c.chunk_id,
            ordinal: c.ordinal,
            rrf_score: 0.0,
            dense_rank: None,
            lexical_rank: None,
        });
        e.dense_rank = Some(rank + 1);
        e.rrf_score += 1.0 / (RRF_K + (rank + 1) as f64);
    }
    for (rank, c) in lexical.iter().enumerate() {
        let e = by_id.entry(c.chunk_id).or_insert(FusedCandidate {
            chunk_id: c.chunk_id,
            ordinal: c.ordinal,
            rrf_score: 0.0,
            dense_rank: None,
            lexical_rank: None,
        });
        e.lexical_rank = Some(rank + 1);
        e.rrf_score += 1.0 / (RRF_K + (rank + 1) as f64);
    }
    let mut out: Vec<FusedCandidate> = by_id.into_values().collect();
    out.sort_by(candidate_order);
    out
}

/// Ordering of fused candidates: RRF score descending, then better dense
/// rank, then better lexical rank, then lower chunk ordinal. Chunk id is a
/// last resort so the order is total across documents.
fn candidate_order(a: &FusedCandidate, b: &FusedCandidate) -> std::cmp::Ordering {
    b.rrf_score
        .partial_cmp(&a.rrf_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| rank_key(a.dense_rank).cmp(&rank_key(b.dense_rank)))
        .then_with(|| rank_key(a.lexical_rank).cmp(&rank_key(b.lexical_rank)))
        .then_with(|| a.ordinal.cmp(&b.ordinal))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

fn rank_key(r: Option<usize>) -> usize {
    r.unwrap_or(usize::MAX)
}

pub struct HybridSearcher {
    store: Store,
    gateway: Arc<ModelGateway>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
}

impl HybridSearcher {
    pub fn new(
        store: Store,
        gateway: Arc<ModelGateway>,
        reranker: Option<Arc<dyn Reranker>>,
        config: RetrievalConfig,
    ) -> Self {
        Self { store, gateway, reranker, config }
    }

    /// Run the hybrid query for one user.
    ///
    /// Edge cases per policy: an empty corpus yields an empty result (and
    /// skips the query embedding entirely); a query with no lexical tokens
    /// runs dense-only; when every candidate falls below the discipline
    /// threshold the result is empty and the caller notes the absence.
    pub async fn search(
        &self,
        user_id: &str,
        query_text: &str,
        discipline: DisciplineLevel,
    ) -> Result<SearchOutcome, RetrievalError> {
        let has_ready = self
            .store
            .list_documents(user_id)
            .await?
            .iter()
            .any(|d| d.status == parley_store::DocumentStatus::Ready);
        if !has_ready {
            return Ok(SearchOutcome { results: Vec::new(), metering: None, rerank_degraded: false });
        }

        let embed = self
            .gateway
            .embed(&[query_text.to_string()])
            .await
            .map_err(RetrievalError::Embedding)?;
        let query_vec = &embed.vectors[0];

        let (dense, lexical) = tokio::join!(
            self.store.dense_candidates(user_id, query_vec, self.config.dense_candidates),
            self.store.lexical_candidates(user_id, query_text, self.config.lexical_candidates),
        );
        let (dense, lexical) = (dense?, lexical?);

        let fused = fuse(&dense, &lexical);
        let candidates: Vec<FusedCandidate> =
            fused.into_iter().take(self.config.rerank_candidates).collect();
        if candidates.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                metering: Some(embed.metering),
                rerank_degraded: false,
            });
        }

        let ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
        let records = self.store.chunks_by_ids(user_id, &ids).await?;
        let by_id: HashMap<i64, parley_store::ChunkRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();

        // Document display names for citation packaging.
        let mut doc_names: HashMap<Uuid, String> = HashMap::new();
        for r in by_id.values() {
            if let std::collections::hash_map::Entry::Vacant(e) = doc_names.entry(r.document_id) {
                let doc = self.store.get_document(user_id, r.document_id).await?;
                e.insert(doc.display_name);
            }
        }

        // Rerank the candidate texts, or fall back to top-normalised RRF
        // scores so the discipline thresholds stay meaningful.
        // One text per candidate, index-aligned with the scores below.
        let texts: Vec<String> = candidates
            .iter()
            .map(|c| by_id.get(&c.chunk_id).map(|r| r.content.clone()).unwrap_or_default())
            .collect();
        let mut rerank_degraded = false;
        let scores: Vec<f64> = match &self.reranker {
            Some(reranker) => match reranker.rerank(query_text, &texts).await {
                Ok(scores) => scores,
                Err(e) => {
                    warn!(error = %e, "reranker failed, falling back to RRF scores");
                    rerank_degraded = true;
                    normalized_rrf(&candidates)
                }
            },
            None => normalized_rrf(&candidates),
        };

        let threshold = discipline.threshold();
        let mut results = Vec::new();
        let mut scored: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
        });
        for (idx, score) in scored {
            if score < threshold {
                continue;
            }
            let cand = &candidates[idx];
            let Some(record) = by_id.get(&cand.chunk_id) else { continue };
            results.push(RetrievedChunk {
                chunk_id: record.id,
                document_id: record.document_id,
                document_name: doc_names
                    .get(&record.document_id)
                    .cloned()
                    .unwrap_or_default(),
                ordinal: record.ordinal,
                text: record.content.clone(),
                page: record.page,
                score,
                dense_rank: cand.dense_rank,
                lexical_rank: cand.lexical_rank,
            });
            if results.len() == self.config.top_k {
                break;
            }
        }

        debug!(
            user = %user_id,
            dense = dense.len(),
            lexical = lexical.len(),
            returned = results.len(),
            "hybrid search complete",
        );
        Ok(SearchOutcome { results, metering: Some(embed.metering), rerank_degraded })
    }
}

/// RRF scores scaled so the best candidate is 1.0, keeping the discipline
/// thresholds usable when the reranker is absent or down.
fn normalized_rrf(candidates: &[FusedCandidate]) -> Vec<f64> {
    let top = candidates.first().map(|c| c.rrf_score).unwrap_or(0.0);
    if top <= 0.0 {
        return vec![0.0; candidates.len()];
    }
    candidates.iter().map(|c| c.rrf_score / top).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sc(chunk_id: i64, ordinal: i64) -> ScoredChunk {
        ScoredChunk { chunk_id, ordinal, score: 0.0 }
    }

    fn fc(
        chunk_id: i64,
        ordinal: i64,
        dense_rank: Option<usize>,
        lexical_rank: Option<usize>,
    ) -> FusedCandidate {
        FusedCandidate { chunk_id, ordinal, rrf_score: 1.0 / 61.0, dense_rank, lexical_rank }
    }

    #[test]
    fn rrf_scores_sum_across_lists() {
        let dense = vec![sc(1, 0)];
        let lexical = vec![sc(1, 0)];
        let fused = fuse(&dense, &lexical);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].rrf_score - 2.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[0].dense_rank, Some(1));
        assert_eq!(fused[0].lexical_rank, Some(1));
        assert_eq!(fused[0].ordinal, 0);
    }

    #[test]
    fn chunk_in_both_lists_beats_single_list_leader() {
        // Chunk 1 is rank 2 in both lists; chunk 2 leads dense only.
        let dense = vec![sc(2, 0), sc(1, 1)];
        let lexical = vec![sc(3, 0), sc(1, 1)];
        let fused = fuse(&dense, &lexical);
        assert_eq!(fused[0].chunk_id, 1, "2/62 beats 1/61");
    }

    #[test]
    fn ties_break_by_dense_then_lexical_rank() {
        // Chunks 1 and 2 appear only once each at the same rank in
        // different lists: identical RRF scores.
        let dense = vec![sc(1, 0)];
        let lexical = vec![sc(2, 0)];
        let fused = fuse(&dense, &lexical);
        assert_eq!(fused[0].chunk_id, 1, "dense presence wins the tie");
        assert_eq!(fused[1].chunk_id, 2);
    }

    #[test]
    fn rank_ties_break_by_lower_ordinal_within_a_document() {
        // Identical score and rank keys; only the ordinal separates them.
        let late = fc(9, 3, Some(2), None);
        let early = fc(7, 1, Some(2), None);
        assert_eq!(candidate_order(&early, &late), std::cmp::Ordering::Less);
        assert_eq!(candidate_order(&late, &early), std::cmp::Ordering::Greater);
    }

    #[test]
    fn rank_ties_prefer_lower_ordinal_over_lower_chunk_id() {
        // Document A's 2nd chunk (row id 2) vs document B's 1st chunk
        // (row id 4): the per-document position wins, not the global id.
        let a_second = fc(2, 1, Some(3), Some(5));
        let b_first = fc(4, 0, Some(3), Some(5));
        assert_eq!(candidate_order(&b_first, &a_second), std::cmp::Ordering::Less);

        // Equal ordinals fall through to chunk id for a total order.
        let same_pos = fc(2, 0, Some(3), Some(5));
        assert_eq!(candidate_order(&same_pos, &b_first), std::cmp::Ordering::Less);
    }

    #[test]
    fn disjoint_lists_all_survive() {
        let dense = vec![sc(1, 0), sc(2, 1)];
        let lexical = vec![sc(3, 0), sc(4, 1)];
        assert_eq!(fuse(&dense, &lexical).len(), 4);
    }

    #[test]
    fn empty_lists_fuse_to_nothing() {
        assert!(fuse(&[], &[]).is_empty());
    }

    #[test]
    fn normalized_rrf_top_is_one() {
        let fused = fuse(&[sc(1, 0), sc(2, 1)], &[sc(1, 0)]);
        let norm = normalized_rrf(&fused);
        assert!((norm[0] - 1.0).abs() < 1e-12);
        assert!(norm[1] < 1.0);
    }

    #[test]
    fn citations_number_from_one() {
        let results = vec![RetrievedChunk {
            chunk_id: 7,
            document_id: Uuid::new_v4(),
            document_name: "a.txt".into(),
            ordinal: 0,
            text: "t".into(),
            page: None,
            score: 0.9,
            dense_rank: Some(1),
            lexical_rank: None,
        }];
        let cits = package_citations(&results);
        assert_eq!(cits[0].n, 1);
        assert_eq!(cits[0].chunk_id, 7);
    }
}

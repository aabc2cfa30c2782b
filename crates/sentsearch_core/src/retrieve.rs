use std::path::Path;

use tracing::debug;

use crate::embed::{normalize_rows, EmbeddingProvider, SimilarityProvider};
use crate::error::{Result, SearchError};
use crate::index::EmbeddingIndex;
use crate::model::{RankedPassage, ScoredPassage};

pub const DEFAULT_N_RETURNS: usize = 5;

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Candidate count for the coarse stage.
    pub n_returns: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            n_returns: DEFAULT_N_RETURNS,
        }
    }
}

/// Fine-stage reranker over a similarity provider. `re_rank` is a pure
/// primitive over parallel texts/ids from any source; the training-data
/// miner reuses it directly.
pub struct SimilarityRanker<S> {
    similarity: S,
}

impl<S: SimilarityProvider> SimilarityRanker<S> {
    pub fn new(similarity: S) -> Self {
        Self { similarity }
    }

    /// Scores `texts` against `query` and returns records sorted strictly
    /// descending by score, candidate order preserved on ties.
    ///
    /// Fewer than two candidates short-circuit without a provider call: a
    /// single candidate comes back as-is with a placeholder score of 0.0,
    /// zero candidates yield an empty result.
    pub fn re_rank(
        &self,
        query: &str,
        texts: &[String],
        ids: &[String],
    ) -> Result<Vec<RankedPassage>> {
        if texts.len() != ids.len() {
            return Err(SearchError::Provider(format!(
                "re_rank called with {} texts but {} ids",
                texts.len(),
                ids.len()
            )));
        }
        match texts.len() {
            0 => return Ok(Vec::new()),
            1 => {
                return Ok(vec![RankedPassage {
                    passage_id: ids[0].clone(),
                    text: texts[0].clone(),
                    score: 0.0,
                }])
            }
            _ => {}
        }

        let mut pairs = self.similarity.score(query, texts)?;
        if pairs.len() != texts.len() {
            return Err(SearchError::Provider(format!(
                "similarity provider returned {} scores for {} candidates",
                pairs.len(),
                texts.len()
            )));
        }
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut results = Vec::with_capacity(pairs.len());
        for (idx, score) in pairs {
            let (id, text) = ids
                .get(idx)
                .zip(texts.get(idx))
                .ok_or_else(|| {
                    SearchError::Provider(format!("similarity provider returned index {idx} out of range"))
                })?;
            results.push(RankedPassage {
                passage_id: id.clone(),
                text: text.clone(),
                score,
            });
        }
        Ok(results)
    }
}

/// Two-stage searcher over a persisted index: coarse ANN retrieval, then
/// similarity reranking of the candidate set.
pub struct SentenceSearcher<E, S> {
    index: EmbeddingIndex,
    embedder: E,
    ranker: SimilarityRanker<S>,
    config: RetrieverConfig,
}

impl<E, S> SentenceSearcher<E, S>
where
    E: EmbeddingProvider,
    S: SimilarityProvider,
{
    /// Wraps a loaded index. The embedder must produce vectors of the
    /// index's dimension; a mismatch surfaces as [`SearchError::IndexLoad`]
    /// here rather than as silently zeroed scores at query time.
    pub fn new(
        index: EmbeddingIndex,
        embedder: E,
        similarity: S,
        config: RetrieverConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimensions {
            return Err(SearchError::index_load(
                &index.location,
                format!(
                    "embedder dimension {} does not match index dimension {}",
                    embedder.dimension(),
                    index.dimensions
                ),
            ));
        }
        Ok(Self {
            index,
            embedder,
            ranker: SimilarityRanker::new(similarity),
            config,
        })
    }

    /// Loads the persisted index at `index_path`; missing or inconsistent
    /// files and embedder/index dimension mismatches surface as
    /// [`SearchError::IndexLoad`].
    pub fn load(
        index_path: &Path,
        embedder: E,
        similarity: S,
        config: RetrieverConfig,
    ) -> Result<Self> {
        let index = EmbeddingIndex::load(index_path)?;
        Self::new(index, embedder, similarity, config)
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn ranker(&self) -> &SimilarityRanker<S> {
        &self.ranker
    }

    /// Coarse stage: inner-product top-`n_returns` against the ANN
    /// structure, resolved to stored texts. Order is the ANN's native
    /// ordering, not re-sorted here.
    pub fn retrieve(&self, query: &str, n_returns: usize) -> Result<Vec<ScoredPassage>> {
        let mut vector = vec![self.embedder.embed(query)?];
        normalize_rows(&mut vector);
        let hits = self.index.ann.query(&vector[0], n_returns);
        debug!(query, hits = hits.len(), "coarse retrieval");

        Ok(hits
            .into_iter()
            .map(|(row, score)| ScoredPassage {
                passage_id: self.index.ids[row].clone(),
                text: self.index.metadata[row].text.clone(),
                score,
            })
            .collect())
    }

    /// Both stages: coarse retrieval followed by similarity reranking.
    pub fn search(&self, query: &str) -> Result<Vec<RankedPassage>> {
        let candidates = self.retrieve(query, self.config.n_returns)?;
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let ids: Vec<String> = candidates.iter().map(|c| c.passage_id.clone()).collect();
        self.ranker.re_rank(query, &texts, &ids)
    }
}

use crate::error::Result;

/// Capability boundary for turning passage text into a fixed-dimension
/// vector. The retrieval core has no dependency on any specific model
/// runtime behind this trait.
pub trait EmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

impl EmbeddingProvider for Box<dyn EmbeddingProvider> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// Capability boundary for scoring a query against candidate texts.
/// Returns one `(candidate_index, score)` pair per candidate, in the
/// provider's own internal ranking order.
pub trait SimilarityProvider {
    fn score(&self, query: &str, texts: &[String]) -> Result<Vec<(usize, f32)>>;
}

impl SimilarityProvider for Box<dyn SimilarityProvider> {
    fn score(&self, query: &str, texts: &[String]) -> Result<Vec<(usize, f32)>> {
        (**self).score(query, texts)
    }
}

/// Unit-normalizes every row in place. Zero rows are left untouched, and
/// already-normalized rows are unchanged within floating-point tolerance.
pub fn normalize_rows(rows: &mut [Vec<f32>]) {
    for row in rows {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in row.iter_mut() {
                *x /= norm;
            }
        }
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in token.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}

/// Deterministic feature-hashing embedder: each token is hashed into one of
/// `dim` buckets and the count vector is unit-normalized. Serves as the
/// bundled reference provider and as a test stand-in for a real model.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dim: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self { dim: 768 }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        for token in tokens(text) {
            let idx = (fnv1a(&token) as usize) % self.dim;
            v[idx] += 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }

        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Deterministic token-overlap reranker: scores each candidate by the
/// fraction of query tokens it contains. Output is ranked descending,
/// ties in candidate order.
#[derive(Debug, Clone, Default)]
pub struct LexicalSimilarityProvider;

impl SimilarityProvider for LexicalSimilarityProvider {
    fn score(&self, query: &str, texts: &[String]) -> Result<Vec<(usize, f32)>> {
        let query_tokens: Vec<String> = tokens(query).collect();

        let mut scored: Vec<(usize, f32)> = texts
            .iter()
            .enumerate()
            .map(|(idx, text)| {
                let text_tokens: Vec<String> = tokens(text).collect();
                let overlap = query_tokens
                    .iter()
                    .filter(|t| text_tokens.contains(t))
                    .count();
                let score = if query_tokens.is_empty() {
                    0.0
                } else {
                    overlap as f32 / query_tokens.len() as f32
                };
                (idx, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored)
    }
}

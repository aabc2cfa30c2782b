/// Flat inner-product nearest-neighbor structure over unit-normalized
/// vectors. Stands behind the approximate-index boundary: callers see only
/// `build` and `query`, so an approximate backend can be swapped in without
/// touching the retrieval pipeline.
#[derive(Debug, Clone, Default)]
pub struct FlatIpIndex {
    vectors: Vec<Vec<f32>>,
}

impl FlatIpIndex {
    pub fn build(vectors: Vec<Vec<f32>>) -> Self {
        Self { vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Top-`k` row indices by inner product, descending. Ties keep row
    /// order; this is the index's native ordering and callers must not
    /// re-sort coarse results.
    pub fn query(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(idx, row)| (idx, inner_product(vector, row)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

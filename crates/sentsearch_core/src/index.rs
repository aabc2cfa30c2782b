use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ann::FlatIpIndex;
use crate::embed::{normalize_rows, EmbeddingProvider};
use crate::error::{Result, SearchError};
use crate::model::{doc_key, Passage};
use crate::storage::{
    load_ids, load_matrix, load_metadata_rows, save_ids, save_json_pretty, save_matrix,
    save_metadata_rows, MetadataRow,
};

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const IDS_FILE: &str = "ids.txt";
pub const DATAFRAME_FILE: &str = "data.csv";
pub const CONFIG_FILE: &str = "config.json";

/// Passages indexed when no corpus is supplied, purely so a test index is
/// never empty.
const REFERENCE_CORPUS: &[(&str, &str)] = &[
    ("Reference 1.pdf_0", "the presidents of the united states are elected every four years"),
    ("Reference 1.pdf_1", "a communications satellite relays radio telecommunications signals"),
    ("Reference 2.pdf_0", "manhattan is the most densely populated borough of new york city"),
    ("Reference 2.pdf_1", "the hubble telescope orbits the earth outside the atmosphere"),
];

/// Reload metadata persisted alongside the vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimensions: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Drop incoming passages whose id is already present when extending.
    /// Defaults to false: extending with an already-indexed id duplicates
    /// it, and the id list records both occurrences.
    pub dedupe_on_extend: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            dedupe_on_extend: false,
        }
    }
}

/// Orchestrates the embedding provider and the ANN structure to build or
/// extend a persisted index from a corpus.
pub struct SentenceEncoder<E> {
    embedder: E,
    config: EncoderConfig,
}

impl<E: EmbeddingProvider> SentenceEncoder<E> {
    pub fn new(embedder: E, config: EncoderConfig) -> Self {
        Self { embedder, config }
    }

    /// Builds an index from `corpus` at `index_path`, or extends the index
    /// already persisted there when `overwrite` is false. Old rows come
    /// first, new rows are appended in corpus order. Passages the provider
    /// fails on are dropped from the batch.
    pub fn build_or_extend(
        &self,
        corpus: &[Passage],
        index_path: &Path,
        overwrite: bool,
    ) -> Result<EmbeddingIndex> {
        let corpus = if corpus.is_empty() {
            info!("no corpus supplied, indexing the bundled reference corpus");
            REFERENCE_CORPUS
                .iter()
                .map(|(id, text)| Passage::new(*id, *text))
                .collect()
        } else {
            corpus.to_vec()
        };

        let mut vectors = Vec::new();
        let mut ids = Vec::new();
        let mut rows = Vec::new();
        for passage in &corpus {
            match self.embedder.embed(&passage.text) {
                Ok(vector) => {
                    vectors.push(vector);
                    ids.push(passage.id.clone());
                    rows.push(MetadataRow {
                        text: passage.text.clone(),
                        paragraph_id: passage.id.clone(),
                    });
                }
                Err(err) => {
                    warn!(passage_id = %passage.id, %err, "embedding failed, dropping passage");
                }
            }
        }
        normalize_rows(&mut vectors);

        let dimensions = self.embedder.dimension();
        let embeddings_path = index_path.join(EMBEDDINGS_FILE);
        if embeddings_path.is_file() && !overwrite {
            let old_vectors = load_matrix(&embeddings_path)?;
            if let Some(row) = old_vectors.iter().find(|row| row.len() != dimensions) {
                return Err(SearchError::index_load(
                    index_path,
                    format!(
                        "cannot extend: embedder dimension is {dimensions}, persisted rows have {}",
                        row.len()
                    ),
                ));
            }
            let old_ids = load_ids(&index_path.join(IDS_FILE))?;
            let old_rows = load_metadata_rows(&index_path.join(DATAFRAME_FILE))?;
            info!(old = old_ids.len(), new = ids.len(), "extending persisted index");

            if self.config.dedupe_on_extend {
                let known: HashSet<&String> = old_ids.iter().collect();
                let mut kept_vectors = Vec::new();
                let mut kept_ids = Vec::new();
                let mut kept_rows = Vec::new();
                for ((vector, id), row) in vectors.into_iter().zip(ids).zip(rows) {
                    if known.contains(&id) {
                        warn!(passage_id = %id, "already indexed, skipping");
                    } else {
                        kept_vectors.push(vector);
                        kept_ids.push(id);
                        kept_rows.push(row);
                    }
                }
                vectors = kept_vectors;
                ids = kept_ids;
                rows = kept_rows;
            }

            let mut merged = old_vectors;
            merged.append(&mut vectors);
            vectors = merged;
            let mut merged = old_ids;
            merged.append(&mut ids);
            ids = merged;
            let mut merged = old_rows;
            merged.append(&mut rows);
            rows = merged;
        }

        fs::create_dir_all(index_path)?;
        save_matrix(&embeddings_path, &vectors, dimensions)?;
        save_ids(&index_path.join(IDS_FILE), &ids)?;
        save_metadata_rows(&index_path.join(DATAFRAME_FILE), &rows)?;
        save_json_pretty(
            &index_path.join(CONFIG_FILE),
            &IndexConfig {
                dimensions,
                ids: ids.clone(),
            },
        )?;

        let ann = FlatIpIndex::build(vectors.clone());
        info!(entries = ids.len(), "built embeddings index");
        Ok(EmbeddingIndex {
            vectors,
            ids,
            metadata: rows,
            ann,
            dimensions,
            location: index_path.to_path_buf(),
        })
    }
}

/// A loaded embedding index: parallel vectors, ids, and metadata rows plus
/// the nearest-neighbor structure over the vectors. Read-only once loaded;
/// mutation happens only through a rebuild via [`SentenceEncoder`].
pub struct EmbeddingIndex {
    pub vectors: Vec<Vec<f32>>,
    pub ids: Vec<String>,
    pub metadata: Vec<MetadataRow>,
    pub ann: FlatIpIndex,
    pub dimensions: usize,
    /// Directory the index was built at or loaded from.
    pub location: PathBuf,
}

impl EmbeddingIndex {
    pub fn load(index_path: &Path) -> Result<Self> {
        for name in [EMBEDDINGS_FILE, IDS_FILE, DATAFRAME_FILE, CONFIG_FILE] {
            if !index_path.join(name).is_file() {
                return Err(SearchError::index_load(
                    index_path,
                    format!("missing index file '{name}'"),
                ));
            }
        }

        let config: IndexConfig = crate::storage::load_json(&index_path.join(CONFIG_FILE))?;
        let vectors = load_matrix(&index_path.join(EMBEDDINGS_FILE))?;
        let ids = load_ids(&index_path.join(IDS_FILE))?;
        let metadata = load_metadata_rows(&index_path.join(DATAFRAME_FILE))?;

        if vectors.len() != ids.len() || ids.len() != metadata.len() {
            return Err(SearchError::index_load(
                index_path,
                format!(
                    "inconsistent index: {} vectors, {} ids, {} metadata rows",
                    vectors.len(),
                    ids.len(),
                    metadata.len()
                ),
            ));
        }
        if let Some(row) = vectors.iter().find(|row| row.len() != config.dimensions) {
            return Err(SearchError::index_load(
                index_path,
                format!(
                    "dimension mismatch: config says {}, found a row of {}",
                    config.dimensions,
                    row.len()
                ),
            ));
        }

        let ann = FlatIpIndex::build(vectors.clone());
        Ok(Self {
            vectors,
            ids,
            metadata,
            ann,
            dimensions: config.dimensions,
            location: index_path.to_path_buf(),
        })
    }

    /// Resolves a passage id to its stored text.
    pub fn text_of(&self, passage_id: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|row| row.paragraph_id == passage_id)
            .map(|row| row.text.as_str())
    }

    /// Metadata rows belonging to `doc`, in table order, capped at `cap`.
    /// Document names are compared case-insensitively after suffix
    /// normalization.
    pub fn passages_for_doc(&self, doc: &str, cap: usize) -> Vec<&MetadataRow> {
        let wanted = doc_key(doc);
        self.metadata
            .iter()
            .filter(|row| doc_key(&row.paragraph_id) == wanted)
            .take(cap)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingProvider;
    use tempfile::tempdir;

    fn encoder() -> SentenceEncoder<HashEmbeddingProvider> {
        SentenceEncoder::new(HashEmbeddingProvider::new(32), EncoderConfig::default())
    }

    fn corpus_a() -> Vec<Passage> {
        vec![
            Passage::new("D1.pdf_0", "the cat sat"),
            Passage::new("D2.pdf_0", "a dog ran"),
        ]
    }

    #[test]
    fn build_persists_a_consistent_index() {
        let dir = tempdir().unwrap();
        let index = encoder().build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        assert_eq!(index.vectors.len(), 2);
        assert_eq!(index.ids.len(), 2);
        assert_eq!(index.metadata.len(), 2);

        let loaded = EmbeddingIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.ids, vec!["D1.pdf_0", "D2.pdf_0"]);
        assert_eq!(loaded.dimensions, 32);
        assert_eq!(loaded.ann.len(), 2);
    }

    #[test]
    fn extend_appends_old_first() {
        let dir = tempdir().unwrap();
        let enc = encoder();
        enc.build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        let more = vec![Passage::new("D3.pdf_0", "birds fly south")];
        let index = enc.build_or_extend(&more, dir.path(), false).unwrap();

        assert_eq!(index.ids, vec!["D1.pdf_0", "D2.pdf_0", "D3.pdf_0"]);
        assert_eq!(index.vectors.len(), 3);
        assert_eq!(index.metadata.len(), 3);
    }

    #[test]
    fn extend_without_dedupe_duplicates_ids() {
        let dir = tempdir().unwrap();
        let enc = encoder();
        enc.build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        let again = vec![Passage::new("D1.pdf_0", "the cat sat")];
        let index = enc.build_or_extend(&again, dir.path(), false).unwrap();

        let count = index.ids.iter().filter(|id| *id == "D1.pdf_0").count();
        assert_eq!(count, 2);
        assert_eq!(index.vectors.len(), index.ids.len());
    }

    #[test]
    fn extend_with_dedupe_skips_known_ids() {
        let dir = tempdir().unwrap();
        let enc = SentenceEncoder::new(
            HashEmbeddingProvider::new(32),
            EncoderConfig {
                dedupe_on_extend: true,
            },
        );
        enc.build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        let again = vec![
            Passage::new("D1.pdf_0", "the cat sat"),
            Passage::new("D3.pdf_0", "birds fly south"),
        ];
        let index = enc.build_or_extend(&again, dir.path(), false).unwrap();

        assert_eq!(index.ids, vec!["D1.pdf_0", "D2.pdf_0", "D3.pdf_0"]);
    }

    #[test]
    fn overwrite_discards_previous_index() {
        let dir = tempdir().unwrap();
        let enc = encoder();
        enc.build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        let fresh = vec![Passage::new("D9.pdf_0", "something else")];
        let index = enc.build_or_extend(&fresh, dir.path(), true).unwrap();
        assert_eq!(index.ids, vec!["D9.pdf_0"]);
    }

    #[test]
    fn empty_corpus_falls_back_to_reference_data() {
        let dir = tempdir().unwrap();
        let index = encoder().build_or_extend(&[], dir.path(), true).unwrap();
        assert!(!index.ids.is_empty());
    }

    #[test]
    fn load_fails_on_missing_files() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            EmbeddingIndex::load(dir.path()),
            Err(SearchError::IndexLoad { .. })
        ));
    }

    #[test]
    fn load_fails_on_dimension_mismatch() {
        let dir = tempdir().unwrap();
        encoder().build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        save_json_pretty(
            &dir.path().join(CONFIG_FILE),
            &IndexConfig {
                dimensions: 64,
                ids: vec!["D1.pdf_0".into(), "D2.pdf_0".into()],
            },
        )
        .unwrap();

        assert!(matches!(
            EmbeddingIndex::load(dir.path()),
            Err(SearchError::IndexLoad { .. })
        ));
    }

    #[test]
    fn extend_with_wrong_embedder_dimension_fails_and_keeps_old_index() {
        let dir = tempdir().unwrap();
        encoder().build_or_extend(&corpus_a(), dir.path(), true).unwrap();

        let wider = SentenceEncoder::new(HashEmbeddingProvider::new(64), EncoderConfig::default());
        let more = vec![Passage::new("D3.pdf_0", "birds fly south")];
        let result = wider.build_or_extend(&more, dir.path(), false);
        assert!(matches!(result, Err(SearchError::IndexLoad { .. })));

        // Nothing was written, so the persisted index is still consistent.
        let loaded = EmbeddingIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.ids, vec!["D1.pdf_0", "D2.pdf_0"]);
        assert_eq!(loaded.dimensions, 32);
    }

    #[test]
    fn passages_for_doc_is_capped_and_case_insensitive() {
        let dir = tempdir().unwrap();
        let corpus: Vec<Passage> = (0..25)
            .map(|i| Passage::new(format!("D1.pdf_{i}"), format!("paragraph {i}")))
            .collect();
        let index = encoder().build_or_extend(&corpus, dir.path(), true).unwrap();

        assert_eq!(index.passages_for_doc("d1.PDF", 20).len(), 20);
        assert_eq!(index.passages_for_doc("D1", 25).len(), 25);
        assert!(index.passages_for_doc("D2", 20).is_empty());
    }
}

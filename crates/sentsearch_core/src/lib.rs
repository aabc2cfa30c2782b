pub mod ann;
pub mod embed;
pub mod error;
pub mod index;
pub mod mine;
pub mod model;
pub mod retrieve;
pub mod storage;

pub use ann::FlatIpIndex;
pub use embed::{
    normalize_rows, EmbeddingProvider, HashEmbeddingProvider, LexicalSimilarityProvider,
    SimilarityProvider,
};
pub use error::{Result, SearchError};
pub use index::{EmbeddingIndex, EncoderConfig, IndexConfig, SentenceEncoder};
pub use mine::{
    merge_gold_standard, mine, normalize_query, save_artifacts, train_test_split, MinedArtifacts,
    MinerConfig, DEFAULT_N_MATCHING, DEFAULT_SPLIT_RATIO, DEFAULT_SPLIT_SEED, MAX_DOC_PASSAGES,
};
pub use model::{
    doc_key, normalize_doc_id, truncate_tokens, DatasetMetadata, Label, NotFoundPair, Passage,
    RankedPassage, RelationSet, ScoredPassage, TrainingDataset, TrainingExample,
    MAX_PARAGRAPH_TOKENS,
};
pub use retrieve::{
    RetrieverConfig, SentenceSearcher, SimilarityRanker, DEFAULT_N_RETURNS,
};
pub use storage::MetadataRow;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::embed::{EmbeddingProvider, SimilarityProvider};
use crate::error::Result;
use crate::model::{
    doc_key, normalize_doc_id, truncate_tokens, DatasetMetadata, Label, NotFoundPair,
    RelationSet, TrainingDataset, TrainingExample, MAX_PARAGRAPH_TOKENS,
};
use crate::retrieve::SentenceSearcher;
use crate::storage::{make_timestamp_directory, save_json_pretty};

/// At most this many passages per document are considered for reranking.
pub const MAX_DOC_PASSAGES: usize = 20;
pub const DEFAULT_N_MATCHING: usize = 3;
pub const DEFAULT_SPLIT_RATIO: f64 = 0.8;
pub const DEFAULT_SPLIT_SEED: u64 = 42;

pub type ExampleMap = BTreeMap<String, TrainingExample>;
pub type NotFoundMap = BTreeMap<String, NotFoundPair>;

#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Reranked passages kept per (query, document) pair.
    pub n_matching: usize,
    /// Coarse candidates per query when sampling neutrals.
    pub n_returns: usize,
    pub split_ratio: f64,
    pub split_seed: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            n_matching: DEFAULT_N_MATCHING,
            n_returns: crate::retrieve::DEFAULT_N_RETURNS,
            split_ratio: DEFAULT_SPLIT_RATIO,
            split_seed: DEFAULT_SPLIT_SEED,
        }
    }
}

/// Everything one mining run produces: the splittable dataset, its summary
/// metadata, and the diagnostic not-found side channel.
#[derive(Debug, Clone)]
pub struct MinedArtifacts {
    pub dataset: TrainingDataset,
    pub metadata: DatasetMetadata,
    pub not_found: NotFoundMap,
}

/// Lowercases, trims, and collapses internal whitespace of a gold-standard
/// query string.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Allocates the next relation key in an existing sequence, continuing the
/// prefix and zero-padding of the current last key: `q0009` -> `q0010`.
fn next_key(keys: &BTreeMap<String, String>, default_prefix: char) -> String {
    match keys.keys().next_back() {
        Some(last) => {
            let prefix = last.chars().next().unwrap_or(default_prefix);
            let digits = &last[prefix.len_utf8()..];
            let width = digits.len().max(1);
            let num: u64 = digits.parse().unwrap_or(0);
            format!("{prefix}{:0width$}", num + 1, width = width)
        }
        None => format!("{default_prefix}{:04}", 1),
    }
}

/// Merges a manually curated gold-standard CSV (header-less rows of
/// `query, semicolon-separated document names`) into the relation set,
/// allocating fresh query/collection keys for unseen values and appending
/// to `correct` without duplicating existing relations.
pub fn merge_gold_standard(relations: &mut RelationSet, path: &Path) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;

    let mut rows: Vec<(String, Vec<String>)> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let query = normalize_query(record.get(0).unwrap_or_default());
        let docs: Vec<String> = record
            .get(1)
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        if !query.is_empty() && !docs.is_empty() {
            rows.push((query, docs));
        }
    }

    let mut query_ids: BTreeMap<String, String> = relations
        .queries
        .iter()
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect();
    let mut doc_ids: BTreeMap<String, String> = relations
        .collection
        .iter()
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect();

    for (query, docs) in rows {
        let query_id = match query_ids.get(&query) {
            Some(id) => id.clone(),
            None => {
                let id = next_key(&relations.queries, 'q');
                info!(%query, %id, "adding gold-standard query");
                relations.queries.insert(id.clone(), query.clone());
                query_ids.insert(query.clone(), id.clone());
                id
            }
        };

        for doc in docs {
            let collection_id = match doc_ids.get(&doc) {
                Some(id) => id.clone(),
                None => {
                    let id = next_key(&relations.collection, 'c');
                    info!(%doc, %id, "adding gold-standard document");
                    relations.collection.insert(id.clone(), doc.clone());
                    doc_ids.insert(doc.clone(), id.clone());
                    id
                }
            };

            let entry = relations.correct.entry(query_id.clone()).or_default();
            if !entry.contains(&collection_id) {
                entry.push(collection_id);
            }
        }
    }
    Ok(())
}

/// Splits an example map into train/test: `round(N * ratio)` keys sampled
/// without replacement from the given rng go to train, the rest to test.
pub fn train_test_split<R: Rng>(
    data: &ExampleMap,
    ratio: f64,
    rng: &mut R,
) -> (ExampleMap, ExampleMap) {
    let train_size = (data.len() as f64 * ratio).round() as usize;
    let keys: Vec<&String> = data.keys().collect();
    let train_keys: BTreeSet<&String> = keys
        .choose_multiple(rng, train_size)
        .copied()
        .collect();

    let mut train = ExampleMap::new();
    let mut test = ExampleMap::new();
    for (key, example) in data {
        if train_keys.contains(key) {
            train.insert(key.clone(), example.clone());
        } else {
            test.insert(key.clone(), example.clone());
        }
    }
    (train, test)
}

/// Mines `label`-ed examples for every (query, document) pair of one
/// relation mapping: the document's first [`MAX_DOC_PASSAGES`] metadata
/// rows are reranked against the query and the top `n_matching` kept.
/// Pairs that yield nothing land in the not-found map.
fn collect_matches<E, S>(
    searcher: &SentenceSearcher<E, S>,
    pairs: &BTreeMap<String, Vec<String>>,
    relations: &RelationSet,
    label: Label,
    n_matching: usize,
) -> (ExampleMap, NotFoundMap)
where
    E: EmbeddingProvider,
    S: SimilarityProvider,
{
    let mut found = ExampleMap::new();
    let mut not_found = NotFoundMap::new();

    for (query_id, collection_ids) in pairs {
        let Some(query) = relations.queries.get(query_id) else {
            warn!(%query_id, "relation references unknown query id, skipping");
            continue;
        };

        for collection_id in collection_ids {
            let Some(doc) = relations.collection.get(collection_id) else {
                warn!(%query_id, %collection_id, "relation references unknown collection id, skipping");
                continue;
            };

            let rows = searcher.index().passages_for_doc(doc, MAX_DOC_PASSAGES);
            if rows.is_empty() {
                warn!(%query_id, %doc, "no indexed passages for document");
                not_found.insert(
                    format!("{query_id}_{collection_id}"),
                    NotFoundPair {
                        query: query.clone(),
                        doc: doc.clone(),
                    },
                );
                continue;
            }

            let texts: Vec<String> = rows.iter().map(|r| r.text.clone()).collect();
            let ids: Vec<String> = rows.iter().map(|r| r.paragraph_id.clone()).collect();
            match searcher.ranker().re_rank(query, &texts, &ids) {
                Ok(ranked) => {
                    for passage in ranked.into_iter().take(n_matching) {
                        found.insert(
                            format!("{query_id}_{}", passage.passage_id),
                            TrainingExample {
                                query: query.clone(),
                                doc: doc.clone(),
                                paragraph: truncate_tokens(&passage.text, MAX_PARAGRAPH_TOKENS),
                                label,
                            },
                        );
                    }
                }
                Err(err) => {
                    warn!(%query_id, %doc, %err, "rerank failed for pair");
                    not_found.insert(
                        format!("{query_id}_{collection_id}"),
                        NotFoundPair {
                            query: query.clone(),
                            doc: doc.clone(),
                        },
                    );
                }
            }
        }
    }
    (found, not_found)
}

/// Samples neutral (`label=0`) examples: for every relation in the union of
/// `correct` and `incorrect`, coarse-retrieves `n_returns` candidates and
/// keeps those whose resolved document differs case-insensitively from all
/// of the query's expected documents.
fn collect_neutral<E, S>(
    searcher: &SentenceSearcher<E, S>,
    relations: &RelationSet,
    n_returns: usize,
) -> (ExampleMap, NotFoundMap)
where
    E: EmbeddingProvider,
    S: SimilarityProvider,
{
    let mut found = ExampleMap::new();
    let mut not_found = NotFoundMap::new();

    let query_ids: BTreeSet<&String> = relations
        .correct
        .keys()
        .chain(relations.incorrect.keys())
        .collect();

    for query_id in query_ids {
        let Some(query) = relations.queries.get(query_id) else {
            warn!(%query_id, "relation references unknown query id, skipping");
            continue;
        };
        let expected: BTreeSet<String> = relations.expected_doc_keys(query_id).into_iter().collect();

        let candidates = match searcher.retrieve(query, n_returns) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(%query_id, %err, "coarse retrieval failed for query");
                not_found.insert(
                    format!("{query_id}_{query_id}"),
                    NotFoundPair {
                        query: query.clone(),
                        doc: String::new(),
                    },
                );
                continue;
            }
        };

        let mut kept = 0;
        for candidate in &candidates {
            if expected.contains(&doc_key(&candidate.passage_id)) {
                continue;
            }
            kept += 1;
            found.insert(
                format!("{query_id}_{}", candidate.passage_id),
                TrainingExample {
                    query: query.clone(),
                    doc: normalize_doc_id(&candidate.passage_id).to_string(),
                    paragraph: truncate_tokens(&candidate.text, MAX_PARAGRAPH_TOKENS),
                    label: Label::Neutral,
                },
            );
        }
        info!(%query_id, kept, total = candidates.len(), "neutral samples for query");
    }
    (found, not_found)
}

/// Runs all three mining passes over the relation set and splits the found
/// examples per label type with the seeded rng, so train/test balance per
/// label follows the split ratio independently.
pub fn mine<E, S>(
    searcher: &SentenceSearcher<E, S>,
    relations: &RelationSet,
    config: &MinerConfig,
) -> Result<MinedArtifacts>
where
    E: EmbeddingProvider,
    S: SimilarityProvider,
{
    for err in relations.validate() {
        warn!(%err, "relation integrity violation");
    }

    let (correct_found, correct_nf) = collect_matches(
        searcher,
        &relations.correct,
        relations,
        Label::Positive,
        config.n_matching,
    );
    let (incorrect_found, incorrect_nf) = collect_matches(
        searcher,
        &relations.incorrect,
        relations,
        Label::Negative,
        config.n_matching,
    );
    let (neutral_found, neutral_nf) = collect_neutral(searcher, relations, config.n_returns);
    info!(
        positive = correct_found.len(),
        negative = incorrect_found.len(),
        neutral = neutral_found.len(),
        "mining passes complete"
    );

    let mut not_found = correct_nf;
    not_found.extend(incorrect_nf);
    not_found.extend(neutral_nf);

    let mut rng = StdRng::seed_from_u64(config.split_seed);
    let (correct_train, correct_test) = train_test_split(&correct_found, config.split_ratio, &mut rng);
    let (neutral_train, neutral_test) = train_test_split(&neutral_found, config.split_ratio, &mut rng);
    let (incorrect_train, incorrect_test) =
        train_test_split(&incorrect_found, config.split_ratio, &mut rng);

    let mut train = correct_train;
    train.extend(neutral_train);
    train.extend(incorrect_train);
    let mut test = correct_test;
    test.extend(neutral_test);
    test.extend(incorrect_test);

    let metadata = DatasetMetadata {
        date_created: Utc::now().format("%Y-%m-%d").to_string(),
        n_positive_samples: correct_found.len(),
        n_negative_samples: incorrect_found.len(),
        n_neutral_samples: neutral_found.len(),
        train_size: train.len(),
        test_size: test.len(),
        split_ratio: config.split_ratio,
    };

    Ok(MinedArtifacts {
        dataset: TrainingDataset { train, test },
        metadata,
        not_found,
    })
}

/// Persists one run's artifacts into a fresh timestamped directory under
/// `base_dir` and returns that directory.
pub fn save_artifacts(artifacts: &MinedArtifacts, base_dir: &Path) -> Result<PathBuf> {
    let dir = make_timestamp_directory(base_dir)?;
    save_json_pretty(&dir.join("training_data.json"), &artifacts.dataset)?;
    save_json_pretty(&dir.join("training_metadata.json"), &artifacts.metadata)?;
    save_json_pretty(&dir.join("not_found_search_pairs.json"), &artifacts.not_found)?;
    info!(dir = %dir.display(), "saved training dataset");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{HashEmbeddingProvider, LexicalSimilarityProvider};
    use crate::index::{EncoderConfig, SentenceEncoder};
    use crate::model::Passage;
    use crate::retrieve::RetrieverConfig;
    use std::io::Write;
    use tempfile::tempdir;

    fn fixture_searcher() -> SentenceSearcher<HashEmbeddingProvider, LexicalSimilarityProvider> {
        let dir = tempdir().unwrap();
        let embedder = HashEmbeddingProvider::new(64);
        let encoder = SentenceEncoder::new(embedder.clone(), EncoderConfig::default());
        let corpus = vec![
            Passage::new("D1.pdf_0", "the cat sat"),
            Passage::new("D1.pdf_1", "cats like warm places"),
            Passage::new("D2.pdf_0", "a dog ran"),
            Passage::new("D3.pdf_0", "cat nap in the sun"),
        ];
        let index = encoder.build_or_extend(&corpus, dir.path(), true).unwrap();
        SentenceSearcher::new(
            index,
            embedder,
            LexicalSimilarityProvider,
            RetrieverConfig { n_returns: 4 },
        )
        .unwrap()
    }

    fn fixture_relations() -> RelationSet {
        let mut relations = RelationSet::default();
        relations.queries.insert("q0001".into(), "cat".into());
        relations.collection.insert("c0001".into(), "D1.pdf".into());
        relations.collection.insert("c0002".into(), "D2.pdf".into());
        relations
            .correct
            .insert("q0001".into(), vec!["c0001".into()]);
        relations
            .incorrect
            .insert("q0001".into(), vec!["c0002".into()]);
        relations
    }

    fn fixture_config() -> MinerConfig {
        MinerConfig {
            n_matching: 1,
            n_returns: 4,
            split_ratio: 0.5,
            split_seed: 7,
        }
    }

    #[test]
    fn mines_positive_example_for_correct_relation() {
        let searcher = fixture_searcher();
        let artifacts = mine(&searcher, &fixture_relations(), &fixture_config()).unwrap();

        let all: ExampleMap = artifacts
            .dataset
            .train
            .iter()
            .chain(artifacts.dataset.test.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let positive = all
            .get("q0001_D1.pdf_0")
            .expect("positive example keyed by query and passage");
        assert_eq!(positive.label, Label::Positive);
        assert_eq!(positive.doc, "D1.pdf");
        assert_eq!(positive.paragraph, "the cat sat");
    }

    #[test]
    fn mines_confirmed_negative_from_incorrect_relation() {
        let searcher = fixture_searcher();
        let artifacts = mine(&searcher, &fixture_relations(), &fixture_config()).unwrap();

        let all: Vec<&TrainingExample> = artifacts
            .dataset
            .train
            .values()
            .chain(artifacts.dataset.test.values())
            .collect();
        let negative: Vec<_> = all.iter().filter(|e| e.label == Label::Negative).collect();
        assert_eq!(negative.len(), 1);
        assert_eq!(negative[0].doc, "D2.pdf");
    }

    #[test]
    fn neutral_samples_exclude_expected_docs_case_insensitively() {
        let searcher = fixture_searcher();
        let relations = fixture_relations();
        let artifacts = mine(&searcher, &relations, &fixture_config()).unwrap();

        let neutrals: Vec<(&String, &TrainingExample)> = artifacts
            .dataset
            .train
            .iter()
            .chain(artifacts.dataset.test.iter())
            .filter(|(_, e)| e.label == Label::Neutral)
            .collect();

        assert!(!neutrals.is_empty());
        let expected: BTreeSet<String> =
            relations.expected_doc_keys("q0001").into_iter().collect();
        for (_, example) in &neutrals {
            assert!(!expected.contains(&doc_key(&example.doc)));
        }
        // D3 is the only indexed doc outside the relations.
        assert!(neutrals.iter().all(|(key, _)| key.starts_with("q0001_D3")));
    }

    #[test]
    fn train_and_test_are_disjoint_and_cover_everything() {
        let searcher = fixture_searcher();
        let artifacts = mine(&searcher, &fixture_relations(), &fixture_config()).unwrap();

        let train_keys: BTreeSet<&String> = artifacts.dataset.train.keys().collect();
        let test_keys: BTreeSet<&String> = artifacts.dataset.test.keys().collect();
        assert!(train_keys.is_disjoint(&test_keys));
        assert_eq!(
            train_keys.len() + test_keys.len(),
            artifacts.metadata.n_positive_samples
                + artifacts.metadata.n_negative_samples
                + artifacts.metadata.n_neutral_samples
        );
    }

    #[test]
    fn split_is_deterministic_for_a_fixed_seed() {
        let mut data = ExampleMap::new();
        for i in 0..10 {
            data.insert(
                format!("q{i}_p{i}"),
                TrainingExample {
                    query: "q".into(),
                    doc: "d".into(),
                    paragraph: "p".into(),
                    label: Label::Neutral,
                },
            );
        }

        let mut rng_a = StdRng::seed_from_u64(3);
        let mut rng_b = StdRng::seed_from_u64(3);
        let (train_a, test_a) = train_test_split(&data, 0.6, &mut rng_a);
        let (train_b, test_b) = train_test_split(&data, 0.6, &mut rng_b);

        assert_eq!(train_a.keys().collect::<Vec<_>>(), train_b.keys().collect::<Vec<_>>());
        assert_eq!(test_a.keys().collect::<Vec<_>>(), test_b.keys().collect::<Vec<_>>());
        assert_eq!(train_a.len(), 6);
        assert_eq!(test_a.len(), 4);
    }

    #[test]
    fn pair_without_indexed_passages_goes_to_not_found() {
        let searcher = fixture_searcher();
        let mut relations = fixture_relations();
        relations
            .collection
            .insert("c0003".into(), "Ghost.pdf".into());
        relations
            .correct
            .get_mut("q0001")
            .unwrap()
            .push("c0003".into());

        let artifacts = mine(&searcher, &relations, &fixture_config()).unwrap();
        let pair = artifacts.not_found.get("q0001_c0003").expect("not-found pair");
        assert_eq!(pair.doc, "Ghost.pdf");
        assert!(!artifacts.dataset.train.contains_key("q0001_c0003"));
        assert!(!artifacts.dataset.test.contains_key("q0001_c0003"));
    }

    #[test]
    fn dangling_relation_entries_are_skipped_not_fatal() {
        let searcher = fixture_searcher();
        let mut relations = fixture_relations();
        relations
            .incorrect
            .insert("q9999".into(), vec!["c9999".into()]);

        let artifacts = mine(&searcher, &relations, &fixture_config()).unwrap();
        let keys: Vec<&String> = artifacts
            .dataset
            .train
            .keys()
            .chain(artifacts.dataset.test.keys())
            .collect();
        assert!(keys.iter().all(|k| !k.starts_with("q9999")));
    }

    #[test]
    fn save_artifacts_writes_timestamped_run_dir() {
        let searcher = fixture_searcher();
        let artifacts = mine(&searcher, &fixture_relations(), &fixture_config()).unwrap();

        let base = tempdir().unwrap();
        let dir = save_artifacts(&artifacts, base.path()).unwrap();
        assert!(dir.join("training_data.json").is_file());
        assert!(dir.join("training_metadata.json").is_file());
        assert!(dir.join("not_found_search_pairs.json").is_file());
    }

    #[test]
    fn normalize_query_lowercases_and_collapses() {
        assert_eq!(normalize_query("  What   IS a Cat? "), "what is a cat?");
    }

    #[test]
    fn next_key_continues_prefix_and_padding() {
        let mut map = BTreeMap::new();
        map.insert("q0009".to_string(), "x".to_string());
        assert_eq!(next_key(&map, 'q'), "q0010");
        assert_eq!(next_key(&BTreeMap::new(), 'c'), "c0001");
    }

    #[test]
    fn next_key_handles_multibyte_prefix() {
        let mut map = BTreeMap::new();
        map.insert("ф007".to_string(), "x".to_string());
        assert_eq!(next_key(&map, 'q'), "ф008");
    }

    #[test]
    fn gold_standard_merge_adds_queries_docs_and_relations() {
        let mut relations = fixture_relations();

        let dir = tempdir().unwrap();
        let path = dir.path().join("gold.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Cat,D1.pdf;D4.pdf").unwrap();
        writeln!(file, "where do birds go,D5.pdf").unwrap();
        drop(file);

        merge_gold_standard(&mut relations, &path).unwrap();

        // "cat" already exists; D4/D5 and the new query get fresh keys.
        assert_eq!(relations.queries.len(), 2);
        assert_eq!(relations.queries.get("q0002").unwrap(), "where do birds go");
        assert_eq!(relations.collection.len(), 4);
        assert_eq!(relations.collection.get("c0003").unwrap(), "D4.pdf");
        assert_eq!(relations.collection.get("c0004").unwrap(), "D5.pdf");

        let cat_docs = relations.correct.get("q0001").unwrap();
        assert!(cat_docs.contains(&"c0001".to_string()));
        assert!(cat_docs.contains(&"c0003".to_string()));
        assert_eq!(cat_docs.iter().filter(|d| *d == "c0001").count(), 1);
        assert_eq!(relations.correct.get("q0002").unwrap(), &vec!["c0004".to_string()]);
    }
}

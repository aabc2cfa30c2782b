use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Maximum number of whitespace-delimited tokens kept in a training paragraph.
pub const MAX_PARAGRAPH_TOKENS: usize = 400;

/// A paragraph-level unit of text, the atomic indexed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub source_document_id: String,
}

impl Passage {
    /// Builds a passage, deriving the source document id from the
    /// paragraph id by stripping the document-format suffix.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let source_document_id = normalize_doc_id(&id).to_string();
        Self {
            id,
            text: text.into(),
            source_document_id,
        }
    }
}

/// Strips the document-format suffix from a paragraph or document id,
/// recovering the document name: `"Title 10.pdf_3"` -> `"Title 10"`.
pub fn normalize_doc_id(id: &str) -> &str {
    id.split(".pdf").next().unwrap_or(id)
}

/// Case-insensitive comparison key for document names: lowercased, with the
/// document-format suffix stripped.
pub fn doc_key(id: &str) -> String {
    let lower = id.to_ascii_lowercase();
    lower.split(".pdf").next().unwrap_or(&lower).to_string()
}

/// Keeps at most `max` whitespace-delimited tokens of `text`.
pub fn truncate_tokens(text: &str, max: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().take(max).collect();
    tokens.join(" ")
}

/// One coarse-retrieval candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage_id: String,
    pub text: String,
    pub score: f32,
}

/// One reranked candidate, ordered by descending rerank score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPassage {
    pub passage_id: String,
    pub text: String,
    pub score: f32,
}

/// Training label: serialized as the integers 1 / 0 / -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Label {
    Positive,
    Neutral,
    Negative,
}

impl From<Label> for i8 {
    fn from(label: Label) -> i8 {
        match label {
            Label::Positive => 1,
            Label::Neutral => 0,
            Label::Negative => -1,
        }
    }
}

impl TryFrom<i8> for Label {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Label::Positive),
            0 => Ok(Label::Neutral),
            -1 => Ok(Label::Negative),
            other => Err(format!("invalid label value: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub query: String,
    pub doc: String,
    pub paragraph: String,
    pub label: Label,
}

/// A (query, document) pair for which no passage could be mined, persisted
/// as a diagnostic artifact alongside the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotFoundPair {
    pub query: String,
    pub doc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDataset {
    pub train: BTreeMap<String, TrainingExample>,
    pub test: BTreeMap<String, TrainingExample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub date_created: String,
    pub n_positive_samples: usize,
    pub n_negative_samples: usize,
    pub n_neutral_samples: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub split_ratio: f64,
}

/// Curated ground truth mapping queries to relevant/irrelevant documents.
///
/// `correct` and `incorrect` reference entries of `queries` and `collection`
/// by id; dangling references are reported by [`RelationSet::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationSet {
    pub queries: BTreeMap<String, String>,
    pub collection: BTreeMap<String, String>,
    #[serde(default)]
    pub correct: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub incorrect: BTreeMap<String, Vec<String>>,
}

impl RelationSet {
    /// Parses a relation set from a JSON file. A failure here is fatal to
    /// the mining run.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let relations: RelationSet = serde_json::from_reader(file)?;
        Ok(relations)
    }

    /// Returns one integrity error per relation entry referencing a query
    /// or collection id that does not exist.
    pub fn validate(&self) -> Vec<SearchError> {
        let mut errors = Vec::new();
        for (name, relations) in [("correct", &self.correct), ("incorrect", &self.incorrect)] {
            for (query_id, collection_ids) in relations {
                if !self.queries.contains_key(query_id) {
                    errors.push(SearchError::RelationIntegrity(format!(
                        "{name} references unknown query id '{query_id}'"
                    )));
                }
                for collection_id in collection_ids {
                    if !self.collection.contains_key(collection_id) {
                        errors.push(SearchError::RelationIntegrity(format!(
                            "{name}[{query_id}] references unknown collection id '{collection_id}'"
                        )));
                    }
                }
            }
        }
        errors
    }

    /// Comparison keys (see [`doc_key`]) of the expected documents for a
    /// query id, drawn from both relation kinds. Dangling collection ids
    /// are skipped.
    pub fn expected_doc_keys(&self, query_id: &str) -> Vec<String> {
        let mut docs = Vec::new();
        for relations in [&self.correct, &self.incorrect] {
            if let Some(collection_ids) = relations.get(query_id) {
                for collection_id in collection_ids {
                    if let Some(doc) = self.collection.get(collection_id) {
                        docs.push(doc_key(doc));
                    }
                }
            }
        }
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_strips_format_suffix() {
        assert_eq!(normalize_doc_id("Title 10.pdf_3"), "Title 10");
        assert_eq!(normalize_doc_id("Title 10.pdf"), "Title 10");
        assert_eq!(normalize_doc_id("plain-id"), "plain-id");
    }

    #[test]
    fn truncate_caps_token_count() {
        let text = "a b c d e";
        assert_eq!(truncate_tokens(text, 3), "a b c");
        assert_eq!(truncate_tokens(text, 10), "a b c d e");
    }

    #[test]
    fn label_serializes_as_integer() {
        let json = serde_json::to_string(&Label::Negative).unwrap();
        assert_eq!(json, "-1");
        let back: Label = serde_json::from_str("1").unwrap();
        assert_eq!(back, Label::Positive);
    }

    #[test]
    fn validate_reports_dangling_references() {
        let mut relations = RelationSet::default();
        relations.queries.insert("q0001".into(), "cat".into());
        relations
            .correct
            .insert("q0001".into(), vec!["c0001".into()]);
        relations
            .incorrect
            .insert("q0002".into(), vec!["c0002".into()]);

        let errors = relations.validate();
        // c0001 missing, q0002 missing, c0002 missing
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn expected_doc_keys_cover_both_relation_kinds() {
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

        assert_eq!(relations.expected_doc_keys("q0001"), vec!["d1", "d2"]);
    }
}

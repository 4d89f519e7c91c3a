use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{Ephemeral, StorePersistence};

pub const MAX_DOC_CHARS: usize = 8000;
pub const MAX_DOC_TOKENS: usize = 500;
pub const SNIPPET_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagDocument {
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub added_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagData {
    #[serde(default)]
    pub docs: Vec<RagDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedDoc {
    pub doc_id: String,
    pub score: f64,
    pub snippet: String,
    pub metadata: Map<String, Value>,
}

pub trait RetrievalService: Send + Sync {
    fn similarity(&self, query: &str, top_k: usize) -> Vec<RetrievedDoc>;
}

/// Lower-cased `[A-Za-z0-9_]{2,}` runs, capped per document.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| token.len() >= 2)
        .map(str::to_ascii_lowercase)
        .take(MAX_DOC_TOKENS)
        .collect()
}

fn term_frequencies(tokens: &[String]) -> BTreeMap<&str, usize> {
    let mut tf = BTreeMap::new();
    for token in tokens {
        *tf.entry(token.as_str()).or_insert(0) += 1;
    }
    tf
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn round_score(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Default)]
struct RagIndex {
    docs: Vec<RagDocument>,
    df: HashMap<String, usize>,
}

impl RagIndex {
    fn from_data(data: RagData) -> Self {
        let mut index = Self {
            docs: data.docs,
            df: HashMap::new(),
        };
        index.rebuild_df();
        index
    }

    fn rebuild_df(&mut self) {
        self.df.clear();
        for doc in &self.docs {
            let unique = tokenize(&doc.text).into_iter().collect::<HashSet<String>>();
            for token in unique {
                *self.df.entry(token).or_insert(0) += 1;
            }
        }
    }

    fn idf(&self, token: &str) -> f64 {
        let n = self.docs.len().max(1) as f64;
        let df = self.df.get(token).copied().unwrap_or(0).max(1) as f64;
        (1.0 + n / df).ln()
    }

    fn to_data(&self) -> RagData {
        RagData {
            docs: self.docs.clone(),
        }
    }
}

/// Small persisted corpus scored with TF-IDF cosine similarity.
pub struct RagStore {
    index: Mutex<RagIndex>,
    persistence: Box<dyn StorePersistence<RagData>>,
}

impl RagStore {
    pub fn open(persistence: Box<dyn StorePersistence<RagData>>) -> Result<Self> {
        let data = persistence.load()?.unwrap_or_default();
        tracing::debug!(
            store = %persistence.describe(),
            docs = data.docs.len(),
            "rag store loaded"
        );
        Ok(Self {
            index: Mutex::new(RagIndex::from_data(data)),
            persistence,
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            index: Mutex::new(RagIndex::default()),
            persistence: Box::new(Ephemeral),
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces `doc_id`. A replaced document keeps its original
    /// rank position for tie-breaking. Blank texts are ignored.
    pub fn add_document(&self, doc_id: &str, text: &str, metadata: Map<String, Value>) -> Result<bool> {
        if text.trim().is_empty() {
            tracing::debug!(doc_id, "skipping blank rag document");
            return Ok(false);
        }

        let doc = RagDocument {
            doc_id: doc_id.to_string(),
            text: truncate_chars(text, MAX_DOC_CHARS),
            metadata,
            added_unix_ms: Utc::now().timestamp_millis(),
        };

        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        match index.docs.iter_mut().find(|existing| existing.doc_id == doc.doc_id) {
            Some(existing) => *existing = doc,
            None => index.docs.push(doc),
        }
        index.rebuild_df();
        self.persistence.save(&index.to_data())?;
        Ok(true)
    }

    pub fn get(&self, doc_id: &str) -> Option<RagDocument> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.docs.iter().find(|doc| doc.doc_id == doc_id).cloned()
    }

    /// Renders the best matches as a prompt preamble, bounded by `max_chars`.
    /// Empty when nothing matches.
    pub fn contextualize(&self, query: &str, top_k: usize, max_chars: usize) -> String {
        let mut out = String::new();
        for doc in self.similarity(query, top_k) {
            let line = format!("[DOC {} S={}] {}\n", doc.doc_id, doc.score, doc.snippet);
            let remaining = max_chars.saturating_sub(out.chars().count());
            if remaining == 0 {
                break;
            }
            out.push_str(&truncate_chars(&line, remaining));
        }
        out.trim_end().to_string()
    }
}

impl RetrievalService for RagStore {
    fn similarity(&self, query: &str, top_k: usize) -> Vec<RetrievedDoc> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        if index.docs.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let q_tokens = tokenize(query);
        if q_tokens.is_empty() {
            return Vec::new();
        }

        let q_len = q_tokens.len() as f64;
        let q_vec = term_frequencies(&q_tokens)
            .into_iter()
            .map(|(token, count)| (token, (count as f64 / q_len) * index.idf(token)))
            .collect::<BTreeMap<&str, f64>>();
        let q_norm = q_vec.values().map(|v| v * v).sum::<f64>().sqrt();
        if q_norm <= 0.0 {
            return Vec::new();
        }

        let mut scored = index
            .docs
            .iter()
            .filter_map(|doc| {
                let d_tokens = tokenize(&doc.text);
                if d_tokens.is_empty() {
                    return None;
                }
                let d_len = d_tokens.len() as f64;
                let d_vec = term_frequencies(&d_tokens)
                    .into_iter()
                    .map(|(token, count)| (token, (count as f64 / d_len) * index.idf(token)))
                    .collect::<BTreeMap<&str, f64>>();
                let dot = q_vec
                    .iter()
                    .map(|(token, weight)| weight * d_vec.get(token).copied().unwrap_or(0.0))
                    .sum::<f64>();
                let d_norm = d_vec.values().map(|v| v * v).sum::<f64>().sqrt();
                if d_norm <= 0.0 {
                    return None;
                }
                let score = round_score(dot / (q_norm * d_norm));
                (score > 0.0).then(|| RetrievedDoc {
                    doc_id: doc.doc_id.clone(),
                    score,
                    snippet: truncate_chars(&doc.text, SNIPPET_CHARS).replace('\n', " "),
                    metadata: doc.metadata.clone(),
                })
            })
            .collect::<Vec<RetrievedDoc>>();

        // stable: equal scores keep corpus order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFile;
    use serde_json::json;
    use tempfile::tempdir;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn relevant_document_wins() {
        let rag = RagStore::ephemeral();
        rag.add_document("doc1", "FastAPI project with auth and posts", Map::new())
            .unwrap();
        rag.add_document("doc2", "unrelated gardening tips", Map::new())
            .unwrap();

        let hits = rag.similarity("auth posts", 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc1");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn single_document_corpus_still_scores() {
        let rag = RagStore::ephemeral();
        rag.add_document("only", "react dashboard with charts", Map::new())
            .unwrap();
        let hits = rag.similarity("charts", 3);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn results_are_bounded_and_sorted_descending() {
        let rag = RagStore::ephemeral();
        let texts = [
            "rust api server with postgres",
            "postgres backup scripts",
            "rust cli for postgres migrations and api docs",
            "vue frontend",
            "api gateway in rust",
        ];
        for (i, text) in texts.iter().enumerate() {
            rag.add_document(&format!("d{i}"), text, Map::new()).unwrap();
        }

        for top_k in 0..6 {
            let hits = rag.similarity("rust api postgres", top_k);
            assert!(hits.len() <= top_k);
            for pair in hits.windows(2) {
                assert!(pair[0].score >= pair[1].score);
            }
        }
    }

    #[test]
    fn ties_follow_insertion_order() {
        let rag = RagStore::ephemeral();
        rag.add_document("first", "auth service", Map::new()).unwrap();
        rag.add_document("second", "auth service", Map::new()).unwrap();
        rag.add_document("third", "billing", Map::new()).unwrap();
        let ids: Vec<String> = rag
            .similarity("auth", 5)
            .into_iter()
            .map(|hit| hit.doc_id)
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn scoring_is_deterministic() {
        let rag = RagStore::ephemeral();
        rag.add_document("a", "graphql api with auth", Map::new()).unwrap();
        rag.add_document("b", "rest api with posts", Map::new()).unwrap();
        assert_eq!(rag.similarity("api auth", 2), rag.similarity("api auth", 2));
    }

    #[test]
    fn re_adding_an_id_replaces_document() {
        let rag = RagStore::ephemeral();
        rag.add_document("doc", "old text about gardening", meta(json!({"v": 1})))
            .unwrap();
        rag.add_document("doc", "new text about kubernetes", meta(json!({"v": 2})))
            .unwrap();
        assert_eq!(rag.len(), 1);
        assert!(rag.similarity("gardening", 3).is_empty());
        let hits = rag.similarity("kubernetes", 3);
        assert_eq!(hits[0].metadata.get("v"), Some(&json!(2)));
    }

    #[test]
    fn blank_documents_are_ignored() {
        let rag = RagStore::ephemeral();
        assert!(!rag.add_document("blank", "   ", Map::new()).unwrap());
        assert!(rag.is_empty());
    }

    #[test]
    fn persists_and_reloads_corpus() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rag.json");
        {
            let rag = RagStore::open(Box::new(JsonFile::new(&path))).unwrap();
            rag.add_document("doc1", "FastAPI project with auth", Map::new())
                .unwrap();
        }
        let rag = RagStore::open(Box::new(JsonFile::new(&path))).unwrap();
        assert_eq!(rag.len(), 1);
        assert_eq!(rag.similarity("fastapi", 1)[0].doc_id, "doc1");
    }

    #[test]
    fn contextualize_respects_char_budget() {
        let rag = RagStore::ephemeral();
        rag.add_document("doc1", "FastAPI project with auth and posts", Map::new())
            .unwrap();
        let full = rag.contextualize("auth", 3, 10_000);
        assert!(full.starts_with("[DOC doc1 S="));
        let clipped = rag.contextualize("auth", 3, 12);
        assert!(clipped.chars().count() <= 12);
        assert!(rag.contextualize("nothing-matches-here", 3, 100).is_empty());
    }

    #[test]
    fn tokenizer_drops_short_tokens_and_punctuation() {
        assert_eq!(
            tokenize("A FastAPI-app, v2: auth_token!"),
            vec!["fastapi", "app", "v2", "auth_token"]
        );
    }
}

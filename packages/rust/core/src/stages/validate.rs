//! Metadata validation and normalisation of corpus fields.
//!
//! Reads the `source` namespace and writes a cleaned view under `validate`:
//! normalised title, DOI and arXiv identifiers, publication year, abstract
//! presence and author count. A record without a title is invalid input.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Datelike;
use paperflow_shared::{Record, SOURCE_NAMESPACE, StageDescriptor, StageError, VALIDATE_STAGE};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::stage::{RecordOutcome, Stage};

/// Logic version of this stage.
pub const VALIDATE_VERSION: u32 = 1;

static DOI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(10\.\d{4,9}/[^\s"<>]+)"#).expect("DOI regex")
});

static ARXIV_NEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:arxiv[:./]\s*)?(\d{4}\.\d{4,5})(v\d+)?").expect("arXiv regex")
});

static ARXIV_OLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z\-]+(?:\.[a-z]{2})?/\d{7})(v\d+)?\b").expect("arXiv legacy regex")
});

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[89]\d{2}|20\d{2})\b").expect("year regex"));

pub struct ValidateStage {
    descriptor: StageDescriptor,
}

impl ValidateStage {
    pub fn new() -> Self {
        let descriptor = StageDescriptor::new(VALIDATE_STAGE, VALIDATE_VERSION, VALIDATE_STAGE)
            .requires(source_key("title"))
            .with_batch_size(256)
            .with_transient(Vec::new());
        Self { descriptor }
    }
}

impl Default for ValidateStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run_batch(&self, batch: &[Record]) -> Result<Vec<RecordOutcome>, StageError> {
        Ok(batch
            .iter()
            .map(|r| (r.record_id.clone(), validate(r)))
            .collect())
    }
}

fn source_key(field: &str) -> String {
    format!("{SOURCE_NAMESPACE}.{field}")
}

/// Validate one record's source metadata.
pub fn validate(record: &Record) -> Result<Value, StageError> {
    let title = record
        .get_str(&source_key("title"))
        .map(normalize_whitespace)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StageError::invalid_input("missing title"))?;

    let mut out = Map::new();
    let mut warnings: Vec<String> = Vec::new();
    out.insert("title".into(), json!(title));

    if let Some(raw) = record.get_str(&source_key("doi")) {
        match extract_doi(raw) {
            Some(doi) => {
                out.insert("doi".into(), json!(doi));
            }
            None => warnings.push(format!("malformed doi '{raw}'")),
        }
    }

    let arxiv_raw = record
        .get_str(&source_key("arxiv_id"))
        .or_else(|| record.get_str(&source_key("arxiv")));
    let arxiv = arxiv_raw
        .and_then(extract_arxiv)
        .or_else(|| out.get("doi").and_then(Value::as_str).and_then(arxiv_from_doi));
    match (arxiv, arxiv_raw) {
        (Some(id), _) => {
            out.insert("arxiv_id".into(), json!(id));
        }
        (None, Some(raw)) => warnings.push(format!("malformed arxiv id '{raw}'")),
        (None, None) => {}
    }

    if let Some(year) = extract_year(record) {
        out.insert("year".into(), json!(year));
    }

    out.insert(
        "has_abstract".into(),
        json!(record.has(&source_key("abstract"))),
    );
    out.insert("author_count".into(), json!(author_count(record)));

    if !warnings.is_empty() {
        out.insert("warnings".into(), json!(warnings));
    }
    Ok(Value::Object(out))
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased DOI with resolver prefixes and trailing punctuation removed.
pub fn extract_doi(raw: &str) -> Option<String> {
    let caps = DOI_RE.captures(raw)?;
    let doi = caps[1].trim_end_matches(['.', ',', ';', ')', ']']);
    Some(doi.to_lowercase())
}

/// arXiv identifier without version suffix.
pub fn extract_arxiv(raw: &str) -> Option<String> {
    if let Some(caps) = ARXIV_NEW_RE.captures(raw) {
        return Some(caps[1].to_string());
    }
    ARXIV_OLD_RE
        .captures(raw)
        .map(|caps| caps[1].to_lowercase())
}

fn arxiv_from_doi(doi: &str) -> Option<String> {
    doi.strip_prefix("10.48550/arxiv.").and_then(extract_arxiv)
}

fn extract_year(record: &Record) -> Option<i64> {
    let max_year = i64::from(chrono::Utc::now().year()) + 1;
    let plausible = |y: i64| (1800..=max_year).contains(&y).then_some(y);

    if let Some(year) = record.get_f64(&source_key("year")) {
        return plausible(year as i64);
    }
    ["published", "date", "publication_date"]
        .iter()
        .find_map(|f| record.get_str(&source_key(f)))
        .and_then(|s| YEAR_RE.captures(s))
        .and_then(|caps| caps[1].parse().ok())
        .and_then(plausible)
}

fn author_count(record: &Record) -> usize {
    match record.get(&source_key("authors")) {
        Some(Value::Array(items)) => items.len(),
        Some(Value::String(s)) => s
            .split([';', '\n'])
            .flat_map(|part| part.split(" and "))
            .filter(|name| !name.trim().is_empty())
            .count(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> Record {
        Record::new("A")
            .with_field("source.title", "  Attention   Is All\nYou Need ")
            .with_field("source.doi", "https://doi.org/10.48550/arXiv.1706.03762")
            .with_field("source.year", 2017)
            .with_field("source.authors", json!(["Vaswani", "Shazeer", "Parmar"]))
            .with_field("source.abstract", "The dominant sequence transduction models...")
    }

    #[test]
    fn normalises_title_and_identifiers() {
        let out = validate(&paper()).unwrap();
        assert_eq!(out["title"], "Attention Is All You Need");
        assert_eq!(out["doi"], "10.48550/arxiv.1706.03762");
        assert_eq!(out["arxiv_id"], "1706.03762");
        assert_eq!(out["year"], 2017);
        assert_eq!(out["author_count"], 3);
        assert_eq!(out["has_abstract"], true);
        assert!(out.get("warnings").is_none());
    }

    #[test]
    fn missing_title_is_invalid_input() {
        let err = validate(&Record::new("B").with_field("source.doi", "10.1/x")).unwrap_err();
        assert_eq!(err.kind, paperflow_shared::ErrorKind::InvalidInput);
    }

    #[test]
    fn malformed_doi_is_a_warning() {
        let record = Record::new("C")
            .with_field("source.title", "T")
            .with_field("source.doi", "not-a-doi");
        let out = validate(&record).unwrap();
        assert!(out.get("doi").is_none());
        assert_eq!(out["warnings"][0], "malformed doi 'not-a-doi'");
    }

    #[test]
    fn doi_trailing_punctuation_trimmed() {
        assert_eq!(
            extract_doi("see 10.1145/3290605.3300233."),
            Some("10.1145/3290605.3300233".into())
        );
    }

    #[test]
    fn arxiv_forms() {
        assert_eq!(extract_arxiv("arXiv:2103.00020v2"), Some("2103.00020".into()));
        assert_eq!(extract_arxiv("hep-th/9901001"), Some("hep-th/9901001".into()));
        assert_eq!(extract_arxiv("nonsense"), None);
    }

    #[test]
    fn year_from_date_string() {
        let record = Record::new("D")
            .with_field("source.title", "T")
            .with_field("source.published", "2019-06-01");
        assert_eq!(validate(&record).unwrap()["year"], 2019);
    }

    #[test]
    fn implausible_year_dropped() {
        let record = Record::new("D")
            .with_field("source.title", "T")
            .with_field("source.year", 3020);
        assert!(validate(&record).unwrap().get("year").is_none());
    }

    #[test]
    fn authors_from_string() {
        let record = Record::new("E")
            .with_field("source.title", "T")
            .with_field("source.authors", "A. Smith and B. Jones; C. Lee");
        assert_eq!(validate(&record).unwrap()["author_count"], 3);
    }

    #[test]
    fn descriptor_requires_title() {
        let stage = ValidateStage::new();
        assert_eq!(stage.descriptor().required_fields, vec!["source.title"]);
    }
}

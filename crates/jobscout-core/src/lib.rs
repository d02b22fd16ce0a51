//! Core domain model and fuzzy duplicate matching for jobscout.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "jobscout-core";

/// Default distance-rate threshold below which a record counts as a duplicate.
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.25;

/// Fixed per-field weights. Company and title dominate; salary/location/JD assist.
pub const WEIGHT_COMPANY: f64 = 0.30;
pub const WEIGHT_TITLE: f64 = 0.30;
pub const WEIGHT_SALARY: f64 = 0.15;
pub const WEIGHT_LOCATION: f64 = 0.10;
pub const WEIGHT_DESCRIPTION: f64 = 0.15;

/// Application lifecycle of a tracked listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Applied,
    Interviewing,
    Offered,
    Rejected,
    Ghosted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Applied => "applied",
            JobStatus::Interviewing => "interviewing",
            JobStatus::Offered => "offered",
            JobStatus::Rejected => "rejected",
            JobStatus::Ghosted => "ghosted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JD quality grade. Legacy catalogs used a four-level A-D scale; F was added
/// later for listings that should be skipped outright, so both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JdQuality {
    A,
    B,
    C,
    D,
    F,
}

impl JdQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            JdQuality::A => "A",
            JdQuality::B => "B",
            JdQuality::C => "C",
            JdQuality::D => "D",
            JdQuality::F => "F",
        }
    }
}

impl FromStr for JdQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(JdQuality::A),
            "B" => Ok(JdQuality::B),
            "C" => Ok(JdQuality::C),
            "D" => Ok(JdQuality::D),
            "F" => Ok(JdQuality::F),
            other => Err(format!("unknown jd_quality grade: {other:?}")),
        }
    }
}

impl fmt::Display for JdQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked listing. Field order here is the serialization order, which the
/// catalog store preserves on save.
///
/// `url` is the unique identity key across the catalog and doubles as the
/// idempotency key for external creation. `notion_page_id` stays absent until
/// a create call succeeds; a reset clears it again. `fetch_error` is the
/// marker the description-fetch collaborator sets when extraction fails.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub collected_at: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub salary: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub company_size: String,
    #[serde(default)]
    pub funding_stage: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub jd_full: String,
    #[serde(default)]
    pub jd_summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(
        default,
        deserialize_with = "quality_from_loose",
        skip_serializing_if = "Option::is_none"
    )]
    pub jd_quality: Option<JdQuality>,
    #[serde(
        default,
        deserialize_with = "none_if_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub fetch_error: Option<String>,
    #[serde(
        default,
        deserialize_with = "none_if_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub notion_page_id: Option<String>,
}

impl JobRecord {
    pub fn is_synced(&self) -> bool {
        self.notion_page_id.is_some()
    }

    /// Description text used for similarity: the full JD when present,
    /// otherwise the summary.
    pub fn description_text(&self) -> &str {
        if self.jd_full.is_empty() {
            &self.jd_summary
        } else {
            &self.jd_full
        }
    }
}

/// Legacy catalogs write empty strings instead of omitting absent values.
fn none_if_blank<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(de)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

fn quality_from_loose<'de, D>(de: D) -> Result<Option<JdQuality>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(de)?;
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => JdQuality::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Partial-field duplicate query. Empty fields never penalize a candidate.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub company: String,
    pub title: String,
    pub salary: String,
    pub location: String,
    pub description: String,
    pub threshold: f64,
}

impl Default for SimilarityQuery {
    fn default() -> Self {
        Self {
            company: String::new(),
            title: String::new(),
            salary: String::new(),
            location: String::new(),
            description: String::new(),
            threshold: DEFAULT_DEDUP_THRESHOLD,
        }
    }
}

impl SimilarityQuery {
    pub fn is_empty(&self) -> bool {
        self.company.is_empty()
            && self.title.is_empty()
            && self.salary.is_empty()
            && self.location.is_empty()
            && self.description.is_empty()
    }
}

/// A catalog record that scored under the query's distance-rate threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub index: usize,
    pub score: f64,
    pub distance_rate: f64,
}

/// Case-folded Levenshtein distance with a single rolling row.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };

    let mut row: Vec<usize> = (0..=short.len()).collect();
    for (i, &lc) in long.iter().enumerate() {
        let mut diag = row[0];
        row[0] = i + 1;
        for (j, &sc) in short.iter().enumerate() {
            let up = row[j + 1];
            row[j + 1] = if lc == sc {
                diag
            } else {
                1 + diag.min(row[j]).min(up)
            };
            diag = up;
        }
    }
    row[short.len()]
}

/// Normalized similarity: 0.0 (disjoint) to 1.0 (identical). Two empty
/// strings are identical; exactly one empty string is a total mismatch.
/// Normalization uses the case-folded lengths, since folding can grow a
/// string (e.g. `İ` becomes two chars) and the distance is measured on the
/// folded forms.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - edit_distance(&a, &b) as f64 / max_len as f64
}

/// An empty query field returns 1.0: absence never penalizes, so a partial
/// query only judges the fields it actually supplies.
fn field_similarity(value: &str, query: &str) -> f64 {
    if query.is_empty() {
        1.0
    } else {
        similarity(value, query)
    }
}

/// Weighted multi-field similarity of one record against a partial query.
pub fn weighted_score(record: &JobRecord, query: &SimilarityQuery) -> f64 {
    WEIGHT_COMPANY * field_similarity(&record.company, &query.company)
        + WEIGHT_TITLE * field_similarity(&record.title, &query.title)
        + WEIGHT_SALARY * field_similarity(&record.salary, &query.salary)
        + WEIGHT_LOCATION * field_similarity(&record.location, &query.location)
        + WEIGHT_DESCRIPTION * field_similarity(record.description_text(), &query.description)
}

/// Rank catalog records whose distance rate falls strictly below the query
/// threshold, best match first, ties broken by ascending catalog index.
///
/// Degenerate case, documented on purpose: a query with every field empty
/// scores 1.0 against everything, so any threshold > 0 matches the whole
/// catalog.
pub fn find_duplicates(records: &[JobRecord], query: &SimilarityQuery) -> Vec<MatchResult> {
    let mut matches: Vec<MatchResult> = records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let score = weighted_score(record, query);
            let distance_rate = 1.0 - score;
            (distance_rate < query.threshold).then_some(MatchResult {
                index,
                score,
                distance_rate,
            })
        })
        .collect();
    // sort_by is stable, so equal scores keep ascending index order
    matches.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(Ordering::Equal));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(company: &str, title: &str, salary: &str, location: &str) -> JobRecord {
        JobRecord {
            company: company.to_string(),
            title: title.to_string(),
            salary: salary.to_string(),
            location: location.to_string(),
            url: format!("https://example.com/{company}/{title}"),
            ..JobRecord::default()
        }
    }

    #[test]
    fn edit_distance_known_values() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("ACME Inc", "acme inc"), 0);
    }

    #[test]
    fn edit_distance_identity_and_symmetry() {
        for s in ["", "a", "AI Engineer", "示例科技", "backend rust"] {
            assert_eq!(edit_distance(s, s), 0);
            assert_eq!(similarity(s, s), 1.0);
        }
        for (a, b) in [("kitten", "sitting"), ("示例科技", "示例网络科技"), ("x", "")] {
            assert_eq!(edit_distance(a, b), edit_distance(b, a));
        }
    }

    #[test]
    fn similarity_bounds_and_empty_rules() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", ""), 0.0);
        assert_eq!(similarity("", "abc"), 0.0);
        for (a, b) in [("abc", "xyz"), ("AI Engineer", "ML Engineer"), ("a", "ab")] {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "similarity({a}, {b}) = {s}");
        }
    }

    #[test]
    fn similarity_bounded_when_case_folding_grows_the_string() {
        // "İ" lowercases to two chars, so the folded distance can exceed the
        // unfolded length; the ratio must still stay within [0, 1]
        for (a, b) in [("İ", "i"), ("İİ", "xy"), ("İstanbul", "istanbul")] {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "similarity({a}, {b}) = {s}");
        }
        assert_eq!(similarity("İİ", "xy"), 0.0);
    }

    #[test]
    fn acme_partial_query_is_reported_duplicate() {
        let records = vec![record("ACME Inc.", "AI Engineer", "", "")];
        let query = SimilarityQuery {
            company: "ACME Inc".to_string(),
            title: "AI Engineer".to_string(),
            ..SimilarityQuery::default()
        };
        let matches = find_duplicates(&records, &query);
        assert_eq!(matches.len(), 1);
        let expected = 0.30 * (1.0 - 1.0 / 9.0) + 0.70;
        assert!((matches[0].score - expected).abs() < 1e-9);
        assert!(matches[0].distance_rate < DEFAULT_DEDUP_THRESHOLD);
    }

    #[test]
    fn identical_candidate_ranks_first_with_perfect_score() {
        let records = vec![
            record("Globex", "Data Engineer", "25-35K", "Berlin"),
            record("ACME", "AI Engineer", "20-30K", "Munich"),
            record("Initech", "AI Engineer", "20-30K", "Munich"),
        ];
        let query = SimilarityQuery {
            company: "ACME".to_string(),
            title: "AI Engineer".to_string(),
            salary: "20-30K".to_string(),
            location: "Munich".to_string(),
            threshold: 0.01,
            ..SimilarityQuery::default()
        };
        let matches = find_duplicates(&records, &query);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].index, 1);
        assert!((matches[0].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn all_empty_query_matches_every_record() {
        let records = vec![
            record("A", "x", "", ""),
            record("B", "y", "", ""),
            record("C", "z", "", ""),
        ];
        let query = SimilarityQuery::default();
        assert!(query.is_empty());
        let matches = find_duplicates(&records, &query);
        assert_eq!(matches.len(), records.len());
        // perfect scores tie, so catalog order is preserved
        let indices: Vec<usize> = matches.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn empty_catalog_yields_no_matches() {
        let matches = find_duplicates(&[], &SimilarityQuery::default());
        assert!(matches.is_empty());
    }

    #[test]
    fn threshold_is_strict() {
        let records = vec![record("ACME", "AI Engineer", "", "")];
        // totally disjoint company+title: score = 0.40 from the empty fields,
        // distance rate exactly 0.60
        let query = SimilarityQuery {
            company: "xxxx".to_string(),
            title: "yyyyyyy".to_string(),
            threshold: 0.60,
            ..SimilarityQuery::default()
        };
        assert!(find_duplicates(&records, &query).is_empty());
    }

    #[test]
    fn description_query_falls_back_to_summary() {
        let mut r = record("ACME", "AI Engineer", "", "");
        r.jd_summary = "Build LLM agents in Rust".to_string();
        assert_eq!(r.description_text(), "Build LLM agents in Rust");
        r.jd_full = "full text".to_string();
        assert_eq!(r.description_text(), "full text");
    }

    #[test]
    fn record_roundtrip_tolerates_blank_optionals() {
        let yaml = concat!(
            "company: \"ACME\"\n",
            "title: \"AI Engineer\"\n",
            "url: \"https://example.com/1\"\n",
            "status: pending\n",
            "jd_quality: ''\n",
            "notion_page_id: ''\n",
        );
        let r: JobRecord = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(r.jd_quality, None);
        assert_eq!(r.notion_page_id, None);
        assert!(!r.is_synced());

        let graded: JobRecord = serde_yaml::from_str("url: u\njd_quality: 'b'\n").expect("parse");
        assert_eq!(graded.jd_quality, Some(JdQuality::B));
    }

    #[test]
    fn unknown_status_is_a_parse_error() {
        let res: Result<JobRecord, _> = serde_yaml::from_str("url: u\nstatus: paused\n");
        assert!(res.is_err());
    }
}

//! Reconciliation between the local catalog and the external tracker
//! collection.
//!
//! The engine pushes catalog records into the record store in one of four
//! modes: create-only for unsynced records, update-only full-overwrites for
//! synced ones, full for both, and reset, which archives every external page,
//! clears the local page ids, and rebuilds the collection purely from the
//! catalog. Network calls run as independent tasks gated by a counting
//! semaphore; each call retries on transport failure and honors server
//! rate-limit waits. One record's failure never aborts its siblings.
//!
//! Catalog persistence is snapshot-replace, so the engine only saves at
//! phase barriers, after every task of the phase has drained.

use std::fmt;
use std::fs;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobscout_core::{JdQuality, JobRecord};
use jobscout_notion::{
    build_properties, extract_collection_id, with_retry, ApiError, RecordStore, RetryPolicy,
};
use jobscout_storage::{Catalog, CatalogStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-sync";

/// Default cap on simultaneously outstanding network calls.
pub const DEFAULT_CONCURRENCY: usize = 3;

const PREFS_DB_KEY: &str = "notion_db_id:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Create,
    Update,
    Full,
    Reset,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "new" and "all" are the legacy spellings
            "create" | "new" => Ok(SyncMode::Create),
            "update" => Ok(SyncMode::Update),
            "full" | "all" => Ok(SyncMode::Full),
            "reset" => Ok(SyncMode::Reset),
            other => Err(format!("unknown sync mode: {other:?}")),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Create => "create",
            SyncMode::Update => "update",
            SyncMode::Full => "full",
            SyncMode::Reset => "reset",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Only process records whose company name contains this string
    /// (case-insensitive).
    pub filter: Option<String>,
    /// Run every selection/decision step with zero network calls and zero
    /// catalog mutations.
    pub dry_run: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Create,
            filter: None,
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Created,
    Updated,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAction::Created => "created",
            SyncAction::Updated => "updated",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub index: usize,
    pub company: String,
    pub url: String,
    pub action: SyncAction,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<RecordOutcome>,
    pub archived: usize,
    pub archive_failures: Vec<(String, String)>,
    pub task_failures: Vec<String>,
    /// Dry-run narration of what a real run would do.
    pub planned: Vec<String>,
}

impl SyncReport {
    fn new(mode: SyncMode, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            dry_run,
            started_at: now,
            finished_at: now,
            outcomes: Vec::new(),
            archived: 0,
            archive_failures: Vec::new(),
            task_failures: Vec::new(),
            planned: Vec::new(),
        }
    }

    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == SyncAction::Created && o.error.is_none())
            .count()
    }

    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == SyncAction::Updated && o.error.is_none())
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
            + self.archive_failures.len()
            + self.task_failures.len()
    }

    /// The run as a whole fails iff at least one record failed.
    pub fn succeeded(&self) -> bool {
        self.failures() == 0
    }
}

pub struct ReconcileEngine<S> {
    store: Arc<S>,
    limiter: Arc<Semaphore>,
    options: SyncOptions,
}

impl<S: RecordStore + 'static> ReconcileEngine<S> {
    pub fn new(store: Arc<S>, options: SyncOptions) -> Self {
        let limiter = Arc::new(Semaphore::new(options.concurrency.max(1)));
        Self {
            store,
            limiter,
            options,
        }
    }

    /// Run one reconciliation pass. The catalog is saved only at phase
    /// barriers; per-record failures are collected into the report rather
    /// than propagated.
    pub async fn run(
        &self,
        catalog_store: &CatalogStore,
        catalog: &mut Catalog,
        collection_id: &str,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::new(self.options.mode, self.options.dry_run);
        info!(
            run_id = %report.run_id,
            mode = %self.options.mode,
            dry_run = self.options.dry_run,
            records = catalog.records.len(),
            "reconciliation started"
        );

        match self.options.mode {
            SyncMode::Create => {
                self.create_phase(catalog, collection_id, &mut report).await;
                self.persist(catalog_store, catalog, &report)?;
            }
            SyncMode::Update => {
                let targets = self.select(catalog, true);
                self.update_phase(catalog, targets, &mut report).await;
            }
            SyncMode::Full => {
                // snapshot the update set before creating: each record gets
                // exactly one operation per pass, and ids assigned by the
                // create phase must not re-select their records here
                let update_targets = self.select(catalog, true);
                self.create_phase(catalog, collection_id, &mut report).await;
                self.update_phase(catalog, update_targets, &mut report).await;
                self.persist(catalog_store, catalog, &report)?;
            }
            SyncMode::Reset => {
                self.reset(catalog_store, catalog, collection_id, &mut report)
                    .await?;
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            created = report.created(),
            updated = report.updated(),
            archived = report.archived,
            failures = report.failures(),
            "reconciliation finished"
        );
        Ok(report)
    }

    fn matches_filter(&self, record: &JobRecord) -> bool {
        match &self.options.filter {
            None => true,
            Some(f) => record
                .company
                .to_lowercase()
                .contains(&f.to_lowercase()),
        }
    }

    fn select(&self, catalog: &Catalog, synced: bool) -> Vec<usize> {
        catalog
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_synced() == synced && self.matches_filter(r))
            .map(|(i, _)| i)
            .collect()
    }

    /// Create external pages for unsynced records and write the returned ids
    /// back into the catalog. The record url is the idempotency key: records
    /// that already hold a page id are never selected, so a rerun after a
    /// successful create is a no-op for that record.
    async fn create_phase(
        &self,
        catalog: &mut Catalog,
        collection_id: &str,
        report: &mut SyncReport,
    ) {
        let targets = self.select(catalog, false);
        if self.options.dry_run {
            for idx in &targets {
                report
                    .planned
                    .push(format!("create {}", catalog.records[*idx].company));
            }
            return;
        }

        let mut tasks = JoinSet::new();
        for idx in targets {
            let store = Arc::clone(&self.store);
            let limiter = Arc::clone(&self.limiter);
            let retry = self.options.retry;
            let properties = build_properties(&catalog.records[idx]);
            let collection_id = collection_id.to_string();
            tasks.spawn(async move {
                let result = with_retry(retry, || {
                    let store = Arc::clone(&store);
                    let limiter = Arc::clone(&limiter);
                    let properties = properties.clone();
                    let collection_id = collection_id.clone();
                    async move {
                        let _permit = limiter
                            .acquire_owned()
                            .await
                            .map_err(|_| ApiError::Transport("limiter closed".to_string()))?;
                        store.create_page(&collection_id, properties).await
                    }
                })
                .await;
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(page_id))) => {
                    catalog.records[idx].notion_page_id = Some(page_id);
                    report
                        .outcomes
                        .push(self.outcome(catalog, idx, SyncAction::Created, None));
                }
                Ok((idx, Err(err))) => {
                    warn!(url = %catalog.records[idx].url, error = %err, "create failed");
                    report.outcomes.push(self.outcome(
                        catalog,
                        idx,
                        SyncAction::Created,
                        Some(err.to_string()),
                    ));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "create task aborted");
                    report.task_failures.push(join_err.to_string());
                }
            }
        }
    }

    /// Push a full overwrite of the property set for each target record.
    /// Targets are selected by the caller before any id write-back of the
    /// same pass. No catalog mutation happens here.
    async fn update_phase(&self, catalog: &Catalog, targets: Vec<usize>, report: &mut SyncReport) {
        if self.options.dry_run {
            for idx in &targets {
                report
                    .planned
                    .push(format!("update {}", catalog.records[*idx].company));
            }
            return;
        }

        let mut tasks = JoinSet::new();
        for idx in targets {
            let store = Arc::clone(&self.store);
            let limiter = Arc::clone(&self.limiter);
            let retry = self.options.retry;
            let properties = build_properties(&catalog.records[idx]);
            let page_id = catalog.records[idx]
                .notion_page_id
                .clone()
                .unwrap_or_default();
            tasks.spawn(async move {
                let result = with_retry(retry, || {
                    let store = Arc::clone(&store);
                    let limiter = Arc::clone(&limiter);
                    let properties = properties.clone();
                    let page_id = page_id.clone();
                    async move {
                        let _permit = limiter
                            .acquire_owned()
                            .await
                            .map_err(|_| ApiError::Transport("limiter closed".to_string()))?;
                        store.update_page(&page_id, properties).await
                    }
                })
                .await;
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(()))) => {
                    report
                        .outcomes
                        .push(self.outcome(catalog, idx, SyncAction::Updated, None));
                }
                Ok((idx, Err(err))) => {
                    warn!(url = %catalog.records[idx].url, error = %err, "update failed");
                    report.outcomes.push(self.outcome(
                        catalog,
                        idx,
                        SyncAction::Updated,
                        Some(err.to_string()),
                    ));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "update task aborted");
                    report.task_failures.push(join_err.to_string());
                }
            }
        }
    }

    /// Archive-and-rebuild: derive the external collection purely from the
    /// local catalog, eliminating drift from partial prior syncs. Three
    /// strictly ordered phases with a full barrier between each:
    ///
    /// 1. enumerate every page via cursor pagination and archive them all
    ///    (archiving, not deleting, keeps an audit trail);
    /// 2. clear notion_page_id on every local record, no network involved;
    /// 3. rerun create-only against the now-fully-unsynced set, respecting
    ///    any active filter.
    async fn reset(
        &self,
        catalog_store: &CatalogStore,
        catalog: &mut Catalog,
        collection_id: &str,
        report: &mut SyncReport,
    ) -> Result<()> {
        if self.options.dry_run {
            let synced = catalog.records.iter().filter(|r| r.is_synced()).count();
            report.planned.push(format!(
                "archive every page in collection {collection_id}"
            ));
            report
                .planned
                .push(format!("clear {synced} local page ids"));
            for record in catalog.records.iter().filter(|r| self.matches_filter(r)) {
                report.planned.push(format!("create {}", record.company));
            }
            return Ok(());
        }

        // Phase 1: enumerate, then archive concurrently. A listing failure is
        // fatal: archiving an unknown subset would leave the collection in a
        // state neither old nor rebuilt.
        let mut page_ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (ids, next) = with_retry(self.options.retry, || {
                let store = Arc::clone(&self.store);
                let limiter = Arc::clone(&self.limiter);
                let collection_id = collection_id.to_string();
                let cursor = cursor.clone();
                async move {
                    let _permit = limiter
                        .acquire_owned()
                        .await
                        .map_err(|_| ApiError::Transport("limiter closed".to_string()))?;
                    store.list_pages(&collection_id, cursor).await
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!("listing collection {collection_id}: {e}"))?;

            page_ids.extend(ids);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(pages = page_ids.len(), "archiving external pages");

        let mut tasks = JoinSet::new();
        for page_id in page_ids {
            let store = Arc::clone(&self.store);
            let limiter = Arc::clone(&self.limiter);
            let retry = self.options.retry;
            tasks.spawn(async move {
                let result = with_retry(retry, || {
                    let store = Arc::clone(&store);
                    let limiter = Arc::clone(&limiter);
                    let page_id = page_id.clone();
                    async move {
                        let _permit = limiter
                            .acquire_owned()
                            .await
                            .map_err(|_| ApiError::Transport("limiter closed".to_string()))?;
                        store.archive_page(&page_id).await
                    }
                })
                .await;
                (page_id, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.archived += 1,
                Ok((page_id, Err(err))) => {
                    warn!(page_id = %page_id, error = %err, "archive failed");
                    report.archive_failures.push((page_id, err.to_string()));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "archive task aborted");
                    report.task_failures.push(join_err.to_string());
                }
            }
        }

        // Phase 2: local only. All archive tasks have drained, so the
        // snapshot write cannot discard concurrent updates.
        for record in &mut catalog.records {
            record.notion_page_id = None;
        }
        catalog_store
            .save(catalog)
            .context("persisting cleared page ids")?;

        // Phase 3: rebuild from the catalog.
        self.create_phase(catalog, collection_id, report).await;
        self.persist(catalog_store, catalog, report)?;
        Ok(())
    }

    fn persist(
        &self,
        catalog_store: &CatalogStore,
        catalog: &Catalog,
        report: &SyncReport,
    ) -> Result<()> {
        if self.options.dry_run || report.created() == 0 {
            return Ok(());
        }
        catalog_store
            .save(catalog)
            .context("persisting assigned page ids")
    }

    fn outcome(
        &self,
        catalog: &Catalog,
        index: usize,
        action: SyncAction,
        error: Option<String>,
    ) -> RecordOutcome {
        let record = &catalog.records[index];
        RecordOutcome {
            index,
            company: record.company.clone(),
            url: record.url.clone(),
            action,
            error,
        }
    }
}

// ── Collection-id resolution & preference file ──────────────────────────────

/// First `notion_db_id:` value found in the preference file, if any.
pub fn read_pref_collection_id(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if let Some(pos) = line.find(PREFS_DB_KEY) {
            let value = line[pos + PREFS_DB_KEY.len()..].trim();
            if let Some(token) = value.split_whitespace().next() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Persist the resolved collection id, replacing an existing entry in place
/// or appending a new section.
pub fn write_pref_collection_id(path: &Path, id: &str) -> std::io::Result<()> {
    let text = fs::read_to_string(path).unwrap_or_default();
    let updated = if text.contains(PREFS_DB_KEY) {
        let lines: Vec<String> = text
            .lines()
            .map(|line| match line.find(PREFS_DB_KEY) {
                Some(pos) => format!("{}{} {}", &line[..pos], PREFS_DB_KEY, id),
                None => line.to_string(),
            })
            .collect();
        lines.join("\n") + "\n"
    } else if text.trim().is_empty() {
        format!("## Notion database\n\n- {PREFS_DB_KEY} {id}\n")
    } else {
        format!(
            "{}\n\n## Notion database\n\n- {PREFS_DB_KEY} {id}\n",
            text.trim_end()
        )
    };
    fs::write(path, updated)
}

/// Resolve the target collection id: explicit argument, then the preference
/// file, then an interactive prompt that can provision a fresh collection.
/// A newly learned id is persisted back to the preference file.
pub async fn resolve_collection_id<S: RecordStore>(
    arg: Option<&str>,
    prefs_path: &Path,
    store: &S,
) -> Result<String, ApiError> {
    if let Some(raw) = arg {
        if let Some(id) = extract_collection_id(raw) {
            return Ok(id);
        }
        warn!(raw, "could not parse collection id from argument");
    }

    if let Some(saved) = read_pref_collection_id(prefs_path) {
        if let Some(id) = extract_collection_id(&saved) {
            return Ok(id);
        }
        warn!(saved = %saved, "ignoring malformed collection id in preference file");
    }

    if !std::io::stdin().is_terminal() {
        return Err(ApiError::Config(
            "no tracker collection configured; pass --db-id or add notion_db_id to the preference file"
                .to_string(),
        ));
    }

    println!("No tracker collection configured. Provide one of:");
    println!("  1. a collection id, e.g. 75ba29af-95bf-43e3-bf02-37960aa08b5d");
    println!("  2. a share link containing the id");
    println!("  3. 'new' to create a collection with the tracker schema");
    print!("-> ");
    std::io::stdout()
        .flush()
        .map_err(|e| ApiError::Config(format!("writing prompt: {e}")))?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| ApiError::Config(format!("reading collection id: {e}")))?;
    let answer = line.trim();

    let id = if answer.eq_ignore_ascii_case("new") {
        store.provision_collection().await?
    } else {
        extract_collection_id(answer).ok_or_else(|| {
            ApiError::Config(format!("could not parse a collection id from {answer:?}"))
        })?
    };

    if let Err(err) = write_pref_collection_id(prefs_path, &id) {
        warn!(error = %err, "could not persist collection id to preference file");
    }
    Ok(id)
}

// ── Summarization collaborator boundary ─────────────────────────────────────

/// One record's analysis as produced by a summarization collaborator. `id`
/// indexes into the submitted batch, not the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JdAnalysis {
    pub id: usize,
    #[serde(default)]
    pub jd_summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub jd_quality: String,
}

/// Synchronous summarization capability. Implementations must never
/// fabricate content: a field they cannot derive from the JD text stays
/// empty, and malformed output surfaces as an error instead of a guess.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, batch: &[JobRecord]) -> Result<Vec<JdAnalysis>>;
}

/// Parse a free-text collaborator reply whose payload is a JSON array
/// somewhere in the text. Anything unparseable is an error, per the
/// fails-with-parse-error contract.
pub fn parse_analysis_reply(text: &str) -> Result<Vec<JdAnalysis>> {
    let start = text.find('[');
    let end = text.rfind(']');
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => anyhow::bail!("reply contains no JSON array"),
    };
    serde_json::from_str(&text[start..=end]).context("parsing analysis reply")
}

/// Catalog indices with a JD but no summary yet (all JD-bearing records when
/// `refetch` is set).
pub fn pending_analysis(records: &[JobRecord], refetch: bool) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            !r.jd_full.trim().is_empty() && (refetch || r.jd_summary.trim().is_empty())
        })
        .map(|(i, _)| i)
        .collect()
}

/// Write analyses back into the catalog. Each field is only taken when it
/// passes its own sanity check, so a partially useful reply still lands.
/// Returns the number of records that received a grade.
pub fn apply_analyses(
    records: &mut [JobRecord],
    batch_indices: &[usize],
    analyses: &[JdAnalysis],
) -> usize {
    let mut graded = 0;
    for analysis in analyses {
        let Some(&record_index) = batch_indices.get(analysis.id) else {
            continue;
        };
        let record = &mut records[record_index];

        let summary = analysis.jd_summary.trim();
        if summary.chars().count() >= 10 {
            record.jd_summary = summary.to_string();
        }
        let tags: Vec<String> = analysis
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            record.tags = tags;
        }
        if let Ok(grade) = JdQuality::from_str(&analysis.jd_quality) {
            record.jd_quality = Some(grade);
            graded += 1;
        }
    }
    graded
}

/// Deterministic extractive fallback summarizer: strips boilerplate
/// headings, splits the JD into segments, and joins the informative ones
/// until the target length. It assigns no tags and no grade, and pads with
/// nothing, keeping the never-fabricate contract.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveSummarizer {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            min_len: 30,
            max_len: 50,
        }
    }
}

const NOISE_HEADINGS: &[&str] = &[
    "【工作职责】",
    "【任职要求】",
    "【我们提供】",
    "岗位职责",
    "职位描述",
    "Responsibilities:",
    "Requirements:",
    "What you'll do:",
];

impl ExtractiveSummarizer {
    fn summarize_text(&self, text: &str) -> String {
        let mut cleaned = text.to_string();
        for heading in NOISE_HEADINGS {
            cleaned = cleaned.replace(heading, "");
        }
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut out = String::new();
        for segment in cleaned.split(['。', '；', ';', '.', '\n']) {
            let segment = segment.trim_matches(&[':', '：', ',', '，', ' '][..]);
            if segment.chars().count() < 8 {
                continue;
            }
            if out.is_empty() {
                out = segment.to_string();
            } else {
                out.push_str("，");
                out.push_str(segment);
            }
            if out.chars().count() >= self.min_len {
                break;
            }
        }
        if out.is_empty() {
            out = cleaned;
        }
        if out.chars().count() > self.max_len {
            out = out.chars().take(self.max_len).collect();
        }
        out
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, batch: &[JobRecord]) -> Result<Vec<JdAnalysis>> {
        Ok(batch
            .iter()
            .enumerate()
            .map(|(id, record)| JdAnalysis {
                id,
                jd_summary: self.summarize_text(&record.jd_full),
                tags: Vec::new(),
                jd_quality: String::new(),
            })
            .collect())
    }
}

//! Sync pipeline orchestration: load, normalize, enrich, merge, gate, persist, report.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use larentals_adapters::{
    default_inbox_path, load_raw_batch, normalize_terms, ColumnAliasMap, ExpiryTable, GeocodeCache,
    HttpExpiryChecker, Normalizer,
};
use larentals_core::{AuditEvent, Listing, Segment};
use larentals_storage::{
    content_hash, ArtifactStore, HttpClientConfig, HttpFetcher, SnapshotStore, SqliteSnapshotStore,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod enrichment;
pub mod gate;
pub mod merge;

pub use enrichment::{EnrichmentHook, GeocodeEnrichmentHook, NoopEnrichmentHook};
pub use gate::{GateConfig, OutlierGate};
pub use merge::{MergeEngine, MergeOutcome, MergeStats};

pub const CRATE_NAME: &str = "larentals-sync";

const SAMPLE_TABLE_SUFFIX: &str = "sample";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub geocode_cache_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub check_expiry: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("LARENTALS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./assets/datasets/larentals.db")),
            artifacts_dir: std::env::var("LARENTALS_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            workspace_root: std::env::var("LARENTALS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            geocode_cache_path: std::env::var("LARENTALS_GEOCODE_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./assets/datasets/geocode_cache.json")),
            user_agent: std::env::var("LARENTALS_USER_AGENT").unwrap_or_else(|_| "larentals-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("LARENTALS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            check_expiry: env_flag("LARENTALS_CHECK_EXPIRY", true),
            scheduler_enabled: env_flag("LARENTALS_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("LARENTALS_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            web_port: std::env::var("LARENTALS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Config rooted in a scratch directory, with no network checks.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_path: root.join("larentals.db"),
            artifacts_dir: root.join("artifacts"),
            geocode_cache_path: root.join("geocode_cache.json"),
            workspace_root: root,
            user_agent: "larentals-bot/0.1".to_string(),
            http_timeout_secs: 20,
            check_expiry: false,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            web_port: 8000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ColumnRulesFile {
    #[serde(default)]
    lease: BTreeMap<String, String>,
    #[serde(default)]
    buy: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct OutlierRulesFile {
    #[serde(default)]
    lease: Option<GateConfig>,
    #[serde(default)]
    buy: Option<GateConfig>,
}

/// Per-segment alias overrides and gate settings from `rules/*.yaml`.
#[derive(Debug, Clone)]
pub struct RuleSet {
    lease_aliases: BTreeMap<String, String>,
    buy_aliases: BTreeMap<String, String>,
    lease_gate: GateConfig,
    buy_gate: GateConfig,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            lease_aliases: BTreeMap::new(),
            buy_aliases: BTreeMap::new(),
            lease_gate: GateConfig::lease_defaults(),
            buy_gate: GateConfig::default(),
        }
    }
}

impl RuleSet {
    /// Missing rule files fall back to the built-in defaults.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let columns: ColumnRulesFile = read_yaml_or_default(&rules_dir.join("columns.yaml"))?;
        let outliers: OutlierRulesFile = read_yaml_or_default(&rules_dir.join("outliers.yaml"))?;
        let defaults = Self::default();
        Ok(Self {
            lease_aliases: columns.lease,
            buy_aliases: columns.buy,
            lease_gate: outliers.lease.unwrap_or(defaults.lease_gate),
            buy_gate: outliers.buy.unwrap_or(defaults.buy_gate),
        })
    }

    pub fn column_overrides(&self, segment: Segment) -> &BTreeMap<String, String> {
        match segment {
            Segment::Lease => &self.lease_aliases,
            Segment::Buy => &self.buy_aliases,
        }
    }

    pub fn gate(&self, segment: Segment) -> &GateConfig {
        match segment {
            Segment::Lease => &self.lease_gate,
            Segment::Buy => &self.buy_gate,
        }
    }

    pub fn with_gate(mut self, segment: Segment, gate: GateConfig) -> Self {
        match segment {
            Segment::Lease => self.lease_gate = gate,
            Segment::Buy => self.buy_gate = gate,
        }
        self
    }
}

fn read_yaml_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Batch file to load instead of `inbox/<segment>/batch.json`.
    pub input: Option<PathBuf>,
    /// Only the first N rows; results go to the `<segment>_sample` table.
    pub sample: Option<usize>,
    pub check_expiry: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRunSummary {
    pub run_id: Uuid,
    pub segment: Segment,
    pub sample: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub normalized_rows: usize,
    pub malformed_rows: usize,
    pub merge: MergeStats,
    pub gate_rejections: usize,
    pub written_rows: usize,
    pub raw_archive: String,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: PipelineConfig,
    rules: RuleSet,
    store: Arc<dyn SnapshotStore>,
    sample_store: Arc<dyn SnapshotStore>,
    artifact_store: ArtifactStore,
    http: Arc<HttpFetcher>,
    enrichment: Box<dyn EnrichmentHook>,
    lease_lock: Mutex<()>,
    buy_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn SnapshotStore>,
        sample_store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            rules: RuleSet::default(),
            store,
            sample_store,
            artifact_store,
            http: Arc::new(http),
            enrichment: Box::<NoopEnrichmentHook>::default(),
            lease_lock: Mutex::new(()),
            buy_lock: Mutex::new(()),
        })
    }

    /// SQLite-backed pipeline with rules and geocode cache read from the workspace.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let store = SqliteSnapshotStore::connect(&config.database_path)
            .await
            .with_context(|| format!("opening snapshot database {}", config.database_path.display()))?;
        let sample_store = store.clone().with_table_suffix(SAMPLE_TABLE_SUFFIX);
        let rules = RuleSet::from_workspace_root(&config.workspace_root)?;
        let cache = GeocodeCache::load(&config.geocode_cache_path)?;
        Ok(Self::new(config, Arc::new(store), Arc::new(sample_store))?
            .with_rules(rules)
            .with_enrichment(Box::new(GeocodeEnrichmentHook::from_cache(cache))))
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn default_options(&self) -> SyncOptions {
        SyncOptions {
            check_expiry: self.config.check_expiry,
            ..SyncOptions::default()
        }
    }

    fn segment_lock(&self, segment: Segment) -> &Mutex<()> {
        match segment {
            Segment::Lease => &self.lease_lock,
            Segment::Buy => &self.buy_lock,
        }
    }

    pub async fn run_segments(&self, segments: &[Segment], options: &SyncOptions) -> Result<Vec<SegmentRunSummary>> {
        let mut summaries = Vec::with_capacity(segments.len());
        for segment in segments {
            summaries.push(self.run_segment(*segment, options).await?);
        }
        Ok(summaries)
    }

    pub async fn run_segment(&self, segment: Segment, options: &SyncOptions) -> Result<SegmentRunSummary> {
        let _guard = self.segment_lock(segment).lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %segment);
        self.run_segment_inner(run_id, segment, options).instrument(span).await
    }

    async fn run_segment_inner(
        &self,
        run_id: Uuid,
        segment: Segment,
        options: &SyncOptions,
    ) -> Result<SegmentRunSummary> {
        let started_at = Utc::now();
        let input = options
            .input
            .clone()
            .unwrap_or_else(|| default_inbox_path(&self.config.workspace_root, segment));
        let mut batch = load_raw_batch(&input, segment).with_context(|| format!("loading {}", input.display()))?;
        if let Some(limit) = options.sample {
            batch = batch.truncated(limit);
        }
        let input_rows = batch.row_count();
        info!(input = %input.display(), input_rows, "loaded raw batch");

        let raw_archive = self
            .artifact_store
            .store_json(batch.captured_at, &format!("raw/{segment}"), &batch)
            .await
            .context("archiving raw batch")?;

        let aliases = ColumnAliasMap::defaults(segment).with_overrides(self.rules.column_overrides(segment));
        let normalized = Normalizer::new(segment)
            .with_aliases(aliases)
            .normalize_batch(&batch, started_at);
        let normalized_rows = normalized.listings.len();
        let malformed_rows = normalized.rejections.len();
        let new_batch = self.enrichment.apply(normalized.listings)?;

        let mut prior = match self.store.read_snapshot(segment).await {
            Ok(prior) => prior,
            Err(err) => {
                match self
                    .artifact_store
                    .store_json(started_at, &format!("failed-merge/{segment}"), &new_batch)
                    .await
                {
                    Ok(dump) => error!(path = %dump.absolute_path.display(), error = %err, "prior snapshot unreadable; new batch saved"),
                    Err(dump_err) => error!(error = %err, dump_error = %dump_err, "prior snapshot unreadable; could not save new batch"),
                }
                return Err(err).with_context(|| format!("reading prior {segment} snapshot"));
            }
        };
        if let Some(limit) = options.sample {
            prior.truncate(limit);
        }

        let expiry = if options.check_expiry {
            HttpExpiryChecker::new(Arc::clone(&self.http), run_id)
                .precompute(expiry_targets(&new_batch, &prior))
                .await
        } else {
            ExpiryTable::empty()
        };

        let merged = MergeEngine::new(&expiry).merge(new_batch, prior);
        let (clean, rejections) = OutlierGate::new(self.rules.gate(segment).clone()).filter(merged.listings);

        let target = if options.sample.is_some() {
            &self.sample_store
        } else {
            &self.store
        };
        target
            .write_snapshot(segment, &clean)
            .await
            .with_context(|| format!("writing {segment} snapshot"))?;
        info!(written_rows = clean.len(), "snapshot replaced");

        let mut audit = normalized.rejections;
        audit.extend(merged.removals);
        let gate_rejections = rejections.len();
        audit.extend(rejections);

        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string())
            .join(segment.as_str());
        let mut summary = SegmentRunSummary {
            run_id,
            segment,
            sample: options.sample.is_some(),
            started_at,
            finished_at: Utc::now(),
            input_rows,
            normalized_rows,
            malformed_rows,
            merge: merged.stats,
            gate_rejections,
            written_rows: clean.len(),
            raw_archive: raw_archive.relative_path.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        };
        write_reports(&reports_dir, &summary, &audit).await?;
        let manifest_path = export_parquet_snapshot(&reports_dir, &clean).await?;
        summary.parquet_manifest = manifest_path.display().to_string();
        Ok(summary)
    }
}

/// URL of whichever row will win the merge for each id.
fn expiry_targets(new_batch: &[Listing], prior: &[Listing]) -> Vec<(String, String)> {
    let mut urls: HashMap<&str, Option<&str>> = HashMap::new();
    for listing in prior.iter().chain(new_batch) {
        urls.insert(&listing.listing_id, listing.listing_url.as_deref());
    }
    let mut targets: Vec<(String, String)> = urls
        .into_iter()
        .filter_map(|(id, url)| url.map(|u| (id.to_string(), u.to_string())))
        .collect();
    targets.sort();
    targets
}

/// Runs every segment on the configured cron schedule.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let options = pipeline.default_options();
            for segment in Segment::ALL {
                match pipeline.run_segment(segment, &options).await {
                    Ok(summary) => info!(%segment, written_rows = summary.written_rows, "scheduled sync finished"),
                    Err(err) => error!(%segment, error = ?err, "scheduled sync failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_from_env(segments: &[Segment], options: &SyncOptions) -> Result<Vec<SegmentRunSummary>> {
    let pipeline = SyncPipeline::connect(PipelineConfig::from_env()).await?;
    pipeline.run_segments(segments, options).await
}

/// Re-canonicalizes lease terms on an existing snapshot. Returns the number of rows changed.
pub async fn backfill_terms(store: &dyn SnapshotStore, segment: Segment) -> Result<usize> {
    let mut listings = store
        .read_snapshot(segment)
        .await
        .with_context(|| format!("reading {segment} snapshot"))?;

    let mut changed = 0usize;
    for listing in &mut listings {
        let legacy = listing.extras.remove("terms");
        let had_legacy = legacy.is_some();
        let raw = legacy.unwrap_or_else(|| listing.terms.join(","));
        let terms = normalize_terms(Some(&raw));
        if had_legacy || terms != listing.terms {
            listing.terms = terms;
            changed += 1;
        }
    }

    if changed > 0 {
        store
            .write_snapshot(segment, &listings)
            .await
            .with_context(|| format!("writing {segment} snapshot"))?;
    }
    info!(%segment, changed, "terms backfill complete");
    Ok(changed)
}

async fn write_reports(reports_dir: &Path, summary: &SegmentRunSummary, audit: &[AuditEvent]) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut rule_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in audit {
        *rule_counts.entry(event.rule.as_str()).or_default() += 1;
    }

    let brief = format!(
        "# LA Rentals Sync Run\n\n- Run ID: `{}`\n- Segment: {}{}\n- Started: {}\n- Finished: {}\n- Input rows: {}\n- Normalized rows: {}\n- Malformed rows: {}\n- Prior snapshot rows: {}\n- Merged rows: {}\n- Expired removed: {}\n- Expiry checks degraded: {}\n- Gate rejections: {}\n- Written rows: {}\n\n## Audit Counts\n{}\n",
        summary.run_id,
        summary.segment,
        if summary.sample { " (sample)" } else { "" },
        summary.started_at,
        summary.finished_at,
        summary.input_rows,
        summary.normalized_rows,
        summary.malformed_rows,
        summary.merge.prior_rows,
        summary.merge.merged_rows,
        summary.merge.expired_removed,
        summary.merge.expiry_degraded,
        summary.gate_rejections,
        summary.written_rows,
        rule_counts
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(reports_dir.join("run_summary.md"), brief)
        .await
        .context("writing run_summary.md")?;

    let audit_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "events": audit,
    }))
    .context("serializing audit trail")?;
    fs::write(reports_dir.join("audit.json"), audit_json)
        .await
        .context("writing audit.json")?;
    Ok(())
}

async fn export_parquet_snapshot(reports_dir: &Path, listings: &[Listing]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    write_listings_parquet(&listings_path, listings)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("listings", reports_dir, &listings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("full_street_address", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("zip_code", DataType::Utf8, true),
        ArrowField::new("subtype", DataType::Utf8, true),
        ArrowField::new("list_price", DataType::Float64, true),
        ArrowField::new("sqft", DataType::Float64, true),
        ArrowField::new("ppsqft", DataType::Float64, true),
        ArrowField::new("bedrooms", DataType::Float64, true),
        ArrowField::new("total_bathrooms", DataType::Float64, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("listed_date", DataType::Utf8, true),
        ArrowField::new("date_processed", DataType::Utf8, true),
        ArrowField::new("reported_as_inactive", DataType::Boolean, false),
    ]));

    let number = |column: &str| Float64Array::from(listings.iter().map(|l| l.numeric(column)).collect::<Vec<_>>());
    let listed_dates: Vec<Option<String>> = listings
        .iter()
        .map(|l| l.listed_date.date().map(|d| d.format("%Y-%m-%d").to_string()))
        .collect();
    let processed: Vec<Option<String>> = listings
        .iter()
        .map(|l| l.date_processed.map(|ts| ts.to_rfc3339()))
        .collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(listings, |l| Some(l.listing_id.as_str()))),
            Arc::new(text_column(listings, |l| l.full_street_address.as_deref())),
            Arc::new(text_column(listings, |l| l.city.as_deref())),
            Arc::new(text_column(listings, |l| l.zip_code.as_deref())),
            Arc::new(text_column(listings, |l| l.subtype.as_deref())),
            Arc::new(number("list_price")),
            Arc::new(number("sqft")),
            Arc::new(number("ppsqft")),
            Arc::new(number("bedrooms")),
            Arc::new(number("total_bathrooms")),
            Arc::new(number("latitude")),
            Arc::new(number("longitude")),
            Arc::new(StringArray::from(listed_dates)),
            Arc::new(StringArray::from(processed)),
            Arc::new(BooleanArray::from(
                listings.iter().map(|l| l.reported_as_inactive).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn text_column(listings: &[Listing], read: fn(&Listing) -> Option<&str>) -> StringArray {
    StringArray::from(listings.iter().map(read).collect::<Vec<_>>())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = content_hash(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use larentals_core::{AuditRule, ListingReport};
    use larentals_storage::MemorySnapshotStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_lease_batch(root: &Path) {
        let path = default_inbox_path(root, Segment::Lease);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let batch = json!({
            "segment": "lease",
            "source": "mls-export",
            "captured_at": "2025-05-02T12:00:00Z",
            "sheets": [{
                "name": "Lease",
                "columns": ["MLS #", "St #", "Address", "City", "Zip", "LP", "Sqft", "Lease Terms"],
                "rows": [
                    ["L1", "12", "Elm Ave", "Pasadena", "91101", "2,400", "700", "month to month, 1 year"],
                    ["L2", "34", "Oak St", "Glendale", "91203", "2,600", "720", "12 months"],
                    ["L3", "56", "Pine Rd", "Burbank", "91502", "2,500", "710", ""],
                    ["L4", "78", "Palm Dr", "Pasadena", "91104", "9,900", "9000", ""],
                    [null, "90", "Ash Ct", "Burbank", "91502", "2,000", "650", ""]
                ]
            }]
        });
        std::fs::write(&path, serde_json::to_vec(&batch).unwrap()).unwrap();
    }

    fn sqft_only_rules() -> RuleSet {
        RuleSet::default().with_gate(
            Segment::Lease,
            GateConfig {
                columns: vec!["sqft".into()],
                ..GateConfig::default()
            },
        )
    }

    fn options() -> SyncOptions {
        SyncOptions::default()
    }

    #[tokio::test]
    async fn lease_run_merges_gates_and_reports() {
        let dir = tempdir().unwrap();
        write_lease_batch(dir.path());
        let mut flagged = Listing::new("L2", Segment::Lease);
        flagged.reported_as_inactive = true;
        flagged.report = Some(ListingReport {
            option: "Unavailable/Sold/Rented".into(),
            text: None,
        });
        let store = Arc::new(
            MemorySnapshotStore::new()
                .with_snapshot(Segment::Lease, vec![flagged, Listing::new("OLD", Segment::Lease)]),
        );
        let pipeline = SyncPipeline::new(PipelineConfig::for_workspace(dir.path()), store.clone(), store.clone())
            .unwrap()
            .with_rules(sqft_only_rules());

        let summary = pipeline.run_segment(Segment::Lease, &options()).await.unwrap();
        assert_eq!(summary.input_rows, 5);
        assert_eq!(summary.normalized_rows, 4);
        assert_eq!(summary.malformed_rows, 1);
        assert_eq!(summary.gate_rejections, 1);

        let written = store.snapshot(Segment::Lease).await.unwrap();
        let ids: Vec<&str> = written.iter().map(|l| l.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L2", "L3", "OLD"]);
        assert!(written[1].reported_as_inactive);
        assert_eq!(written[0].street_address.as_deref(), Some("12 Elm Ave"));
        assert_eq!(written[0].terms, vec!["MO".to_string(), "12M".to_string()]);

        let reports = PathBuf::from(&summary.reports_dir);
        assert!(reports.join("run_summary.md").exists());
        assert!(reports.join("snapshots").join("listings.parquet").exists());
        let audit: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reports.join("audit.json")).unwrap()).unwrap();
        let rules: Vec<&str> = audit["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["rule"].as_str().unwrap())
            .collect();
        assert_eq!(rules, vec![AuditRule::MalformedRow.as_str(), AuditRule::IqrThreshold.as_str()]);
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.parquet_manifest).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["path"], "snapshots/listings.parquet");
        assert_eq!(manifest["files"][0]["sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn unreadable_prior_snapshot_aborts_and_dumps_the_batch() {
        let dir = tempdir().unwrap();
        write_lease_batch(dir.path());
        let prior = vec![Listing::new("KEEP", Segment::Lease)];
        let store = Arc::new(MemorySnapshotStore::new().with_snapshot(Segment::Lease, prior.clone()));
        store.poison();
        let pipeline =
            SyncPipeline::new(PipelineConfig::for_workspace(dir.path()), store.clone(), store.clone()).unwrap();

        let err = pipeline.run_segment(Segment::Lease, &options()).await.unwrap_err();
        assert!(format!("{err:#}").contains("reading prior lease snapshot"));

        let dump_dir = dir.path().join("artifacts").join("failed-merge").join("lease");
        assert_eq!(std::fs::read_dir(&dump_dir).unwrap().count(), 1);
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_prior_snapshot_in_place() {
        let dir = tempdir().unwrap();
        write_lease_batch(dir.path());
        let prior = vec![Listing::new("KEEP", Segment::Lease)];
        let store = Arc::new(MemorySnapshotStore::new().with_snapshot(Segment::Lease, prior.clone()));
        store.fail_writes();
        let pipeline =
            SyncPipeline::new(PipelineConfig::for_workspace(dir.path()), store.clone(), store.clone()).unwrap();

        assert!(pipeline.run_segment(Segment::Lease, &options()).await.is_err());
        assert_eq!(store.snapshot(Segment::Lease).await.unwrap(), prior);
    }

    #[tokio::test]
    async fn sample_runs_write_only_the_sample_table() {
        let dir = tempdir().unwrap();
        write_lease_batch(dir.path());
        let live = Arc::new(MemorySnapshotStore::new());
        let sample = Arc::new(MemorySnapshotStore::new());
        let pipeline = SyncPipeline::new(PipelineConfig::for_workspace(dir.path()), live.clone(), sample.clone())
            .unwrap()
            .with_rules(sqft_only_rules());

        let summary = pipeline
            .run_segment(
                Segment::Lease,
                &SyncOptions {
                    sample: Some(2),
                    ..options()
                },
            )
            .await
            .unwrap();
        assert!(summary.sample);
        assert_eq!(summary.input_rows, 2);
        assert!(live.snapshot(Segment::Lease).await.is_none());
        assert_eq!(sample.snapshot(Segment::Lease).await.unwrap().len(), 2);
    }

    #[test]
    fn rule_files_override_defaults() {
        let dir = tempdir().unwrap();
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(rules_dir.join("columns.yaml"), "buy:\n  \"asking price\": list_price\n").unwrap();
        std::fs::write(
            rules_dir.join("outliers.yaml"),
            "buy:\n  columns: [list_price]\n  absolute_caps:\n    bedrooms: 6\n",
        )
        .unwrap();

        let rules = RuleSet::from_workspace_root(dir.path()).unwrap();
        assert_eq!(
            rules.column_overrides(Segment::Buy).get("asking price").map(String::as_str),
            Some("list_price")
        );
        assert_eq!(rules.gate(Segment::Buy).iqr_multiplier, 1.5);
        assert_eq!(rules.gate(Segment::Buy).absolute_caps.get("bedrooms"), Some(&6.0));
        assert_eq!(rules.gate(Segment::Lease), &GateConfig::lease_defaults());

        let empty = tempdir().unwrap();
        assert!(RuleSet::from_workspace_root(empty.path()).unwrap().column_overrides(Segment::Lease).is_empty());
    }

    #[test]
    fn expiry_targets_follow_the_merge_winner() {
        let mut prior = Listing::new("A1", Segment::Lease);
        prior.listing_url = Some("https://x/a1-old".into());
        let mut prior_only = Listing::new("B2", Segment::Lease);
        prior_only.listing_url = Some("https://x/b2".into());
        let fresh = Listing::new("A1", Segment::Lease);

        let targets = expiry_targets(&[fresh], &[prior, prior_only]);
        assert_eq!(targets, vec![("B2".to_string(), "https://x/b2".to_string())]);
    }

    #[tokio::test]
    async fn terms_backfill_canonicalizes_legacy_rows() {
        let mut legacy = Listing::new("L1", Segment::Lease);
        legacy.extras.insert("terms".into(), "Month-to-Month, 6 Months".into());
        let mut current = Listing::new("L2", Segment::Lease);
        current.terms = vec!["12M".into()];
        let store = MemorySnapshotStore::new().with_snapshot(Segment::Lease, vec![legacy, current]);

        let changed = backfill_terms(&store, Segment::Lease).await.unwrap();
        assert_eq!(changed, 1);
        let rows = store.snapshot(Segment::Lease).await.unwrap();
        assert_eq!(rows[0].terms, vec!["MO".to_string(), "6M".to_string()]);
        assert!(rows[0].extras.get("terms").is_none());
        assert_eq!(rows[1].terms, vec!["12M".to_string()]);
    }
}

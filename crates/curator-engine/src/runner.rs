use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{anyhow, Context, Result};
use curator_contracts::catalog::{AssetDescriptor, Catalog};
use curator_contracts::events::{EventWriter, RUN_FINISHED, RUN_STARTED};
use curator_contracts::models::{ModelSelector, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_VISION};
use curator_contracts::runs::summary::{write_summary, RunSummary};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{BudgetPolicy, RunConfig};
use crate::generation::{resolve_size, GenerationClient};
use crate::ledger::{micros_to_usd, usd_to_micros, CostLedger};
use crate::pacing::CallPacer;
use crate::pricing::PricingTables;
use crate::providers::{build_generator, build_reviewer, ImageGenerator, ImageReviewer};
use crate::refine::{RefinementController, RefinementSession, SessionState};
use crate::review::ReviewClient;
use crate::store::ArtifactStore;
use crate::{map_object, now_utc_iso};

/// Models for both services plus the unit cost each billed call is charged.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub image: ModelSpec,
    pub vision: ModelSpec,
    pub generation_cost_usd: f64,
    pub review_cost_usd: f64,
}

impl ModelChoice {
    /// Explicitly requested models must exist; unit costs come from the
    /// config overrides, then the pricing tables.
    pub fn resolve(config: &RunConfig, pricing: &PricingTables) -> Result<Self> {
        let selector = ModelSelector::new(None);
        let image = selector
            .select_strict(config.image_model.as_deref(), CAPABILITY_IMAGE)
            .map_err(|err| anyhow!(err))
            .context("image model selection failed")?
            .model;
        let vision = selector
            .select_strict(config.vision_model.as_deref(), CAPABILITY_VISION)
            .map_err(|err| anyhow!(err))
            .context("vision model selection failed")?
            .model;

        let generation_cost_usd = match config.generation_cost_usd {
            Some(cost) => cost,
            None => pricing
                .generation_cost(image.pricing_key.as_deref(), config.quality)
                .ok_or_else(|| {
                    anyhow!(
                        "no generation price for model '{}'; pass a generation cost",
                        image.name
                    )
                })?,
        };
        let review_cost_usd = match config.review_cost_usd {
            Some(cost) => cost,
            None => pricing
                .review_cost(vision.pricing_key.as_deref())
                .ok_or_else(|| {
                    anyhow!(
                        "no review price for model '{}'; pass a review cost",
                        vision.name
                    )
                })?,
        };

        Ok(Self {
            image,
            vision,
            generation_cost_usd,
            review_cost_usd,
        })
    }

    /// Worst case for every asset: `max_iterations` generation and review calls.
    pub fn plan(&self, config: &RunConfig, assets: &[AssetDescriptor]) -> RunPlan {
        let cycle_micros =
            usd_to_micros(self.generation_cost_usd) + usd_to_micros(self.review_cost_usd);
        let asset_micros = cycle_micros * u64::from(config.max_iterations);
        let rows: Vec<AssetPlan> = assets
            .iter()
            .map(|asset| AssetPlan {
                id: asset.id.clone(),
                category: asset.category.as_str().to_string(),
                priority: asset.priority.as_str().to_string(),
                size: resolve_size(asset),
                segmented: asset.category.requires_transparency(),
                worst_case_usd: micros_to_usd(asset_micros),
            })
            .collect();
        let total_micros = asset_micros * rows.len() as u64;
        RunPlan {
            image_model: self.image.name.clone(),
            vision_model: self.vision.name.clone(),
            quality: config.quality.as_str().to_string(),
            max_iterations: config.max_iterations,
            generation_cost_usd: self.generation_cost_usd,
            review_cost_usd: self.review_cost_usd,
            assets: rows,
            total_worst_case_usd: micros_to_usd(total_micros),
            limit_usd: config.budget_limit_usd,
            fits_limit: total_micros <= usd_to_micros(config.budget_limit_usd),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetPlan {
    pub id: String,
    pub category: String,
    pub priority: String,
    pub size: String,
    pub segmented: bool,
    pub worst_case_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    pub image_model: String,
    pub vision_model: String,
    pub quality: String,
    pub max_iterations: u32,
    pub generation_cost_usd: f64,
    pub review_cost_usd: f64,
    pub assets: Vec<AssetPlan>,
    pub total_worst_case_usd: f64,
    pub limit_usd: f64,
    pub fits_limit: bool,
}

/// Owns everything a run shares across sessions: ledger, pacer, event log,
/// artifact store and the two provider handles.
pub struct CurationEngine {
    config: RunConfig,
    choice: ModelChoice,
    run_id: String,
    started_at: String,
    store: ArtifactStore,
    events: EventWriter,
    ledger: CostLedger,
    pacer: CallPacer,
    generator: Box<dyn ImageGenerator>,
    reviewer: Box<dyn ImageReviewer>,
    references: Vec<PathBuf>,
    style_guide: Option<String>,
    finished: Vec<Map<String, Value>>,
    counts: [u64; 3],
    budget_exceeded: bool,
}

impl CurationEngine {
    /// Builds providers for the chosen models. Missing credentials are a
    /// configuration error.
    pub fn new(config: RunConfig, choice: ModelChoice, catalog: &Catalog) -> Result<Self> {
        let generator = build_generator(&choice.image, config.request_timeout)?;
        let reviewer = build_reviewer(&choice.vision, config.request_timeout)?;
        Self::with_providers(config, choice, catalog, generator, reviewer)
    }

    /// Validates the config and reference images, creates the output
    /// directory and emits `run_started`.
    pub fn with_providers(
        config: RunConfig,
        choice: ModelChoice,
        catalog: &Catalog,
        generator: Box<dyn ImageGenerator>,
        reviewer: Box<dyn ImageReviewer>,
    ) -> Result<Self> {
        config.validate()?;
        for reference in &catalog.references {
            image::open(reference).with_context(|| {
                format!("failed to read reference image {}", reference.display())
            })?;
        }

        let store = ArtifactStore::new(config.out_dir.clone());
        std::fs::create_dir_all(store.root())
            .with_context(|| format!("failed to create {}", store.root().display()))?;
        let run_id = store
            .root()
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("curator-run")
            .to_string();
        let events = EventWriter::new(store.events_path(), run_id.clone());

        let mut payload = config.to_payload();
        payload.insert("image_model".to_string(), json!(choice.image.name));
        payload.insert("vision_model".to_string(), json!(choice.vision.name));
        payload.insert(
            "generation_cost_usd".to_string(),
            json!(choice.generation_cost_usd),
        );
        payload.insert("review_cost_usd".to_string(), json!(choice.review_cost_usd));
        payload.insert(
            "references".to_string(),
            json!(catalog.references.len()),
        );
        events.emit(RUN_STARTED, payload)?;

        Ok(Self {
            ledger: CostLedger::new(config.budget_limit_usd),
            pacer: CallPacer::new(config.call_delay),
            config,
            choice,
            run_id,
            started_at: now_utc_iso(),
            store,
            events,
            generator,
            reviewer,
            references: catalog.references.clone(),
            style_guide: catalog.style_guide.clone(),
            finished: Vec::new(),
            counts: [0; 3],
            budget_exceeded: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn plan(&self, assets: &[AssetDescriptor]) -> RunPlan {
        self.choice.plan(&self.config, assets)
    }

    /// Runs one session per asset and returns them in input order.
    ///
    /// Per-asset errors never abort the batch. Under [`BudgetPolicy::Run`],
    /// assets not yet started once any session hits the ledger limit are
    /// recorded as exhausted without calling either service.
    pub fn run(&mut self, assets: &[AssetDescriptor]) -> Vec<RefinementSession> {
        let generation = GenerationClient::new(
            &self.ledger,
            &self.pacer,
            self.generator.as_ref(),
            self.choice.image.name.clone(),
            self.choice.generation_cost_usd,
        )
        .with_quality(self.config.quality)
        .with_segmentation(self.config.segmentation.clone());
        let review = ReviewClient::new(
            &self.ledger,
            &self.pacer,
            self.reviewer.as_ref(),
            self.choice.vision.name.clone(),
            self.choice.review_cost_usd,
        )
        .with_references(self.references.clone())
        .with_style_guide(self.style_guide.clone());
        let controller =
            RefinementController::new(&generation, &review, &self.store, &self.events);

        let max_iterations = self.config.max_iterations;
        let stop_on_budget = self.config.budget_policy == BudgetPolicy::Run;
        let next = AtomicUsize::new(0);
        let halted = AtomicBool::new(false);
        let done: Mutex<Vec<(usize, RefinementSession)>> = Mutex::new(Vec::new());

        let worker = || loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(asset) = assets.get(index) else {
                break;
            };
            let mut session = if halted.load(Ordering::SeqCst) {
                RefinementSession::unstarted(asset.clone(), max_iterations)
            } else {
                RefinementSession::new(asset.clone(), max_iterations)
            };
            if let Err(err) = controller.run(&mut session) {
                session.record_error(&err);
            }
            if stop_on_budget && session.budget_exceeded {
                halted.store(true, Ordering::SeqCst);
            }
            done.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((index, session));
        };

        let workers = self.config.workers.clamp(1, assets.len().max(1));
        if workers == 1 {
            worker();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&worker);
                }
            });
        }

        let mut sessions = done.into_inner().unwrap_or_else(PoisonError::into_inner);
        sessions.sort_by_key(|(index, _)| *index);
        let sessions: Vec<RefinementSession> =
            sessions.into_iter().map(|(_, session)| session).collect();
        for session in &sessions {
            self.record(session);
        }
        sessions
    }

    fn record(&mut self, session: &RefinementSession) {
        let slot = match session.state {
            SessionState::Approved => 0,
            SessionState::Failed => 2,
            _ => 1,
        };
        self.counts[slot] += 1;
        self.budget_exceeded |= session.budget_exceeded;
        self.finished.push(session.summary_row());
    }

    pub fn summary(&self) -> RunSummary {
        let [approved, exhausted, failed] = self.counts;
        RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            approved,
            exhausted,
            failed,
            spent_usd: self.ledger.spent_usd(),
            limit_usd: self.ledger.limit_usd(),
            budget_exceeded: self.budget_exceeded,
            assets: self.finished.clone(),
        }
    }

    /// Writes `summary.json` and emits `run_finished`.
    pub fn finish(&mut self) -> Result<RunSummary> {
        let summary = self.summary();
        let extra = map_object(json!({
            "image_model": self.choice.image.name,
            "vision_model": self.choice.vision.name,
            "quality": self.config.quality.as_str(),
            "budget_policy": self.config.budget_policy.as_str(),
            "max_iterations": self.config.max_iterations,
        }));
        let summary_path = self.store.summary_path();
        write_summary(&summary_path, &summary, Some(&extra))?;
        self.events.emit(
            RUN_FINISHED,
            map_object(json!({
                "summary_path": summary_path.to_string_lossy().to_string(),
                "approved": summary.approved,
                "exhausted": summary.exhausted,
                "failed": summary.failed,
                "spent_usd": summary.spent_usd,
                "limit_usd": summary.limit_usd,
                "budget_exceeded": summary.budget_exceeded,
            })),
        )?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use curator_contracts::catalog::{Catalog, CatalogFilter};
    use serde_json::Value;

    use super::{CurationEngine, ModelChoice};
    use crate::config::{BudgetPolicy, RunConfig};
    use crate::pricing::PricingTables;
    use crate::refine::{SessionState, UNSTARTED_REASON};

    const CATALOG: &str = r#"{
        "style_guide": "flat shading, warm palette",
        "assets": {
            "icon": [{"id": "coin", "prompt": "gold coin", "size": "128x128"}],
            "background": [{"id": "sky", "prompt": "evening sky", "size": "128x96"}]
        }
    }"#;

    fn dryrun_config(out_dir: &Path) -> RunConfig {
        let mut config = RunConfig::new(out_dir);
        config.call_delay = Duration::ZERO;
        config.image_model = Some("dryrun-image-1".to_string());
        config.vision_model = Some("dryrun-vision-1".to_string());
        config.generation_cost_usd = Some(0.01);
        config.review_cost_usd = Some(0.005);
        config
    }

    fn engine(config: RunConfig, catalog: &Catalog) -> anyhow::Result<CurationEngine> {
        let choice = ModelChoice::resolve(&config, &PricingTables::from_json("{}"))?;
        CurationEngine::new(config, choice, catalog)
    }

    #[test]
    fn dryrun_batch_refines_and_approves_every_asset() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = Catalog::parse(CATALOG, temp.path())?;
        let assets = catalog.select(&CatalogFilter::default())?;
        let mut engine = engine(dryrun_config(&temp.path().join("run-a")), &catalog)?;

        let sessions = engine.run(&assets);
        let summary = engine.finish()?;

        assert_eq!(sessions.len(), 2);
        for session in &sessions {
            assert_eq!(session.state, SessionState::Approved);
            assert_eq!(session.iteration, 2);
        }
        assert_eq!(summary.approved, 2);
        assert_eq!(summary.run_id, "run-a");
        assert!((summary.spent_usd - 0.06).abs() < 1e-9);
        assert!(!summary.budget_exceeded);

        let icon = image::open(engine.store().asset_path(&assets[0]))?.to_rgba8();
        assert_eq!(icon.get_pixel(0, 0)[3], 0);
        let background = image::open(engine.store().asset_path(&assets[1]))?.to_rgba8();
        assert_eq!(background.dimensions(), (128, 96));

        let written: Value = serde_json::from_str(&fs::read_to_string(
            engine.store().summary_path(),
        )?)?;
        assert_eq!(written["total"], 2);
        assert_eq!(written["image_model"], "dryrun-image-1");

        let types = engine.event_writer().read_types()?;
        assert_eq!(types.first().map(String::as_str), Some("run_started"));
        assert_eq!(types.last().map(String::as_str), Some("run_finished"));
        assert_eq!(
            types.iter().filter(|row| row.as_str() == "asset_finished").count(),
            2
        );
        Ok(())
    }

    #[test]
    fn run_policy_skips_assets_after_budget_is_hit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = Catalog::parse(CATALOG, temp.path())?;
        let assets = catalog.select(&CatalogFilter::default())?;
        let mut config = dryrun_config(&temp.path().join("run"));
        config.budget_limit_usd = 0.02;
        let mut engine = engine(config, &catalog)?;

        let sessions = engine.run(&assets);
        let summary = engine.finish()?;

        assert!(sessions[0].budget_exceeded);
        assert_eq!(sessions[0].iteration, 2);
        assert_eq!(sessions[1].state, SessionState::Exhausted);
        assert_eq!(sessions[1].iteration, 0);
        assert_eq!(sessions[1].terminal_reason.as_deref(), Some(UNSTARTED_REASON));
        assert_eq!(summary.exhausted, 2);
        assert!(summary.budget_exceeded);
        assert!(summary.spent_usd <= summary.limit_usd);
        Ok(())
    }

    #[test]
    fn session_policy_lets_later_assets_try() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = Catalog::parse(CATALOG, temp.path())?;
        let assets = catalog.select(&CatalogFilter::default())?;
        let mut config = dryrun_config(&temp.path().join("run"));
        config.budget_limit_usd = 0.02;
        config.budget_policy = BudgetPolicy::Session;
        let mut engine = engine(config, &catalog)?;

        let sessions = engine.run(&assets);

        assert_eq!(sessions[1].state, SessionState::Exhausted);
        assert!(sessions[1].budget_exceeded);
        assert_ne!(sessions[1].terminal_reason.as_deref(), Some(UNSTARTED_REASON));
        Ok(())
    }

    #[test]
    fn parallel_workers_keep_input_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = Catalog::parse(CATALOG, temp.path())?;
        let assets = catalog.select(&CatalogFilter::default())?;
        let mut config = dryrun_config(&temp.path().join("run"));
        config.workers = 4;
        let mut engine = engine(config, &catalog)?;

        let sessions = engine.run(&assets);
        let summary = engine.finish()?;

        let ids: Vec<&str> = sessions.iter().map(|session| session.asset.id.as_str()).collect();
        assert_eq!(ids, vec!["coin", "sky"]);
        assert_eq!(summary.approved, 2);
        assert_eq!(summary.assets[0]["asset_id"], "coin");
        Ok(())
    }

    #[test]
    fn plan_reports_worst_case_against_the_limit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let catalog = Catalog::parse(CATALOG, temp.path())?;
        let assets = catalog.select(&CatalogFilter::default())?;
        let mut config = dryrun_config(&temp.path().join("run"));
        config.budget_limit_usd = 0.05;
        let choice = ModelChoice::resolve(&config, &PricingTables::from_json("{}"))?;

        let plan = choice.plan(&config, &assets);

        assert_eq!(plan.assets.len(), 2);
        assert_eq!(plan.assets[0].worst_case_usd, 0.045);
        assert!(plan.assets[0].segmented);
        assert!(!plan.assets[1].segmented);
        assert_eq!(plan.assets[1].size, "128x96");
        assert_eq!(plan.total_worst_case_usd, 0.09);
        assert!(!plan.fits_limit);
        Ok(())
    }

    #[test]
    fn missing_price_without_override_is_a_config_error() {
        let mut config = RunConfig::new("/tmp/unused");
        config.image_model = Some("dryrun-image-1".to_string());
        config.vision_model = Some("dryrun-vision-1".to_string());
        let err = ModelChoice::resolve(&config, &PricingTables::from_json("{}"))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("no generation price"));

        let priced = PricingTables::load();
        assert!(ModelChoice::resolve(&config, &priced).is_ok());
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut config = RunConfig::new("/tmp/unused");
        config.image_model = Some("imaginary-9000".to_string());
        assert!(ModelChoice::resolve(&config, &PricingTables::load()).is_err());
    }

    #[test]
    fn unreadable_reference_aborts_before_run_started() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("style.png"), b"not a png")?;
        let catalog = Catalog::parse(
            r#"{"references": ["style.png"], "assets": {"icon": [{"id": "a", "prompt": "a"}]}}"#,
            temp.path(),
        )?;
        let out_dir = temp.path().join("run");

        let err = engine(dryrun_config(&out_dir), &catalog)
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();

        assert!(err.contains("failed to read reference image"));
        assert!(!out_dir.join("events.jsonl").exists());
        Ok(())
    }
}

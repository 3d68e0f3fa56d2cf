use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use curator_contracts::catalog::AssetDescriptor;
use curator_contracts::events::{
    EventWriter, ASSET_FINISHED, ASSET_STARTED, BUDGET_EXCEEDED, GENERATION_COMPLETED,
    GENERATION_FAILED, PROMPT_REVISED, REVIEW_COMPLETED, SEGMENTATION_SKIPPED,
};
use curator_contracts::runs::receipts::{build_receipt, write_receipt, AttemptRequest};
use curator_contracts::runs::session_log::{SessionLog, TransitionEntry};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::generation::{GeneratedAsset, GenerationClient, GenerationResult, SegmentationOutcome};
use crate::ledger::BudgetExceeded;
use crate::pacing::CallKind;
use crate::providers::FailureKind;
use crate::review::{review_event_payload, ReviewClient, ReviewResult};
use crate::store::ArtifactStore;
use crate::{error_chain_text, map_object, now_utc_iso};

pub const UNSTARTED_REASON: &str = "budget exceeded before start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Generated,
    Segmented,
    Reviewed,
    Approved,
    Exhausted,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generated => "generated",
            Self::Segmented => "segmented",
            Self::Reviewed => "reviewed",
            Self::Approved => "approved",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Exhausted | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generate/review cycle.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub iteration: u32,
    pub prompt: String,
    pub generation: Map<String, Value>,
    pub review: Option<ReviewResult>,
    pub artifact_path: Option<PathBuf>,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub iteration: u32,
    pub from: SessionState,
    pub to: SessionState,
    pub note: Option<String>,
    pub at: String,
}

/// Per-asset refinement state. `asset.prompt` always holds the prompt the
/// next generation will use.
#[derive(Debug, Clone)]
pub struct RefinementSession {
    pub session_id: String,
    pub asset: AssetDescriptor,
    pub iteration: u32,
    pub max_iterations: u32,
    pub state: SessionState,
    pub attempts: Vec<Attempt>,
    pub transitions: Vec<Transition>,
    pub terminal_reason: Option<String>,
    pub spent_usd: f64,
    pub budget_exceeded: bool,
    pub artifact_path: Option<PathBuf>,
}

impl RefinementSession {
    pub fn new(asset: AssetDescriptor, max_iterations: u32) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            asset,
            iteration: 0,
            max_iterations,
            state: SessionState::Pending,
            attempts: Vec::new(),
            transitions: Vec::new(),
            terminal_reason: None,
            spent_usd: 0.0,
            budget_exceeded: false,
            artifact_path: None,
        }
    }

    /// A session the run stopped before its first call.
    pub fn unstarted(asset: AssetDescriptor, max_iterations: u32) -> Self {
        let mut session = Self::new(asset, max_iterations);
        session.budget_exceeded = true;
        session.terminate(SessionState::Exhausted, UNSTARTED_REASON);
        session
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn last_review(&self) -> Option<&ReviewResult> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.review.as_ref())
    }

    fn transition(&mut self, to: SessionState, note: Option<String>) {
        self.transitions.push(Transition {
            iteration: self.iteration,
            from: self.state,
            to,
            note,
            at: now_utc_iso(),
        });
        self.state = to;
    }

    fn terminate(&mut self, to: SessionState, reason: impl Into<String>) {
        let reason = reason.into();
        self.transition(to, Some(reason.clone()));
        self.terminal_reason = Some(reason);
    }

    /// Marks a session whose bookkeeping failed; a terminal state is kept.
    pub(crate) fn record_error(&mut self, err: &anyhow::Error) {
        let reason = format!("session error: {}", error_chain_text(err, 512));
        if self.is_terminal() {
            self.terminal_reason = Some(match self.terminal_reason.take() {
                Some(previous) => format!("{previous}; {reason}"),
                None => reason,
            });
        } else {
            self.terminate(SessionState::Failed, reason);
        }
    }

    /// Row used by `asset_finished` events and the run summary.
    pub fn summary_row(&self) -> Map<String, Value> {
        map_object(json!({
            "asset_id": self.asset.id,
            "category": self.asset.category.as_str(),
            "state": self.state.as_str(),
            "reason": self.terminal_reason,
            "iterations": self.iteration,
            "max_iterations": self.max_iterations,
            "spent_usd": self.spent_usd,
            "budget_exceeded": self.budget_exceeded,
            "final_prompt": self.asset.prompt,
            "overall_score": self.last_review().map(|review| review.overall_score),
            "artifact_path": self
                .artifact_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
        }))
    }

    pub fn session_log(&self, path: impl Into<PathBuf>) -> SessionLog {
        let mut log = SessionLog::new(path, self.asset.id.as_str());
        log.session_id = self.session_id.clone();
        for attempt in &self.attempts {
            log.record_attempt(
                attempt.iteration,
                &attempt.prompt,
                attempt.generation.clone(),
                attempt.review.as_ref().map(ReviewResult::to_payload),
                attempt.artifact_path.as_deref(),
            );
        }
        log.transitions = self
            .transitions
            .iter()
            .map(|transition| TransitionEntry {
                iteration: transition.iteration,
                from: transition.from.as_str().to_string(),
                to: transition.to.as_str().to_string(),
                note: transition.note.clone(),
                at: transition.at.clone(),
            })
            .collect();
        if self.is_terminal() {
            log.finish(self.state.as_str(), self.terminal_reason.as_deref());
        }
        log
    }
}

/// Receipt inputs for the iteration in flight; rewritten as the cycle advances.
struct CycleRecord {
    request: AttemptRequest,
    provider_request: Map<String, Value>,
    provider_response: Map<String, Value>,
    warnings: Vec<String>,
    metadata: Map<String, Value>,
    image_path: Option<PathBuf>,
    receipt_path: PathBuf,
}

#[derive(Default)]
struct Cycle {
    generated: Option<GeneratedAsset>,
    candidate: Option<RgbaImage>,
    review: Option<ReviewResult>,
    record: Option<CycleRecord>,
    last_failure_malformed: bool,
}

/// Drives one session through generate, persist, review and decide until it
/// reaches `approved`, `exhausted` or `failed`.
pub struct RefinementController<'a> {
    generation: &'a GenerationClient<'a>,
    review: &'a ReviewClient<'a>,
    store: &'a ArtifactStore,
    events: &'a EventWriter,
}

impl<'a> RefinementController<'a> {
    pub fn new(
        generation: &'a GenerationClient<'a>,
        review: &'a ReviewClient<'a>,
        store: &'a ArtifactStore,
        events: &'a EventWriter,
    ) -> Self {
        Self {
            generation,
            review,
            store,
            events,
        }
    }

    /// Runs the session to a terminal state, then writes its session log and
    /// emits `asset_finished`. A session that is already terminal is only
    /// recorded.
    ///
    /// Errors are limited to event, receipt and session-log I/O; provider and
    /// budget outcomes end up in `session.state`.
    pub fn run(&self, session: &mut RefinementSession) -> Result<()> {
        if !session.is_terminal() {
            self.events.emit_for_asset(
                ASSET_STARTED,
                &session.asset.id,
                session.iteration,
                map_object(json!({
                    "category": session.asset.category.as_str(),
                    "prompt": session.asset.prompt,
                    "max_iterations": session.max_iterations,
                })),
            )?;
        }

        let mut cycle = Cycle::default();
        while !session.is_terminal() {
            match session.state {
                SessionState::Pending => self.generate_step(session, &mut cycle)?,
                SessionState::Generated => self.persist_step(session, &mut cycle)?,
                SessionState::Segmented => self.review_step(session, &mut cycle)?,
                SessionState::Reviewed => self.decide_step(session, &mut cycle)?,
                SessionState::Approved | SessionState::Exhausted | SessionState::Failed => break,
            }
        }

        self.finish(session)
    }

    fn generate_step(&self, session: &mut RefinementSession, cycle: &mut Cycle) -> Result<()> {
        if session.iteration >= session.max_iterations {
            session.terminate(SessionState::Exhausted, "max iterations reached");
            return Ok(());
        }
        session.iteration += 1;
        let iteration = session.iteration;

        let result = match self.generation.generate(&session.asset) {
            Ok(result) => result,
            Err(exceeded) => return self.stop_for_budget(session, CallKind::Generation, &exceeded),
        };
        session.spent_usd += result.cost_usd;
        let summary = result.summary();
        session.attempts.push(Attempt {
            iteration,
            prompt: session.asset.prompt.clone(),
            generation: summary.clone(),
            review: None,
            artifact_path: None,
            cost_usd: result.cost_usd,
        });
        let record = self.cycle_record(&session.asset, iteration, &result, summary.clone());

        match result.outcome {
            Err(failure) => {
                self.events.emit_for_asset(
                    GENERATION_FAILED,
                    &session.asset.id,
                    iteration,
                    map_object(json!({
                        "error_kind": failure.kind.as_str(),
                        "error": failure.message,
                        "charged": failure.charged,
                        "cost_usd": result.cost_usd,
                    })),
                )?;
                self.write_cycle_receipt(&record)?;

                let malformed = failure.kind == FailureKind::MalformedResponse;
                let repeated_malformed = malformed && cycle.last_failure_malformed;
                cycle.last_failure_malformed = malformed;
                if !failure.kind.is_retryable() || repeated_malformed {
                    session.terminate(
                        SessionState::Failed,
                        format!("generation failed: {failure}"),
                    );
                } else if iteration >= session.max_iterations {
                    session.terminate(
                        SessionState::Exhausted,
                        format!("max iterations reached after {} failure", failure.kind),
                    );
                } else {
                    session.transition(
                        SessionState::Pending,
                        Some(format!("retrying after {} failure", failure.kind)),
                    );
                }
            }
            Ok(generated) => {
                cycle.last_failure_malformed = false;
                self.events.emit_for_asset(
                    GENERATION_COMPLETED,
                    &session.asset.id,
                    iteration,
                    summary,
                )?;
                cycle.generated = Some(generated);
                cycle.record = Some(record);
                session.transition(SessionState::Generated, None);
            }
        }
        Ok(())
    }

    fn persist_step(&self, session: &mut RefinementSession, cycle: &mut Cycle) -> Result<()> {
        let Some(generated) = cycle.generated.take() else {
            session.terminate(SessionState::Failed, "no generated image to persist");
            return Ok(());
        };
        if let SegmentationOutcome::Skipped(err) = &generated.segmentation {
            self.events.emit_for_asset(
                SEGMENTATION_SKIPPED,
                &session.asset.id,
                session.iteration,
                map_object(json!({ "reason": err.to_string() })),
            )?;
        }

        let image = generated.final_image();
        let path = match self.store.write_image(&session.asset, &image) {
            Ok(path) => path,
            Err(err) => {
                session.terminate(
                    SessionState::Failed,
                    format!("failed to write artifact: {}", error_chain_text(&err, 512)),
                );
                return Ok(());
            }
        };
        if let Some(attempt) = session.attempts.last_mut() {
            attempt.artifact_path = Some(path.clone());
        }
        if let Some(record) = cycle.record.as_mut() {
            record.image_path = Some(path.clone());
            self.write_cycle_receipt(record)?;
        }
        session.artifact_path = Some(path);
        cycle.candidate = Some(image);
        session.transition(SessionState::Segmented, None);
        Ok(())
    }

    fn review_step(&self, session: &mut RefinementSession, cycle: &mut Cycle) -> Result<()> {
        let Some(candidate) = cycle.candidate.take() else {
            session.terminate(SessionState::Failed, "no candidate image to review");
            return Ok(());
        };
        let result = match self.review.review(&candidate, &session.asset) {
            Ok(result) => result,
            Err(exceeded) => return self.stop_for_budget(session, CallKind::Review, &exceeded),
        };
        session.spent_usd += result.cost_usd;
        self.events.emit_for_asset(
            REVIEW_COMPLETED,
            &session.asset.id,
            session.iteration,
            review_event_payload(&result),
        )?;

        if let Some(attempt) = session.attempts.last_mut() {
            attempt.review = Some(result.clone());
            attempt.cost_usd += result.cost_usd;
        }
        if let Some(record) = cycle.record.as_mut() {
            record
                .metadata
                .insert("review".to_string(), Value::Object(result.to_payload()));
            self.write_cycle_receipt(record)?;
        }
        let note = if result.malformed {
            "malformed review".to_string()
        } else {
            format!("score {}", result.overall_score)
        };
        cycle.review = Some(result);
        session.transition(SessionState::Reviewed, Some(note));
        Ok(())
    }

    fn decide_step(&self, session: &mut RefinementSession, cycle: &mut Cycle) -> Result<()> {
        let Some(review) = cycle.review.take() else {
            session.terminate(SessionState::Failed, "no review to act on");
            return Ok(());
        };

        if review.passed {
            session.terminate(
                SessionState::Approved,
                format!("approved with score {}", review.overall_score),
            );
        } else if session.iteration >= session.max_iterations {
            session.terminate(
                SessionState::Exhausted,
                format!(
                    "max iterations reached; last score {}",
                    review.overall_score
                ),
            );
        } else if review.malformed {
            session.transition(
                SessionState::Pending,
                Some("malformed review, retrying with the same prompt".to_string()),
            );
        } else if let Some(revised) = review.suggested_prompt {
            let previous = std::mem::replace(&mut session.asset.prompt, revised);
            self.events.emit_for_asset(
                PROMPT_REVISED,
                &session.asset.id,
                session.iteration,
                map_object(json!({
                    "previous_prompt": previous,
                    "prompt": session.asset.prompt,
                    "overall_score": review.overall_score,
                })),
            )?;
            session.transition(SessionState::Pending, Some("prompt revised".to_string()));
        } else {
            session.terminate(
                SessionState::Exhausted,
                format!(
                    "score {} with no suggested prompt",
                    review.overall_score
                ),
            );
        }
        Ok(())
    }

    fn stop_for_budget(
        &self,
        session: &mut RefinementSession,
        call: CallKind,
        exceeded: &BudgetExceeded,
    ) -> Result<()> {
        session.budget_exceeded = true;
        self.events.emit_for_asset(
            BUDGET_EXCEEDED,
            &session.asset.id,
            session.iteration,
            map_object(json!({
                "call": call.as_str(),
                "spent_usd": exceeded.spent,
                "limit_usd": exceeded.limit,
                "requested_usd": exceeded.requested,
            })),
        )?;
        session.terminate(SessionState::Exhausted, exceeded.to_string());
        Ok(())
    }

    fn finish(&self, session: &RefinementSession) -> Result<()> {
        session
            .session_log(self.store.session_path(&session.asset.id))
            .save()?;
        self.events.emit_for_asset(
            ASSET_FINISHED,
            &session.asset.id,
            session.iteration,
            session.summary_row(),
        )?;
        Ok(())
    }

    fn cycle_record(
        &self,
        asset: &AssetDescriptor,
        iteration: u32,
        result: &GenerationResult,
        generation: Map<String, Value>,
    ) -> CycleRecord {
        let mut metadata = Map::new();
        metadata.insert("generation".to_string(), Value::Object(generation));
        CycleRecord {
            request: AttemptRequest {
                asset_id: asset.id.clone(),
                category: asset.category.as_str().to_string(),
                iteration,
                prompt: asset.prompt.clone(),
                negative_prompt: asset.negative_prompt.clone(),
                prompt_sent: result.prompt_sent.clone(),
                size: result.size.clone(),
                quality: self.generation.quality().as_str().to_string(),
                image_model: self.generation.model().to_string(),
                vision_model: self.review.model().to_string(),
            },
            provider_request: result.provider_request.clone(),
            provider_response: result.provider_response.clone(),
            warnings: result.warnings.clone(),
            metadata,
            image_path: None,
            receipt_path: self.store.receipt_path(&asset.id, iteration),
        }
    }

    fn write_cycle_receipt(&self, record: &CycleRecord) -> Result<()> {
        let receipt = build_receipt(
            &record.request,
            &record.provider_request,
            &record.provider_response,
            &record.warnings,
            record.image_path.as_deref(),
            &record.receipt_path,
            &record.metadata,
        );
        write_receipt(&record.receipt_path, &receipt)
    }
}

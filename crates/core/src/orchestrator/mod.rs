mod history;

pub use history::{MemoryRunStore, RunRecord, RunStatus, RunStore, RunStoreError};

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::assembler::{assemble, AcceptedChapter, AssemblyError, Manuscript, ManuscriptHeader};
use crate::bible::{AnalysisError, Prompt, PromptValidation, StoryAnalyzer, StoryBible};
use crate::cancel::{interruption, CancelReason, CancelToken};
use crate::config::{Config, ConfigError, GenerationSettings};
use crate::drafting::{ChapterContext, Disposition, DraftingEngine, DraftingError, DraftingModels};
use crate::gateway::{ModelGateway, ModelParameters};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::outline::{Outline, OutlineError, OutlineGenerator, OutlineRequest};
use crate::prompts::PromptRegistry;
use crate::review::QualityReviewer;
use crate::run_log::RunLog;
use crate::stage::Stage;
use crate::text::{tail_chars, PREVIOUS_EXCERPT_CHARS};
use crate::tracker::ConsistencyTracker;

/// Call parameters for every model-backed stage of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct StageParameters {
    pub analyzer: ModelParameters,
    pub outliner: ModelParameters,
    pub drafter: ModelParameters,
    pub extractor: ModelParameters,
}

impl StageParameters {
    /// One model for every stage, with each stage's default temperature.
    pub fn uniform(model: &str, max_tokens: u32) -> Self {
        let params = |stage: Stage| ModelParameters::new(model, max_tokens, stage.default_temperature());
        Self {
            analyzer: params(Stage::Analysis),
            outliner: params(Stage::Outline),
            drafter: params(Stage::Drafting),
            extractor: params(Stage::Extraction),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            analyzer: config.stage_parameters(Stage::Analysis)?,
            outliner: config.stage_parameters(Stage::Outline)?,
            drafter: config.stage_parameters(Stage::Drafting)?,
            extractor: config.stage_parameters(Stage::Extraction)?,
        })
    }

    pub fn for_stage(&self, stage: Stage) -> Option<&ModelParameters> {
        match stage {
            Stage::Analysis => Some(&self.analyzer),
            Stage::Outline => Some(&self.outliner),
            Stage::Drafting => Some(&self.drafter),
            Stage::Extraction => Some(&self.extractor),
            Stage::Assembly => None,
        }
    }
}

/// Everything `generate` needs besides the prompt.
#[derive(Clone, Debug)]
pub struct GenerationOptions {
    pub chapters: usize,
    pub target_words: u32,
    pub models: StageParameters,
    pub max_attempts: u32,
    pub analysis_attempts: usize,
    pub outline_regenerations: usize,
    pub fact_cap: usize,
    pub candidates: usize,
    pub run_budget: Option<Duration>,
}

impl GenerationOptions {
    pub fn new(models: StageParameters) -> Self {
        Self::from_settings(&GenerationSettings::default(), models)
    }

    pub fn from_settings(settings: &GenerationSettings, models: StageParameters) -> Self {
        Self {
            chapters: usize::try_from(settings.chapters.max(1)).unwrap_or(1),
            target_words: settings.target_words.max(1),
            models,
            max_attempts: settings.effective_max_attempts(),
            analysis_attempts: usize::try_from(settings.analysis_retries.max(1)).unwrap_or(1),
            outline_regenerations: usize::try_from(settings.outline_regenerations.max(1)).unwrap_or(1),
            fact_cap: settings.fact_cap.max(1),
            candidates: usize::try_from(settings.candidates.max(1)).unwrap_or(1),
            run_budget: settings.run_budget(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::from_settings(
            &config.generation,
            StageParameters::from_config(config)?,
        ))
    }

    pub fn with_chapters(mut self, chapters: usize) -> Self {
        self.chapters = chapters.max(1);
        self
    }

    pub fn with_target_words(mut self, target_words: u32) -> Self {
        self.target_words = target_words.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    pub fn with_run_budget(mut self, budget: Option<Duration>) -> Self {
        self.run_budget = budget;
        self
    }
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("invalid prompt: {0}")]
    InvalidPrompt(#[source] PromptValidation),
    #[error("analysis failed: {0}")]
    AnalysisFailed(#[source] AnalysisError),
    #[error("outline failed: {0}")]
    OutlineFailed(#[source] OutlineError),
    #[error("drafting failed for chapter {chapter}: {source}")]
    DraftingFailed {
        chapter: usize,
        #[source]
        source: DraftingError,
    },
    #[error("{0}")]
    EmptyManuscript(#[source] AssemblyError),
}

/// A fatal run failure, naming the stage it happened in.
#[derive(Debug, Error)]
#[error("{stage} failed: {cause}")]
pub struct GenerationFailure {
    pub stage: Stage,
    #[source]
    pub cause: FailureCause,
}

impl GenerationFailure {
    fn new(stage: Stage, cause: FailureCause) -> Self {
        Self { stage, cause }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Manuscript),
    /// Stopped by the cancel token or the run budget. `partial` holds the
    /// chapters accepted before the stop, when there were any.
    Cancelled {
        reason: CancelReason,
        partial: Option<Manuscript>,
    },
}

impl RunOutcome {
    pub fn manuscript(&self) -> Option<&Manuscript> {
        match self {
            Self::Completed(manuscript) => Some(manuscript),
            Self::Cancelled { partial, .. } => partial.as_ref(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// State of one run. Owned by the run and dropped with it.
pub struct RunContext {
    pub run_id: Uuid,
    pub prompt: Prompt,
    pub started_at: DateTime<Utc>,
    pub bible: Option<StoryBible>,
    pub outline: Option<Outline>,
    pub tracker: ConsistencyTracker,
    pub chapters: Vec<AcceptedChapter>,
    pub warnings: Vec<String>,
}

impl RunContext {
    pub fn new(prompt: Prompt, fact_cap: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            prompt,
            started_at: Utc::now(),
            bible: None,
            outline: None,
            tracker: ConsistencyTracker::new(fact_cap),
            chapters: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn manuscript_title(&self) -> String {
        self.bible
            .as_ref()
            .and_then(StoryBible::title)
            .map(str::to_string)
            .or_else(|| {
                self.outline
                    .as_ref()
                    .and_then(|outline| outline.get(0))
                    .map(|node| node.title.clone())
            })
            .unwrap_or_else(|| "Untitled".to_string())
    }

    fn assemble(&self) -> Result<Manuscript, AssemblyError> {
        let header = ManuscriptHeader::new(self.manuscript_title(), self.prompt.as_str());
        assemble(header, &self.chapters, &self.warnings)
    }
}

enum Interrupted {
    Finished(Result<Manuscript, GenerationFailure>),
    Stopped(CancelReason),
}

/// Runs the pipeline for one prompt: analysis, outline, then each chapter in
/// order, then assembly.
pub struct Orchestrator<'a> {
    gateway: &'a ModelGateway,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    reviewer: QualityReviewer,
    store: Option<&'a dyn RunStore>,
    run_log: Option<&'a RunLog>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(gateway: &'a ModelGateway, prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            gateway,
            prompts,
            sink,
            reviewer: QualityReviewer::default(),
            store: None,
            run_log: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: QualityReviewer) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_store(mut self, store: &'a dyn RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_run_log(mut self, run_log: &'a RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, GenerationFailure> {
        let prompt = match Prompt::new(prompt) {
            Ok(prompt) => prompt,
            Err(err) => {
                self.log(LogLevel::Error, format!("prompt rejected: {err}"));
                return Err(GenerationFailure::new(
                    Stage::Analysis,
                    FailureCause::InvalidPrompt(err),
                ));
            }
        };
        let mut ctx = RunContext::new(prompt, options.fact_cap);
        self.log(
            LogLevel::Info,
            format!(
                "run {} started: {} chapters, {} words",
                ctx.run_id, options.chapters, options.target_words
            ),
        );

        let interrupted = {
            let run = self.run(&mut ctx, options);
            tokio::pin!(run);
            tokio::select! {
                biased;
                reason = interruption(cancel, options.run_budget) => Interrupted::Stopped(reason),
                result = &mut run => Interrupted::Finished(result),
            }
        };

        match interrupted {
            Interrupted::Finished(Ok(manuscript)) => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "run {} completed: {} chapters, {} warning(s)",
                        ctx.run_id,
                        manuscript.len(),
                        manuscript.warnings().len()
                    ),
                );
                self.save_story(&manuscript);
                self.remember(&ctx, RunStatus::Completed, Some(&manuscript), None);
                Ok(RunOutcome::Completed(manuscript))
            }
            Interrupted::Finished(Err(failure)) => {
                self.log(LogLevel::Error, format!("run {} failed: {failure}", ctx.run_id));
                self.remember(&ctx, RunStatus::Failed, None, Some(failure.to_string()));
                Err(failure)
            }
            Interrupted::Stopped(reason) => {
                ctx.warnings.push(format!("run stopped early: {reason}"));
                let partial = ctx.assemble().ok();
                self.log(
                    LogLevel::Warn,
                    format!(
                        "run {} cancelled ({reason}); {} chapter(s) kept",
                        ctx.run_id,
                        ctx.chapters.len()
                    ),
                );
                if let Some(manuscript) = &partial {
                    self.save_story(manuscript);
                }
                self.remember(&ctx, RunStatus::Cancelled, partial.as_ref(), None);
                Ok(RunOutcome::Cancelled { reason, partial })
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RunContext,
        options: &GenerationOptions,
    ) -> Result<Manuscript, GenerationFailure> {
        let models = &options.models;

        self.log(LogLevel::Info, format!("stage: {}", Stage::Analysis));
        let bible = StoryAnalyzer::new(self.prompts, self.sink)
            .with_max_attempts(options.analysis_attempts)
            .analyze(self.gateway, &models.analyzer, &ctx.prompt)
            .await
            .map_err(|err| GenerationFailure::new(Stage::Analysis, FailureCause::AnalysisFailed(err)))?;
        let bible = ctx.bible.insert(bible);

        self.log(LogLevel::Info, format!("stage: {}", Stage::Outline));
        let request = OutlineRequest {
            chapters: options.chapters,
            total_words: options.target_words,
        };
        let outline = OutlineGenerator::new(self.prompts, self.sink)
            .with_max_attempts(options.outline_regenerations)
            .generate(self.gateway, &models.outliner, bible, &request)
            .await
            .map_err(|err| GenerationFailure::new(Stage::Outline, FailureCause::OutlineFailed(err)))?;
        ctx.outline = Some(outline.clone());

        self.log(LogLevel::Info, format!("stage: {}", Stage::Drafting));
        let engine = DraftingEngine::new(self.prompts, self.sink)
            .with_reviewer(self.reviewer.clone())
            .with_max_attempts(options.max_attempts)
            .with_candidates(options.candidates);
        let drafting_models = DraftingModels {
            drafter: &models.drafter,
            extractor: &models.extractor,
        };

        for node in &outline {
            let chapter = node.number();
            let previous_excerpt = ctx
                .chapters
                .last()
                .map(|accepted| tail_chars(&accepted.text, PREVIOUS_EXCERPT_CHARS).to_string())
                .unwrap_or_default();
            let Some(bible) = ctx.bible.as_ref() else {
                break;
            };
            let chapter_ctx = ChapterContext {
                bible,
                node,
                chapter_count: outline.len(),
                tracker: &ctx.tracker,
                previous_excerpt: &previous_excerpt,
            };

            let result = engine
                .draft_chapter(self.gateway, drafting_models, &chapter_ctx)
                .await
                .map_err(|source| {
                    GenerationFailure::new(Stage::Drafting, FailureCause::DraftingFailed { chapter, source })
                })?;

            if result.disposition == Disposition::Abandoned {
                ctx.warnings.push(format!(
                    "chapter {chapter} (\"{}\") was abandoned after {} attempt(s); kept attempt {} with score {:.2}: {}",
                    node.title,
                    options.max_attempts,
                    result.draft.attempt_number,
                    result.draft.score,
                    result.draft.issues.join("; ")
                ));
            }

            if let Some(warning) = result.extraction_warning {
                ctx.warnings.push(warning);
            }

            match ctx.tracker.record(node.index, result.facts) {
                Ok(stored) => self.log(
                    LogLevel::Debug,
                    format!("chapter {chapter}: {stored} new fact(s) recorded"),
                ),
                Err(conflict) => {
                    for flagged in &conflict.conflicts {
                        self.log(
                            LogLevel::Warn,
                            format!("chapter {chapter}: consistency conflict kept as flagged: {flagged}"),
                        );
                        ctx.warnings
                            .push(format!("chapter {chapter}: consistency conflict: {flagged}"));
                    }
                }
            }

            if let Some(bible) = ctx.bible.as_mut() {
                let added = bible.amend(result.characters);
                if !added.is_empty() {
                    self.log(
                        LogLevel::Info,
                        format!("chapter {chapter}: story bible gained {}", added.join(", ")),
                    );
                }
            }

            self.log(
                LogLevel::Info,
                format!(
                    "chapter {chapter}/{} {} (attempt {}, score {:.2})",
                    outline.len(),
                    result.disposition,
                    result.draft.attempt_number,
                    result.draft.score
                ),
            );
            ctx.chapters.push(AcceptedChapter {
                index: node.index,
                title: node.title.clone(),
                text: result.draft.text,
                abandoned: result.disposition == Disposition::Abandoned,
            });
        }

        self.log(LogLevel::Info, format!("stage: {}", Stage::Assembly));
        ctx.assemble()
            .map_err(|err| GenerationFailure::new(Stage::Assembly, FailureCause::EmptyManuscript(err)))
    }

    fn save_story(&self, manuscript: &Manuscript) {
        let Some(run_log) = self.run_log else {
            return;
        };
        match run_log.save_story(&manuscript.to_markdown()) {
            Ok(path) => self.log(LogLevel::Info, format!("story saved to {}", path.display())),
            Err(err) => self.log(LogLevel::Warn, format!("could not save the story: {err}")),
        }
    }

    fn remember(
        &self,
        ctx: &RunContext,
        status: RunStatus,
        manuscript: Option<&Manuscript>,
        failure: Option<String>,
    ) {
        let Some(store) = self.store else {
            return;
        };
        let entry = RunRecord {
            run_id: ctx.run_id,
            prompt: ctx.prompt.as_str().to_string(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            status,
            manuscript_id: manuscript.map(Manuscript::id),
            chapters: ctx.chapters.len(),
            warnings: ctx.warnings.clone(),
            failure,
        };
        if let Err(err) = store.record(&entry) {
            self.log(
                LogLevel::Warn,
                format!("run {} could not be written to history: {err}", ctx.run_id),
            );
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

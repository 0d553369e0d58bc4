pub mod assembler;
pub mod bible;
pub mod cancel;
pub mod config;
pub mod drafting;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod outline;
pub mod prompts;
pub mod review;
pub mod run_log;
pub mod stage;
pub mod text;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use assembler::{
    assemble, AcceptedChapter, AssemblyError, ExportMetadata, ExportRecord, Manuscript,
    ManuscriptChapter, ManuscriptHeader,
};
pub use bible::{
    AnalysisError, Character, Prompt, PromptValidation, StoryAnalyzer, StoryBible,
    MAX_PROMPT_CHARS,
};
pub use cancel::{CancelReason, CancelToken};
pub use config::{
    Config, ConfigError, ConfigStore, GenerationSettings, LlmConfig, ModelSpec, ModelSpecError,
    PromptConfig, Provider, RecentUsage, StageModels,
};
pub use drafting::{
    parse_extraction, ChapterContext, ChapterDraft, ChapterResult, Disposition, DraftState,
    DraftingEngine, DraftingError, DraftingModels, Extraction, FactExtractor,
};
pub use gateway::{LanguageModel, ModelError, ModelGateway, ModelParameters, RetryPolicy};
pub use logging::{
    FacadeLogSink, FileLogSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink,
    StdoutLogSink, TeeLogSink, VecLogSink,
};
pub use orchestrator::{
    FailureCause, GenerationFailure, GenerationOptions, MemoryRunStore, Orchestrator, RunContext,
    RunOutcome, RunRecord, RunStatus, RunStore, RunStoreError, StageParameters,
};
pub use outline::{Outline, OutlineError, OutlineGenerator, OutlineNode, OutlineRequest};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use review::{QualityReviewer, Review, ReviewDecision, ReviewPolicy};
pub use run_log::{RunLog, RunLogError};
pub use stage::Stage;
pub use tracker::{
    ConsistencyConflict, ConsistencyFact, ConsistencyTracker, FactConflict, ObservedFact,
};

use clap::{Args, Parser, Subcommand};
use storyforge_adapters::{build_gateway, create_backend, AdapterError, JsonlRunStore};
use storyforge_core::gateway::DEFAULT_MAX_TOKENS;
use storyforge_core::prompts::keys;
use storyforge_core::{
    CancelToken, ConfigError, ConfigStore, FacadeLogSink, GenerationFailure, GenerationOptions,
    LogLevel, LogRecord, LogSink, Manuscript, ModelError, ModelGateway, ModelParameters,
    ModelSpec, Orchestrator, PromptError, PromptRegistry, RetryPolicy, RunLog, RunOutcome,
    RunStore, SharedLogSink, Stage, TeeLogSink,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const EXIT_CANCELLED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    let sink = FacadeLogSink::new();

    match cli.command {
        Command::Generate(args) => run_generate(&cli.config, args, &sink).await,
        Command::Config(ConfigCommand::TestLlm(args)) => {
            run_test_llm(&cli.config, args, &sink).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(ConfigCommand::Show) => {
            run_show_config(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_generate(
    config_path: &Path,
    args: GenerateArgs,
    console: &FacadeLogSink,
) -> Result<ExitCode, CliError> {
    let prompt = read_prompt(&args)?;

    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    apply_overrides(&mut store, &args);
    let config = store.config();

    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let options = GenerationOptions::from_config(config)?;
    let mut gateway = build_gateway(config)?;

    let run_log = open_run_log(&config.generation.log_dir, console);
    let sink: SharedLogSink = match &run_log {
        Some(run_log) => {
            gateway = gateway.with_transcript(Arc::clone(run_log));
            let file: SharedLogSink = run_log.clone();
            Arc::new(TeeLogSink::new(vec![Arc::new(console.clone()), file]))
        }
        None => Arc::new(console.clone()),
    };

    for stage in Stage::MODEL_STAGES {
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("{}: {}", stage.config_key(), config.stages.for_stage(stage)),
        ));
    }

    let history = args.history.as_ref().map(JsonlRunStore::new);
    let mut orchestrator = Orchestrator::new(&gateway, &prompts, sink.as_ref());
    if let Some(history) = history.as_ref() {
        orchestrator = orchestrator.with_store(history as &dyn RunStore);
    }
    if let Some(run_log) = run_log.as_deref() {
        orchestrator = orchestrator.with_run_log(run_log);
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt_sink = Arc::clone(&sink);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt_sink.log(LogRecord::new(
                LogLevel::Warn,
                "interrupt received; stopping after the current call",
            ));
            on_interrupt.cancel();
        }
    });

    let output = args.output.unwrap_or_else(|| PathBuf::from("Story.md"));
    match orchestrator.generate(&prompt, &options, &cancel).await? {
        RunOutcome::Completed(manuscript) => {
            write_manuscript(&output, &manuscript)?;
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!(
                    "wrote {} chapter(s) to {}",
                    manuscript.len(),
                    output.display()
                ),
            ));
            for warning in manuscript.warnings() {
                sink.log(LogRecord::new(LogLevel::Warn, warning.clone()));
            }
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Cancelled { reason, partial } => {
            match partial {
                Some(manuscript) => {
                    write_manuscript(&output, &manuscript)?;
                    sink.log(LogRecord::new(
                        LogLevel::Warn,
                        format!(
                            "{reason}; wrote {} finished chapter(s) to {}",
                            manuscript.len(),
                            output.display()
                        ),
                    ));
                }
                None => sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!("{reason}; no chapter was finished"),
                )),
            }
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
    }
}

fn read_prompt(args: &GenerateArgs) -> Result<String, CliError> {
    match (&args.prompt, &args.prompt_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.clone(),
            source,
        }),
        (None, None) => Err(CliError::MissingPrompt),
    }
}

fn apply_overrides(store: &mut ConfigStore, args: &GenerateArgs) {
    let config = store.config_mut();
    if let Some(model) = normalize_preference(args.model.clone()) {
        config.stages.default = model;
    }
    let per_stage = [
        (Stage::Analysis, &args.analyzer_model),
        (Stage::Outline, &args.outline_model),
        (Stage::Drafting, &args.chapter_model),
        (Stage::Extraction, &args.extractor_model),
    ];
    for (stage, selection) in per_stage {
        if let Some(selection) = normalize_preference(selection.clone()) {
            config.stages.set(stage, selection);
        }
    }

    let generation = &mut config.generation;
    if let Some(chapters) = args.chapters {
        generation.chapters = chapters;
    }
    if let Some(words) = args.words {
        generation.target_words = words;
    }
    if let Some(candidates) = args.candidates {
        generation.candidates = candidates;
    }
    if let Some(budget) = args.budget_secs {
        generation.run_budget_secs = Some(budget);
    }
    if args.no_revision {
        generation.revision = false;
    }
    if let Some(log_dir) = args.log_dir.as_ref() {
        generation.log_dir = log_dir.display().to_string();
    }
}

fn open_run_log(log_dir: &str, console: &FacadeLogSink) -> Option<Arc<RunLog>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return None;
    }
    match RunLog::create(log_dir) {
        Ok(run_log) => {
            console.log(LogRecord::new(
                LogLevel::Info,
                format!("run log directory: {}", run_log.dir().display()),
            ));
            Some(Arc::new(run_log))
        }
        Err(err) => {
            console.log(LogRecord::new(
                LogLevel::Warn,
                format!("continuing without a run log: {err}"),
            ));
            None
        }
    }
}

fn write_manuscript(path: &Path, manuscript: &Manuscript) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CliError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, manuscript.to_markdown()).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn run_test_llm(
    config_path: &Path,
    args: TestLlmArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    let selected = select_llm_interface(&store, args.interface)?;
    let config = store.config();

    let params = match config.get_llm_profile(&selected) {
        Some(profile) => {
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!(
                    "model: {} | interface: {} | base URL: {}",
                    profile.model_name, profile.interface_format, profile.base_url
                ),
            ));
            ModelParameters::new(selected.as_str(), profile.max_tokens, profile.temperature)
        }
        None => ModelParameters::new(selected.as_str(), DEFAULT_MAX_TOKENS, 0.0),
    };

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("testing model selection `{selected}`"),
    ));

    let retries = usize::try_from(config.generation.gateway_retries).unwrap_or(usize::MAX);
    let gateway = ModelGateway::new(create_backend(config, &selected)?)
        .with_retry_policy(RetryPolicy::default().with_max_retries(retries))
        .with_call_timeout(config.generation.call_timeout());
    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let probe = prompts.format_with(keys::CONNECTION_PROBE, std::iter::empty::<(&str, &str)>())?;

    match gateway.complete(&probe, &params).await {
        Ok(response) if response.trim().is_empty() => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                "connection test failed: empty response",
            ));
            return Err(CliError::TestFailed(
                "connection test failed: empty response".to_string(),
            ));
        }
        Ok(response) => {
            sink.log(LogRecord::new(LogLevel::Info, "connection test succeeded"));
            sink.log(LogRecord::new(LogLevel::Debug, format!("reply: {response}")));
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("connection test failed: {err}"),
            ));
            return Err(CliError::Model(err));
        }
    }

    if config.llm_profiles.contains_key(&selected) {
        store.touch_llm_interface(selected);
        store.save()?;
    }
    Ok(())
}

fn run_show_config(config_path: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let config = store.config();

    println!("config: {}", store.path().display());
    for stage in Stage::MODEL_STAGES {
        let selection = config.stages.for_stage(stage);
        let params = config.stage_parameters(stage)?;
        let kind = if config.get_llm_profile(selection).is_some() {
            "profile"
        } else {
            "model spec"
        };
        println!(
            "{:<10} {selection} ({kind}, max_tokens={}, temperature={})",
            stage.config_key(),
            params.max_tokens,
            params.temperature
        );
    }

    let generation = &config.generation;
    println!(
        "chapters={} target_words={} max_attempts={} candidates={} call_timeout={}s",
        generation.chapters,
        generation.target_words,
        generation.effective_max_attempts(),
        generation.candidates,
        generation.call_timeout().as_secs()
    );
    if let Some(budget) = generation.run_budget() {
        println!("run budget: {}s", budget.as_secs());
    }
    Ok(())
}

/// A profile name or model spec from the command line, else the last
/// profile used, else the first profile, else the default stage model.
fn select_llm_interface(
    store: &ConfigStore,
    preferred: Option<String>,
) -> Result<String, CliError> {
    if let Some(name) = normalize_preference(preferred) {
        if store.config().llm_profiles.contains_key(&name) {
            return Ok(name);
        }
        return match ModelSpec::parse(&name) {
            Ok(_) => Ok(name),
            Err(_) => Err(CliError::UnknownInterface(name)),
        };
    }

    if let Some(name) = store.last_llm_interface() {
        return Ok(name.to_string());
    }

    if let Some(name) = store.config().llm_profiles.keys().next() {
        return Ok(name.clone());
    }

    normalize_preference(Some(store.config().stages.default.clone()))
        .ok_or(CliError::MissingLlmProfile)
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("no model is configured; add an llm profile or set stages.default")]
    MissingLlmProfile,
    #[error("`{0}` is neither a configured profile nor a valid model spec")]
    UnknownInterface(String),
    #[error("pass --prompt or --prompt-file")]
    MissingPrompt,
    #[error("failed to access `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("backend setup failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
    #[error("failed to load prompts: {0}")]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Generation(#[from] GenerationFailure),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(
    name = "storyforge",
    version,
    about = "Generate a multi-chapter novel from a short prompt"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a manuscript from a prompt
    Generate(GenerateArgs),
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Send a one-line probe to a model and report the result
    TestLlm(TestLlmArgs),
    /// Print the model each stage resolves to
    Show,
}

#[derive(Args)]
struct TestLlmArgs {
    /// Profile name or model spec to test; defaults to the last profile used
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Story prompt text
    #[arg(long, value_name = "TEXT", conflicts_with = "prompt_file")]
    prompt: Option<String>,
    /// File containing the story prompt
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,
    /// Number of chapters to aim for
    #[arg(long, value_name = "N")]
    chapters: Option<u32>,
    /// Total target length in words
    #[arg(long, value_name = "WORDS")]
    words: Option<u32>,
    /// Default model for every stage (profile name or provider:model)
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,
    /// Model for prompt analysis
    #[arg(long, value_name = "MODEL")]
    analyzer_model: Option<String>,
    /// Model for outline generation
    #[arg(long, value_name = "MODEL")]
    outline_model: Option<String>,
    /// Model for chapter drafting
    #[arg(long, value_name = "MODEL")]
    chapter_model: Option<String>,
    /// Model for fact extraction
    #[arg(long, value_name = "MODEL")]
    extractor_model: Option<String>,
    /// Accept or abandon the first draft of every chapter
    #[arg(long)]
    no_revision: bool,
    /// Drafts generated concurrently per attempt
    #[arg(long, value_name = "K")]
    candidates: Option<u32>,
    /// Wall-clock budget for the whole run
    #[arg(long, value_name = "SECS")]
    budget_secs: Option<u64>,
    /// Where to write the Markdown manuscript
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Root directory for per-run logs and transcripts
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// JSON-lines file that receives one record per run
    #[arg(long, value_name = "FILE")]
    history: Option<PathBuf>,
}

//! CLI command definitions for sqlforge.
//!
//! `ask` runs one question through the pipeline, `predict` and `evaluate`
//! work on whole datasets, and `badcases` inspects the failure log written
//! by failed runs.

use crate::evaluation::{
    evaluate, load_dataset, load_predictions, predict_all, write_predictions, write_report,
    EvaluationReport,
};
use crate::failure::{load_failure_log, FailureLogEntry, DEFAULT_FAILURE_LOG};
use crate::llm::LiteLlmClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{Nl2SqlService, PipelineConfig, QueryRequest, QueryResponse};
use crate::schema::SchemaCatalog;
use clap::{Args, Parser};
use std::sync::Arc;
use tracing::{info, warn};

/// Default Spider-style schema file.
const DEFAULT_SCHEMA_FILE: &str = "data/spider/tables.json";

/// Default predictions file written by `predict`.
const DEFAULT_PREDICTIONS_FILE: &str = "predictions.sql";

/// Mismatched questions listed by `evaluate` in text mode.
const MISMATCH_PREVIEW: usize = 5;

/// Default number of failure records shown by `badcases`.
const DEFAULT_BADCASE_LIMIT: usize = 10;

/// Characters of an error message shown per failure record.
const MESSAGE_PREVIEW_CHARS: usize = 200;

/// Natural-language to SQL pipeline.
#[derive(Parser)]
#[command(name = "sqlforge")]
#[command(about = "Translate natural-language questions into SQL with a staged LLM conversation")]
#[command(version)]
#[command(
    long_about = "sqlforge answers questions about a database by running analysis, generation, execution and refinement stages until the SQL is done.\n\nFailed runs are appended to a JSON Lines failure log that `sqlforge badcases` can summarize.\n\nExample usage:\n  sqlforge ask --db-id concert_singer --question \"How many singers do we have?\" --db-root ./data/spider/database\n  sqlforge predict --dataset data/spider/dev.json -o predictions.sql\n  sqlforge evaluate --dataset data/spider/dev.json --predictions predictions.sql"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Answer one question against one database.
    Ask(AskArgs),

    /// Predict SQL for every question of a dataset.
    Predict(PredictArgs),

    /// Score a predictions file against a dataset's gold queries.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Show recent failed runs from the failure log.
    #[command(alias = "failures")]
    Badcases(BadcasesArgs),
}

/// Pipeline options shared by `ask` and `predict`.
#[derive(Args, Debug)]
pub struct PipelineArgs {
    /// Spider-style schema file (tables.json).
    #[arg(short = 's', long, default_value = DEFAULT_SCHEMA_FILE)]
    pub schema_file: String,

    /// Directory holding `<db_id>/<db_id>.sqlite` files. Enables SQL execution.
    #[arg(long, env = "SQLFORGE_DB_ROOT")]
    pub db_root: Option<String>,

    /// Maximum stage invocations (overrides SQLFORGE_MAX_ROUNDS).
    #[arg(long)]
    pub max_rounds: Option<usize>,

    /// Do not execute generated SQL.
    #[arg(long)]
    pub no_execute: bool,

    /// LLM model identifier (overrides SQLFORGE_MODEL).
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// OpenRouter API key (can also be set via OPENROUTER_API_KEY env var).
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Failure log path (overrides SQLFORGE_FAILURE_LOG).
    #[arg(long)]
    pub failure_log: Option<String>,
}

/// Arguments for `sqlforge ask`.
#[derive(Parser, Debug)]
pub struct AskArgs {
    /// Database identifier within the schema file.
    #[arg(short = 'd', long)]
    pub db_id: String,

    /// The question to answer.
    #[arg(short = 'q', long)]
    pub question: String,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Add a natural-language answer after successful execution.
    #[arg(long)]
    pub answer: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sqlforge predict`.
#[derive(Parser, Debug)]
pub struct PredictArgs {
    /// Dataset file: a JSON array of {question_id?, db_id, question} objects.
    #[arg(long)]
    pub dataset: String,

    /// Predictions file to write (tab-separated qid, SQL, db_id).
    #[arg(short = 'o', long, default_value = DEFAULT_PREDICTIONS_FILE)]
    pub output: String,

    /// Only predict the first N questions.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Arguments for `sqlforge evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Dataset file with gold `query` fields.
    #[arg(long)]
    pub dataset: String,

    /// Predictions file written by `sqlforge predict`.
    #[arg(short = 'p', long, default_value = DEFAULT_PREDICTIONS_FILE)]
    pub predictions: String,

    /// Write the full per-question report to this JSON file.
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sqlforge badcases`.
#[derive(Parser, Debug)]
pub struct BadcasesArgs {
    /// Failure log to read.
    #[arg(short = 'f', long, default_value = DEFAULT_FAILURE_LOG)]
    pub file: String,

    /// Number of most recent records to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_BADCASE_LIMIT)]
    pub limit: usize,

    /// Print the distribution of error kinds, failed steps, subjects and messages.
    #[arg(short = 'a', long)]
    pub analyze: bool,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the sqlforge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Ask(args) => run_ask_command(args).await,
        Commands::Predict(args) => run_predict_command(args).await,
        Commands::Evaluate(args) => run_evaluate_command(args).await,
        Commands::Badcases(args) => run_badcases_command(args).await,
    }
}

// ============================================================================
// Ask Command Implementation
// ============================================================================

/// Builds the pipeline configuration from the environment and `args`.
fn build_config(args: &PipelineArgs, answer: bool) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;

    if let Some(root) = &args.db_root {
        config = config.with_db_root(root);
    }
    if let Some(max_rounds) = args.max_rounds {
        config = config.with_max_rounds(max_rounds);
    }
    if let Some(model) = &args.model {
        config = config.with_model(model);
    }
    if let Some(path) = &args.failure_log {
        config = config.with_failure_log_path(path);
    }
    if args.no_execute {
        config = config.with_sql_execution(false);
    }
    if answer {
        config = config.with_answer_mode(true);
    }

    config.validate()?;
    Ok(config)
}

async fn run_ask_command(args: AskArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    let service = build_service(&args.pipeline, args.answer).await?;
    let config = service.config();
    if config.answer_mode && !config.executes_sql() {
        warn!("Answer mode needs SQL execution; no answer will be produced");
    }

    info!(
        db_id = %args.db_id,
        model = %config.model,
        execute = config.executes_sql(),
        "Running question"
    );

    let request = QueryRequest::new(&args.db_id, &args.question);
    let result = service.execute(request).await;

    if args.metrics {
        eprintln!("{}", export_metrics());
    }

    match result {
        Ok(response) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
            Ok(())
        }
        Err(failure) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&failure)?);
            }
            Err(anyhow::anyhow!(
                "{} (details in {})",
                failure,
                service.config().failure_log_path.display()
            ))
        }
    }
}

/// Loads the schema catalog and LLM client and assembles the service.
async fn build_service(args: &PipelineArgs, answer: bool) -> anyhow::Result<Nl2SqlService> {
    let config = build_config(args, answer)?;
    let catalog = SchemaCatalog::load(&args.schema_file).await.map_err(|e| {
        anyhow::anyhow!("Failed to load schema file {}: {}", args.schema_file, e)
    })?;
    let provider = build_llm_client(args.api_key.clone())?;
    Ok(Nl2SqlService::new(config, Arc::new(catalog), provider)?)
}

fn print_response(response: &QueryResponse) {
    println!("✓ Completed in {} round(s)", response.rounds);
    println!("  Task: {}", response.task_id);
    match &response.sql {
        Some(sql) => println!("  SQL:  {}", sql),
        None => println!("  SQL:  (none extracted)"),
    }
    if let Some(answer) = &response.answer {
        println!("  Answer: {}", answer);
    }
    println!();
    for step in &response.trace.steps {
        println!(
            "  {:<14} {:<10} {:>7}",
            step.name,
            step.status.as_str(),
            step.duration_secs
                .map(|d| format!("{:.2}s", d))
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn build_llm_client(api_key: Option<String>) -> anyhow::Result<Arc<dyn crate::llm::LlmProvider>> {
    if let Some(key) = api_key {
        info!("Using OpenRouter with specified API key");
        return Ok(Arc::new(LiteLlmClient::new_with_defaults(key)));
    }

    info!("Using LiteLLM client from environment");
    Ok(Arc::new(LiteLlmClient::from_env_or_openrouter().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Please provide --api-key or set LITELLM_API_BASE/OPENROUTER_API_KEY env var.",
            e
        )
    })?))
}

// ============================================================================
// Predict / Evaluate Command Implementation
// ============================================================================

async fn run_predict_command(args: PredictArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    let items = load_dataset(&args.dataset, args.limit).await?;
    let service = build_service(&args.pipeline, false).await?;
    info!(
        dataset = %args.dataset,
        questions = items.len(),
        model = %service.config().model,
        "Predicting dataset"
    );

    let report = predict_all(&service, &items).await;
    write_predictions(&args.output, &report.predictions).await?;

    println!("Predicted {} question(s) from {}", report.total(), args.dataset);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed:    {}", report.failed);
    println!(
        "  Time:      {:.2}s ({:.2}s per question)",
        report.elapsed.as_secs_f64(),
        report.average().as_secs_f64()
    );
    println!("  Output:    {}", args.output);
    if report.failed > 0 {
        println!(
            "  Failure details in {}",
            service.config().failure_log_path.display()
        );
    }
    Ok(())
}

async fn run_evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let items = load_dataset(&args.dataset, None).await?;
    let predictions = load_predictions(&args.predictions).await?;
    if predictions.len() != items.len() {
        warn!(
            questions = items.len(),
            predictions = predictions.len(),
            "Prediction count differs from dataset size"
        );
    }

    let report = evaluate(&items, &predictions);
    if let Some(path) = &args.output {
        write_report(path, &report).await?;
        info!(path = %path, "Wrote evaluation report");
    }

    if args.json {
        let output = serde_json::json!({
            "total": report.total,
            "exactMatch": report.exact_match,
            "mismatched": report.mismatched,
            "missing": report.missing,
            "accuracy": report.accuracy,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_evaluation(&report);
    }
    Ok(())
}

fn print_evaluation(report: &EvaluationReport) {
    println!("=== Evaluation ===");
    println!("Total questions: {}", report.total);
    println!("Exact match:     {}", report.exact_match);
    println!("Mismatched:      {}", report.mismatched);
    println!("Missing:         {}", report.missing);
    println!("Accuracy:        {:.2}%", report.accuracy * 100.0);

    let mismatches: Vec<_> = report.mismatches().take(MISMATCH_PREVIEW).collect();
    if !mismatches.is_empty() {
        println!();
        println!("First mismatches:");
        for detail in mismatches {
            println!("  [{}] {}", detail.qid, preview(&detail.question));
            println!("    gold: {}", preview(&detail.gold));
            println!(
                "    pred: {}",
                preview(detail.predicted.as_deref().unwrap_or("-"))
            );
        }
    }
}

// ============================================================================
// Badcases Command Implementation
// ============================================================================

async fn run_badcases_command(args: BadcasesArgs) -> anyhow::Result<()> {
    let log = load_failure_log(&args.file).await?;
    let recent = log.recent(args.limit);

    if args.json {
        let output = serde_json::json!({
            "file": args.file,
            "total": log.entries.len(),
            "malformedLines": log.malformed_lines,
            "recent": recent,
            "summary": args.analyze.then(|| log.summary()),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if log.entries.is_empty() {
        println!("No failures recorded in {}.", args.file);
        return Ok(());
    }

    println!(
        "{} failure(s) in {}, showing the last {}",
        log.entries.len(),
        args.file,
        recent.len()
    );
    if log.malformed_lines > 0 {
        println!("  ({} malformed line(s) skipped)", log.malformed_lines);
    }

    for (i, entry) in recent.iter().enumerate() {
        println!();
        print!("{}", format_entry(i + 1, entry));
    }

    if args.analyze {
        let summary = log.summary();
        println!();
        println!("=== Failure Analysis ===");
        println!("Total failures: {}", summary.total);
        print_ranking("By error kind", &summary.by_error_kind);
        print_ranking("By failed step", &summary.by_failed_step);
        print_ranking("Top databases", &summary.top_subjects);
        print_ranking("Common messages", &summary.top_messages);
    }

    Ok(())
}

fn format_entry(position: usize, entry: &FailureLogEntry) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "#{} [{}] {}\n",
        position,
        entry.error_kind(),
        entry.timestamp.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "  Task:     {}\n",
        entry.task_id.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("  Database: {}\n", entry.subject()));
    out.push_str(&format!(
        "  Question: {}\n",
        entry.input_query.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "  Step:     {} ({})\n",
        entry.failed_step(),
        entry.failed_step_kind.as_deref().unwrap_or("unknown")
    ));
    out.push_str(&format!("  Error:    {}\n", preview(entry.message())));
    out
}

fn print_ranking(title: &str, ranking: &[(String, usize)]) {
    println!("{}:", title);
    for (key, count) in ranking {
        println!("  {:>5}  {}", count, key);
    }
}

fn preview(message: &str) -> String {
    let single_line = message.replace('\n', " ");
    match single_line.char_indices().nth(MESSAGE_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &single_line[..idx]),
        None => single_line,
    }
}

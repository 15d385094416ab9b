use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use matter_stress::analysis::{self, chart};
use matter_stress::record::{RunRecord, RunResult, RunSummary};

#[derive(Parser)]
#[command(
    name = "matter-stress",
    about = "Stress and reliability test harness for Matter devices",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stress test case against the configured DUT
    Run {
        /// Configuration file (TOML or JSON)
        #[arg(long)]
        config: PathBuf,

        /// Inline JSON merged over the configuration file
        #[arg(long = "override")]
        override_json: Option<String>,

        /// Test case class, selecting `test_case_config.<class>` overrides
        #[arg(long)]
        test_case: Option<String>,

        /// Continue the run recorded in this summary.json
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Print counts, verdict inputs and analytics means of a finished run
    Summarize {
        /// Path to summary.json
        summary: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Regenerate the analytics chart report
    Report {
        /// Path to summary.json
        summary: PathBuf,

        /// Output directory (defaults to the summary's folder)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Resolve a configuration and print it
    CheckConfig {
        #[arg(long)]
        config: PathBuf,

        #[arg(long = "override")]
        override_json: Option<String>,

        #[arg(long)]
        test_case: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            override_json,
            test_case,
            resume,
        } => {
            let config =
                matter_stress::config::load(&config, override_json.as_deref(), test_case.as_deref())?;
            let router = matter_stress::logging::init(&config.general.logging);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping after cleanup");
                    on_signal.cancel();
                }
            });

            let summary =
                matter_stress::run_stress_test(&config, resume.as_deref(), cancel, router).await?;
            print_summary(&summary);
            if summary.test_case_result != RunResult::Pass {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Summarize { summary, json } => {
            init_console_logging();
            let document = analysis::load_document(&summary)?;
            let means = analysis::mean_of_analytics(&document);
            let record = RunRecord::from_document(document)
                .with_context(|| format!("{} is not a valid run record", summary.display()))?;
            let mut summary = record.test_summary_record;
            summary.mean_of_analytics = means;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Report { summary, output } => {
            init_console_logging();
            let document = analysis::load_document(&summary)?;
            let output_dir = output
                .or_else(|| summary.parent().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            let path = chart::build_chart_report(&document, &output_dir)?;
            println!("Report written to {}", path.display());
        }
        Commands::CheckConfig {
            config,
            override_json,
            test_case,
        } => {
            init_console_logging();
            let config =
                matter_stress::config::load(&config, override_json.as_deref(), test_case.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Stress Test Summary ===");
    println!(
        "Test case:  {}",
        summary.test_case_name.as_deref().unwrap_or("-")
    );
    println!("Status:     {}", summary.test_case_status);
    println!("Result:     {}", summary.test_case_result);
    println!(
        "Iterations: {} of {} completed, {} passed, {} failed",
        summary.number_of_iterations_completed,
        summary.total_number_of_iterations,
        summary.number_of_iterations_passed,
        summary.number_of_iterations_failed
    );
    if let Some(pct) = summary.pass_percentage() {
        println!("Pass rate:  {pct:.1}%");
    }
    if !summary.list_of_iterations_failed.is_empty() {
        let failed: Vec<String> = summary
            .list_of_iterations_failed
            .iter()
            .map(u32::to_string)
            .collect();
        println!("Failed:     {}", failed.join(", "));
    }
    if !summary.mean_of_analytics.is_empty() {
        println!("\n{:<30} | Mean", "Analytics");
        println!("{:-<30}-|-{:-<12}", "", "");
        for (name, mean) in &summary.mean_of_analytics {
            println!("{name:<30} | {mean:.3}");
        }
    }
    println!("===========================\n");
}

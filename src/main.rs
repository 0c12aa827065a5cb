use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::BufReader;

use covflow::config::Config;
use covflow::coverage::{Package, ThresholdCheck};
use covflow::{logging, run_pipeline, CancellationToken, PackageReceiver, PipelineOptions, Summary};

#[derive(Parser)]
#[command(name = "covflow")]
#[command(about = "Stream per-package coverage out of Cobertura XML reports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: covflow.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every package of a report as it is extracted
    Extract {
        /// Cobertura XML report
        report: PathBuf,

        /// Print one JSON object per package, then a summary object
        #[arg(long)]
        json: bool,

        /// List uncovered line numbers for every file
        #[arg(long)]
        show_lines: bool,

        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Fail if any file is below a minimum coverage percentage
    Check {
        /// Cobertura XML report
        report: PathBuf,

        /// Minimum percentage (overrides threshold.min_percent)
        #[arg(long)]
        min: Option<u8>,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::discover(cli.config.as_deref())?;
    logging::init(&config.log);

    match cli.command {
        Commands::Extract {
            report,
            json,
            show_lines,
            timeout,
        } => {
            let mut options = PipelineOptions::from(&config.extract);
            if let Some(secs) = timeout {
                options.timeout = Some(Duration::from_secs(secs));
            }
            cmd_extract(&report, options, json, show_lines)
        }
        Commands::Check { report, min } => {
            let min_percent = min.or(config.threshold.min_percent).context(
                "No minimum given. Use --min or set threshold.min_percent in covflow.toml",
            )?;
            if min_percent > 100 {
                anyhow::bail!("--min must be between 0 and 100, got {}", min_percent);
            }
            cmd_check(&report, PipelineOptions::from(&config.extract), min_percent)
        }
    }
}

async fn open_report(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Could not open report: {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Cancel the pipeline on Ctrl+C
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn cmd_extract(report: &Path, options: PipelineOptions, json: bool, show_lines: bool) -> Result<()> {
    let source = open_report(report).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    if !json {
        println!("\n{} {}\n", "📦".cyan(), report.display().to_string().bold());
    }

    let result = run_pipeline(source, options, cancel, move |packages| {
        print_packages(packages, json, show_lines)
    })
    .await;

    match result {
        Ok((stats, _)) => {
            if !json {
                println!(
                    "\n{} {} line(s) scanned",
                    "✓".green(),
                    stats.lines.to_string().bold()
                );
            }
            Ok(())
        }
        Err(e) => Err(e).context("Extraction stopped early; packages above are complete"),
    }
}

async fn print_packages(mut packages: PackageReceiver, json: bool, show_lines: bool) -> Result<Summary> {
    let mut summary = Summary::default();

    while let Some(package) = packages.recv().await {
        summary.record(&package);
        if json {
            println!("{}", serde_json::to_string(&package)?);
        } else {
            print_package(&package, show_lines);
        }
    }

    if json {
        println!("{}", summary.json_line());
    } else {
        summary.print();
    }
    Ok(summary)
}

fn print_package(package: &Package, show_lines: bool) {
    println!("  {} {}", "•".green(), package.path.cyan());

    if package.files.is_empty() {
        println!("    {}", "no files".dimmed());
    }

    for file in &package.files {
        let percent = format!("{:>3}%", file.percent);
        let percent = match file.percent {
            90..=100 => percent.green(),
            60..=89 => percent.yellow(),
            _ => percent.red(),
        };

        println!(
            "    {} {} {}",
            percent,
            file.file,
            format!("({} uncovered)", file.uncovered_lines.len()).dimmed()
        );

        if show_lines && !file.uncovered_lines.is_empty() {
            let lines: Vec<String> = file.uncovered_lines.iter().map(|n| n.to_string()).collect();
            println!("         {} {}", "lines:".dimmed(), lines.join(", "));
        }
    }
}

#[tokio::main]
async fn cmd_check(report: &Path, options: PipelineOptions, min_percent: u8) -> Result<()> {
    let source = open_report(report).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let (_, result) = run_pipeline(source, options, cancel, move |mut packages| async move {
        let mut check = ThresholdCheck::new(min_percent);
        while let Some(package) = packages.recv().await {
            check.record(&package);
        }
        Ok::<_, anyhow::Error>(check.finish())
    })
    .await?;

    println!("\n{} {}\n", "🎯".cyan(), "Coverage threshold".bold());
    result.print_summary();

    if !result.passed {
        std::process::exit(1);
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::fmt::format::FmtSpan;

use tfgate_policy::{Policy, Report, Status, RULES};
use tfgate_tfcompat as tfc;

const EXIT_POLICY_FAILED: u8 = 1;
const EXIT_LOAD_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about="tfgate — security baseline gate for Terraform/OpenTofu plans")]
struct Cli {
    /// Baseline file (YAML); the built-in baseline when omitted
    #[arg(short, long, global = true)]
    baseline: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t=Format::Text, global = true)]
    format: Format,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Runner { Auto, Terraform, Tofu }

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Format { Text, Json }

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Plan a project locally (no backend, no refresh) and check the plan
    Check {
        #[arg(short, long, default_value=".")]
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t=Runner::Auto)]
        runner: Runner,
        /// terraform/tofu binary to use instead of --runner
        #[arg(long)]
        tf_bin: Option<PathBuf>,
        /// Plan artifact written inside --dir
        #[arg(long, default_value=tfc::DEFAULT_PLAN_FILE)]
        plan_file: String,
    },
    /// Check an already rendered `show -json` plan ('-' reads stdin)
    Validate {
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// List the policies in evaluation order
    Policies,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().json().with_span_events(FmtSpan::CLOSE).with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_POLICY_FAILED),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "run aborted");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_LOAD_ERROR)
        }
    }
}

/// Ok(passed) once a report was produced; Err for load and config errors.
fn run(cli: Cli) -> Result<bool> {
    let policy = match &cli.baseline {
        Some(p) => Policy::from_file(p).context("load baseline")?,
        None => Policy::default(),
    };

    let doc = match cli.cmd {
        Cmd::Policies => {
            print_policies(&policy, cli.format)?;
            return Ok(true);
        }
        Cmd::Validate { plan } => tfc::read_plan_json(&plan)
            .with_context(|| format!("load plan {}", plan.display()))?,
        Cmd::Check { dir, runner, tf_bin, plan_file } => {
            let tool = match tf_bin {
                Some(p) => tfc::Tool::at(p),
                None => {
                    let r = match runner {
                        Runner::Terraform => Some(tfc::Runner::Terraform),
                        Runner::Tofu      => Some(tfc::Runner::Tofu),
                        Runner::Auto      => None
                    };
                    tfc::Tool::runner(tfc::pick_runner(r)?)
                }
            };
            tracing::info!(dir = %dir.display(), program = %tool.program().display(), "planning");
            tfc::load_plan(&tool, &dir, &plan_file)
                .with_context(|| format!("plan {}", dir.display()))?
        }
    };

    let report = policy.evaluate(&doc);
    print_report(&report, cli.format)?;
    Ok(report.passed)
}

fn print_report(report: &Report, format: Format) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if format == Format::Json {
        serde_json::to_writer_pretty(&mut out, report)?;
        writeln!(out)?;
        return Ok(());
    }
    for v in &report.verdicts {
        let tag = match v.status { Status::Pass => "PASS", Status::Fail => "FAIL", Status::Skipped => "SKIP" };
        let detail = v.diagnostic.as_deref().or(v.resource.as_deref()).unwrap_or("");
        writeln!(out, "{tag}  {:<26} {detail}", v.id.as_str())?;
    }
    let count = |s: Status| report.verdicts.iter().filter(|v| v.status == s).count();
    writeln!(out, "{} passed, {} failed, {} skipped",
        count(Status::Pass), count(Status::Fail), count(Status::Skipped))?;
    Ok(())
}

fn print_policies(policy: &Policy, format: Format) -> Result<()> {
    let skip = &policy.baseline().skip;
    let mut out = std::io::stdout().lock();
    if format == Format::Json {
        let rows: Vec<_> = RULES.iter().map(|r| json!({
            "id": r.id,
            "title": r.title,
            "resource_type": r.subject,
            "skipped": skip.contains(&r.id),
        })).collect();
        serde_json::to_writer_pretty(&mut out, &rows)?;
        writeln!(out)?;
        return Ok(());
    }
    for r in RULES.iter() {
        let note = if skip.contains(&r.id) { " (skipped)" } else { "" };
        writeln!(out, "{:<26} {:<52} {}{note}", r.id.as_str(), r.subject.type_name(), r.title)?;
    }
    Ok(())
}

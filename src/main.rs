use anyhow::Result;
use bug_agent::config::Settings;
use bug_agent::github::GitHubClient;
use bug_agent::logging::{self, LoggingConfig};
use bug_agent::orchestrator::{
    read_status, Capabilities, ConfirmationOutcome, CycleOutcome, Orchestrator,
};
use bug_agent::reporter::Reporter;
use bug_agent::state::StateStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "bug-agent",
    about = "Finds bugs in a web app with browser tests and an LLM, then proposes fixes",
    version
)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository to watch (overrides the config file)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for changes, run exploratory tests and report new bugs
    RunCycle,
    /// Generate, review and verify a fix for a confirmed issue
    HandleConfirmation {
        /// GitHub issue number of the confirmed report
        issue: u64,
    },
    /// Show the persisted agent state
    Status,
    /// List issues awaiting confirmation and confirmed issues
    Pending,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = logging::init(&LoggingConfig {
        verbose: args.verbose,
        ..LoggingConfig::default()
    }) {
        eprintln!("{:#}", err);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "command failed");
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(repo) = args.repo {
        settings.repo_path = repo;
    }

    match args.command {
        Command::RunCycle => {
            let caps = Capabilities::production(&settings)?;
            let mut orchestrator = Orchestrator::new(&settings, caps);
            match orchestrator.run_cycle().await? {
                CycleOutcome::NoChanges => println!("No relevant changes since the last scan."),
                CycleOutcome::AllPassed => println!("All exploratory tests passed."),
                CycleOutcome::Reported { bugs_reported } => {
                    println!("Reported {} bug(s).", bugs_reported)
                }
            }
        }
        Command::HandleConfirmation { issue } => {
            let caps = Capabilities::production(&settings)?;
            let mut orchestrator = Orchestrator::new(&settings, caps);
            match orchestrator.handle_confirmation(issue).await? {
                ConfirmationOutcome::ReportNotFound => {
                    println!("No bug report is tracked for issue #{}.", issue)
                }
                ConfirmationOutcome::NoFixGenerated => {
                    println!("No fix could be generated for issue #{}.", issue)
                }
                ConfirmationOutcome::RegressionFailed { failed_tests } => println!(
                    "Fix for issue #{} failed {} regression test(s) and was reverted.",
                    issue, failed_tests
                ),
                ConfirmationOutcome::PullRequestOpened { number, url } => {
                    println!("Opened pull request #{}: {}", number, url)
                }
            }
        }
        Command::Status => {
            let store = StateStore::new(settings.state_file());
            match read_status(&store) {
                Some(status) => {
                    println!("State:       {}", status.state);
                    println!("Reports:     {}", status.reports);
                    println!("Updated:     {}", status.updated_at.to_rfc3339());
                    if !status.open_issues.is_empty() {
                        let issues: Vec<String> =
                            status.open_issues.iter().map(|n| format!("#{}", n)).collect();
                        println!("Open issues: {}", issues.join(", "));
                    }
                }
                None => println!("No state recorded yet ({}).", store.path().display()),
            }
        }
        Command::Pending => {
            let reporter = Reporter::new(&settings, Arc::new(GitHubClient::from_settings(&settings)?));
            print_issues("Awaiting confirmation", &reporter.pending_confirmations().await?);
            print_issues("Confirmed", &reporter.confirmed_bugs().await?);
        }
    }

    Ok(())
}

fn print_issues(heading: &str, issues: &[u64]) {
    if issues.is_empty() {
        println!("{}: none", heading);
    } else {
        let issues: Vec<String> = issues.iter().map(|n| format!("#{}", n)).collect();
        println!("{}: {}", heading, issues.join(", "));
    }
}

//! `agency` command-line entry point.
//!
//! `run` creates a worktree, runs the repo's setup script and starts the
//! runner in tmux. `ls` and `show` read runs back from the data directory.

use std::path::PathBuf;
use std::process::{Command as Process, ExitStatus};

use agency::dirs::Dirs;
use agency::errors::{AgencyError, ErrorCode, err};
use agency::exit_codes;
use agency::io::fs::OsFs;
use agency::io::process::OsRunner;
use agency::io::tmux::Tmux;
use agency::logging;
use agency::pipeline::{Pipeline, RunFailure, RunSummary};
use agency::runs::{RunView, Runs};
use agency::service::{RunOptions, RunService};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "agency",
    version,
    about = "Local-first orchestrator for AI coding agent runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a worktree, run setup and start the runner in tmux.
    Run {
        /// Human title; also seeds the branch name.
        #[arg(short, long)]
        title: Option<String>,
        /// Runner name (overrides `defaults.runner`).
        #[arg(long)]
        runner: Option<String>,
        /// Parent branch (overrides `defaults.parent_branch`).
        #[arg(long)]
        parent: Option<String>,
        /// Attach to the tmux session once it is running.
        #[arg(short, long)]
        attach: bool,
        /// Any path inside the target repository.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// List runs across all repos, newest first.
    Ls {
        #[arg(long)]
        json: bool,
    },
    /// Show one run by id or unique prefix.
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(e) => report_error(&e),
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let dirs = Dirs::from_env()?;
    match cli.command {
        Command::Run {
            title,
            runner,
            parent,
            attach,
            repo,
        } => cmd_run(
            &dirs,
            RunOptions {
                title,
                runner,
                parent,
                attach,
                repo_path: repo,
            },
        ),
        Command::Ls { json } => cmd_ls(&dirs, json),
        Command::Show { id, json } => cmd_show(&dirs, &id, json),
    }
}

fn cmd_run(dirs: &Dirs, opts: RunOptions) -> Result<i32> {
    let runner = OsRunner;
    let invocation: Vec<String> = std::env::args().collect();
    let service = RunService::new(&runner, &OsFs, dirs).with_lock_cmd(invocation.join(" "));
    match Pipeline::new(service).run(opts) {
        Ok(summary) => {
            print_summary(&summary);
            if summary.attach {
                attach(&runner, &summary.tmux_session)?;
            }
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            print_failure(&failure);
            Ok(exit_codes::for_error(failure.error.code()))
        }
    }
}

fn cmd_ls(dirs: &Dirs, json: bool) -> Result<i32> {
    let views = Runs::new(&OsFs, &OsRunner, dirs).list()?;
    if json {
        print_json(&views)?;
        return Ok(exit_codes::OK);
    }
    if views.is_empty() {
        println!("no runs");
        return Ok(exit_codes::OK);
    }
    println!("{:<20}  {:<24}  TITLE", "RUN", "STATUS");
    for view in &views {
        println!(
            "{:<20}  {:<24}  {}",
            view.run_id,
            view.status_label,
            view.title()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_show(dirs: &Dirs, id: &str, json: bool) -> Result<i32> {
    let view = Runs::new(&OsFs, &OsRunner, dirs).find(id)?;
    if json {
        print_json(&view)?;
    } else {
        print_view(&view);
    }
    Ok(exit_codes::OK)
}

fn attach(runner: &OsRunner, session: &str) -> Result<()> {
    if !Tmux::new(runner).has_session(session)? {
        return Err(err(
            ErrorCode::SessionMissing,
            format!("tmux session {session} is gone"),
        )
        .into());
    }
    let status: ExitStatus = Process::new("tmux")
        .args(["attach", "-t", &format!("={session}")])
        .status()
        .context("spawn tmux attach")?;
    if !status.success() {
        anyhow::bail!("tmux attach exited with {status}");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("run_id:   {}", summary.run_id);
    println!("title:    {}", summary.title);
    println!("branch:   {}", summary.branch);
    println!("worktree: {}", summary.worktree_path.display());
    println!("tmux:     {}", summary.tmux_session);
    if let Some(log) = &summary.setup_log {
        println!("setup:    {}", log.display());
    }
    print_warnings(&summary.warnings);
    if !summary.attach {
        println!("attach:   tmux attach -t ={}", summary.tmux_session);
    }
}

fn print_failure(failure: &RunFailure) {
    eprintln!("error_code: {}", failure.error.code());
    eprintln!("run_id: {}", failure.run_id);
    eprintln!("step: {}", failure.step);
    eprintln!("{}", failure.error.message());
    if let Some(cause) = failure.error.cause() {
        eprintln!("cause: {cause:#}");
    }
    if let Some(path) = &failure.worktree_path {
        eprintln!("worktree: {}", path.display());
    }
    if let Some(path) = &failure.log_path {
        eprintln!("log: {}", path.display());
    }
    print_warnings(&failure.warnings);
}

fn print_view(view: &RunView) {
    println!("run_id:   {}", view.run_id);
    println!("repo_id:  {}", view.repo_id);
    println!("status:   {}", view.status_label);
    println!("worktree: {}", view.worktree_path.display());
    println!("report:   {} bytes", view.report_bytes);
    if let Some(meta) = &view.meta {
        println!("title:    {}", meta.title);
        println!("runner:   {}", meta.runner);
        println!("branch:   {} (from {})", meta.branch, meta.parent_branch);
        println!("created:  {}", meta.created_at);
        if let Some(session) = &meta.tmux_session_name {
            let state = if view.tmux_active { "live" } else { "gone" };
            println!("tmux:     {session} ({state})");
        }
        if let Some(url) = &meta.pr_url {
            println!("pr:       {url}");
        }
    }
    if let Some(error) = &view.error {
        println!("error:    {error}");
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

/// Print `err` and pick the exit code: domain errors keep their code,
/// anything else is a generic failure.
fn report_error(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<AgencyError>() {
        Some(domain) => {
            eprintln!("error_code: {}", domain.code());
            eprintln!("{}", domain.message());
            exit_codes::for_error(domain.code())
        }
        None => {
            eprintln!("{e:#}");
            exit_codes::FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["agency", "run"]);
        match cli.command {
            Command::Run {
                title,
                runner,
                parent,
                attach,
                repo,
            } => {
                assert_eq!(title, None);
                assert_eq!(runner, None);
                assert_eq!(parent, None);
                assert!(!attach);
                assert_eq!(repo, PathBuf::from("."));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "agency", "run", "--title", "fix it", "--runner", "codex", "--parent", "dev", "-a",
        ]);
        assert!(matches!(
            cli.command,
            Command::Run { title: Some(ref t), runner: Some(ref r), parent: Some(ref p), attach: true, .. }
                if t == "fix it" && r == "codex" && p == "dev"
        ));
    }

    #[test]
    fn parse_ls_and_show() {
        let cli = Cli::parse_from(["agency", "ls", "--json"]);
        assert!(matches!(cli.command, Command::Ls { json: true }));

        let cli = Cli::parse_from(["agency", "show", "20260110"]);
        assert!(matches!(cli.command, Command::Show { ref id, json: false } if id == "20260110"));
    }

    #[test]
    fn domain_errors_keep_their_exit_code() {
        let e = anyhow::Error::from(AgencyError::new(ErrorCode::RunIdAmbiguous, "two runs"));
        assert_eq!(report_error(&e), exit_codes::AMBIGUOUS);
        assert_eq!(report_error(&anyhow::anyhow!("boom")), exit_codes::FAILED);
    }
}

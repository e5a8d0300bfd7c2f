//! Fixed-order run pipeline.
//!
//! `run` generates the run id before any step executes, so every outcome,
//! including a failure in the very first step, carries an id the user can look
//! up. Steps run in order and the first error stops the pipeline.

use std::path::PathBuf;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::naming::format_run_id;
use crate::errors::AgencyError;
use crate::service::{PipelineState, RunOptions, RunSteps};

type StepFn<S> = fn(&S, &mut PipelineState) -> anyhow::Result<()>;

/// Step names, in execution order.
pub const STEP_NAMES: [&str; 6] = [
    "check_repo_safe",
    "load_agency_config",
    "create_worktree",
    "write_meta",
    "run_setup",
    "start_tmux",
];

fn step_table<S: RunSteps>() -> [(&'static str, StepFn<S>); 6] {
    [
        (STEP_NAMES[0], S::check_repo_safe as StepFn<S>),
        (STEP_NAMES[1], S::load_agency_config as StepFn<S>),
        (STEP_NAMES[2], S::create_worktree as StepFn<S>),
        (STEP_NAMES[3], S::write_meta as StepFn<S>),
        (STEP_NAMES[4], S::run_setup as StepFn<S>),
        (STEP_NAMES[5], S::start_tmux as StepFn<S>),
    ]
}

/// A run that reached a live session.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub repo_id: String,
    pub title: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub tmux_session: String,
    pub setup_log: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub attach: bool,
}

/// A run that stopped early, with whatever evidence exists on disk.
#[derive(Debug, Error)]
#[error("run {run_id} failed at {step}: {error}")]
pub struct RunFailure {
    pub run_id: String,
    pub step: &'static str,
    #[source]
    pub error: AgencyError,
    pub worktree_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Drives a [`RunSteps`] implementation through the fixed sequence.
pub struct Pipeline<S> {
    steps: S,
    new_run_id: Box<dyn Fn() -> String>,
}

impl<S: RunSteps> Pipeline<S> {
    pub fn new(steps: S) -> Self {
        Self {
            steps,
            new_run_id: Box::new(generate_run_id),
        }
    }

    /// Replace the run id generator (tests pin ids this way).
    pub fn with_run_id_generator(mut self, generator: impl Fn() -> String + 'static) -> Self {
        self.new_run_id = Box::new(generator);
        self
    }

    pub fn steps(&self) -> &S {
        &self.steps
    }

    #[instrument(skip_all)]
    pub fn run(&self, opts: RunOptions) -> Result<RunSummary, RunFailure> {
        let run_id = (self.new_run_id)();
        info!(%run_id, "starting run");
        let mut st = PipelineState::new(run_id, opts);

        for (name, step) in step_table::<S>() {
            debug!(step = name, "running step");
            if let Err(e) = step(&self.steps, &mut st) {
                let error = normalize(name, e);
                warn!(step = name, code = %error.code(), "run failed");
                return Err(RunFailure {
                    run_id: st.run_id.clone(),
                    step: name,
                    error,
                    worktree_path: st.worktree_path.clone(),
                    log_path: st.setup_log.clone(),
                    warnings: std::mem::take(&mut st.warnings),
                });
            }
        }

        info!(run_id = %st.run_id, "run started");
        Ok(RunSummary {
            run_id: st.run_id.clone(),
            repo_id: st.repo_id.clone(),
            title: st.title.clone(),
            branch: st.branch.clone(),
            worktree_path: st.worktree_path.clone().unwrap_or_default(),
            tmux_session: st.tmux_session.clone().unwrap_or_default(),
            setup_log: st.setup_log.clone(),
            warnings: std::mem::take(&mut st.warnings),
            attach: st.opts.attach,
        })
    }
}

/// `YYYYMMDDHHMMSS-xxxx` from the current UTC time and 16 random bits.
pub fn generate_run_id() -> String {
    format_run_id(Utc::now(), rand::thread_rng().r#gen::<u16>())
}

/// Domain errors pass through unchanged; anything else becomes `internal`
/// naming the step.
pub fn normalize(step: &str, err: anyhow::Error) -> AgencyError {
    match err.downcast::<AgencyError>() {
        Ok(domain) => domain,
        Err(other) => AgencyError::internal(step, other),
    }
}

//! Run id resolution: exact match first, then unique prefix.

use thiserror::Error;

use crate::errors::{AgencyError, ErrorCode};

/// Minimal projection of a run used for id resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub repo_id: String,
    pub run_id: String,
    /// Meta is missing or invalid. Not filtered here; callers decide.
    pub broken: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no run matches '{input}'")]
    NotFound { input: String },
    #[error("run id '{input}' is ambiguous ({} matches)", .candidates.len())]
    Ambiguous {
        input: String,
        /// Sorted by run id, then repo id.
        candidates: Vec<RunRef>,
    },
}

/// Resolve `input` against `refs`.
///
/// An exact run id match wins over prefix matches; the same exact id under two
/// repos is ambiguous.
pub fn resolve_run_id(input: &str, refs: &[RunRef]) -> Result<RunRef, ResolveError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ResolveError::NotFound {
            input: String::new(),
        });
    }

    let exact: Vec<&RunRef> = refs.iter().filter(|r| r.run_id == input).collect();
    match exact.len() {
        0 => {}
        1 => return Ok(exact[0].clone()),
        _ => return Err(ambiguous(input, exact)),
    }

    let prefixed: Vec<&RunRef> = refs.iter().filter(|r| r.run_id.starts_with(input)).collect();
    match prefixed.len() {
        0 => Err(ResolveError::NotFound {
            input: input.to_string(),
        }),
        1 => Ok(prefixed[0].clone()),
        _ => Err(ambiguous(input, prefixed)),
    }
}

fn ambiguous(input: &str, matches: Vec<&RunRef>) -> ResolveError {
    let mut candidates: Vec<RunRef> = matches.into_iter().cloned().collect();
    candidates.sort_by(|a, b| {
        a.run_id
            .cmp(&b.run_id)
            .then_with(|| a.repo_id.cmp(&b.repo_id))
    });
    ResolveError::Ambiguous {
        input: input.to_string(),
        candidates,
    }
}

impl From<ResolveError> for AgencyError {
    fn from(err: ResolveError) -> Self {
        match &err {
            ResolveError::NotFound { .. } => {
                AgencyError::new(ErrorCode::RunNotFound, err.to_string())
            }
            ResolveError::Ambiguous { candidates, .. } => {
                let listed = candidates
                    .iter()
                    .map(|c| format!("{} ({})", c.run_id, c.repo_id))
                    .collect::<Vec<_>>()
                    .join(", ");
                AgencyError::new(ErrorCode::RunIdAmbiguous, err.to_string())
                    .with_detail("candidates", listed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ref(repo_id: &str, run_id: &str) -> RunRef {
        RunRef {
            repo_id: repo_id.to_string(),
            run_id: run_id.to_string(),
            broken: false,
        }
    }

    fn ids(err: ResolveError) -> Vec<String> {
        match err {
            ResolveError::Ambiguous { candidates, .. } => {
                candidates.into_iter().map(|c| c.run_id).collect()
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn shared_prefix_is_ambiguous_in_sorted_order() {
        let refs = vec![run_ref("r1", "20260110-a3ff"), run_ref("r1", "20260110-a3f2")];
        let err = resolve_run_id("20260110-a3f", &refs).expect_err("ambiguous");
        assert_eq!(ids(err), vec!["20260110-a3f2", "20260110-a3ff"]);
    }

    #[test]
    fn exact_match_beats_prefix_ambiguity() {
        let refs = vec![
            run_ref("r1", "20260110-a3f2"),
            run_ref("r1", "20260110-a3f2x"),
            run_ref("r1", "20260110-a3ff"),
        ];
        let got = resolve_run_id("20260110-a3f2", &refs).expect("resolve");
        assert_eq!(got.run_id, "20260110-a3f2");
    }

    #[test]
    fn unknown_and_empty_inputs_are_not_found() {
        let refs = vec![run_ref("r1", "20260110-a3f2")];
        assert_eq!(
            resolve_run_id("zzz", &refs),
            Err(ResolveError::NotFound {
                input: "zzz".to_string()
            })
        );
        assert!(matches!(
            resolve_run_id("   ", &refs),
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_exact_id_across_repos_is_ambiguous() {
        let refs = vec![run_ref("repo-b", "20260110-a3f2"), run_ref("repo-a", "20260110-a3f2")];
        match resolve_run_id("20260110-a3f2", &refs) {
            Err(ResolveError::Ambiguous { candidates, .. }) => {
                let repos: Vec<&str> = candidates.iter().map(|c| c.repo_id.as_str()).collect();
                assert_eq!(repos, vec!["repo-a", "repo-b"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn input_is_trimmed_and_broken_refs_still_match() {
        let mut broken = run_ref("r1", "20260110-dead");
        broken.broken = true;
        let got = resolve_run_id("  20260110-de ", &[broken]).expect("resolve");
        assert!(got.broken);
    }

    #[test]
    fn converts_to_domain_codes() {
        let not_found: AgencyError = ResolveError::NotFound {
            input: "x".to_string(),
        }
        .into();
        assert_eq!(not_found.code(), ErrorCode::RunNotFound);

        let refs = vec![run_ref("r1", "a1"), run_ref("r1", "a2")];
        let ambiguous: AgencyError = resolve_run_id("a", &refs).expect_err("ambiguous").into();
        assert_eq!(ambiguous.code(), ErrorCode::RunIdAmbiguous);
        assert_eq!(ambiguous.detail("candidates"), Some("a1 (r1), a2 (r1)"));
    }
}

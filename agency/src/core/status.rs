//! Derived run status.
//!
//! A run's status is never stored; it is computed from the persisted meta and
//! a live [`Snapshot`] using fixed precedence:
//!
//! 1. missing/invalid meta → `broken`
//! 2. `archive.merged_at` set → `merged`
//! 3. `flags.abandoned` → `abandoned`
//! 4. `flags.setup_failed` or `flags.tmux_failed` → `failed`
//! 5. `flags.needs_attention` → `needs attention`
//! 6. pushed and report at least [`REPORT_MIN_BYTES`] → `ready for review`
//! 7. tmux session alive → `active`
//! 8. otherwise → `idle`
//!
//! `archived` is orthogonal: it is exactly "worktree missing".

use serde::Serialize;

use crate::core::meta::RunMeta;

/// Minimum `.agency/report.md` size for a run to count as ready for review.
pub const REPORT_MIN_BYTES: u64 = 64;

/// Live local observations about a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub tmux_active: bool,
    pub worktree_present: bool,
    pub report_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Broken,
    Merged,
    Abandoned,
    Failed,
    NeedsAttention,
    ReadyForReview,
    Active,
    Idle,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Broken => "broken",
            Status::Merged => "merged",
            Status::Abandoned => "abandoned",
            Status::Failed => "failed",
            Status::NeedsAttention => "needs attention",
            Status::ReadyForReview => "ready for review",
            Status::Active => "active",
            Status::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Derived {
    pub status: Status,
    pub archived: bool,
}

impl Derived {
    /// Human label, e.g. `idle (archived)`.
    pub fn display_label(&self) -> String {
        if self.archived && self.status != Status::Merged {
            format!("{} (archived)", self.status.label())
        } else {
            self.status.label().to_string()
        }
    }
}

pub fn derive_status(meta: Option<&RunMeta>, snapshot: &Snapshot) -> Derived {
    let archived = !snapshot.worktree_present;
    let status = match meta {
        None => Status::Broken,
        Some(meta) => status_for(meta, snapshot),
    };
    Derived { status, archived }
}

fn status_for(meta: &RunMeta, snapshot: &Snapshot) -> Status {
    let merged = meta
        .archive
        .as_ref()
        .is_some_and(|a| a.merged_at.is_some());
    if merged {
        return Status::Merged;
    }
    if meta.flags.abandoned {
        return Status::Abandoned;
    }
    if meta.flags.setup_failed || meta.flags.tmux_failed {
        return Status::Failed;
    }
    if meta.flags.needs_attention {
        return Status::NeedsAttention;
    }
    if is_ready_for_review(meta, snapshot) {
        return Status::ReadyForReview;
    }
    if snapshot.tmux_active {
        return Status::Active;
    }
    Status::Idle
}

/// A run is ready for review once its branch was pushed and it has a report.
pub fn is_ready_for_review(meta: &RunMeta, snapshot: &Snapshot) -> bool {
    let pushed = meta.last_push_at.is_some() || meta.pr_url.is_some();
    pushed && snapshot.report_bytes >= REPORT_MIN_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meta::ArchiveRecord;
    use crate::test_support::sample_meta;

    fn live() -> Snapshot {
        Snapshot {
            tmux_active: true,
            worktree_present: true,
            report_bytes: 0,
        }
    }

    #[test]
    fn missing_meta_is_broken() {
        for snapshot in [Snapshot::default(), live()] {
            let derived = derive_status(None, &snapshot);
            assert_eq!(derived.status, Status::Broken);
        }
    }

    #[test]
    fn merged_wins_over_every_flag() {
        let mut meta = sample_meta("r1");
        meta.flags.abandoned = true;
        meta.flags.setup_failed = true;
        meta.flags.needs_attention = true;
        meta.archive = Some(ArchiveRecord {
            archived_at: None,
            merged_at: Some("2026-01-11T00:00:00Z".to_string()),
        });
        assert_eq!(derive_status(Some(&meta), &live()).status, Status::Merged);
    }

    #[test]
    fn archived_tracks_worktree_presence_only() {
        let meta = sample_meta("r1");
        let mut snapshot = live();
        assert!(!derive_status(Some(&meta), &snapshot).archived);
        snapshot.worktree_present = false;
        assert!(derive_status(Some(&meta), &snapshot).archived);
        assert!(derive_status(None, &snapshot).archived);
    }

    #[test]
    fn report_threshold_is_inclusive() {
        let mut meta = sample_meta("r1");
        meta.last_push_at = Some("2026-01-11T00:00:00Z".to_string());
        let mut snapshot = live();

        snapshot.report_bytes = REPORT_MIN_BYTES - 1;
        assert!(!is_ready_for_review(&meta, &snapshot));
        assert_eq!(derive_status(Some(&meta), &snapshot).status, Status::Active);

        snapshot.report_bytes = REPORT_MIN_BYTES;
        assert!(is_ready_for_review(&meta, &snapshot));
        assert_eq!(
            derive_status(Some(&meta), &snapshot).status,
            Status::ReadyForReview
        );
    }

    #[test]
    fn flags_follow_precedence() {
        let mut meta = sample_meta("r1");
        meta.flags.needs_attention = true;
        assert_eq!(
            derive_status(Some(&meta), &live()).status,
            Status::NeedsAttention
        );
        meta.flags.tmux_failed = true;
        assert_eq!(derive_status(Some(&meta), &live()).status, Status::Failed);
        meta.flags.abandoned = true;
        assert_eq!(derive_status(Some(&meta), &live()).status, Status::Abandoned);
    }

    #[test]
    fn idle_without_session_and_label_marks_archive() {
        let meta = sample_meta("r1");
        let derived = derive_status(Some(&meta), &Snapshot::default());
        assert_eq!(derived.status, Status::Idle);
        assert_eq!(derived.display_label(), "idle (archived)");
    }
}

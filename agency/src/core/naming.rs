//! Deterministic names derived from a run id and title.

use chrono::{DateTime, Utc};

/// Maximum length of the title slug embedded in branch names.
pub const MAX_SLUG_LEN: usize = 30;

/// Format a run id: `YYYYMMDDHHMMSS-xxxx` (UTC timestamp, 4 lowercase hex).
pub fn format_run_id(now: DateTime<Utc>, suffix: u16) -> String {
    format!("{}-{suffix:04x}", now.format("%Y%m%d%H%M%S"))
}

/// The random part of a run id (everything after the last `-`).
pub fn run_id_suffix(run_id: &str) -> &str {
    run_id.rsplit_once('-').map_or(run_id, |(_, suffix)| suffix)
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapses to `-`.
///
/// Returns `"untitled"` when nothing survives.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        return "untitled".to_string();
    }
    slug
}

/// Branch for a run: `agency/<slug>-<suffix>`.
pub fn branch_name(title: &str, run_id: &str) -> String {
    format!("agency/{}-{}", slugify(title), run_id_suffix(run_id))
}

/// Title used when the caller supplied none.
pub fn default_title(run_id: &str) -> String {
    format!("untitled-{}", run_id_suffix(run_id))
}

/// tmux session name for a run.
pub fn tmux_session_name(run_id: &str) -> String {
    format!("agency_{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_has_timestamp_and_hex_suffix() {
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 14, 3, 9).unwrap();
        assert_eq!(format_run_id(now, 0xa3f2), "20260110140309-a3f2");
        assert_eq!(format_run_id(now, 0x7), "20260110140309-0007");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Fix: flaky  Login test!"), "fix-flaky-login-test");
        assert_eq!(slugify("  --  "), "untitled");
        assert_eq!(slugify("héllo wörld"), "h-llo-w-rld");
    }

    #[test]
    fn slugify_caps_length_without_trailing_dash() {
        let slug = slugify("abcdefghijklmnopqrstuvwxyz abcdefghij");
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn branch_and_session_names_are_deterministic() {
        assert_eq!(
            branch_name("Add retries", "20260110140309-a3f2"),
            "agency/add-retries-a3f2"
        );
        assert_eq!(default_title("20260110140309-a3f2"), "untitled-a3f2");
        assert_eq!(
            tmux_session_name("20260110140309-a3f2"),
            "agency_20260110140309-a3f2"
        );
    }
}

//! Rendering a restore result as a block of text for a resumed agent.
//!
//! Section order is fixed: header, summary, progress and elapsed time,
//! restored counts, next steps, blockers, files touched, warnings. Empty
//! lists render as `- none` so the shape never changes.

use crate::recovery::restorer::RestoreResult;
use std::fmt::Write;

/// Compact human form of a millisecond duration ("2h 5m", "42s").
#[must_use]
pub fn format_elapsed(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m"),
    }
}

fn status_line(result: &RestoreResult) -> String {
    if !result.success {
        let reason = result.errors.first().map_or("unknown error", String::as_str);
        return format!("failed: {reason}");
    }
    if result.dry_run {
        "dry run, nothing applied".to_string()
    } else {
        "restored".to_string()
    }
}

fn push_list(out: &mut String, title: &str, items: &[String], numbered: bool) {
    let _ = writeln!(out, "\n{title}:");
    if items.is_empty() {
        out.push_str("- none\n");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        if numbered {
            let _ = writeln!(out, "{}. {item}", i + 1);
        } else {
            let _ = writeln!(out, "- {item}");
        }
    }
}

/// Render the recovery prompt for a restore result.
#[must_use]
pub fn format_recovery_prompt(result: &RestoreResult) -> String {
    let ctx = &result.recovery_context;
    let mut out = String::new();

    let _ = writeln!(out, "## Fleet recovery: {}", result.mission_id);
    let _ = writeln!(out, "Checkpoint: {}", result.checkpoint_id);
    let _ = writeln!(out, "Status: {}", status_line(result));

    let summary = if ctx.mission_summary.is_empty() {
        "(no summary recorded)"
    } else {
        ctx.mission_summary.as_str()
    };
    let _ = writeln!(out, "\nSummary: {summary}");
    if !ctx.last_action.is_empty() {
        let _ = writeln!(out, "Last action: {}", ctx.last_action);
    }
    let _ = writeln!(
        out,
        "Progress: {}% | Elapsed: {}",
        result.progress_percent,
        format_elapsed(ctx.elapsed_time_ms)
    );
    let _ = writeln!(
        out,
        "Restored: {} sorties, {} locks, {} messages",
        result.restored.sorties, result.restored.locks, result.restored.messages
    );

    push_list(&mut out, "Next steps", &ctx.next_steps, true);
    push_list(&mut out, "Blockers", &ctx.blockers, false);
    push_list(&mut out, "Files touched", &ctx.files_modified, false);
    push_list(&mut out, "Warnings", &result.warnings, false);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecoveryContext;
    use crate::recovery::restorer::RestoredCounts;

    fn result() -> RestoreResult {
        RestoreResult {
            success: true,
            dry_run: false,
            mission_id: "msn-1".into(),
            checkpoint_id: "ckpt_abc".into(),
            progress_percent: 40,
            restored: RestoredCounts { sorties: 3, locks: 1, messages: 1 },
            warnings: vec!["LockExpired: lock on a.rs".into()],
            errors: vec![],
            recovery_context: RecoveryContext {
                last_action: "sortie_progress".into(),
                next_steps: vec!["finish lexer".into(), "run tests".into()],
                blockers: vec![],
                files_modified: vec!["src/lexer.rs".into()],
                mission_summary: "Parser: 1/3 sorties complete (in_progress)".into(),
                elapsed_time_ms: 3_900_000,
                last_activity_at: 0,
            },
        }
    }

    #[test]
    fn test_prompt_layout_is_stable() {
        let expected = "\
## Fleet recovery: msn-1
Checkpoint: ckpt_abc
Status: restored

Summary: Parser: 1/3 sorties complete (in_progress)
Last action: sortie_progress
Progress: 40% | Elapsed: 1h 5m
Restored: 3 sorties, 1 locks, 1 messages

Next steps:
1. finish lexer
2. run tests

Blockers:
- none

Files touched:
- src/lexer.rs

Warnings:
- LockExpired: lock on a.rs
";
        assert_eq!(format_recovery_prompt(&result()), expected);
    }

    #[test]
    fn test_failed_status_names_first_error() {
        let mut r = result();
        r.success = false;
        r.errors = vec!["Sortie not found: s3".into()];
        let prompt = format_recovery_prompt(&r);
        assert!(prompt.contains("Status: failed: Sortie not found: s3"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(42_000), "42s");
        assert_eq!(format_elapsed(125_000), "2m 5s");
        assert_eq!(format_elapsed(7_500_000), "2h 5m");
        assert_eq!(format_elapsed(-5), "0s");
    }
}

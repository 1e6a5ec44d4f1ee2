//! Text shaping for child results

use crate::session::types::CompletionRecord;

/// Cut `text` to at most `max_chars` characters, marking the cut with an ellipsis
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
    }
}

/// The message an orchestrator is resumed with once its children are done
pub fn resume_message(results: &[CompletionRecord]) -> String {
    let mut out = String::from("Child sessions finished:\n");
    for result in results {
        let summary = if result.summary.is_empty() {
            "(no output)"
        } else {
            result.summary.as_str()
        };
        out.push_str(&format!(
            "- **{}** ({}): {}\n",
            result.name,
            result.status.as_str(),
            summary
        ));
    }
    out.push_str("\nContinue with the orchestration.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{ChildStatus, TokenUsage};

    fn record(name: &str, status: ChildStatus, summary: &str) -> CompletionRecord {
        CompletionRecord {
            child_id: format!("id-{}", name),
            name: name.to_string(),
            status,
            summary: summary.to_string(),
            usage: TokenUsage::default(),
            completed_at: 0,
        }
    }

    #[test]
    fn short_text_is_kept() {
        assert_eq!(truncate_summary("  done  ", 10), "done");
    }

    #[test]
    fn long_text_is_cut_with_ellipsis() {
        assert_eq!(truncate_summary("abcdef ghijkl", 7), "abcdef…");
    }

    #[test]
    fn resume_message_lists_every_child() {
        let text = resume_message(&[
            record("A", ChildStatus::Completed, "wrote the parser"),
            record("B", ChildStatus::Error, ""),
        ]);

        assert!(text.starts_with("Child sessions finished:\n"));
        assert!(text.contains("- **A** (completed): wrote the parser\n"));
        assert!(text.contains("- **B** (error): (no output)\n"));
        assert!(text.ends_with("Continue with the orchestration."));
    }
}

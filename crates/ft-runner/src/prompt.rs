// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt composition.
//!
//! The mission's prompt template is a markdown document with `{{persona}}`,
//! `{{mission}}`, and `{{report_schema}}` placeholders. Follow-up attempts
//! append a bounded addendum carrying exactly what the agent needs to
//! repair: its previous final message, the schema errors, and failing
//! verification output tails.

/// Literal segment that opens every follow-up addendum.
pub const FOLLOWUP_SEGMENT: &str = "Follow-up required.";

/// Character budget for each quoted block inside the addendum.
pub const FOLLOWUP_BLOCK_MAX_CHARS: usize = 2_000;

/// Character budget for the whole addendum.
pub const FOLLOWUP_MAX_CHARS: usize = 8_000;

/// Substitute template placeholders.
pub fn compose_prompt(template: &str, persona_md: &str, mission_md: &str, report_schema: &str) -> String {
    template
        .replace("{{persona}}", persona_md.trim())
        .replace("{{mission}}", mission_md.trim())
        .replace("{{report_schema}}", report_schema.trim())
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

/// Inputs for one follow-up addendum.
#[derive(Debug, Clone, Default)]
pub struct FollowupContext {
    /// The agent's previous final message, verbatim.
    pub previous_last_message: String,
    /// Schema validation errors from the previous attempt.
    pub report_validation_errors: Vec<String>,
    /// `(command, stdout_tail, stderr_tail)` triples for failing
    /// verification commands.
    pub failing_commands: Vec<(String, String, String)>,
}

/// Build the follow-up prompt: original prompt plus a bounded addendum.
pub fn compose_followup_prompt(original_prompt: &str, ctx: &FollowupContext) -> String {
    let mut addendum = String::new();
    addendum.push_str(FOLLOWUP_SEGMENT);
    addendum.push('\n');

    if !ctx.previous_last_message.trim().is_empty() {
        addendum.push_str("\nYour previous final message was:\n```\n");
        addendum.push_str(&tail_chars(
            ctx.previous_last_message.trim(),
            FOLLOWUP_BLOCK_MAX_CHARS,
        ));
        addendum.push_str("\n```\n");
    }

    if !ctx.report_validation_errors.is_empty() {
        addendum.push_str("\nIt failed report validation:\n");
        for error in &ctx.report_validation_errors {
            addendum.push_str("- ");
            addendum.push_str(&tail_chars(error, FOLLOWUP_BLOCK_MAX_CHARS / 4));
            addendum.push('\n');
        }
        addendum.push_str("\nRespond with a corrected report that satisfies the schema.\n");
    }

    if !ctx.failing_commands.is_empty() {
        addendum.push_str("\nThese verification commands failed:\n");
        for (command, stdout_tail, stderr_tail) in &ctx.failing_commands {
            addendum.push_str(&format!("\n$ {command}\n"));
            if !stdout_tail.trim().is_empty() {
                addendum.push_str("[stdout]\n");
                addendum.push_str(&tail_chars(stdout_tail.trim(), FOLLOWUP_BLOCK_MAX_CHARS));
                addendum.push('\n');
            }
            if !stderr_tail.trim().is_empty() {
                addendum.push_str("[stderr]\n");
                addendum.push_str(&tail_chars(stderr_tail.trim(), FOLLOWUP_BLOCK_MAX_CHARS));
                addendum.push('\n');
            }
        }
        addendum.push_str("\nMake the verification commands pass, then report again.\n");
    }

    let addendum = tail_chars(&addendum, FOLLOWUP_MAX_CHARS);
    format!("{original_prompt}\n\n---\n\n{addendum}")
}

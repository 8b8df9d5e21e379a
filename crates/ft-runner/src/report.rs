// SPDX-License-Identifier: MIT OR Apache-2.0
//! Report validation and markdown rendering.

use serde_json::Value;

/// Parse and validate the agent's last message against the mission's
/// report schema. `Err` carries one string per violation (a parse failure
/// is a single violation).
pub fn validate_report(last_message: &str, schema: &Value) -> Result<Value, Vec<String>> {
    let trimmed = last_message.trim();
    if trimmed.is_empty() {
        return Err(vec!["agent produced no report output".to_string()]);
    }

    let instance: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => return Err(vec![format!("report is not valid JSON: {e}")]),
    };

    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(e) => return Err(vec![format!("report schema failed to compile: {e}")]),
    };

    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|error| format!("{}: {error}", error.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(instance)
    } else {
        Err(errors)
    }
}

fn str_items<'a>(report: &'a Value, field: &str, key: &str) -> Vec<&'a str> {
    report
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.get(key)
                        .and_then(Value::as_str)
                        .or_else(|| item.as_str())
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Render a human-readable `report.md` from a validated report.
pub fn render_report_markdown(report: &Value, agent: &str, mission_id: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("# Run report — {agent} / {mission_id}"));
    lines.push(String::new());

    if let Some(summary) = report.get("summary").and_then(Value::as_str) {
        lines.push(summary.trim().to_string());
        lines.push(String::new());
    }

    let confusion = str_items(report, "confusion_points", "summary");
    if !confusion.is_empty() {
        lines.push("## Confusion points".to_string());
        for point in confusion {
            lines.push(format!("- {point}"));
        }
        lines.push(String::new());
    }

    let changes = str_items(report, "suggested_changes", "change");
    if !changes.is_empty() {
        lines.push("## Suggested changes".to_string());
        for change in changes {
            lines.push(format!("- {change}"));
        }
        lines.push(String::new());
    }

    if let Some(missing) = report
        .get("confidence_signals")
        .and_then(|cs| cs.get("missing"))
        .and_then(Value::as_array)
    {
        let missing: Vec<&str> = missing.iter().filter_map(Value::as_str).collect();
        if !missing.is_empty() {
            lines.push("## Missing confidence signals".to_string());
            for item in missing {
                lines.push(format!("- {item}"));
            }
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

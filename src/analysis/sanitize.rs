// Sanitize case text before it is rendered into a prompt.
// Removes invisible Unicode, drops prompt-injection lines, normalizes whitespace.

/// Maximum narrative length sent to the model (characters).
const MAX_NARRATIVE_LENGTH: usize = 20_000;

/// Maximum length of a single structured field (characters).
const MAX_FIELD_LENGTH: usize = 1_000;

const TRUNCATION_MARK: &str = "…[TRUNCATED]";

/// Sanitize multi-line free text (the case narrative).
pub fn sanitize_case_text(raw: &str) -> String {
    let cleaned = remove_invisible_chars(raw);
    let (no_injection, removed) = remove_injection_lines(&cleaned);

    if removed > 0 {
        // Counts only: case text is health data and never goes to the log.
        tracing::warn!(
            removed_lines = removed,
            "Injection patterns removed from case narrative"
        );
    }

    let normalized = normalize_whitespace(&no_injection);
    truncate_chars(&normalized, MAX_NARRATIVE_LENGTH)
}

/// Sanitize a short structured field: one line, capped length.
pub fn sanitize_field(raw: &str) -> String {
    let cleaned = remove_invisible_chars(raw);
    let (no_injection, _) = remove_injection_lines(&cleaned);
    let single_line = no_injection.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&single_line, MAX_FIELD_LENGTH)
}

/// Remove zero-width, bidi-override and control characters.
/// Keeps space, newline, tab and carriage return.
fn remove_invisible_chars(text: &str) -> String {
    text.chars()
        .filter(|c| {
            if matches!(*c, ' ' | '\n' | '\t' | '\r') {
                return true;
            }
            if matches!(
                *c,
                '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
            ) {
                return false;
            }
            !c.is_control()
        })
        .collect()
}

fn is_role_marker(trimmed: &str) -> bool {
    const MARKERS: &[&str] = &[
        "system:",
        "assistant:",
        "user:",
        "[system]",
        "[assistant]",
        "[inst]",
        "[/inst]",
        "<<sys>>",
        "note to ai:",
        "instructions:",
    ];
    MARKERS.iter().any(|m| trimmed.starts_with(m))
}

fn is_override_attempt(text: &str) -> bool {
    const OVERRIDES: &[&str] = &[
        "ignore previous instructions",
        "ignore all instructions",
        "ignore the above instructions",
        "disregard your instructions",
        "disregard all instructions",
        "forget your instructions",
        "new instructions:",
        "respond without json",
    ];
    OVERRIDES.iter().any(|o| text.contains(o))
}

/// Drop lines that look like role markers or instruction overrides.
/// Returns the kept text and the number of dropped lines.
fn remove_injection_lines(text: &str) -> (String, usize) {
    let mut kept: Vec<&str> = Vec::new();
    let mut removed = 0usize;

    for line in text.lines() {
        let lower = line.trim().to_lowercase();
        if is_role_marker(&lower) || is_override_attempt(&lower) {
            removed += 1;
            continue;
        }
        kept.push(line);
    }

    (kept.join("\n"), removed)
}

/// Trim each line and collapse runs of blank lines to one.
fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut prev_blank = true;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_blank {
                lines.push("");
            }
            prev_blank = true;
        } else {
            lines.push(trimmed);
            prev_blank = false;
        }
    }

    while lines.last() == Some(&"") {
        lines.pop();
    }

    lines.join("\n")
}

/// Truncate on a word boundary, counting characters rather than bytes.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(pos) => format!("{}{TRUNCATION_MARK}", &cut[..pos]),
        None => format!("{cut}{TRUNCATION_MARK}"),
    }
}

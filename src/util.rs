//! Shared utility functions used across the codebase.

/// Truncate `s` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Pull the JSON object out of a model response.
///
/// Models wrap JSON in prose or markdown fences often enough that the raw
/// text cannot be fed to serde directly. Accepts a fenced ```json block, then
/// falls back to the outermost `{ ... }` span. Returns `None` when neither is
/// present; the caller decides how to fail.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let trimmed = response.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(fenced) = extract_fenced_block(trimmed, &["json", ""]) {
        let inner = fenced.trim();
        if inner.starts_with('{') && inner.ends_with('}') {
            return Some(inner);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&trimmed[start..=end])
}

/// Return the body of the first markdown code fence whose info string is one
/// of `languages` (an empty string matches an unlabelled fence).
pub fn extract_fenced_block<'a>(text: &'a str, languages: &[&str]) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(rel_open) = text[search_from..].find("```") {
        let open = search_from + rel_open;
        let after_ticks = open + 3;
        let line_end = text[after_ticks..]
            .find('\n')
            .map(|i| after_ticks + i)
            .unwrap_or(text.len());
        let info = text[after_ticks..line_end].trim().to_lowercase();
        let body_start = (line_end + 1).min(text.len());
        let close = text[body_start..].find("```").map(|i| body_start + i)?;
        if languages.iter().any(|lang| *lang == info) {
            return Some(&text[body_start..close]);
        }
        search_from = close + 3;
    }
    None
}

/// Deduplicate and trim a list of names, preserving order.
pub fn sanitize_name_list<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_appends_ellipsis_only_when_cut() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }

    #[test]
    fn extract_json_object_handles_plain_and_fenced() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));

        let fenced = "Here is the plan:\n```json\n{\"a\": 2}\n```\nDone.";
        assert_eq!(extract_json_object(fenced), Some("{\"a\": 2}"));

        let prose = "Sure! {\"a\": 3} hope that helps";
        assert_eq!(extract_json_object(prose), Some("{\"a\": 3}"));

        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn extract_fenced_block_matches_language() {
        let text = "```python\nprint(1)\n```\n```sql\nSELECT 1\n```";
        assert_eq!(extract_fenced_block(text, &["sql"]), Some("SELECT 1\n"));
        assert_eq!(extract_fenced_block(text, &["rust"]), None);
    }

    #[test]
    fn sanitize_name_list_deduplicates_and_trims() {
        let names = vec![" foo ", "bar", "foo", "", "  ", "bar"];
        assert_eq!(sanitize_name_list(names), vec!["foo", "bar"]);
    }
}

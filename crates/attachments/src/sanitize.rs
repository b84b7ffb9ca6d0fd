//! File-name sanitization for user-supplied upload names (spec §4.5
//! "sanitizes file name"). The sanitized name is only ever used as a suffix
//! of the blob key, never as a standalone path, so this is defense in depth
//! rather than the sole guard against traversal.

const MAX_NAME_LEN: usize = 100;

/// Strips path separators and anything outside a conservative allow-list,
/// collapsing the result to a bounded-length name. Falls back to `"file"` if
/// nothing safe survives.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .take(MAX_NAME_LEN)
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directory_components() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    }

    #[test]
    fn keeps_safe_characters_only() {
        assert_eq!(sanitize_file_name("my report (final)!.pdf"), "myreportfinal.pdf");
    }

    #[test]
    fn empty_after_sanitizing_falls_back() {
        assert_eq!(sanitize_file_name("???"), "file");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_file_name(&long).len(), MAX_NAME_LEN);
    }
}

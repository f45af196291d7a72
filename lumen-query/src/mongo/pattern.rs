/// Translate a SQL LIKE pattern into an anchored regular expression.
///
/// Regex metacharacters in the pattern are escaped first, then `%` becomes
/// `.*` and `_` becomes `.`.
pub fn like_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern).replace('%', ".*").replace('_', ".");
    format!("^{}$", escaped)
}

/// Unanchored regex matching `text` literally
pub(crate) fn literal_regex(text: &str) -> String {
    regex::escape(text)
}

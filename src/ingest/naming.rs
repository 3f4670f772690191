use chrono::{DateTime, Datelike, Utc};

const FALLBACK_STEM: &str = "file";

/// Reduces the stem of `file_name` to a filesystem and URL safe token.
///
/// Directory components are dropped, anything other than ASCII
/// alphanumerics, `-` and `_` becomes `_`, runs of separators collapse to
/// one, and leading or trailing separators are trimmed. Returns `file`
/// when nothing survives.
pub fn sanitize_stem(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };

    let mut sanitized = String::with_capacity(stem.len());
    for ch in stem.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            '_'
        };
        let separator = matches!(ch, '_' | '-');
        if separator && sanitized.ends_with(['_', '-']) {
            continue;
        }
        sanitized.push(ch);
    }

    let sanitized = sanitized.trim_matches(['_', '-', '.']);
    if sanitized.is_empty() {
        return FALLBACK_STEM.to_owned();
    }
    sanitized.to_owned()
}

/// Builds `<stem>_<YYYYMMDDHHMMSS>_<8 hex>.<extension>`.
pub fn unique_name(file_name: &str, extension: &str, now: DateTime<Utc>) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}.{}",
        sanitize_stem(file_name),
        now.format("%Y%m%d%H%M%S"),
        &random[..8],
        extension
    )
}

/// Date-sharded storage key `YYYY/MM/DD/<name>`.
pub fn storage_path(unique_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{:04}/{:02}/{:02}/{unique_name}",
        now.year(),
        now.month(),
        now.day()
    )
}

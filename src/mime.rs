//! Process-wide MIME registry.
//!
//! Maps file extensions to content types. Built once at startup from the
//! built-in defaults plus any configured `{ext, contenttype}` pairs
//! (last writer wins), read-only afterwards. Used by the resolver only when
//! a record carries no explicit content type.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MimeType {
    /// Extension including the leading dot, e.g. `.woff2`.
    pub ext: String,
    #[serde(rename = "contenttype")]
    pub content_type: String,
}

static REGISTRY: OnceLock<HashMap<String, String>> = OnceLock::new();

const DEFAULTS: &[(&str, &str)] = &[
    (".avif", "image/avif"),
    (".css", "text/css; charset=utf-8"),
    (".gif", "image/gif"),
    (".htm", "text/html; charset=utf-8"),
    (".html", "text/html; charset=utf-8"),
    (".ico", "image/vnd.microsoft.icon"),
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".js", "text/javascript; charset=utf-8"),
    (".json", "application/json"),
    (".map", "application/json"),
    (".mjs", "text/javascript; charset=utf-8"),
    (".otf", "font/otf"),
    (".pdf", "application/pdf"),
    (".png", "image/png"),
    (".svg", "image/svg+xml"),
    (".ttf", "font/ttf"),
    (".txt", "text/plain; charset=utf-8"),
    (".wasm", "application/wasm"),
    (".webm", "video/webm"),
    (".webp", "image/webp"),
    (".woff", "font/woff"),
    (".woff2", "font/woff2"),
    (".xml", "text/xml; charset=utf-8"),
];

fn build(extra: &[MimeType]) -> HashMap<String, String> {
    let mut table: HashMap<String, String> = DEFAULTS
        .iter()
        .map(|(ext, ctype)| (ext.to_string(), ctype.to_string()))
        .collect();
    for m in extra {
        table.insert(m.ext.clone(), m.content_type.clone());
    }
    table
}

/// Install the registry. Must run before serving; the first call wins and
/// later calls are ignored (the table is read-only once serving starts).
pub fn init(extra: &[MimeType]) {
    let _ = REGISTRY.set(build(extra));
}

/// Look up a content type by extension (with leading dot).
pub fn by_extension(ext: &str) -> Option<&'static str> {
    if ext.is_empty() {
        return None;
    }
    REGISTRY
        .get_or_init(|| build(&[]))
        .get(ext)
        .map(|s| s.as_str())
}

/// Extension of a slash-separated logical path, with leading dot.
pub fn path_ext(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        // a leading dot is a hidden file, not an extension
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_common_web_types() {
        assert_eq!(by_extension(".png"), Some("image/png"));
        assert_eq!(by_extension(".js"), Some("text/javascript; charset=utf-8"));
        assert_eq!(by_extension(".html"), Some("text/html; charset=utf-8"));
        assert_eq!(by_extension(".json"), Some("application/json"));
        assert_eq!(by_extension(".unknownext"), None);
        assert_eq!(by_extension(""), None);
    }

    #[test]
    fn path_ext_extraction() {
        assert_eq!(path_ext("a/b/c.png"), ".png");
        assert_eq!(path_ext("c.tar.gz"), ".gz");
        assert_eq!(path_ext("noext"), "");
        assert_eq!(path_ext("dir.v2/noext"), "");
        assert_eq!(path_ext(".hidden"), "");
    }
}

//! Route table and request resolution: prefix matching, encoding
//! negotiation, content-type fallback, and validators.

use std::collections::HashSet;

use base64::prelude::*;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::db::ContentRecord;
use crate::mime;
use crate::store::ObjectMeta;
use crate::{ContentHash, clean_path};

/// One serving route, as configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Route {
    pub prefix: String,
    /// Directory route: the request path past the prefix selects the
    /// record. File routes ignore the request path entirely.
    #[serde(default)]
    pub dir: bool,
    /// Tree path (dir routes: prefix of it) this route serves from.
    pub path: String,
    #[serde(default, rename = "cachecontrol")]
    pub cache_control: String,
    /// Regex the path tail must match (dir routes only).
    #[serde(default)]
    pub include: String,
    /// Regex that rejects matching path tails (dir routes only).
    #[serde(default)]
    pub exclude: String,
    /// Content codings this route may serve; empty accepts anything the
    /// record offers.
    #[serde(default)]
    pub encodings: Vec<String>,
    #[serde(default, rename = "defaultcontenttype")]
    pub default_content_type: String,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid {kind} regex for route {prefix}: {err}")]
    BadRegex {
        prefix: String,
        kind: &'static str,
        err: regex::Error,
    },
}

pub(crate) struct CompiledRoute {
    pub route: Route,
    include: Option<Regex>,
    exclude: Option<Regex>,
}

/// Ordered route table; the longest matching prefix wins.
pub(crate) struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            let include = compile(&route, "include", &route.include)?;
            let exclude = compile(&route, "exclude", &route.exclude)?;
            compiled.push(CompiledRoute {
                route,
                include,
                exclude,
            });
        }
        compiled.sort_by(|a, b| b.route.prefix.len().cmp(&a.route.prefix.len()));
        Ok(Self { routes: compiled })
    }

    /// Match a request path to a route and the tree path to look up.
    /// Returns `None` when no route matches or the tail is filtered out.
    pub fn resolve(&self, req_path: &str) -> Option<(&CompiledRoute, String)> {
        let matched = self
            .routes
            .iter()
            .find(|r| req_path.starts_with(&r.route.prefix))?;

        if !matched.route.dir {
            return Some((matched, clean_path(&matched.route.path)));
        }

        let tail = clean_path(req_path[matched.route.prefix.len()..].trim_start_matches('/'));
        if tail.is_empty() {
            return None;
        }
        if let Some(include) = &matched.include
            && !include.is_match(&tail)
        {
            return None;
        }
        if let Some(exclude) = &matched.exclude
            && exclude.is_match(&tail)
        {
            return None;
        }
        let storage = clean_path(&format!("{}/{}", matched.route.path, tail));
        Some((matched, storage))
    }
}

fn compile(route: &Route, kind: &'static str, src: &str) -> Result<Option<Regex>, RouteError> {
    if src.is_empty() {
        return Ok(None);
    }
    Regex::new(src)
        .map(Some)
        .map_err(|err| RouteError::BadRegex {
            prefix: route.prefix.clone(),
            kind,
            err,
        })
}

/// Pick the blob to serve from the record's encodings, in publisher
/// preference order, against the client's Accept-Encoding tokens. Falls
/// back to the primary blob with identity encoding.
pub(crate) fn negotiate_encoding<'r>(
    record: &'r ContentRecord,
    accept_encoding: Option<&str>,
    accepted: &[String],
) -> (&'r ContentHash, Option<&'r str>) {
    let client: HashSet<&str> = accept_encoding
        .unwrap_or("")
        .split(',')
        .map(|directive| {
            directive
                .split_once(';')
                .map_or(directive, |(enc, _)| enc)
                .trim()
        })
        .filter(|enc| !enc.is_empty())
        .collect();

    for enc in &record.encodings {
        if !accepted.is_empty() && !accepted.iter().any(|code| code == &enc.code) {
            continue;
        }
        if client.contains(enc.code.as_str()) {
            return (&enc.hash, Some(enc.code.as_str()));
        }
    }
    (&record.hash, None)
}

/// Content type for a record: the record's own, else the registry by
/// extension of the tree path, else the route default, else octet-stream.
pub(crate) fn content_type(record: &ContentRecord, storage_path: &str, route: &Route) -> String {
    if !record.content_type.is_empty() {
        return record.content_type.clone();
    }
    // the tree path, not the encoded blob, names the extension: `.gz` and
    // friends would otherwise shadow the real type
    if let Some(ctype) = mime::by_extension(mime::path_ext(storage_path)) {
        return ctype.to_string();
    }
    if !route.default_content_type.is_empty() {
        return route.default_content_type.clone();
    }
    "application/octet-stream".to_string()
}

/// Strong validator: the quoted blob hash. Content addressing makes a
/// match prove byte identity, which is what authorises range requests.
pub(crate) fn strong_etag(hash: &ContentHash) -> String {
    format!("\"{hash}\"")
}

/// Weak validator from the served blob's metadata: millisecond mtime and
/// size packed big-endian into 16 bytes, base64url.
pub(crate) fn weak_etag(meta: &ObjectMeta) -> String {
    let mtime_ms = meta
        .modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut packed = [0u8; 16];
    packed[..8].copy_from_slice(&mtime_ms.to_be_bytes());
    packed[8..].copy_from_slice(&meta.size.to_be_bytes());
    format!("W/\"{}\"", BASE64_URL_SAFE_NO_PAD.encode(packed))
}

/// RFC 7232: any listed validator matching either of ours yields a 304.
pub(crate) fn if_none_match(header: &str, strong: &str, weak: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|tag| tag == strong || tag == weak)
}

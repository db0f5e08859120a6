//! Path resolution, validator computation, conditional-request evaluation,
//! and response-cache population for regular files under the document root.

use crate::cache::{self, Cache, MAX_CACHEABLE_SIZE};
use crate::errors::NxError;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::StatusCode;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Matches the conventional `PATH_MAX` fixed buffer; a root+target join
/// that would overflow it is a 414, not a silent truncation.
const PATH_BUFFER: usize = 4096;

/// Joins `root` with the request target, substituting `/` for `/index.html`
/// and normalizing `.`/`..` components so the result can never resolve
/// outside `root`. A target whose `..` segments would climb above `root`
/// is rejected with 404 rather than allowed to escape the document tree.
fn resolve_path(root: &Path, target: &[u8]) -> Result<PathBuf, NxError> {
    if root.as_os_str().as_bytes().len() + target.len() > PATH_BUFFER {
        return Err(NxError::TargetTooLong);
    }

    let target = if target == b"/" { b"/index.html".as_slice() } else { target };

    let mut stack: Vec<&[u8]> = Vec::new();
    for segment in target.split(|&b| b == b'/') {
        match segment {
            b"" | b"." => continue,
            b".." => {
                if stack.pop().is_none() {
                    return Err(NxError::NotFound);
                }
            }
            other => stack.push(other),
        }
    }

    let mut path = root.to_path_buf();
    for segment in stack {
        path.push(std::ffi::OsStr::from_bytes(segment));
    }
    Ok(path)
}

/// `"<ino hex>-<size hex>-<mtime hex>"`, quoted as a standard strong ETag.
fn etag(meta: &std::fs::Metadata) -> String {
    format!("\"{:x}-{:x}-{:x}\"", meta.ino(), meta.size(), meta.mtime())
}

fn last_modified(meta: &std::fs::Metadata) -> String {
    let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.mtime().max(0) as u64);
    httpdate::fmt_http_date(mtime)
}

const MIME_TABLE: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("svg", "image/svg+xml"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("txt", "text/plain"),
    ("xml", "application/xml"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn content_type(ext: Option<&str>) -> &'static str {
    let ext = ext.map(|e| e.to_ascii_lowercase());
    MIME_TABLE
        .iter()
        .find(|(e, _)| Some(*e) == ext.as_deref())
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

/// `Cache-Control` chosen by file extension: long-lived and immutable for
/// hashed/versioned asset types, short-lived for markup, uncacheable for
/// anything unrecognized.
fn cache_control(ext: Option<&str>) -> &'static str {
    let ext = match ext {
        Some(e) => e.to_ascii_lowercase(),
        None => return "no-cache, no-store, must-revalidate",
    };
    match ext.as_str() {
        "css" | "js" => "public, max-age=86400, must-revalidate",
        "png" | "jpg" | "jpeg" | "gif" | "ico" => "public, max-age=604800, immutable",
        "html" | "htm" => "public, max-age=300, must-revalidate",
        "pdf" | "doc" | "docx" => "public, max-age=86400",
        other if MIME_TABLE.iter().any(|(e, _)| *e == other) => "public, max-age=3600",
        _ => "no-cache, no-store, must-revalidate",
    }
}

/// Splits a comma-separated `If-None-Match` list into individual tags with
/// the weak prefix and surrounding quotes stripped.
fn if_none_match_tags(header: &[u8]) -> impl Iterator<Item = &[u8]> {
    header.split(|&b| b == b',').map(|raw| {
        let mut tag = raw;
        while tag.first() == Some(&b' ') {
            tag = &tag[1..];
        }
        while tag.last() == Some(&b' ') {
            tag = &tag[..tag.len() - 1];
        }
        let tag = tag.strip_prefix(b"W/").unwrap_or(tag);
        tag.strip_prefix(b"\"").and_then(|t| t.strip_suffix(b"\"")).unwrap_or(tag)
    })
}

fn etag_matches(header: &[u8], current_etag: &str) -> bool {
    let current = current_etag.trim_matches('"');
    if_none_match_tags(header).any(|tag| tag == b"*" || tag == current.as_bytes())
}

/// Parses `If-Modified-Since` in any of the three HTTP date formats,
/// treating the parsed value as a UTC instant directly, and reports whether
/// the file is unmodified since.
fn not_modified_since(header: &[u8], mtime: SystemTime) -> bool {
    let Ok(text) = std::str::from_utf8(header) else { return false };
    let Ok(since) = httpdate::parse_http_date(text) else { return false };
    mtime <= since
}

fn add_common_headers(resp: &mut Response, etag_value: &str, last_mod: &str, cache_control_value: &str) {
    resp.header("ETag", etag_value.to_string())
        .header("Last-Modified", last_mod.to_string())
        .header("Cache-Control", cache_control_value.to_string())
        .header("Vary", "Accept-Encoding, User-Agent");
}

/// Serves `req` (GET or HEAD) from `root`, consulting and populating
/// `cache`. Never suspends: all I/O here is a single blocking-but-local
/// `open`/`fstat`/`read` against a regular file already known to exist on
/// the local filesystem.
pub fn serve(req: &Request<'_>, root: &Path, cache: &Cache, head_only: bool) -> Result<Response, NxError> {
    let path = resolve_path(root, req.target())?;
    let path_key = path.to_string_lossy().into_owned();
    let vary = cache::vary_key(req);

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .map_err(NxError::from)?;
    let meta = file.metadata().map_err(NxError::from)?;
    if !meta.is_file() {
        return Err(NxError::Forbidden);
    }

    let etag_value = etag(&meta);
    let last_mod = last_modified(&meta);
    let ext = extension(&path);
    let cache_control_value = cache_control(ext);
    let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.mtime().max(0) as u64);

    if let Some(inm) = req.header(b"If-None-Match") {
        if etag_matches(inm, &etag_value) {
            let mut resp = Response::new(StatusCode::NOT_MODIFIED);
            add_common_headers(&mut resp, &etag_value, &last_mod, cache_control_value);
            return Ok(resp);
        }
    } else if let Some(ims) = req.header(b"If-Modified-Since") {
        if not_modified_since(ims, mtime) {
            let mut resp = Response::new(StatusCode::NOT_MODIFIED);
            add_common_headers(&mut resp, &etag_value, &last_mod, cache_control_value);
            return Ok(resp);
        }
    }

    if let Some(entry) = cache.lookup(&path_key, &vary) {
        let mut resp = Response::new(StatusCode::OK);
        resp.body_cached(entry);
        if head_only {
            resp.drop_body_for_head();
        }
        return Ok(resp);
    }

    let mut resp = Response::new(StatusCode::OK);
    resp.header("Content-Type", content_type(ext));
    add_common_headers(&mut resp, &etag_value, &last_mod, cache_control_value);

    if meta.size() < MAX_CACHEABLE_SIZE {
        let bytes = read_whole_file(file, meta.size() as usize)?;
        if head_only {
            resp.header("Content-Length", bytes.len().to_string());
        } else {
            resp.body_inline(bytes.clone());
            let head = crate::http::response::cacheable_head(&resp);
            cache.insert(&path_key, &vary, head, bytes);
        }
    } else if head_only {
        resp.header("Content-Length", meta.size().to_string());
    } else {
        resp.body_file(file, meta.size());
    }

    if head_only {
        resp.drop_body_for_head();
    }
    Ok(resp)
}

fn read_whole_file(mut file: File, size: usize) -> Result<Vec<u8>, NxError> {
    use std::io::Read;
    let mut buf = Vec::with_capacity(size);
    file.read_to_end(&mut buf).map_err(NxError::from)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_substitutes_index() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, b"/").unwrap(), root.join("index.html"));
    }

    #[test]
    fn resolve_path_joins_target() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, b"/css/app.css").unwrap(), root.join("css/app.css"));
    }

    #[test]
    fn resolve_path_rejects_traversal_above_root() {
        let root = Path::new("/srv/www");
        assert!(matches!(resolve_path(root, b"/../../etc/passwd"), Err(NxError::NotFound)));
    }

    #[test]
    fn resolve_path_collapses_dot_segments() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, b"/./a/../b.html").unwrap(), root.join("b.html"));
    }

    #[test]
    fn resolve_path_rejects_oversize_join() {
        let root = PathBuf::from("/".to_string() + &"a".repeat(PATH_BUFFER));
        assert!(matches!(resolve_path(&root, b"/x"), Err(NxError::TargetTooLong)));
    }

    #[test]
    fn cache_control_by_extension() {
        assert_eq!(cache_control(Some("css")), "public, max-age=86400, must-revalidate");
        assert_eq!(cache_control(Some("png")), "public, max-age=604800, immutable");
        assert_eq!(cache_control(Some("html")), "public, max-age=300, must-revalidate");
        assert_eq!(cache_control(None), "no-cache, no-store, must-revalidate");
        assert_eq!(cache_control(Some("json")), "public, max-age=3600");
    }

    #[test]
    fn if_none_match_strips_weak_prefix_and_quotes() {
        assert!(etag_matches(b"W/\"abc\"", "\"abc\""));
        assert!(etag_matches(b"\"x\", \"abc\"", "\"abc\""));
        assert!(etag_matches(b"*", "\"abc\""));
        assert!(!etag_matches(b"\"other\"", "\"abc\""));
    }
}

use crate::config::FileServerConfig;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use percent_encoding::{AsciiSet, CONTROLS};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Characters a directory-listing entry name must be percent-encoded for
/// before it's safe to drop into an `href` attribute.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Serves a request out of a `file_server` route's configured root.
///
/// Resolves `root || request_path`, rejecting any path that would escape
/// `root` via `..` or a symlink, then either streams the file (optionally
/// gzip-compressed) or renders a directory listing.
pub async fn serve(req: &Request<hyper::body::Incoming>, cfg: &FileServerConfig) -> Response<BoxBody> {
    let accept_gzip = req
        .headers()
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    let request_path = req.uri().path();

    let target = match resolve_path(&cfg.root, request_path) {
        Some(p) => p,
        None => return error_response(StatusCode::NOT_FOUND, "not found"),
    };

    let meta = match tokio::fs::metadata(&target).await {
        Ok(m) => m,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "not found"),
    };

    if meta.is_dir() {
        return serve_directory(&target, request_path, cfg).await;
    }

    serve_file(&target, accept_gzip).await
}

/// Joins `root` and `request_path`, canonicalizing to guard against
/// `..`-escape and symlink traversal outside the configured root.
fn resolve_path(root: &str, request_path: &str) -> Option<PathBuf> {
    let root = Path::new(root);
    let root_canon = root.canonicalize().ok()?;

    let mut joined = root.to_path_buf();
    for comp in Path::new(request_path.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    // Canonicalize what exists; the full path might not (a 404 candidate),
    // so walk up to the nearest existing ancestor to validate containment.
    let mut probe = joined.clone();
    let canon = loop {
        match probe.canonicalize() {
            Ok(c) => break c,
            Err(_) => {
                if !probe.pop() {
                    return None;
                }
            }
        }
    };
    if !canon.starts_with(&root_canon) {
        return None;
    }

    Some(joined)
}

async fn serve_file(path: &Path, accept_gzip: bool) -> Response<BoxBody> {
    let content_type = content_type_for(path);

    if accept_gzip {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(_) => return error_response(StatusCode::NOT_FOUND, "not found"),
        };
        let reader = tokio::io::BufReader::new(file);
        let encoder = async_compression::tokio::bufread::GzipEncoder::new(reader);
        let body = wrap_encoder_as_body(encoder);

        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_ENCODING, "gzip")
            .header(CONNECTION, "close")
            .body(body)
            .unwrap();
    }

    match tokio::fs::read(path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, bytes.len())
            .header(CONNECTION, "close")
            .body(full_body(bytes))
            .unwrap(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn serve_directory(dir: &Path, request_path: &str, cfg: &FileServerConfig) -> Response<BoxBody> {
    if cfg.directory_listing {
        for index in &cfg.index_files {
            let candidate = dir.join(index);
            if tokio::fs::metadata(&candidate).await.map(|m| m.is_file()).unwrap_or(false) {
                return serve_file(&candidate, false).await;
            }
        }
    }

    if !cfg.directory_listing {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }

    match render_listing(dir, request_path).await {
        Ok(html) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html")
            .header(CONNECTION, "close")
            .body(full_body(html))
            .unwrap(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
    modified: u64,
}

async fn render_listing(dir: &Path, request_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(ent) = read_dir.next_entry().await? {
        let meta = ent.metadata().await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        entries.push(Entry {
            name: ent.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified,
        });
    }
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    let escaped_path = escape_html(request_path);
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {escaped_path}</title></head>\n<body>\n<h1>Index of {escaped_path}</h1>\n<table>\n"
    );

    if request_path != "/" {
        let parent = parent_path(request_path);
        let _ = write!(
            html,
            "<tr><td><a href=\"{}\">..</a></td><td>-</td><td>-</td></tr>\n",
            escape_html(&parent)
        );
    }

    for e in &entries {
        let mut href = request_path.to_string();
        if !href.ends_with('/') {
            href.push('/');
        }
        href.push_str(&percent_encoding::utf8_percent_encode(&e.name, PATH_SEGMENT).to_string());
        let size = if e.is_dir { "-".to_string() } else { format_size(e.size) };
        let _ = write!(
            html,
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&href),
            escape_html(&e.name),
            size,
            format_time(e.modified)
        );
    }

    html.push_str("</table>\n</body>\n</html>\n");
    Ok(html)
}

fn parent_path(request_path: &str) -> String {
    let trimmed = request_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = &trimmed[..=idx];
            if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            }
        }
        None => "/".to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size_f = size as f64;
    let mut unit_idx = 0;
    while size_f >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size_f /= 1024.0;
        unit_idx += 1;
    }
    format!("{:.1} {}", size_f, UNITS[unit_idx])
}

fn format_time(unix_secs: u64) -> String {
    let secs_per_day = 86_400i64;
    let days = unix_secs as i64 / secs_per_day;
    let rem = unix_secs as i64 % secs_per_day;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let (y, mo, d) = civil_from_days(days + 719_468);
    format!("{y:04}-{mo:02}-{d:02} {h:02}:{m:02}:{s:02}")
}

/// Howard Hinnant's days-from-civil / civil-from-days algorithm, used here
/// to avoid pulling in a full calendar crate for one timestamp formatter.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z - 60;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => "application/json",
        "xml" => "application/xml",
        "iso" | "exe" | "bin" => "application/octet-stream",
        "htm" | "html" => "text/html",
        "txt" | "log" | "ini" | "cfg" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "css" => "text/css",
        "js" => "application/javascript",
        _ => "application/octet-stream",
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    if status == StatusCode::NOT_FOUND {
        Response::builder().status(status).body(empty_body()).unwrap()
    } else {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain")
            .body(full_body(msg.to_string()))
            .unwrap()
    }
}

fn wrap_encoder_as_body<R>(encoder: R) -> BoxBody
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    use tokio::io::AsyncReadExt;

    let encoder = Box::pin(encoder);
    let stream = futures_util::stream::unfold(encoder, |mut enc| async move {
        let mut buf = vec![0u8; 8192];
        match enc.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(Bytes::from(buf)));
                Some((frame, enc))
            }
            Err(_) => None,
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

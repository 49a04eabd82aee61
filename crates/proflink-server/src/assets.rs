use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Serve one file from the prebuilt dashboard bundle.
///
/// Request paths resolve strictly inside `dir`: each segment must be a plain
/// filename, so encoded traversal attempts die here. Paths without an
/// extension fall back to `index.html`, which lets the dashboard handle its
/// own client-side routes.
pub async fn serve(dir: &Path, raw_path: &str) -> Response {
    let Some(relative) = sanitize(raw_path) else {
        return (StatusCode::NOT_FOUND, "not found\n").into_response();
    };
    let candidate = if relative.as_os_str().is_empty() {
        dir.join("index.html")
    } else {
        dir.join(&relative)
    };

    match read_file(&candidate).await {
        Ok(resp) => resp,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let spa_route = !raw_path.rsplit('/').next().unwrap_or("").contains('.');
            if spa_route {
                match read_file(&dir.join("index.html")).await {
                    Ok(resp) => resp,
                    Err(_) => (StatusCode::NOT_FOUND, "not found\n").into_response(),
                }
            } else {
                (StatusCode::NOT_FOUND, "not found\n").into_response()
            }
        }
        Err(err) => {
            tracing::warn!(path = %candidate.display(), %err, "failed reading asset");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error\n").into_response()
        }
    }
}

async fn read_file(path: &Path) -> Result<Response, std::io::Error> {
    let bytes = tokio::fs::read(path).await?;
    let mime = content_type(&path.to_string_lossy());
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

/// Decode and validate a request path into a relative path under the asset
/// root. Returns None for anything that could step outside it.
fn sanitize(raw_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(raw_path)?;
    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        if segment.is_empty() {
            continue;
        }
        if !is_plain_segment(segment) {
            return None;
        }
        relative.push(segment);
    }
    Some(relative)
}

fn is_plain_segment(segment: &str) -> bool {
    segment != "."
        && segment != ".."
        && !segment.contains('\\')
        && !segment.contains('\0')
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0usize;
    while idx < bytes.len() {
        let byte = bytes[idx];
        if byte == b'%' {
            if idx + 2 >= bytes.len() {
                return None;
            }
            let hi = hex_value(bytes[idx + 1])?;
            let lo = hex_value(bytes[idx + 2])?;
            out.push((hi << 4) | lo);
            idx += 3;
        } else {
            out.push(byte);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn content_type(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if path.ends_with(".js") {
        "text/javascript; charset=utf-8"
    } else if path.ends_with(".css") {
        "text/css; charset=utf-8"
    } else if path.ends_with(".json") {
        "application/json; charset=utf-8"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".ico") {
        "image/x-icon"
    } else if path.ends_with(".woff2") {
        "font/woff2"
    } else if path.ends_with(".woff") {
        "font/woff"
    } else if path.ends_with(".map") {
        "application/json; charset=utf-8"
    } else if path.ends_with(".wasm") {
        "application/wasm"
    } else {
        "application/octet-stream"
    }
}

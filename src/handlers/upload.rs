use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use crate::config::ServerConfig;
use crate::http::response::find_block_end;
use crate::http::HttpResponse;
use crate::server::spool::BodySpool;

#[derive(Debug)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct MultipartForm {
    pub files: Vec<UploadedFile>,
}

/// Splits a `multipart/form-data` body on its boundary. Parts without a
/// filename are form fields and are skipped.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Option<MultipartForm> {
    let boundary = content_type.split("boundary=").nth(1)?.trim();
    if boundary.is_empty() {
        return None;
    }
    let marker = format!("--{}", boundary);
    let marker = marker.as_bytes();

    let mut files = Vec::new();
    let mut start = find_bytes(body, marker, 0)?;

    loop {
        let mut part_start = start + marker.len();
        if body.get(part_start..part_start + 2) == Some(&b"--"[..]) {
            break; // closing boundary
        }
        if body.get(part_start..part_start + 2) == Some(&b"\r\n"[..]) {
            part_start += 2;
        } else if body.get(part_start..part_start + 1) == Some(&b"\n"[..]) {
            part_start += 1;
        }

        let next = match find_bytes(body, marker, part_start) {
            Some(pos) => pos,
            None => break,
        };

        let mut part_end = next;
        if part_end >= 2 && body.get(part_end - 2..part_end) == Some(&b"\r\n"[..]) {
            part_end -= 2;
        } else if part_end >= 1 && body.get(part_end - 1..part_end) == Some(&b"\n"[..]) {
            part_end -= 1;
        }

        if part_start < part_end {
            if let Some(file) = parse_part(&body[part_start..part_end]) {
                files.push(file);
            }
        }
        start = next;
    }

    Some(MultipartForm { files })
}

fn parse_part(part: &[u8]) -> Option<UploadedFile> {
    let (header_end, body_start) = find_block_end(part)?;
    let header_str = std::str::from_utf8(&part[..header_end]).ok()?;
    let data = &part[body_start..];

    let mut field_name = String::new();
    let mut file_name = String::new();
    let mut content_type = String::new();

    for line in header_str.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("content-disposition") {
            if let Some(name) = quoted_value(line, "name=\"") {
                field_name = name;
            }
            if let Some(name) = quoted_value(line, "filename=\"") {
                file_name = name;
            }
        } else if lower.starts_with("content-type") {
            content_type = line.split(':').nth(1)?.trim().to_string();
        }
    }

    if file_name.is_empty() {
        return None;
    }

    Some(UploadedFile { field_name, file_name, content_type, data: data.to_vec() })
}

fn quoted_value(line: &str, key: &str) -> Option<String> {
    let tail = line.split(key).nth(1)?;
    Some(tail.split('"').next()?.to_string())
}

fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start > haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + start)
}

/// Saves every file of a multipart body into the upload directory,
/// creating it (0755) on first use.
pub fn multipart_upload(
    content_type: &str,
    body: &[u8],
    upload_dir: &Path,
    config: &ServerConfig,
) -> HttpResponse {
    let form = match parse_multipart(content_type, body) {
        Some(form) => form,
        None => return HttpResponse::error(400, config),
    };

    if ensure_dir(upload_dir).is_err() {
        return HttpResponse::error(500, config);
    }

    for file in &form.files {
        let target = unique_target(upload_dir, &file.file_name);
        if let Err(err) = std::fs::write(&target, &file.data) {
            error!(target = %target.display(), %err, "failed to save uploaded file");
            return HttpResponse::error(500, config);
        }
        info!(target = %target.display(), bytes = file.data.len(), "file uploaded");
    }

    let mut response = HttpResponse::new(200);
    response.set_content_type("text/html");
    response.set_body(
        b"<html><body><h1>File Upload Successful</h1>\
          <p>Your file(s) have been uploaded successfully.</p></body></html>"
            .to_vec(),
    );
    response
}

/// Single-file upload for locations with an `upload_path`: the spooled
/// body moves into the upload directory under a name derived from the URI
/// tail, or a timestamp when the URI gives none.
pub fn raw_upload(
    spool: Option<BodySpool>,
    upload_dir: &Path,
    url_path: &str,
    config: &ServerConfig,
) -> HttpResponse {
    if ensure_dir(upload_dir).is_err() {
        return HttpResponse::error(500, config);
    }

    let name = match url_path.trim_end_matches('/').rsplit('/').next() {
        Some(tail) if !tail.is_empty() => sanitize_filename(tail),
        _ => format!("upload_{}", epoch_secs()),
    };
    let target = unique_target(upload_dir, &name);

    let moved = match spool {
        Some(spool) => move_spool(spool, &target),
        None => std::fs::write(&target, b""),
    };
    if let Err(err) = moved {
        error!(target = %target.display(), %err, "raw upload failed");
        return HttpResponse::error(500, config);
    }

    info!(target = %target.display(), "file uploaded");
    created_response()
}

/// `application/json` POST: the body lands next to the URI, gaining a
/// `.json` suffix (or a timestamped name when posted to a directory).
/// Responds 201 with a `Location` header for the new resource.
pub fn json_post(
    spool: Option<BodySpool>,
    target: &Path,
    url_path: &str,
    config: &ServerConfig,
) -> HttpResponse {
    let (fs_target, location) = if target.is_dir() || url_path.ends_with('/') {
        let name = format!("post_{}.json", epoch_secs());
        (target.join(&name), format!("{}/{}", url_path.trim_end_matches('/'), name))
    } else if target.extension().is_none() {
        let mut with_ext = target.as_os_str().to_os_string();
        with_ext.push(".json");
        (PathBuf::from(with_ext), format!("{}.json", url_path))
    } else {
        (target.to_path_buf(), url_path.to_string())
    };

    if let Some(parent) = fs_target.parent() {
        if ensure_dir(parent).is_err() {
            return HttpResponse::error(500, config);
        }
    }

    let written = match spool {
        Some(spool) => move_spool(spool, &fs_target),
        None => std::fs::write(&fs_target, b""),
    };
    if written.is_err() {
        return HttpResponse::error(500, config);
    }

    let mut response = created_response();
    response.set_header("Location", &location);
    response
}

/// PUT: the spooled body becomes the target file verbatim.
pub fn put_file(spool: Option<BodySpool>, target: &Path, config: &ServerConfig) -> HttpResponse {
    let written = match spool {
        Some(spool) => move_spool(spool, target),
        None => std::fs::write(target, b""),
    };
    match written {
        Ok(()) => {
            info!(target = %target.display(), "file stored via PUT");
            created_response()
        }
        Err(err) => {
            error!(target = %target.display(), %err, "PUT failed");
            HttpResponse::error(500, config)
        }
    }
}

pub fn delete_file(path: &Path, config: &ServerConfig) -> HttpResponse {
    if !path.exists() {
        return HttpResponse::error(404, config);
    }
    if path.is_dir() {
        return HttpResponse::error(403, config);
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "file deleted");
            let mut response = HttpResponse::new(200);
            response.set_content_type("text/plain");
            response.set_body(b"File deleted successfully".to_vec());
            response
        }
        Err(err) => {
            error!(path = %path.display(), %err, "failed to delete file");
            HttpResponse::error(500, config)
        }
    }
}

fn created_response() -> HttpResponse {
    let mut response = HttpResponse::new(201);
    response.set_content_type("text/plain");
    response.set_body(b"File created successfully\n".to_vec());
    response
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Strips any path components out of a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("upload_{}", epoch_secs()))
}

/// Resolves collisions by appending `_<n>` before the extension.
fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let safe = sanitize_filename(name);
    let mut target = dir.join(&safe);
    let mut counter = 1;
    while target.exists() {
        let next = match safe.rfind('.') {
            Some(dot) if dot > 0 => format!("{}_{}{}", &safe[..dot], counter, &safe[dot..]),
            _ => format!("{}_{}", safe, counter),
        };
        target = dir.join(next);
        counter += 1;
    }
    target
}

/// Moves the finished spool into place, falling back to copy when the
/// temp directory lives on another filesystem.
fn move_spool(spool: BodySpool, target: &Path) -> std::io::Result<()> {
    let source = spool.into_path();
    match std::fs::rename(&source, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(&source, target)?;
            std::fs::remove_file(&source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn unique_tmp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
        dir.push(format!("webserv-upload-test-{}-{}", std::process::id(), nanos));
        dir
    }

    fn multipart_body(boundary: &str) -> Vec<u8> {
        format!(
            "--{b}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello multipart\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"note\"\r\n\r\n\
             just a field\r\n\
             --{b}--\r\n",
            b = boundary
        )
        .into_bytes()
    }

    #[test]
    fn parses_files_and_skips_plain_fields() {
        let body = multipart_body("XBOUND");
        let form = parse_multipart("multipart/form-data; boundary=XBOUND", &body).expect("parse");
        assert_eq!(form.files.len(), 1);
        let file = &form.files[0];
        assert_eq!(file.file_name, "hello.txt");
        assert_eq!(file.field_name, "file");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.data, b"hello multipart");
    }

    #[test]
    fn missing_boundary_is_rejected() {
        assert!(parse_multipart("multipart/form-data", b"x").is_none());
    }

    #[test]
    fn multipart_upload_writes_into_the_directory() {
        let dir = unique_tmp_dir();
        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };

        let body = multipart_body("B42");
        let response = multipart_upload("multipart/form-data; boundary=B42", &body, &dir, &config);
        assert_eq!(response.status(), 200);

        let saved = fs::read(dir.join("hello.txt")).expect("uploaded file");
        assert_eq!(saved, b"hello multipart");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn collisions_gain_numeric_suffixes() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.txt"), b"first").unwrap();

        assert_eq!(unique_target(&dir, "a.txt"), dir.join("a_1.txt"));
        fs::write(dir.join("a_1.txt"), b"second").unwrap();
        assert_eq!(unique_target(&dir, "a.txt"), dir.join("a_2.txt"));
        assert_eq!(unique_target(&dir, "noext"), dir.join("noext"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn filenames_are_reduced_to_basenames() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("plain.txt"), "plain.txt");
    }

    #[test]
    fn raw_upload_moves_the_spool() {
        let dir = unique_tmp_dir();
        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };

        let mut spool = BodySpool::create().unwrap();
        spool.write_all(b"HELLO").unwrap();
        spool.finish().unwrap();
        let spool_path = spool.path().to_path_buf();

        let response = raw_upload(Some(spool), &dir, "/echo", &config);
        assert_eq!(response.status(), 201);
        assert_eq!(fs::read(dir.join("echo")).expect("file"), b"HELLO");
        assert!(!spool_path.exists(), "spool must be consumed");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn json_post_appends_extension_and_location() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };

        let mut spool = BodySpool::create().unwrap();
        spool.write_all(b"{\"a\":1}").unwrap();
        spool.finish().unwrap();

        let target = dir.join("item");
        let response = json_post(Some(spool), &target, "/notes/item", &config);
        assert_eq!(response.status(), 201);
        assert_eq!(response.header("Location"), Some("/notes/item.json"));
        assert_eq!(fs::read(dir.join("item.json")).expect("file"), b"{\"a\":1}");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_semantics() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("f.txt"), b"x").unwrap();
        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };

        assert_eq!(delete_file(&dir.join("f.txt"), &config).status(), 200);
        assert!(!dir.join("f.txt").exists());
        assert_eq!(delete_file(&dir.join("f.txt"), &config).status(), 404);
        assert_eq!(delete_file(&dir.join("sub"), &config).status(), 403);

        fs::remove_dir_all(&dir).ok();
    }
}

use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::config::{LocationConfig, ServerConfig};
use crate::http::response::format_timestamp;
use crate::http::HttpResponse;

/// Compatibility artefact: `/directory/<anything>` serves this file when
/// the index is missing, mirroring the historical tester layout.
const DIRECTORY_FALLBACK_FILE: &str = "youpi.bad_extension";

pub fn serve_file(path: &Path, config: &ServerConfig) -> HttpResponse {
    debug!(path = %path.display(), "serving static file");
    HttpResponse::from_file(&path.to_string_lossy(), config)
}

/// GET on a directory: index file first, then the `/directory/`
/// compatibility fallback, then autoindex, else 403.
pub fn serve_directory(
    dir: &Path,
    url_path: &str,
    location: &LocationConfig,
    config: &ServerConfig,
) -> HttpResponse {
    let index_path = dir.join(config.effective_index(location));
    if index_path.is_file() {
        return serve_file(&index_path, config);
    }

    if url_path.starts_with("/directory/") && url_path != "/directory" {
        let fallback = dir.join(DIRECTORY_FALLBACK_FILE);
        if fallback.is_file() {
            return serve_file(&fallback, config);
        }
        return HttpResponse::error(404, config);
    }

    if !location.autoindex {
        return HttpResponse::error(403, config);
    }

    match directory_listing(dir, url_path) {
        Ok(html) => {
            let mut response = HttpResponse::new(200);
            response.set_content_type("text/html");
            response.set_body(html.into_bytes());
            response
        }
        Err(_) => HttpResponse::error(500, config),
    }
}

/// Renders the autoindex page: parent link (unless root), directories
/// sorted first with a trailing slash, then files with mtime and size.
/// Hyperlinks are relative to the URL path, never the filesystem path.
pub fn directory_listing(dir: &Path, url_path: &str) -> std::io::Result<String> {
    let mut directories = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            directories.push(name);
        } else {
            files.push(name);
        }
    }
    directories.sort();
    files.sort();

    let mut html = String::from("<!DOCTYPE html>\n");
    html.push_str(&format!("<html><head><title>Index of {}</title></head>\n", url_path));
    html.push_str(&format!("<body><h1>Index of {}</h1>\n<hr><pre>\n", url_path));

    if url_path != "/" {
        html.push_str(&format!("<a href=\"{}\">../</a>\n", parent_of(url_path)));
    }

    let base = if url_path.ends_with('/') {
        url_path.to_string()
    } else {
        format!("{}/", url_path)
    };

    for name in &directories {
        html.push_str(&format!("<a href=\"{base}{name}/\">{name}/</a>\n"));
    }

    for name in &files {
        html.push_str(&format!("<a href=\"{base}{name}\">{name}</a>"));
        if let Ok(meta) = std::fs::metadata(dir.join(name)) {
            if let Ok(mtime) = meta.modified().and_then(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            }) {
                html.push_str(&format!("    {}", format_timestamp(mtime.as_secs())));
            }
            html.push_str(&format!("    {} bytes", meta.len()));
        }
        html.push('\n');
    }

    html.push_str("</pre><hr></body></html>\n");
    Ok(html)
}

fn parent_of(url_path: &str) -> String {
    let trimmed = url_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..=pos].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
        dir.push(format!("webserv-static-test-{}-{}", std::process::id(), nanos));
        dir
    }

    #[test]
    fn listing_sorts_directories_before_files() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(dir.join("zeta")).unwrap();
        fs::create_dir_all(dir.join("alpha")).unwrap();
        fs::write(dir.join("b.txt"), b"bb").unwrap();
        fs::write(dir.join("a.txt"), b"a").unwrap();

        let html = directory_listing(&dir, "/files").expect("listing");
        fs::remove_dir_all(&dir).ok();

        assert!(html.contains("<title>Index of /files</title>"));
        assert!(html.contains("<a href=\"/\">../</a>"));

        let alpha = html.find("alpha/").expect("alpha");
        let zeta = html.find("zeta/").expect("zeta");
        let a_txt = html.find("a.txt").expect("a.txt");
        let b_txt = html.find("b.txt").expect("b.txt");
        assert!(alpha < zeta && zeta < a_txt && a_txt < b_txt);

        assert!(html.contains("1 bytes"));
        assert!(html.contains("2 bytes"));
    }

    #[test]
    fn empty_listing_is_still_a_page() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        let html = directory_listing(&dir, "/empty").expect("listing");
        fs::remove_dir_all(&dir).ok();

        assert!(html.contains("Index of /empty"));
        assert!(html.contains("../"));
        assert!(html.ends_with("</pre><hr></body></html>\n"));
    }

    #[test]
    fn root_listing_has_no_parent_link() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        let html = directory_listing(&dir, "/").expect("listing");
        fs::remove_dir_all(&dir).ok();
        assert!(!html.contains("../"));
    }

    #[test]
    fn hrefs_are_url_relative() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("f.txt"), b"x").unwrap();

        let html = directory_listing(&dir, "/deep/path").expect("listing");
        fs::remove_dir_all(&dir).ok();

        assert!(html.contains("<a href=\"/deep/path/sub/\">sub/</a>"));
        assert!(html.contains("<a href=\"/deep/path/f.txt\">f.txt</a>"));
        assert!(html.contains("<a href=\"/deep/\">../</a>"));
    }

    #[test]
    fn directory_with_index_serves_it() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), b"<p>home</p>").unwrap();

        let config = ServerConfig::default();
        let location = config.default_location();
        let response = serve_directory(&dir, "/", &location, &config);
        fs::remove_dir_all(&dir).ok();

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn directory_without_index_or_autoindex_is_forbidden() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();

        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };
        let mut location = config.default_location();
        location.autoindex = false;
        let response = serve_directory(&dir, "/stuff", &location, &config);
        fs::remove_dir_all(&dir).ok();

        assert_eq!(response.status(), 403);
    }

    #[test]
    fn directory_compat_path_serves_fallback_file() {
        let dir = unique_tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DIRECTORY_FALLBACK_FILE), b"youpi").unwrap();

        let config = ServerConfig { error_pages: Default::default(), ..ServerConfig::default() };
        let location = config.default_location();
        let response = serve_directory(&dir, "/directory/nested", &location, &config);
        fs::remove_dir_all(&dir).ok();

        assert_eq!(response.status(), 200);
    }
}

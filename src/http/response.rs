use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ServerConfig;
use crate::http::request::file_extension;

pub const SERVER_SOFTWARE: &str = "webserv/1.0";

/// An outbound response under construction. Serialization always reflects
/// the body length in `Content-Length`; chunked responses are not produced.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    close: bool,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Server".to_string(), SERVER_SOFTWARE.to_string());
        headers.insert("Date".to_string(), http_date_now());
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers,
            body: Vec::new(),
            close: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = reason_phrase(status).to_string();
    }

    pub fn set_status_with_reason(&mut self, status: u16, reason: &str) {
        self.status = status;
        self.reason = reason.to_string();
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_content_type(&mut self, value: &str) {
        self.set_header("Content-Type", value);
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.insert("Content-Length".to_string(), body.len().to_string());
        self.body = body;
    }

    /// Marks the connection for closing once this response is drained.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    pub fn wants_close(&self) -> bool {
        self.close
    }

    /// Wire form. A HEAD response carries the same header block but no
    /// body bytes.
    pub fn to_bytes(&self, head_only: bool) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains_key("Content-Length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        let connection = if self.close { "close" } else { "keep-alive" };
        out.extend_from_slice(format!("Connection: {}\r\n\r\n", connection).as_bytes());
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }

    /// Error response using the configured error page when one is set and
    /// readable, the built-in HTML stub otherwise.
    pub fn error(status: u16, config: &ServerConfig) -> Self {
        let mut response = Self::new(status);
        response.set_content_type("text/html");

        if let Some(page) = config.error_pages.get(&status) {
            if let Ok(content) = std::fs::read(page) {
                response.set_body(content);
                return response;
            }
        }

        response.set_body(error_stub(status).into_bytes());
        response
    }

    /// Serves a file from disk: 404 when absent, 500 when unreadable.
    pub fn from_file(path: &str, config: &ServerConfig) -> Self {
        if !std::path::Path::new(path).is_file() {
            return Self::error(404, config);
        }
        match std::fs::read(path) {
            Ok(content) => {
                let mut response = Self::new(200);
                response.set_content_type(mime_type(&file_extension(path)));
                response.set_body(content);
                response
            }
            Err(_) => Self::error(500, config),
        }
    }

    pub fn redirect(status: u16, url: &str) -> Self {
        let mut response = Self::new(status);
        response.set_header("Location", url);
        response.set_content_type("text/html");
        response.set_body(
            format!(
                "<!DOCTYPE html>\n<html>\n<head><title>{} {}</title></head>\n\
                 <body>\n<h1>{}</h1>\n<p>The document has moved <a href=\"{}\">here</a>.</p>\n</body>\n</html>\n",
                status,
                reason_phrase(status),
                reason_phrase(status),
                url
            )
            .into_bytes(),
        );
        response
    }

    /// Builds a response out of raw CGI output: an optional header block
    /// (`Status:` and `Content-Type:` recognized, anything else passed
    /// through verbatim) followed by the body. Output without a header
    /// block becomes a 200 text/plain body.
    pub fn from_cgi_output(output: &[u8]) -> Self {
        let mut response = Self::new(200);

        let (header_part, body_part) = match find_block_end(output) {
            Some((start, end)) => (&output[..start], &output[end..]),
            None => {
                response.set_content_type("text/plain");
                response.set_body(output.to_vec());
                return response;
            }
        };

        if let Ok(header_str) = std::str::from_utf8(header_part) {
            for line in header_str.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (name, value) = match line.split_once(':') {
                    Some((n, v)) => (n.trim(), v.trim()),
                    None => continue,
                };
                if name.eq_ignore_ascii_case("status") {
                    let mut parts = value.splitn(2, ' ');
                    if let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) {
                        match parts.next() {
                            Some(reason) => response.set_status_with_reason(code, reason.trim()),
                            None => response.set_status(code),
                        }
                    }
                } else if name.eq_ignore_ascii_case("content-length")
                    || name.eq_ignore_ascii_case("connection")
                {
                    // Content-Length is recomputed from the actual body;
                    // Connection is the loop's decision, not the script's.
                } else {
                    response.set_header(name, value);
                }
            }
        }

        if response.header("Content-Type").is_none() {
            response.set_content_type("text/plain");
        }
        response.set_body(body_part.to_vec());
        response
    }
}

/// Locates the `\r\n\r\n` (or `\n\n`) separator; returns (start of
/// separator, first byte after it).
pub fn find_block_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, pos + 2))
}

fn error_stub(status: u16) -> String {
    let message = match status {
        400 => "The request could not be understood.",
        403 => "Access to this resource is forbidden.",
        404 => "The requested resource could not be found.",
        405 => "The request method is not allowed for this resource.",
        413 => "The request payload is too large.",
        500 => "An internal server error occurred.",
        501 => "The requested functionality is not implemented.",
        504 => "The upstream handler did not respond in time.",
        _ => "An error occurred.",
    };
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n    <title>{code} {reason}</title>\n</head>\n\
         <body>\n    <h1>{code} {reason}</h1>\n    <p>{message}</p>\n    <hr>\n    <small>{software}</small>\n</body>\n</html>\n",
        code = status,
        reason = reason_phrase(status),
        message = message,
        software = SERVER_SOFTWARE,
    )
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

pub fn mime_type(extension: &str) -> &'static str {
    match extension {
        ".html" | ".htm" => "text/html",
        ".css" => "text/css",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".xml" => "application/xml",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        ".txt" => "text/plain",
        ".pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Current time as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    http_date(secs)
}

pub fn http_date(epoch_secs: u64) -> String {
    const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let days = (epoch_secs / 86_400) as i64;
    let rem = epoch_secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let weekday = ((days + 4) % 7) as usize;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}

/// `YYYY-MM-DD HH:MM:SS` form used by the directory listing.
pub fn format_timestamp(epoch_secs: u64) -> String {
    let days = (epoch_secs / 86_400) as i64;
    let rem = epoch_secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Gregorian date from a day count since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

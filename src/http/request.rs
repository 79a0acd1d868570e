use std::collections::HashMap;

/// A parsed request header block. Body bytes never live here; they are
/// streamed into the session's spool as they arrive.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Field names lower-cased at parse time.
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Parses a complete header block (request line plus header fields,
    /// including the terminating blank line). Returns `None` on anything
    /// malformed; the caller maps that to 400.
    pub fn parse(block: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(block).ok()?;
        let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r'));

        let request_line = lines.find(|l| !l.trim().is_empty())?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let uri = parts.next()?.to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();
        if parts.next().is_some() {
            return None;
        }
        if method.is_empty() || !method.chars().all(|c| c.is_ascii_uppercase()) {
            return None;
        }
        if !uri.starts_with('/') && uri != "*" {
            return None;
        }
        if !version.starts_with("HTTP/") {
            return None;
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            if name.trim().is_empty() {
                return None;
            }
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Some(Self { method, uri, version, headers })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.to_ascii_lowercase().contains("100-continue"))
            .unwrap_or(false)
    }

    /// Whether the connection must close after this exchange.
    pub fn wants_close(&self) -> bool {
        if let Some(conn) = self.header("connection") {
            let conn = conn.to_ascii_lowercase();
            if conn.contains("close") {
                return true;
            }
            if conn.contains("keep-alive") {
                return false;
            }
        }
        self.version == "HTTP/1.0"
    }

    /// Request path with the query string stripped, percent-decoded.
    pub fn path(&self) -> String {
        let raw = match self.uri.split_once('?') {
            Some((p, _)) => p,
            None => self.uri.as_str(),
        };
        url_decode(raw)
    }

    pub fn query_string(&self) -> &str {
        match self.uri.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }
}

/// Decodes %XX escapes and `+` as space.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(v) => {
                        out.push(v);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lower-cased extension of a path, dot included (".py"); empty when none.
pub fn file_extension(path: &str) -> String {
    let basename = path.rsplit('/').next().unwrap_or(path);
    match basename.rfind('.') {
        Some(pos) if pos > 0 => basename[pos..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

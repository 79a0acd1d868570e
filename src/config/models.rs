use std::collections::BTreeMap;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_KEEPALIVE_TIMEOUT: u64 = 60;
pub const DEFAULT_CGI_TIMEOUT: u64 = 30;

/// One `location` block. Empty strings and a zero max body size mean
/// "inherit from the server block".
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub path: String,
    pub is_regex: bool,
    pub root: String,
    pub index: String,
    pub allowed_methods: Vec<String>,
    pub autoindex: bool,
    pub upload_path: String,
    pub cgi_path: String,
    pub cgi_extension: String,
    pub max_body_size: u64,
    /// code -> target URL; the lowest code wins when several are set.
    pub redirections: BTreeMap<u16, String>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            is_regex: false,
            root: String::new(),
            index: "index.html".to_string(),
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()],
            autoindex: false,
            upload_path: String::new(),
            cgi_path: String::new(),
            cgi_extension: String::new(),
            max_body_size: 0,
            redirections: BTreeMap::new(),
        }
    }
}

impl LocationConfig {
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }
}

/// One `server` block, immutable once parsed.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub root: String,
    pub index: String,
    pub max_body_size: u64,
    pub allowed_methods: Vec<String>,
    pub autoindex: bool,
    pub upload_path: String,
    pub cgi_path: String,
    /// `.ext` -> interpreter path.
    pub cgi_extensions: BTreeMap<String, String>,
    pub error_pages: BTreeMap<u16, String>,
    pub keepalive_timeout: u64,
    pub cgi_timeout: u64,
    pub locations: Vec<LocationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut cgi_extensions = BTreeMap::new();
        cgi_extensions.insert(".php".to_string(), "/usr/bin/php-cgi".to_string());
        cgi_extensions.insert(".py".to_string(), "/usr/bin/python3".to_string());
        cgi_extensions.insert(".pl".to_string(), "/usr/bin/perl".to_string());
        cgi_extensions.insert(".sh".to_string(), "/bin/bash".to_string());

        let mut error_pages = BTreeMap::new();
        for code in [400u16, 403, 404, 500, 502, 504] {
            error_pages.insert(code, format!("www/error/{}.html", code));
        }

        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server_name: "localhost".to_string(),
            root: "www".to_string(),
            index: "index.html".to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()],
            autoindex: false,
            upload_path: "www/uploads".to_string(),
            cgi_path: "www/cgi-bin".to_string(),
            cgi_extensions,
            error_pages,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            cgi_timeout: DEFAULT_CGI_TIMEOUT,
            locations: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Synthesizes the location used when no configured block matches a
    /// URI. `upload_path` stays empty: a plain POST only becomes a raw
    /// upload when a configured location asks for one, while multipart
    /// uploads fall back to the server-wide directory on their own.
    /// `cgi_path` stays empty too — the server-level value names the
    /// script directory, while a location's `cgi_path` is an explicit
    /// interpreter and is honoured verbatim.
    pub fn default_location(&self) -> LocationConfig {
        LocationConfig {
            path: "/".to_string(),
            root: self.root.clone(),
            index: self.index.clone(),
            allowed_methods: self.allowed_methods.clone(),
            autoindex: self.autoindex,
            max_body_size: self.max_body_size,
            ..LocationConfig::default()
        }
    }

    pub fn effective_root<'a>(&'a self, location: &'a LocationConfig) -> &'a str {
        if location.root.is_empty() {
            &self.root
        } else {
            &location.root
        }
    }

    pub fn effective_index<'a>(&'a self, location: &'a LocationConfig) -> &'a str {
        if location.index.is_empty() {
            &self.index
        } else {
            &location.index
        }
    }

    pub fn effective_max_body(&self, location: &LocationConfig) -> u64 {
        if location.max_body_size > 0 {
            location.max_body_size
        } else {
            self.max_body_size
        }
    }

    pub fn interpreter_for(&self, extension: &str) -> Option<&str> {
        self.cgi_extensions.get(extension).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Fallback single-server configuration used when no config file exists.
    pub fn builtin() -> Self {
        Self { servers: vec![ServerConfig::default()] }
    }
}

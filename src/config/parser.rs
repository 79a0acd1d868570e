use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::config::models::{Config, LocationConfig, ServerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads and validates a configuration file.
///
/// A missing file is not fatal: the built-in single-server defaults are
/// used instead, matching the behaviour expected of `webserv` without
/// arguments.
pub fn parse_config(path: &str) -> Result<Config, ConfigError> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, using built-in defaults");
        return Ok(Config::builtin());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;

    let config = parse_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Parses configuration text into server blocks.
pub fn parse_str(content: &str) -> Result<Config, ConfigError> {
    let tokens = tokenize(content);
    let mut cursor = 0usize;
    let mut servers = Vec::new();

    while cursor < tokens.len() {
        match tokens[cursor].as_str() {
            "server" => {
                cursor += 1;
                expect(&tokens, &mut cursor, "{")?;
                servers.push(parse_server(&tokens, &mut cursor)?);
            }
            other => {
                return Err(ConfigError::Syntax(format!(
                    "expected 'server' block, found '{}'",
                    other
                )));
            }
        }
    }

    if servers.is_empty() {
        servers.push(ServerConfig::default());
    }

    Ok(Config { servers })
}

fn tokenize(content: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw_line in content.lines() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let mut word = String::new();
        for ch in line.chars() {
            match ch {
                '{' | '}' | ';' => {
                    if !word.is_empty() {
                        tokens.push(std::mem::take(&mut word));
                    }
                    tokens.push(ch.to_string());
                }
                c if c.is_whitespace() => {
                    if !word.is_empty() {
                        tokens.push(std::mem::take(&mut word));
                    }
                }
                c => word.push(c),
            }
        }
        if !word.is_empty() {
            tokens.push(word);
        }
    }
    tokens
}

fn expect(tokens: &[String], cursor: &mut usize, what: &str) -> Result<(), ConfigError> {
    if tokens.get(*cursor).map(String::as_str) == Some(what) {
        *cursor += 1;
        Ok(())
    } else {
        Err(ConfigError::Syntax(format!(
            "expected '{}', found '{}'",
            what,
            tokens.get(*cursor).map(String::as_str).unwrap_or("<eof>")
        )))
    }
}

/// Collects the arguments of one directive up to the terminating ';'.
fn take_statement(tokens: &[String], cursor: &mut usize) -> Result<Vec<String>, ConfigError> {
    let mut args = Vec::new();
    loop {
        match tokens.get(*cursor).map(String::as_str) {
            Some(";") => {
                *cursor += 1;
                return Ok(args);
            }
            Some("{") | Some("}") | None => {
                return Err(ConfigError::Syntax("unterminated directive (missing ';')".to_string()));
            }
            Some(arg) => {
                args.push(arg.to_string());
                *cursor += 1;
            }
        }
    }
}

fn parse_server(tokens: &[String], cursor: &mut usize) -> Result<ServerConfig, ConfigError> {
    let mut server = ServerConfig::default();

    loop {
        let directive = match tokens.get(*cursor).map(String::as_str) {
            Some("}") => {
                *cursor += 1;
                return Ok(server);
            }
            Some(d) => d.to_string(),
            None => return Err(ConfigError::Syntax("unterminated server block".to_string())),
        };
        *cursor += 1;

        if directive == "location" {
            let location = parse_location(tokens, cursor)?;
            server.locations.push(location);
            continue;
        }

        let args = take_statement(tokens, cursor)?;
        apply_server_directive(&mut server, &directive, &args)?;
    }
}

fn parse_location(tokens: &[String], cursor: &mut usize) -> Result<LocationConfig, ConfigError> {
    let mut location = LocationConfig::default();

    let mut pattern = tokens
        .get(*cursor)
        .cloned()
        .ok_or_else(|| ConfigError::Syntax("location without a path".to_string()))?;
    *cursor += 1;

    if pattern == "~" {
        location.is_regex = true;
        pattern = tokens
            .get(*cursor)
            .cloned()
            .ok_or_else(|| ConfigError::Syntax("regex location without a pattern".to_string()))?;
        *cursor += 1;
    }
    location.path = pattern;

    expect(tokens, cursor, "{")?;

    loop {
        let directive = match tokens.get(*cursor).map(String::as_str) {
            Some("}") => {
                *cursor += 1;
                return Ok(location);
            }
            Some(d) => d.to_string(),
            None => return Err(ConfigError::Syntax("unterminated location block".to_string())),
        };
        *cursor += 1;

        let args = take_statement(tokens, cursor)?;
        apply_location_directive(&mut location, &directive, &args)?;
    }
}

fn apply_server_directive(server: &mut ServerConfig, directive: &str, args: &[String]) -> Result<(), ConfigError> {
    let first = args.first().map(String::as_str).unwrap_or("");
    match directive {
        "listen" => {
            server.port = first
                .parse()
                .map_err(|_| ConfigError::Syntax(format!("invalid listen port '{}'", first)))?;
        }
        "host" => server.host = first.to_string(),
        "server_name" => server.server_name = first.to_string(),
        "root" => server.root = first.to_string(),
        "index" => server.index = first.to_string(),
        "client_max_body_size" | "max_body_size" => {
            server.max_body_size = parse_size(first)?;
        }
        "allow_methods" => server.allowed_methods = args.to_vec(),
        "autoindex" => server.autoindex = first == "on",
        "upload_path" => server.upload_path = first.to_string(),
        "cgi_path" => server.cgi_path = first.to_string(),
        "cgi_extension" => {
            if args.len() < 2 {
                return Err(ConfigError::Syntax("cgi_extension needs <.ext> <interpreter>".to_string()));
            }
            server.cgi_extensions.insert(args[0].clone(), args[1].clone());
        }
        "error_page" => {
            if args.len() < 2 {
                return Err(ConfigError::Syntax("error_page needs <code> <path>".to_string()));
            }
            let code: u16 = args[0]
                .parse()
                .map_err(|_| ConfigError::Syntax(format!("invalid error_page code '{}'", args[0])))?;
            server.error_pages.insert(code, args[1].clone());
        }
        "keepalive_timeout" => {
            server.keepalive_timeout = first
                .parse()
                .map_err(|_| ConfigError::Syntax(format!("invalid keepalive_timeout '{}'", first)))?;
        }
        "cgi_timeout" => {
            server.cgi_timeout = first
                .parse()
                .map_err(|_| ConfigError::Syntax(format!("invalid cgi_timeout '{}'", first)))?;
        }
        other => {
            warn!(directive = other, "ignoring unknown server directive");
        }
    }
    Ok(())
}

fn apply_location_directive(location: &mut LocationConfig, directive: &str, args: &[String]) -> Result<(), ConfigError> {
    let first = args.first().map(String::as_str).unwrap_or("");
    match directive {
        "root" => location.root = first.to_string(),
        "index" => location.index = first.to_string(),
        "allow_methods" => location.allowed_methods = args.to_vec(),
        "autoindex" => location.autoindex = first == "on",
        "upload_path" => location.upload_path = first.to_string(),
        "cgi_path" => location.cgi_path = first.to_string(),
        "cgi_extension" | "cgi_extensions" => location.cgi_extension = first.to_string(),
        "client_max_body_size" | "max_body_size" => {
            location.max_body_size = parse_size(first)?;
        }
        "redirect" => {
            if args.len() < 2 {
                return Err(ConfigError::Syntax("redirect needs <code> <url>".to_string()));
            }
            let code: u16 = args[0]
                .parse()
                .map_err(|_| ConfigError::Syntax(format!("invalid redirect code '{}'", args[0])))?;
            location.redirections.insert(code, args[1].clone());
        }
        other => {
            warn!(directive = other, "ignoring unknown location directive");
        }
    }
    Ok(())
}

/// Parses `<N>[K|M|G]` into bytes.
fn parse_size(value: &str) -> Result<u64, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Syntax("empty size value".to_string()));
    }
    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024u64),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Syntax(format!("invalid size value '{}'", value)))?;
    Ok(n * multiplier)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut endpoints = BTreeSet::new();
    for server in &config.servers {
        if server.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "server '{}' has no valid listen port",
                server.server_name
            )));
        }
        if server.host.is_empty() {
            return Err(ConfigError::Invalid("empty host".to_string()));
        }
        if server.root.is_empty() {
            return Err(ConfigError::Invalid("empty root directory".to_string()));
        }
        if server.host != "localhost" && server.host.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!("invalid host address '{}'", server.host)));
        }
        if !endpoints.insert((server.host.clone(), server.port)) {
            return Err(ConfigError::Invalid(format!(
                "duplicate listen endpoint {}:{}",
                server.host, server.port
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes_with_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("8K").unwrap(), 8192);
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn tokenizer_splits_braces_and_comments() {
        let tokens = tokenize("server { # comment\n listen 8080;\n}");
        assert_eq!(tokens, vec!["server", "{", "listen", "8080", ";", "}"]);
    }

    #[test]
    fn rejects_unterminated_directive() {
        let err = parse_str("server { listen 8080 }").unwrap_err();
        assert!(err.to_string().contains("missing ';'"), "unexpected error: {err}");
    }

    #[test]
    fn rejects_stray_top_level_token() {
        assert!(parse_str("upstream { }").is_err());
    }
}

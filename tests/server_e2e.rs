//! Live-socket tests: each case boots the event loop on its own port and
//! speaks HTTP/1.1 to it over a real TCP connection.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use webserv::config::{Config, LocationConfig, ServerConfig};
use webserv::server::Server;

fn unique_tmp_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
    dir.push(format!("webserv-e2e-{}-{}-{}", tag, std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

fn base_server(port: u16, root: &PathBuf) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        root: root.to_string_lossy().into_owned(),
        allowed_methods: vec![
            "GET".to_string(),
            "POST".to_string(),
            "PUT".to_string(),
            "DELETE".to_string(),
        ],
        error_pages: Default::default(),
        ..ServerConfig::default()
    }
}

/// Boots the loop on a background thread; it dies with the test process.
fn start(config: Config) -> u16 {
    let port = config.servers[0].port;
    thread::spawn(move || {
        let mut server = Server::new(config).expect("server");
        server.bind().expect("bind");
        let _ = server.run();
    });
    port
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server on port {port} never came up");
}

struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn parse_response(raw: &[u8]) -> Response {
    let sep = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header separator");
    let head = std::str::from_utf8(&raw[..sep]).expect("utf8 headers");
    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line.split_whitespace().nth(1).expect("code").parse().expect("numeric code");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Response { status, headers, body: raw[sep + 4..].to_vec() }
}

/// One-shot exchange over a closing connection.
fn roundtrip(port: u16, request: &[u8]) -> Response {
    let mut stream = connect(port);
    stream.write_all(request).expect("send");
    let mut raw = Vec::new();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    stream.read_to_end(&mut raw).expect("receive");
    parse_response(&raw)
}

/// Reads exactly one response (status line + headers + sized body) off a
/// kept-alive connection.
fn read_one_response(stream: &mut TcpStream) -> Response {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let body_start = loop {
        let n = stream.read(&mut buf).expect("read");
        assert!(n > 0, "connection closed before headers were complete");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let partial = parse_response(&raw);
    let content_length: usize = partial
        .headers
        .get("content-length")
        .expect("content-length")
        .parse()
        .expect("numeric length");

    while raw.len() < body_start + content_length {
        let n = stream.read(&mut buf).expect("read body");
        assert!(n > 0, "connection closed mid-body");
        raw.extend_from_slice(&buf[..n]);
    }
    parse_response(&raw[..body_start + content_length])
}

#[test]
fn serves_a_static_file() {
    let root = unique_tmp_dir("static");
    fs::write(root.join("index.html"), b"hello\n").unwrap();

    let port = start(Config { servers: vec![base_server(47311, &root)] });
    let response = roundtrip(
        port,
        b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-length").map(String::as_str), Some("6"));
    assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/html"));
    assert_eq!(response.headers.get("server").map(String::as_str), Some("webserv/1.0"));
    assert!(response.headers.contains_key("date"));
    assert_eq!(response.body, b"hello\n");

    // "/" resolves to root + index.
    let response = roundtrip(port, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello\n");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn head_truncates_the_body() {
    let root = unique_tmp_dir("head");
    fs::write(root.join("index.html"), b"hello\n").unwrap();

    let port = start(Config { servers: vec![base_server(47312, &root)] });
    let response = roundtrip(port, b"HEAD /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-length").map(String::as_str), Some("6"));
    assert!(response.body.is_empty());

    fs::remove_dir_all(&root).ok();
}

#[test]
fn missing_file_is_404() {
    let root = unique_tmp_dir("missing");
    let port = start(Config { servers: vec![base_server(47313, &root)] });
    let response = roundtrip(port, b"GET /nope.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(response.status, 404);
    assert!(!response.body.is_empty());
    fs::remove_dir_all(&root).ok();
}

#[test]
fn malformed_request_line_is_400() {
    let root = unique_tmp_dir("bad");
    let port = start(Config { servers: vec![base_server(47314, &root)] });
    let response = roundtrip(port, b"TOTAL GARBAGE\r\n\r\n");
    assert_eq!(response.status, 400);
    assert_eq!(response.headers.get("connection").map(String::as_str), Some("close"));
    fs::remove_dir_all(&root).ok();
}

#[test]
fn upload_location_stores_sized_bodies() {
    let root = unique_tmp_dir("upload");
    let uploads = root.join("up");

    let mut server = base_server(47315, &root);
    let mut location = LocationConfig::default();
    location.path = "/echo".to_string();
    location.allowed_methods = vec!["POST".to_string()];
    location.upload_path = uploads.to_string_lossy().into_owned();
    server.locations.push(location);

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(
        port,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nHELLO",
    );
    assert_eq!(response.status, 201);

    let stored = fs::read(uploads.join("echo")).expect("uploaded file");
    assert_eq!(stored, b"HELLO");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn upload_location_stores_chunked_bodies() {
    let root = unique_tmp_dir("chunked");
    let uploads = root.join("up");

    let mut server = base_server(47316, &root);
    let mut location = LocationConfig::default();
    location.path = "/up".to_string();
    location.allowed_methods = vec!["POST".to_string()];
    location.upload_path = uploads.to_string_lossy().into_owned();
    server.locations.push(location);

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(
        port,
        b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nHELLO\r\n0\r\n\r\n",
    );
    assert_eq!(response.status, 201);

    let stored = fs::read(uploads.join("up")).expect("uploaded file");
    assert_eq!(stored, b"HELLO");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn oversized_declared_body_is_413_and_closes() {
    let root = unique_tmp_dir("toolarge");
    let mut server = base_server(47317, &root);
    server.max_body_size = 1024 * 1024;

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(
        port,
        b"POST /big HTTP/1.1\r\nHost: x\r\nContent-Length: 2000000\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 413);
    assert_eq!(response.headers.get("connection").map(String::as_str), Some("close"));
    fs::remove_dir_all(&root).ok();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let root = unique_tmp_dir("keepalive");
    fs::write(root.join("index.html"), b"first\n").unwrap();
    fs::write(root.join("two.html"), b"second!\n").unwrap();

    let port = start(Config { servers: vec![base_server(47318, &root)] });
    let mut stream = connect(port);

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let first = read_one_response(&mut stream);
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"first\n");
    assert_eq!(first.headers.get("connection").map(String::as_str), Some("keep-alive"));

    stream
        .write_all(b"GET /two.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let second = read_one_response(&mut stream);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"second!\n");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn put_get_delete_lifecycle() {
    let root = unique_tmp_dir("lifecycle");
    let port = start(Config { servers: vec![base_server(47319, &root)] });

    let put = roundtrip(
        port,
        b"PUT /x.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\nConnection: close\r\n\r\npayload",
    );
    assert_eq!(put.status, 201);

    let get = roundtrip(port, b"GET /x.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(get.status, 200);
    assert_eq!(get.body, b"payload");

    let del = roundtrip(port, b"DELETE /x.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(del.status, 200);

    let gone = roundtrip(port, b"GET /x.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(gone.status, 404);

    fs::remove_dir_all(&root).ok();
}

#[test]
fn autoindex_lists_a_directory() {
    let root = unique_tmp_dir("autoindex");
    fs::create_dir_all(root.join("files")).unwrap();
    fs::write(root.join("files/zz.txt"), b"z").unwrap();

    let mut server = base_server(47320, &root);
    let mut location = LocationConfig::default();
    location.path = "/files".to_string();
    location.root = root.join("files").to_string_lossy().into_owned();
    location.autoindex = true;
    location.allowed_methods = vec!["GET".to_string()];
    server.locations.push(location);

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(port, b"GET /files HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(response.status, 200);
    let html = String::from_utf8(response.body).unwrap();
    assert!(html.contains("Index of /files"), "bad listing: {html}");
    assert!(html.contains("zz.txt"));

    fs::remove_dir_all(&root).ok();
}

#[test]
fn cgi_script_runs_and_returns_output() {
    let root = unique_tmp_dir("cgi");
    fs::write(
        root.join("hello.sh"),
        b"#!/bin/sh\necho \"Content-Type: text/plain\"\necho \"\"\nprintf ok\n",
    )
    .unwrap();

    let mut server = base_server(47321, &root);
    server.cgi_extensions.insert(".sh".to_string(), "/bin/sh".to_string());

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(port, b"GET /hello.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/plain"));
    assert_eq!(response.body, b"ok");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn cgi_receives_the_request_body_on_stdin() {
    let root = unique_tmp_dir("cgistdin");
    fs::write(
        root.join("echo.sh"),
        b"#!/bin/sh\necho \"Content-Type: text/plain\"\necho \"\"\ncat\n",
    )
    .unwrap();

    let mut server = base_server(47322, &root);
    server.cgi_extensions.insert(".sh".to_string(), "/bin/sh".to_string());

    let port = start(Config { servers: vec![server] });
    let response = roundtrip(
        port,
        b"POST /echo.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nConnection: close\r\n\r\nHELLO WORLD",
    );

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"HELLO WORLD");

    fs::remove_dir_all(&root).ok();
}

#[test]
fn concurrent_cgi_requests_all_complete() {
    let root = unique_tmp_dir("cgiherd");
    fs::write(
        root.join("slow.sh"),
        b"#!/bin/sh\nsleep 0.2\necho \"Content-Type: text/plain\"\necho \"\"\nprintf done\n",
    )
    .unwrap();

    let mut server = base_server(47323, &root);
    server.cgi_extensions.insert(".sh".to_string(), "/bin/sh".to_string());

    let port = start(Config { servers: vec![server] });

    // More clients than the CGI concurrency cap; the overflow queues and
    // every client still gets a well-formed response.
    let workers: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                roundtrip(port, b"GET /slow.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            })
        })
        .collect();

    for worker in workers {
        let response = worker.join().expect("client thread");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"done");
    }

    fs::remove_dir_all(&root).ok();
}

#[test]
fn single_byte_delivery_still_parses() {
    let root = unique_tmp_dir("slowloris");
    fs::write(root.join("index.html"), b"ok\n").unwrap();

    let port = start(Config { servers: vec![base_server(47324, &root)] });
    let mut stream = connect(port);

    for &b in b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n" {
        stream.write_all(&[b]).unwrap();
    }
    let mut raw = Vec::new();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.read_to_end(&mut raw).unwrap();
    let response = parse_response(&raw);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok\n");

    fs::remove_dir_all(&root).ok();
}

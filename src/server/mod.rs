pub mod connection;
pub mod router;
pub mod spool;

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::handlers::cgi::{CgiEngine, CgiOutcome, CgiPipes, CgiRequest, StdinProgress, StdoutProgress, Submit};
use crate::handlers::{static_files, upload};
use crate::http::HttpResponse;
use crate::network::poll::{Event, Interest, Poller};
use crate::server::connection::{Connection, ConnectionState, ParseState};
use crate::server::router::Dispatch;

const POLL_TIMEOUT_MS: i32 = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Routes SIGINT/SIGTERM into the loop's shutdown flag and neutralizes
/// SIGPIPE so dead sockets surface as write errors.
pub fn install_signal_handlers() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_shutdown_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Tagged registry entry: revent dispatch goes through this, never
/// through pointers into the session tables.
#[derive(Debug, Clone, Copy)]
enum FdKind {
    Listener,
    Client,
    CgiStdout(u64),
    CgiStdin(u64),
}

struct Listener {
    socket: TcpListener,
    server_idx: usize,
}

pub struct Server {
    poller: Poller,
    config: Config,
    registry: HashMap<RawFd, FdKind>,
    listeners: HashMap<RawFd, Listener>,
    clients: HashMap<RawFd, Connection>,
    cgi: CgiEngine,
}

impl Server {
    pub fn new(config: Config) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            config,
            registry: HashMap::new(),
            listeners: HashMap::new(),
            clients: HashMap::new(),
            cgi: CgiEngine::new(),
        })
    }

    /// Binds one listener per server block. Individual bind failures are
    /// logged and skipped; having no listener at all is fatal.
    pub fn bind(&mut self) -> io::Result<()> {
        for (idx, server) in self.config.servers.iter().enumerate() {
            let host = if server.host == "localhost" { "127.0.0.1" } else { server.host.as_str() };
            let addr = format!("{}:{}", host, server.port);
            match TcpListener::bind(&addr) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    let fd = socket.as_raw_fd();
                    self.poller.add(fd, Interest::READ)?;
                    self.registry.insert(fd, FdKind::Listener);
                    self.listeners.insert(fd, Listener { socket, server_idx: idx });
                    info!(%addr, server = %server.server_name, "listening");
                }
                Err(err) => {
                    error!(%addr, %err, "failed to bind");
                }
            }
        }

        if self.listeners.is_empty() {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no listen endpoint could be bound"));
        }
        Ok(())
    }

    /// The readiness loop. Returns once a shutdown signal is observed.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events: Vec<Event> = Vec::new();
        let mut last_sweep = Instant::now();
        info!("event loop started");

        while !shutdown_requested() {
            if let Err(err) = self.poller.wait(&mut events, POLL_TIMEOUT_MS) {
                error!(%err, "poll failed");
                continue;
            }

            // Listeners before client I/O.
            for i in 0..events.len() {
                let event = events[i];
                if matches!(self.registry.get(&event.fd), Some(FdKind::Listener)) {
                    self.accept_connection(event.fd);
                }
            }

            for i in 0..events.len() {
                let event = events[i];
                match self.registry.get(&event.fd).copied() {
                    Some(FdKind::Listener) | None => {}
                    Some(FdKind::Client) => self.client_event(event),
                    Some(FdKind::CgiStdout(job_id)) => {
                        // A hangup still needs a final read to collect EOF.
                        if event.readable || event.error {
                            self.cgi_stdout_event(job_id);
                        }
                    }
                    Some(FdKind::CgiStdin(job_id)) => {
                        if event.writable || event.error {
                            self.cgi_stdin_event(job_id);
                        }
                    }
                }
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.sweep_timeouts();
                last_sweep = Instant::now();
            }
        }

        info!("shutdown requested, closing");
        self.shutdown();
        Ok(())
    }

    fn accept_connection(&mut self, listener_fd: RawFd) {
        let server_idx = match self.listeners.get(&listener_fd) {
            Some(listener) => listener.server_idx,
            None => return,
        };

        let accepted = match self.listeners.get(&listener_fd).unwrap().socket.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(%err, "accept failed");
                return;
            }
        };

        let (stream, peer) = accepted;
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let _ = stream.set_nodelay(true);

        let fd = stream.into_raw_fd();
        if let Err(err) = self.poller.add(fd, Interest::READ) {
            warn!(fd, %err, "failed to register client");
            unsafe { libc::close(fd) };
            return;
        }

        let peer_addr = peer.ip().to_string();
        debug!(fd, %peer_addr, "client connected");
        self.registry.insert(fd, FdKind::Client);
        self.clients.insert(fd, Connection::new(fd, server_idx, peer_addr));
    }

    fn client_event(&mut self, event: Event) {
        if event.error && !event.readable {
            debug!(fd = event.fd, "client error/hangup");
            self.close_client(event.fd);
            return;
        }
        if event.readable {
            self.client_readable(event.fd);
        }
        // The read side may have torn the session down.
        if event.writable && self.clients.contains_key(&event.fd) {
            self.client_writable(event.fd);
        }
    }

    fn client_readable(&mut self, fd: RawFd) {
        let mut closed = false;
        {
            let conn = match self.clients.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };

            let mut buf = [0u8; READ_CHUNK];
            loop {
                if conn.stop_reading {
                    break;
                }
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
                if n > 0 {
                    conn.touch();
                    if let Err(err) = conn.feed(&buf[..n as usize]) {
                        error!(fd, %err, "spool write failed");
                        closed = true;
                        break;
                    }
                    // Pause at the headers/body boundary: the body-size
                    // limit must be decided before body bytes pile up.
                    if conn.parse_state == ParseState::HeadersComplete {
                        break;
                    }
                } else if n == 0 {
                    debug!(fd, "client closed connection");
                    closed = true;
                    break;
                } else {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    debug!(fd, %err, "read error");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.close_client(fd);
            return;
        }
        self.drive_parser(fd);
    }

    /// Applies the body-size policy at the headers/body boundary and
    /// hands completed requests to the router.
    fn drive_parser(&mut self, fd: RawFd) {
        let limit = {
            let conn = match self.clients.get(&fd) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state != ConnectionState::ReadRequest {
                return;
            }
            match (&conn.parse_state, &conn.request) {
                (ParseState::HeadersComplete, Some(request)) => {
                    let server = &self.config.servers[conn.server_idx];
                    Some(router::effective_body_limit(server, request))
                }
                _ => None,
            }
        };

        if let Some(limit) = limit {
            let conn = self.clients.get_mut(&fd).expect("session vanished");
            if let Err(err) = conn.begin_body(limit) {
                error!(fd, %err, "failed to open body spool");
                self.close_client(fd);
                return;
            }
        }

        let complete = self
            .clients
            .get(&fd)
            .map(|conn| conn.parse_state == ParseState::RequestComplete)
            .unwrap_or(false);
        if complete {
            self.process_request(fd);
        }
    }

    fn process_request(&mut self, fd: RawFd) {
        let (bad_request, over_limit, server_idx) = match self.clients.get_mut(&fd) {
            Some(conn) => {
                conn.touch();
                (conn.bad_request, conn.over_limit, conn.server_idx)
            }
            None => return,
        };

        // Framing errors and 413 both end the connection after the error
        // response; the socket may still hold unread bytes.
        if bad_request || over_limit {
            let code = if bad_request { 400 } else { 413 };
            let server = self.config.servers[server_idx].clone();
            let mut response = HttpResponse::error(code, &server);
            response.set_close();
            self.queue_response(fd, response, false);
            return;
        }

        let (request, spool) = match self.clients.get_mut(&fd) {
            Some(conn) => match conn.request.clone() {
                Some(request) => (request, conn.spool.take()),
                None => return,
            },
            None => return,
        };

        let server = self.config.servers[server_idx].clone();
        let body_len = spool.as_ref().map(|s| s.len()).unwrap_or(0);
        let head_only = request.method == "HEAD";
        let client_close = request.wants_close();

        info!(method = %request.method, uri = %request.uri, fd, "request");

        let response = match router::route(&server, &request, body_len) {
            Dispatch::Error(code) => HttpResponse::error(code, &server),
            Dispatch::Redirect { code, url } => HttpResponse::redirect(code, &url),
            Dispatch::StaticFile { path } => static_files::serve_file(&path, &server),
            Dispatch::Directory { path, url_path, location } => {
                static_files::serve_directory(&path, &url_path, &location, &server)
            }
            Dispatch::MultipartUpload { upload_dir } => {
                let body = spool
                    .as_ref()
                    .map(|s| s.read_to_vec().unwrap_or_default())
                    .unwrap_or_default();
                let content_type = request.header("content-type").unwrap_or("").to_string();
                upload::multipart_upload(&content_type, &body, &upload_dir, &server)
            }
            Dispatch::RawUpload { upload_dir } => {
                upload::raw_upload(spool, &upload_dir, &request.path(), &server)
            }
            Dispatch::JsonPost { target } => upload::json_post(spool, &target, &request.path(), &server),
            Dispatch::Put { target } => upload::put_file(spool, &target, &server),
            Dispatch::Delete { path } => upload::delete_file(&path, &server),
            Dispatch::PostAck => {
                let mut response = HttpResponse::new(200);
                response.set_content_type("text/plain");
                response.set_body(b"POST request received".to_vec());
                response
            }
            Dispatch::Cgi { script, interpreter } => {
                self.dispatch_cgi(fd, script, interpreter, request, spool, server_idx, head_only, &server);
                return;
            }
        };

        let mut response = response;
        if client_close {
            response.set_close();
        }
        // 413 on the routed path closes too: the socket may still hold
        // unread body bytes.
        if response.status() == 413 {
            response.set_close();
        }
        self.queue_response(fd, response, head_only);
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_cgi(
        &mut self,
        fd: RawFd,
        script: std::path::PathBuf,
        interpreter: std::path::PathBuf,
        request: crate::http::HttpRequest,
        spool: Option<spool::BodySpool>,
        server_idx: usize,
        head_only: bool,
        server: &ServerConfig,
    ) {
        let peer_addr = self
            .clients
            .get(&fd)
            .map(|c| c.peer_addr.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let cgi_request = CgiRequest {
            client_fd: fd,
            script,
            interpreter,
            request,
            spool,
            server_idx,
            peer_addr,
            head_only,
        };

        match self.cgi.submit(cgi_request, server) {
            Ok(Submit::Spawned { job_id }) => {
                self.register_cgi_job(job_id);
                if let Some(conn) = self.clients.get_mut(&fd) {
                    conn.state = ConnectionState::CgiPending;
                }
            }
            Ok(Submit::Queued) => {
                if let Some(conn) = self.clients.get_mut(&fd) {
                    conn.state = ConnectionState::CgiPending;
                }
            }
            Err(err) => {
                error!(fd, %err, "CGI spawn failed");
                let response = HttpResponse::error(500, server);
                self.queue_response(fd, response, head_only);
            }
        }
    }

    fn register_cgi_job(&mut self, job_id: u64) {
        let (stdout_fd, stdin_fd) = match self.cgi.job(job_id) {
            Some(job) => (job.stdout_fd(), job.stdin_fd()),
            None => return,
        };

        if let Err(err) = self.poller.add(stdout_fd, Interest::READ) {
            error!(%err, "failed to register CGI stdout");
        } else {
            self.registry.insert(stdout_fd, FdKind::CgiStdout(job_id));
        }
        if let Some(stdin_fd) = stdin_fd {
            if let Err(err) = self.poller.add(stdin_fd, Interest::WRITE) {
                error!(%err, "failed to register CGI stdin");
            } else {
                self.registry.insert(stdin_fd, FdKind::CgiStdin(job_id));
            }
        }
    }

    fn cgi_stdout_event(&mut self, job_id: u64) {
        match self.cgi.on_stdout_readable(job_id) {
            Ok(StdoutProgress::Continue) => {}
            Ok(StdoutProgress::Complete(outcome)) => self.deliver_cgi_outcome(outcome),
            Err(err) => {
                error!(job_id, %err, "CGI stdout read failed");
            }
        }
    }

    fn cgi_stdin_event(&mut self, job_id: u64) {
        match self.cgi.on_stdin_writable(job_id) {
            Ok(StdinProgress::MoreLater) => {}
            Ok(StdinProgress::Done { stdin }) => {
                if let Some(pipe) = stdin {
                    let fd = pipe.as_raw_fd();
                    let _ = self.poller.delete(fd);
                    self.registry.remove(&fd);
                    drop(pipe);
                }
            }
            Err(err) => {
                error!(job_id, %err, "CGI stdin write failed");
            }
        }
    }

    fn release_cgi_pipes(&mut self, pipes: CgiPipes) {
        let stdout_fd = pipes.stdout_fd();
        let _ = self.poller.delete(stdout_fd);
        self.registry.remove(&stdout_fd);
        if let Some(stdin_fd) = pipes.stdin_fd() {
            let _ = self.poller.delete(stdin_fd);
            self.registry.remove(&stdin_fd);
        }
        drop(pipes);
    }

    fn deliver_cgi_outcome(&mut self, outcome: CgiOutcome) {
        let CgiOutcome { client_fd, head_only, close_after, mut response, pipes, .. } = outcome;
        self.release_cgi_pipes(pipes);

        if close_after {
            response.set_close();
        }
        if self.clients.contains_key(&client_fd) {
            self.queue_response(client_fd, response, head_only);
        }

        self.drain_cgi_queue();
    }

    fn drain_cgi_queue(&mut self) {
        let config = &self.config;
        let results = self.cgi.drain_queue(|idx| config.servers[idx].clone());
        for result in results {
            match result {
                Ok(job_id) => self.register_cgi_job(job_id),
                Err((client_fd, server_idx)) => {
                    let server = self.config.servers[server_idx].clone();
                    if self.clients.contains_key(&client_fd) {
                        let response = HttpResponse::error(500, &server);
                        self.queue_response(client_fd, response, false);
                    }
                }
            }
        }
    }

    fn queue_response(&mut self, fd: RawFd, response: HttpResponse, head_only: bool) {
        let close_after = response.wants_close();
        let bytes = response.to_bytes(head_only);
        if let Some(conn) = self.clients.get_mut(&fd) {
            conn.queue_response(bytes, close_after);
            if let Err(err) = self.poller.modify(fd, Interest::WRITE) {
                warn!(fd, %err, "failed to arm write interest");
            }
        }
    }

    fn client_writable(&mut self, fd: RawFd) {
        let mut finished = false;
        let mut closed = false;
        {
            let conn = match self.clients.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };

            while conn.bytes_written < conn.write_buffer.len() {
                let remaining = &conn.write_buffer[conn.bytes_written..];
                let n = unsafe {
                    libc::send(
                        fd,
                        remaining.as_ptr() as *const libc::c_void,
                        remaining.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n > 0 {
                    conn.bytes_written += n as usize;
                    conn.touch();
                } else {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return;
                    }
                    debug!(fd, %err, "write error");
                    closed = true;
                    break;
                }
            }
            if !closed && conn.write_done() {
                finished = true;
            }
        }

        if closed {
            self.close_client(fd);
            return;
        }
        if finished {
            self.response_drained(fd);
        }
    }

    /// The response for request n is fully on the wire: close, or reset
    /// to idle keep-alive and immediately parse any buffered bytes of
    /// request n+1.
    fn response_drained(&mut self, fd: RawFd) {
        let close = match self.clients.get(&fd) {
            Some(conn) => conn.close_after_write,
            None => return,
        };

        if close {
            debug!(fd, "closing after response");
            self.close_client(fd);
            return;
        }

        if let Some(conn) = self.clients.get_mut(&fd) {
            conn.reset_for_next_request();
            if let Err(err) = conn.advance() {
                error!(fd, %err, "parse error on buffered bytes");
                self.close_client(fd);
                return;
            }
        }
        if let Err(err) = self.poller.modify(fd, Interest::READ) {
            warn!(fd, %err, "failed to re-arm read interest");
        }
        self.drive_parser(fd);
    }

    fn close_client(&mut self, fd: RawFd) {
        for pipes in self.cgi.abort_for_client(fd) {
            let stdout_fd = pipes.stdout_fd();
            let _ = self.poller.delete(stdout_fd);
            self.registry.remove(&stdout_fd);
            if let Some(stdin_fd) = pipes.stdin_fd() {
                let _ = self.poller.delete(stdin_fd);
                self.registry.remove(&stdin_fd);
            }
        }

        let _ = self.poller.delete(fd);
        self.registry.remove(&fd);
        // Dropping the session closes the socket and unlinks any spool.
        self.clients.remove(&fd);
    }

    /// Runs every ~5 s: idle keep-alive cutoffs and CGI wall-clock
    /// timeouts, per the owning server's configured values.
    fn sweep_timeouts(&mut self) {
        let idle: Vec<RawFd> = self
            .clients
            .iter()
            .filter(|(_, conn)| {
                conn.state != ConnectionState::CgiPending
                    && conn.last_activity.elapsed().as_secs()
                        > self.config.servers[conn.server_idx].keepalive_timeout
            })
            .map(|(&fd, _)| fd)
            .collect();
        for fd in idle {
            debug!(fd, "idle timeout");
            self.close_client(fd);
        }

        let config = &self.config;
        let outcomes = self.cgi.sweep_timeouts(|idx| config.servers[idx].cgi_timeout);
        for outcome in outcomes {
            self.deliver_cgi_outcome(outcome);
        }
    }

    fn shutdown(&mut self) {
        self.cgi.shutdown();
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.close_client(fd);
        }
        for (fd, _) in self.listeners.drain() {
            let _ = self.poller.delete(fd);
            self.registry.remove(&fd);
        }
        info!("all descriptors released");
    }
}

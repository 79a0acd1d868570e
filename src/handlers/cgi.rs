use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::http::request::HttpRequest;
use crate::http::response::SERVER_SOFTWARE;
use crate::http::HttpResponse;
use crate::network::poll::set_nonblocking;
use crate::server::spool::BodySpool;

pub const MAX_CONCURRENT_CGI_PROCESSES: usize = 5;
const STDIN_CHUNK: usize = 64 * 1024;

/// Everything needed to start one CGI execution. Owns the body spool
/// until the job (or the queue slot) is done with it.
pub struct CgiRequest {
    pub client_fd: RawFd,
    pub script: PathBuf,
    pub interpreter: PathBuf,
    pub request: HttpRequest,
    pub spool: Option<BodySpool>,
    pub server_idx: usize,
    pub peer_addr: String,
    pub head_only: bool,
}

/// One live subprocess with its pipes hooked into the event loop.
pub struct CgiJob {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    pub client_fd: RawFd,
    pub server_idx: usize,
    pub head_only: bool,
    close_after: bool,
    started: Instant,
    output: Vec<u8>,
    spool: Option<BodySpool>,
    spool_reader: Option<File>,
    pending: Vec<u8>,
    pending_off: usize,
}

impl CgiJob {
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|s| s.as_raw_fd())
    }

    /// Size of the body being streamed to the child, if any. The job owns
    /// the spool for its whole lifetime; the file is unlinked when the
    /// job is dismantled.
    pub fn body_len(&self) -> u64 {
        self.spool.as_ref().map(|s| s.len()).unwrap_or(0)
    }
}

pub enum Submit {
    /// Child is running; the returned fds must be registered with the loop.
    Spawned { job_id: u64 },
    /// Concurrency cap reached; the request waits in FIFO order.
    Queued,
}

pub enum StdoutProgress {
    Continue,
    /// Child finished: response ready for the owning client.
    Complete(CgiOutcome),
}

/// Still-open pipe endpoints of a dismantled job. The loop deregisters
/// the fds and only then drops this, so deregistration always precedes
/// `close()`.
pub struct CgiPipes {
    stdout: ChildStdout,
    stdin: Option<ChildStdin>,
}

impl CgiPipes {
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|s| s.as_raw_fd())
    }
}

pub struct CgiOutcome {
    pub client_fd: RawFd,
    pub server_idx: usize,
    pub head_only: bool,
    /// Client asked for `Connection: close` on the originating request.
    pub close_after: bool,
    pub response: HttpResponse,
    pub pipes: CgiPipes,
}

pub enum StdinProgress {
    /// More spool bytes remain; keep write interest.
    MoreLater,
    /// Spool fully fed (or child closed its end). The pipe, when present,
    /// is still open so the loop can deregister it before it closes.
    Done { stdin: Option<ChildStdin> },
}

/// Owns every in-flight CGI subprocess, the concurrency cap, and the
/// overflow queue. The loop's fd registry maps pipe fds back to job ids.
pub struct CgiEngine {
    jobs: HashMap<u64, CgiJob>,
    queue: VecDeque<CgiRequest>,
    next_id: u64,
}

impl CgiEngine {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn live_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn job(&self, id: u64) -> Option<&CgiJob> {
        self.jobs.get(&id)
    }

    /// Spawns the subprocess now or queues the request when the cap is hit.
    pub fn submit(&mut self, request: CgiRequest, config: &ServerConfig) -> io::Result<Submit> {
        if self.jobs.len() >= MAX_CONCURRENT_CGI_PROCESSES {
            debug!(script = %request.script.display(), "CGI cap reached, queueing");
            self.queue.push_back(request);
            return Ok(Submit::Queued);
        }
        let job_id = self.spawn(request, config)?;
        Ok(Submit::Spawned { job_id })
    }

    /// Pops queued work once a slot frees up. Spawn failures surface as an
    /// error outcome for that client; the queue keeps draining.
    pub fn drain_queue(&mut self, config_for: impl Fn(usize) -> ServerConfig) -> Vec<Result<u64, (RawFd, usize)>> {
        let mut started = Vec::new();
        while self.jobs.len() < MAX_CONCURRENT_CGI_PROCESSES {
            let request = match self.queue.pop_front() {
                Some(request) => request,
                None => break,
            };
            let client_fd = request.client_fd;
            let server_idx = request.server_idx;
            let config = config_for(server_idx);
            match self.spawn(request, &config) {
                Ok(job_id) => started.push(Ok(job_id)),
                Err(err) => {
                    warn!(%err, "queued CGI spawn failed");
                    started.push(Err((client_fd, server_idx)));
                }
            }
        }
        started
    }

    fn spawn(&mut self, request: CgiRequest, config: &ServerConfig) -> io::Result<u64> {
        let script_dir = request
            .script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let script_name = request
            .script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CGI script has no filename"))?;

        let env = build_environment(&request, config);

        let mut child = Command::new(&request.interpreter)
            .arg(&script_name)
            .current_dir(&script_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "CGI child without stdout"))?;
        set_nonblocking(stdout.as_raw_fd())?;

        let spool_reader = match request.spool.as_ref() {
            Some(spool) if !spool.is_empty() => {
                let reader = spool.open_reader()?;
                if let Some(pipe) = stdin.as_ref() {
                    set_nonblocking(pipe.as_raw_fd())?;
                }
                Some(reader)
            }
            _ => {
                // No body to feed: close stdin right away so the child
                // sees EOF.
                stdin = None;
                None
            }
        };

        info!(
            pid = child.id(),
            script = %request.script.display(),
            interpreter = %request.interpreter.display(),
            "CGI child started"
        );

        let job = CgiJob {
            child,
            stdin,
            stdout,
            client_fd: request.client_fd,
            server_idx: request.server_idx,
            head_only: request.head_only,
            close_after: request.request.wants_close(),
            started: Instant::now(),
            output: Vec::new(),
            spool: request.spool,
            spool_reader,
            pending: Vec::new(),
            pending_off: 0,
        };

        let job_id = self.next_id;
        self.next_id += 1;
        self.jobs.insert(job_id, job);
        Ok(job_id)
    }

    /// Drains readable CGI output. On EOF the child is reaped, the output
    /// parsed, and the finished job dismantled.
    pub fn on_stdout_readable(&mut self, job_id: u64) -> io::Result<StdoutProgress> {
        let eof = {
            let job = match self.jobs.get_mut(&job_id) {
                Some(job) => job,
                None => return Ok(StdoutProgress::Continue),
            };

            let mut buf = [0u8; 8192];
            loop {
                match job.stdout.read(&mut buf) {
                    Ok(0) => break true,
                    Ok(n) => job.output.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break false,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break true,
                }
            }
        };

        if eof {
            Ok(StdoutProgress::Complete(self.finish(job_id)?))
        } else {
            Ok(StdoutProgress::Continue)
        }
    }

    /// Pushes another spool chunk into the child's stdin.
    pub fn on_stdin_writable(&mut self, job_id: u64) -> io::Result<StdinProgress> {
        let job = match self.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => return Ok(StdinProgress::Done { stdin: None }),
        };
        if job.stdin.is_none() {
            return Ok(StdinProgress::Done { stdin: None });
        }

        loop {
            if job.pending_off >= job.pending.len() {
                // Refill from the spool.
                job.pending.resize(STDIN_CHUNK, 0);
                job.pending_off = 0;
                let read = match job.spool_reader.as_mut() {
                    Some(reader) => reader.read(&mut job.pending)?,
                    None => 0,
                };
                job.pending.truncate(read);
                if read == 0 {
                    break;
                }
            }

            let pipe = match job.stdin.as_mut() {
                Some(pipe) => pipe,
                None => break,
            };
            match pipe.write(&job.pending[job.pending_off..]) {
                Ok(0) => break,
                Ok(n) => job.pending_off += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(StdinProgress::MoreLater),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break, // child closed its end; keep draining stdout
            }
        }

        // Spool exhausted or the child gave up on its stdin: stop feeding.
        let stdin = job.stdin.take();
        job.spool_reader = None;
        Ok(StdinProgress::Done { stdin })
    }

    /// Reaps the child exactly once, parses its output, and removes the
    /// job. The spool drops (and unlinks) here.
    fn finish(&mut self, job_id: u64) -> io::Result<CgiOutcome> {
        let mut job = self.jobs.remove(&job_id).expect("finishing unknown CGI job");

        let status = match job.child.try_wait()? {
            Some(status) => status,
            None => {
                // Output is complete; a child lingering past its own EOF
                // gets collected forcibly.
                let _ = job.child.kill();
                job.child.wait()?
            }
        };

        let response = if status.success() {
            HttpResponse::from_cgi_output(&job.output)
        } else {
            warn!(code = ?status.code(), "CGI child exited with an error");
            let mut error = HttpResponse::new(500);
            error.set_content_type("text/html");
            error.set_body(
                format!(
                    "<html><body><h1>500 Internal Server Error</h1><p>CGI execution failed.</p><hr><small>{}</small></body></html>",
                    SERVER_SOFTWARE
                )
                .into_bytes(),
            );
            error
        };

        info!(client_fd = job.client_fd, status = response.status(), "CGI job complete");

        Ok(CgiOutcome {
            client_fd: job.client_fd,
            server_idx: job.server_idx,
            head_only: job.head_only,
            close_after: job.close_after,
            response,
            pipes: CgiPipes { stdout: job.stdout, stdin: job.stdin },
        })
    }

    /// Kills jobs that outlived the per-server CGI timeout. Each returned
    /// outcome carries a 504 for the owning client.
    pub fn sweep_timeouts(&mut self, timeout_for: impl Fn(usize) -> u64) -> Vec<CgiOutcome> {
        let expired: Vec<u64> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.started.elapsed().as_secs() > timeout_for(job.server_idx))
            .map(|(&id, _)| id)
            .collect();

        let mut outcomes = Vec::new();
        for job_id in expired {
            let mut job = match self.jobs.remove(&job_id) {
                Some(job) => job,
                None => continue,
            };

            warn!(pid = job.child.id(), "CGI timeout, killing child");
            let _ = job.child.kill();
            let _ = job.child.wait();

            let mut response = HttpResponse::new(504);
            response.set_content_type("text/html");
            response.set_body(
                format!(
                    "<html><body><h1>504 Gateway Timeout</h1><p>The upstream handler did not respond in time.</p><hr><small>{}</small></body></html>",
                    SERVER_SOFTWARE
                )
                .into_bytes(),
            );
            response.set_close();

            outcomes.push(CgiOutcome {
                client_fd: job.client_fd,
                server_idx: job.server_idx,
                head_only: job.head_only,
                close_after: job.close_after,
                response,
                pipes: CgiPipes { stdout: job.stdout, stdin: job.stdin },
            });
        }
        outcomes
    }

    /// Forgets jobs owned by a client that vanished mid-flight. The
    /// returned pipes are still open for deregistration.
    pub fn abort_for_client(&mut self, client_fd: RawFd) -> Vec<CgiPipes> {
        let doomed: Vec<u64> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.client_fd == client_fd)
            .map(|(&id, _)| id)
            .collect();

        let mut pipes = Vec::new();
        for job_id in doomed {
            if let Some(mut job) = self.jobs.remove(&job_id) {
                let _ = job.child.kill();
                let _ = job.child.wait();
                pipes.push(CgiPipes { stdout: job.stdout, stdin: job.stdin });
            }
        }
        self.queue.retain(|queued| queued.client_fd != client_fd);
        pipes
    }

    /// Kills everything on shutdown. Spools drop with their jobs.
    pub fn shutdown(&mut self) {
        for (_, mut job) in self.jobs.drain() {
            let _ = job.child.kill();
            let _ = job.child.wait();
        }
        self.queue.clear();
    }
}

/// RFC 3875-subset environment plus `HTTP_*` passthrough of every inbound
/// header.
fn build_environment(request: &CgiRequest, config: &ServerConfig) -> Vec<(String, String)> {
    let script_filename = request
        .script
        .canonicalize()
        .unwrap_or_else(|_| request.script.clone())
        .to_string_lossy()
        .into_owned();
    let script_name = request
        .script
        .file_name()
        .map(|n| format!("/{}", n.to_string_lossy()))
        .unwrap_or_default();
    let content_length = request.spool.as_ref().map(|s| s.len()).unwrap_or(0);

    let mut env = vec![
        ("REQUEST_METHOD".to_string(), request.request.method.clone()),
        ("REQUEST_URI".to_string(), request.request.uri.clone()),
        ("QUERY_STRING".to_string(), request.request.query_string().to_string()),
        (
            "CONTENT_TYPE".to_string(),
            request.request.header("content-type").unwrap_or("").to_string(),
        ),
        ("CONTENT_LENGTH".to_string(), content_length.to_string()),
        ("SERVER_NAME".to_string(), config.server_name.clone()),
        ("SERVER_PORT".to_string(), config.port.to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SCRIPT_NAME".to_string(), script_name),
        ("SCRIPT_FILENAME".to_string(), script_filename),
        ("PATH_INFO".to_string(), String::new()),
        ("PATH_TRANSLATED".to_string(), String::new()),
        ("REMOTE_ADDR".to_string(), request.peer_addr.clone()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
        ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
    ];

    for (name, value) in &request.request.headers {
        let mut env_name = String::with_capacity(5 + name.len());
        env_name.push_str("HTTP_");
        for ch in name.chars() {
            match ch {
                '-' => env_name.push('_'),
                c => env_name.push(c.to_ascii_uppercase()),
            }
        }
        env.push((env_name, value.clone()));
    }

    env
}

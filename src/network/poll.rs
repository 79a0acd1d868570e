use std::io;
use std::os::unix::io::RawFd;

use libc::{epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};

/// Readiness interest for a registered descriptor.
///
/// The poller is strictly level-triggered: a descriptor keeps reporting
/// readiness until it is drained, so short reads and writes are resumed on
/// the next wait without any re-arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    fn events(self) -> u32 {
        let mut ev = libc::EPOLLRDHUP as u32;
        if self.read {
            ev |= libc::EPOLLIN as u32;
        }
        if self.write {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }
}

/// One readiness report out of [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd: fd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest.events())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest.events())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Blocks up to `timeout_ms` and fills `out` with the descriptors that
    /// became ready. EINTR is reported as zero events so the caller's loop
    /// can re-check its shutdown flag.
    pub fn wait(&self, out: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        let mut raw = [epoll_event { events: 0, u64: 0 }; 256];
        let res = unsafe { epoll_wait(self.epoll_fd, raw.as_mut_ptr(), raw.len() as i32, timeout_ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                out.clear();
                return Ok(0);
            }
            return Err(err);
        }

        out.clear();
        for ev in raw.iter().take(res as usize) {
            let flags = ev.events;
            out.push(Event {
                fd: ev.u64 as RawFd,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                error: flags & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            });
        }
        Ok(res as usize)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = epoll_event { events, u64: fd as u64 };
        let res = unsafe { epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Puts an arbitrary descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

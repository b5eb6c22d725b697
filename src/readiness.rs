//! Non-blocking readiness notification (C6, spec §4.5, §5).
//!
//! A thin, level-triggered wrapper around raw `libc::epoll_*` calls, in the
//! same raw-libc idiom the teacher uses for process control
//! (`PR_SET_PDEATHSIG`, `waitpid`, `AsRawFd`/`libc::close` in
//! `tcp-server/src/core.rs`). Grounded in
//! `original_source/src/Server.py`'s `select.epoll()` usage: the source
//! polls one epoll instance registered with every live socket and
//! dispatches strictly on `EPOLLIN`.

use std::io;
use std::os::fd::RawFd;

/// A single ready descriptor, identified by the raw fd it was registered
/// under (used as the `u64` token in `epoll_event.u64`).
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
}

pub struct Epoll {
    epoll_fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    /// Registers `fd` for read-readiness, level-triggered (the epoll
    /// default: no `EPOLLET`).
    pub fn register_read(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event as *mut _)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The event pointer is ignored by EPOLL_CTL_DEL on modern kernels
        // but pre-2.6.9 kernels require a non-null pointer; pass a zeroed
        // one for portability.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event as *mut _)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until at least one registered descriptor is read-ready, or a
    /// signal interrupts the call (`EINTR`, surfaced to the caller so the
    /// readiness loop can check the shutdown flag).
    pub fn wait(&self, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
        out.clear();
        let mut raw: [libc::epoll_event; 64] = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let n = unsafe { libc::epoll_wait(self.epoll_fd, raw.as_mut_ptr(), raw.len() as i32, -1) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in &raw[..n as usize] {
            out.push(ReadyEvent { fd: ev.u64 as RawFd });
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

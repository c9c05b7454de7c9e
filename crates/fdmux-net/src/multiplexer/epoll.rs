//! `epoll(7)` backend (Linux only).
//!
//! The interest set lives in the kernel, so register and deregister are
//! incremental `epoll_ctl` calls and `wait` only returns descriptors whose
//! state changed.  The epoll instance itself is an [`OwnedFd`] and is closed
//! when the multiplexer is dropped.
//!
//! Registrations are level-triggered (no `EPOLLET`) to match the select and
//! poll backends.

#![cfg(target_os = "linux")]

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{timeout_millis, Event, Interest, Multiplexer, Registration, Token};

#[derive(Debug)]
pub struct EpollMultiplexer {
    epoll: OwnedFd,
    registry: BTreeMap<RawFd, (Token, Interest)>,
}

impl EpollMultiplexer {
    /// Creates a new epoll instance with `EPOLL_CLOEXEC`.
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; EPOLL_CLOEXEC is a valid flag.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by epoll_create1 and nothing else owns it.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epoll,
            registry: BTreeMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut bits = 0u32;
        if interest.is_readable() {
            bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if interest.is_writable() {
            bits |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event {
            events: bits,
            u64: token.to_u64(),
        };

        // SAFETY: the epoll fd is owned by self and `event` is a valid,
        // initialised struct on this stack frame.
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Multiplexer for EpollMultiplexer {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.registry.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)?;
        self.registry.insert(fd, (token, interest));
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registry.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not registered"),
            ));
        }

        // SAFETY: EPOLL_CTL_DEL ignores the event pointer (null is allowed
        // since Linux 2.6.9).
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // The kernel drops closed descriptors from the set on its own.
            if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn registrations(&self) -> Vec<Registration> {
        self.registry
            .iter()
            .map(|(&fd, &(token, interest))| Registration {
                fd,
                token,
                interest,
            })
            .collect()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let capacity = self.registry.len().max(1);
        let mut ready = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];

        // SAFETY: `ready` holds `capacity` initialised epoll_event structs and
        // outlives the call; the kernel writes at most `capacity` entries.
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                ready.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_millis(timeout),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let events = ready[..rc as usize]
            .iter()
            .map(|raw| {
                // Copy out of the (possibly packed) struct before use.
                let bits = raw.events;
                let data = raw.u64;
                Event::new(
                    Token::from_u64(data),
                    bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0,
                    bits & libc::EPOLLOUT as u32 != 0,
                    bits & libc::EPOLLHUP as u32 != 0,
                    bits & libc::EPOLLERR as u32 != 0,
                )
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdmux_core::SlotId;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_epoll_round_trips_connection_token() {
        // Arrange
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut mux = EpollMultiplexer::new().unwrap();
        let token = Token::Connection(SlotId::new(7));
        mux.register(a.as_raw_fd(), token, Interest::READABLE).unwrap();

        // Act
        b.write_all(b"hello").unwrap();
        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        // Assert
        assert_eq!(events, vec![Event::readable(token)]);
    }

    #[test]
    fn test_epoll_reports_hangup_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut mux = EpollMultiplexer::new().unwrap();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();

        drop(b);
        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
    }

    #[test]
    fn test_epoll_timeout_returns_no_events() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut mux = EpollMultiplexer::new().unwrap();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();

        assert!(mux.wait(Some(Duration::from_millis(20))).unwrap().is_empty());
    }

    #[test]
    fn test_epoll_deregister_stops_reporting() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut mux = EpollMultiplexer::new().unwrap();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();
        b.write_all(b"x").unwrap();

        mux.deregister(a.as_raw_fd()).unwrap();

        assert!(mux.wait(Some(Duration::from_millis(20))).unwrap().is_empty());
        assert!(mux.registrations().is_empty());
    }
}

//! `poll(2)` backend.
//!
//! Same level-triggered semantics as the select backend, without the
//! `FD_SETSIZE` ceiling.  The `pollfd` array is rebuilt from the registration
//! map on every wait.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{timeout_millis, Event, Interest, Multiplexer, Registration, Token};

#[derive(Debug, Default)]
pub struct PollMultiplexer {
    registry: BTreeMap<RawFd, (Token, Interest)>,
}

impl PollMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poll_flags(interest: Interest) -> libc::c_short {
    let mut flags = 0;
    if interest.is_readable() {
        flags |= libc::POLLIN;
    }
    if interest.is_writable() {
        flags |= libc::POLLOUT;
    }
    flags
}

impl Multiplexer for PollMultiplexer {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.registry.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }
        self.registry.insert(fd, (token, interest));
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registry.remove(&fd).map(|_| ()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not registered"),
            )
        })
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
        let mut fds: Vec<libc::pollfd> = self
            .registry
            .iter()
            .map(|(&fd, &(_, interest))| libc::pollfd {
                fd,
                events: poll_flags(interest),
                revents: 0,
            })
            .collect();

        // SAFETY: `fds` is a valid, initialised array of `fds.len()` pollfd
        // structs that outlives the call.
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
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

        let events = fds
            .iter()
            .filter(|p| p.revents != 0)
            .filter_map(|p| {
                let (token, _) = self.registry.get(&p.fd)?;
                let revents = p.revents;
                Some(Event::new(
                    *token,
                    revents & (libc::POLLIN | libc::POLLPRI) != 0,
                    revents & libc::POLLOUT != 0,
                    revents & libc::POLLHUP != 0,
                    revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                ))
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_reports_readable_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut mux = PollMultiplexer::new();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();
        b.write_all(b"x").unwrap();

        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token::Socket);
        assert!(events[0].readable);
    }

    #[test]
    fn test_poll_reports_peer_close_as_readable() {
        // Arrange
        let (a, b) = UnixStream::pair().unwrap();
        let mut mux = PollMultiplexer::new();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();

        // Act
        drop(b);
        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        // Assert
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
    }

    #[test]
    fn test_poll_is_level_triggered() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut mux = PollMultiplexer::new();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();
        b.write_all(b"unread").unwrap();

        let first = mux.wait(Some(Duration::from_secs(1))).unwrap();
        let second = mux.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_poll_deregistered_descriptor_is_not_reported() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut mux = PollMultiplexer::new();
        mux.register(a.as_raw_fd(), Token::Socket, Interest::READABLE).unwrap();
        b.write_all(b"x").unwrap();

        mux.deregister(a.as_raw_fd()).unwrap();
        let events = mux.wait(Some(Duration::from_millis(20))).unwrap();

        assert!(events.is_empty());
        assert_eq!(
            mux.deregister(a.as_raw_fd()).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}

//! `select(2)` backend.
//!
//! The read and write `fd_set`s are rebuilt from the registration map on
//! every wait, because `select` overwrites them with its result.  The same is
//! true of the `timeval`, which Linux decrements in place.
//!
//! `fd_set` is a fixed-width bitmap, so descriptors at or above
//! `FD_SETSIZE` (1024 on Linux) cannot be watched.  They are rejected at
//! registration time rather than silently corrupting memory in `FD_SET`.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use super::{Event, Interest, Multiplexer, Registration, Token};

/// One past the highest descriptor an `fd_set` can hold.
pub const DESCRIPTOR_LIMIT: usize = libc::FD_SETSIZE as usize;

#[derive(Debug, Default)]
pub struct SelectMultiplexer {
    registry: BTreeMap<RawFd, (Token, Interest)>,
}

impl SelectMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn empty_set() -> libc::fd_set {
    // SAFETY: fd_set is a plain bitmap for which all-zero bytes is a valid
    // (empty) value; FD_ZERO then initialises it the portable way.
    unsafe {
        let mut set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}

impl Multiplexer for SelectMultiplexer {
    fn name(&self) -> &'static str {
        "select"
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if !self.accepts(fd) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} is outside the select range 0..{DESCRIPTOR_LIMIT}"),
            ));
        }
        if self.registry.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }
        self.registry.insert(fd, (token, interest));
        Ok(())
    }

    fn accepts(&self, fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < DESCRIPTOR_LIMIT
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
        let mut read_set = empty_set();
        let mut write_set = empty_set();
        let mut max_fd: RawFd = -1;

        for (&fd, &(_, interest)) in &self.registry {
            // SAFETY: fd was range-checked against FD_SETSIZE in register.
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

        // SAFETY: both sets and the optional timeval live on this stack frame
        // for the whole call; nfds is one past the highest descriptor set.
        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                ptr::null_mut(),
                tv_ptr,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(rc as usize);
        for (&fd, &(token, _)) in &self.registry {
            // SAFETY: the sets were filled in by select above.
            let (readable, writable) =
                unsafe { (libc::FD_ISSET(fd, &read_set), libc::FD_ISSET(fd, &write_set)) };
            if readable || writable {
                events.push(Event::new(token, readable, writable, false, false));
            }
        }
        Ok(events)
    }
}

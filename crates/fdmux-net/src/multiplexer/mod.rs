//! Readiness multiplexing.
//!
//! A [`Multiplexer`] watches a set of descriptors and reports which of them
//! are ready.  Three interchangeable backends implement it:
//!
//! | Backend | Interest storage          | Cost per wait         |
//! |---------|---------------------------|-----------------------|
//! | select  | `fd_set` rebuilt per call | O(highest descriptor) |
//! | poll    | `pollfd` list per call    | O(registered)         |
//! | epoll   | kept in the kernel        | O(ready)              |
//!
//! All three are level-triggered: a descriptor with unread data is reported
//! again on every wait until the data is consumed.  End-of-stream, hang-up
//! and error conditions are always reported as readable so the owner reads,
//! sees the condition, and cleans up.
//!
//! # Tokens
//!
//! Each registration carries a [`Token`] naming the source (console,
//! listener, the single socket of a point-to-point program, or a connection
//! slot).  Events come back tagged with the token, so callers never map raw
//! descriptors back to meaning themselves.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

use fdmux_core::SlotId;
use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod mock;
pub mod poll;
pub mod select;

/// Identifies the source behind a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Console,
    Listener,
    /// The one connected or datagram socket of a client or pair program.
    Socket,
    Connection(SlotId),
}

impl Token {
    const CONNECTION_BASE: u64 = 3;

    /// Packs the token into the 64-bit user data word epoll carries.
    pub fn to_u64(self) -> u64 {
        match self {
            Token::Console => 0,
            Token::Listener => 1,
            Token::Socket => 2,
            Token::Connection(slot) => Self::CONNECTION_BASE + slot.index() as u64,
        }
    }

    pub fn from_u64(raw: u64) -> Self {
        match raw {
            0 => Token::Console,
            1 => Token::Listener,
            2 => Token::Socket,
            n => Token::Connection(SlotId::new((n - Self::CONNECTION_BASE) as usize)),
        }
    }
}

/// Readiness kinds a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }
}

/// One ready source reported by [`Multiplexer::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Event {
    /// Builds an event, folding hang-up and error into readability.
    pub fn new(token: Token, readable: bool, writable: bool, hangup: bool, error: bool) -> Self {
        Self {
            token,
            readable: readable || hangup || error,
            writable,
            hangup,
            error,
        }
    }

    pub fn readable(token: Token) -> Self {
        Self::new(token, true, false, false, false)
    }

    pub fn writable(token: Token) -> Self {
        Self::new(token, false, true, false, false)
    }

    pub fn hangup(token: Token) -> Self {
        Self::new(token, false, false, true, false)
    }
}

/// A descriptor together with its token and interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub fd: RawFd,
    pub token: Token,
    pub interest: Interest,
}

/// The set of registrations the event loop wants for the next wait.
///
/// Built from scratch every iteration and applied with [`Multiplexer::sync`].
#[derive(Debug, Clone, Default)]
pub struct InterestSet {
    entries: Vec<Registration>,
}

impl InterestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fd: RawFd, token: Token, interest: Interest) {
        self.entries.retain(|r| r.fd != fd);
        self.entries.push(Registration {
            fd,
            token,
            interest,
        });
    }

    pub fn get(&self, fd: RawFd) -> Option<&Registration> {
        self.entries.iter().find(|r| r.fd == fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Waits for readiness on a set of registered descriptors.
///
/// The multiplexer never owns the descriptors it watches.  Callers must
/// deregister a descriptor before closing it.
pub trait Multiplexer {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Starts watching `fd`.  Registering an already registered descriptor
    /// fails with [`io::ErrorKind::AlreadyExists`].
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stops watching `fd`.  Unknown descriptors fail with
    /// [`io::ErrorKind::NotFound`].
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Current registrations, in no particular order.
    fn registrations(&self) -> Vec<Registration>;

    /// Returns `false` when `fd` can never be registered with this backend.
    ///
    /// Lets callers turn away a fresh descriptor before it reaches
    /// [`Multiplexer::sync`], where a failure would affect every source.
    fn accepts(&self, fd: RawFd) -> bool {
        fd >= 0
    }

    /// Blocks until at least one registered descriptor is ready or `timeout`
    /// elapses.  `None` waits forever.
    ///
    /// A timeout and an interrupted wait both return an empty list.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>>;

    /// Reconciles the registrations with `wanted`: stale entries are
    /// deregistered, changed entries re-registered, and new ones added.
    fn sync(&mut self, wanted: &InterestSet) -> io::Result<()> {
        let current = self.registrations();
        for reg in &current {
            if wanted.get(reg.fd) != Some(reg) {
                self.deregister(reg.fd)?;
            }
        }
        for reg in wanted.iter() {
            if !current.contains(reg) {
                self.register(reg.fd, reg.token, reg.interest)?;
            }
        }
        Ok(())
    }
}

impl<M: Multiplexer + ?Sized> Multiplexer for Box<M> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        (**self).register(fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        (**self).deregister(fd)
    }

    fn registrations(&self) -> Vec<Registration> {
        (**self).registrations()
    }

    fn accepts(&self, fd: RawFd) -> bool {
        (**self).accepts(fd)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        (**self).wait(timeout)
    }

    fn sync(&mut self, wanted: &InterestSet) -> io::Result<()> {
        (**self).sync(wanted)
    }
}

/// Which multiplexer backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Select,
    #[default]
    Poll,
    Epoll,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Select, BackendKind::Poll, BackendKind::Epoll];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Select => "select",
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
        }
    }

    /// Highest descriptor count the backend can watch, `None` when it is
    /// bounded only by the process limit.
    pub fn descriptor_limit(self) -> Option<usize> {
        match self {
            BackendKind::Select => Some(select::DESCRIPTOR_LIMIT),
            _ => None,
        }
    }

    /// Returns `true` when the backend can be created on this platform.
    pub fn is_supported(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(target_os = "linux"),
            _ => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "select" => Ok(BackendKind::Select),
            "poll" => Ok(BackendKind::Poll),
            "epoll" => Ok(BackendKind::Epoll),
            other => Err(format!(
                "unknown backend `{other}` (expected select, poll, or epoll)"
            )),
        }
    }
}

/// Creates a multiplexer of the requested kind.
///
/// # Errors
///
/// Returns [`io::ErrorKind::Unsupported`] for epoll outside Linux, or the OS
/// error if the kernel object cannot be created.
pub fn create(kind: BackendKind) -> io::Result<Box<dyn Multiplexer>> {
    match kind {
        BackendKind::Select => Ok(Box::new(select::SelectMultiplexer::new())),
        BackendKind::Poll => Ok(Box::new(poll::PollMultiplexer::new())),
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollMultiplexer::new()?)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Epoll => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the epoll backend is only available on Linux",
        )),
    }
}

/// Converts a wait timeout to whole milliseconds for poll and epoll.
///
/// Sub-millisecond remainders round up so a short timeout never becomes a
/// non-blocking poll.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

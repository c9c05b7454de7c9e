//! Scripted multiplexer for unit testing.
//!
//! Lets tests decide exactly what each `wait` returns (events, a timeout, or
//! an error) without relying on kernel timing.  Registrations are tracked the
//! same way the real backends track them, so `sync` behaves identically.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Event, Interest, Multiplexer, Registration, Token};

/// A [`Multiplexer`] whose `wait` results are queued up front by the test.
///
/// When the script runs out, `wait` behaves like a timeout.
#[derive(Debug, Default)]
pub struct ScriptedMultiplexer {
    registry: BTreeMap<RawFd, (Token, Interest)>,
    script: VecDeque<io::Result<Vec<Event>>>,
    waits: Vec<Option<Duration>>,
    sealed: bool,
}

impl ScriptedMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a wait that reports `events`.
    pub fn push_events(&mut self, events: Vec<Event>) -> &mut Self {
        self.script.push_back(Ok(events));
        self
    }

    /// Queues a wait that times out.
    pub fn push_timeout(&mut self) -> &mut Self {
        self.script.push_back(Ok(Vec::new()));
        self
    }

    /// Queues a wait that fails with `kind`.
    pub fn push_error(&mut self, kind: io::ErrorKind) -> &mut Self {
        self.script
            .push_back(Err(io::Error::new(kind, "scripted wait failure")));
        self
    }

    /// From now on refuses every descriptor that is not already registered,
    /// the way `select` refuses anything past `FD_SETSIZE`.
    pub fn seal(&mut self) -> &mut Self {
        self.sealed = true;
        self
    }

    /// Timeouts passed to every `wait` call so far.
    pub fn waits(&self) -> &[Option<Duration>] {
        &self.waits
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registry.values().any(|(t, _)| *t == token)
    }
}

impl Multiplexer for ScriptedMultiplexer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if !self.accepts(fd) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} arrived after the multiplexer was sealed"),
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
        fd >= 0 && (!self.sealed || self.registry.contains_key(&fd))
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
        self.waits.push(timeout);
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::InterestSet;

    #[test]
    fn test_scripted_multiplexer_replays_queue_in_order() {
        // Arrange
        let mut mux = ScriptedMultiplexer::new();
        mux.push_events(vec![Event::readable(Token::Console)])
            .push_timeout()
            .push_error(io::ErrorKind::Other);

        // Act / Assert
        assert_eq!(mux.wait(None).unwrap().len(), 1);
        assert!(mux.wait(None).unwrap().is_empty());
        assert!(mux.wait(None).is_err());
        assert!(mux.wait(Some(Duration::from_secs(5))).unwrap().is_empty());
        assert_eq!(mux.waits().len(), 4);
    }

    #[test]
    fn test_sync_adds_and_removes_registrations() {
        let mut mux = ScriptedMultiplexer::new();
        let mut first = InterestSet::new();
        first.add(3, Token::Console, Interest::READABLE);
        first.add(4, Token::Listener, Interest::READABLE);
        mux.sync(&first).unwrap();

        let mut second = InterestSet::new();
        second.add(4, Token::Listener, Interest::READABLE);
        second.add(9, Token::Socket, Interest::BOTH);
        mux.sync(&second).unwrap();

        assert!(!mux.is_registered(Token::Console));
        assert!(mux.is_registered(Token::Listener));
        assert!(mux.is_registered(Token::Socket));
        assert_eq!(mux.registrations().len(), 2);
    }

    #[test]
    fn test_sealed_multiplexer_refuses_new_descriptors() {
        let mut mux = ScriptedMultiplexer::new();
        mux.register(9, Token::Console, Interest::READABLE).unwrap();

        mux.seal();

        assert!(mux.accepts(9));
        assert!(!mux.accepts(10));
        let err = mux.register(10, Token::Socket, Interest::READABLE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_sync_reregisters_descriptor_with_new_token() {
        // A descriptor number reused by a different source.
        let mut mux = ScriptedMultiplexer::new();
        let mut before = InterestSet::new();
        before.add(7, Token::Socket, Interest::READABLE);
        mux.sync(&before).unwrap();

        let mut after = InterestSet::new();
        after.add(7, Token::Listener, Interest::READABLE);
        mux.sync(&after).unwrap();

        assert_eq!(mux.registrations()[0].token, Token::Listener);
    }
}

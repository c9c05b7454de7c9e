//! Every multiplexer backend must report the same readiness for the same
//! descriptor activity.
//!
//! Each test loops over [`BackendKind::ALL`], skipping backends the platform
//! cannot create, and checks one behaviour on real sockets.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use fdmux_core::SlotId;
use fdmux_net::{create, BackendKind, Interest, InterestSet, Token};

fn supported() -> impl Iterator<Item = BackendKind> {
    BackendKind::ALL.into_iter().filter(|kind| kind.is_supported())
}

#[test]
fn test_timeout_returns_no_events_on_every_backend() {
    for kind in supported() {
        // Arrange
        let mut mux = create(kind).unwrap();
        let (quiet, _peer) = UnixStream::pair().unwrap();
        mux.register(quiet.as_raw_fd(), Token::Socket, Interest::READABLE)
            .unwrap();

        // Act
        let started = Instant::now();
        let events = mux.wait(Some(Duration::from_millis(50))).unwrap();

        // Assert
        assert!(events.is_empty(), "{kind}: {events:?}");
        assert!(started.elapsed() >= Duration::from_millis(40), "{kind} returned early");
    }
}

#[test]
fn test_pending_data_is_readable_with_its_token_on_every_backend() {
    for kind in supported() {
        let mut mux = create(kind).unwrap();
        let (ready, mut writer) = UnixStream::pair().unwrap();
        let (quiet, _other) = UnixStream::pair().unwrap();
        let slot = Token::Connection(SlotId::new(4));
        mux.register(ready.as_raw_fd(), slot, Interest::READABLE)
            .unwrap();
        mux.register(quiet.as_raw_fd(), Token::Console, Interest::READABLE)
            .unwrap();

        writer.write_all(b"x").unwrap();
        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(events.len(), 1, "{kind}: {events:?}");
        assert_eq!(events[0].token, slot, "{kind}");
        assert!(events[0].readable, "{kind}");
    }
}

#[test]
fn test_peer_close_is_readable_on_every_backend() {
    for kind in supported() {
        let mut mux = create(kind).unwrap();
        let (watched, peer) = UnixStream::pair().unwrap();
        mux.register(watched.as_raw_fd(), Token::Socket, Interest::READABLE)
            .unwrap();

        drop(peer);
        let events = mux.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(events.len(), 1, "{kind}: {events:?}");
        assert!(events[0].readable, "{kind}");
    }
}

#[test]
fn test_sync_tracks_interest_set_on_every_backend() {
    for kind in supported() {
        // Arrange
        let mut mux = create(kind).unwrap();
        let (a, _pa) = UnixStream::pair().unwrap();
        let (b, _pb) = UnixStream::pair().unwrap();
        let mut wanted = InterestSet::new();
        wanted.add(a.as_raw_fd(), Token::Console, Interest::READABLE);
        wanted.add(b.as_raw_fd(), Token::Socket, Interest::READABLE);
        mux.sync(&wanted).unwrap();

        // Act
        let mut shrunk = InterestSet::new();
        shrunk.add(b.as_raw_fd(), Token::Socket, Interest::READABLE);
        mux.sync(&shrunk).unwrap();

        // Assert
        let regs = mux.registrations();
        assert_eq!(regs.len(), 1, "{kind}");
        assert_eq!(regs[0].fd, b.as_raw_fd(), "{kind}");
    }
}

#[test]
fn test_deregistered_descriptor_is_not_reported_on_every_backend() {
    for kind in supported() {
        let mut mux = create(kind).unwrap();
        let (watched, mut writer) = UnixStream::pair().unwrap();
        mux.register(watched.as_raw_fd(), Token::Socket, Interest::READABLE)
            .unwrap();
        mux.deregister(watched.as_raw_fd()).unwrap();

        writer.write_all(b"x").unwrap();
        let events = mux.wait(Some(Duration::from_millis(20))).unwrap();

        assert!(events.is_empty(), "{kind}: {events:?}");
    }
}

//! Poll driver: a set of registered descriptors with readiness events, plus
//! the blocking wait that turns OS readiness into the snapshot the event
//! loop dispatches over.
//!
//! Backed by `mio`. `wait` blocks with an infinite timeout and returns a
//! plain `Vec` copy of what was ready, so a handler may add or remove
//! descriptors from the live set mid-dispatch without perturbing the
//! in-flight iteration.

use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Socket, Type};
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

pub use mio::event::Source;

/// One descriptor's readiness, copied out of `mio::Events` so it outlives
/// the poll call that produced it.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    /// Hangup or error without a matching readable bit: the event loop must
    /// close this descriptor.
    pub closed: bool,
}

pub struct SocketSet {
    poll: Poll,
    events: Events,
    registered: BTreeSet<usize>,
}

impl SocketSet {
    pub fn new(event_capacity: usize) -> io::Result<SocketSet> {
        Ok(SocketSet {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            registered: BTreeSet::new(),
        })
    }

    /// Registers `source` under `token` for readable (and, for not-yet-
    /// connected outbound sockets, writable) interest.
    pub fn add<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)?;
        self.registered.insert(token.0);
        Ok(())
    }

    pub fn remove<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        // deregister can fail harmlessly if the socket already closed itself
        // out from under the registry; the token bookkeeping still clears.
        let _ = self.poll.registry().deregister(source);
        self.registered.remove(&token.0);
        Ok(())
    }

    /// Tokens currently registered, in ascending order. Used for the `-d`
    /// L2 descriptor-list diagnostic.
    pub fn snapshot(&self) -> Vec<Token> {
        self.registered.iter().map(|&t| Token(t)).collect()
    }

    /// The underlying `mio::Registry`, needed to construct a `mio::Waker`
    /// that can interrupt an in-progress `wait()` from a signal handler.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Blocks with an infinite timeout until at least one descriptor is
    /// ready, then returns an owned copy of that ready set.
    pub fn wait(&mut self) -> io::Result<Vec<ReadyEvent>> {
        self.events.clear();
        self.poll.poll(&mut self.events, None)?;

        Ok(self
            .events
            .iter()
            .map(|e| ReadyEvent {
                token: e.token(),
                readable: e.is_readable(),
                closed: (e.is_read_closed() || e.is_error() || e.is_write_closed()) && !e.is_readable(),
            })
            .collect())
    }
}

/// Binds a listener with `SO_REUSEADDR` and the requested backlog, mirroring
/// `Tcp_Reuse_Addr`/`Listen` around a raw socket.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Reads until `buf` is completely filled or the peer sends EOF, blocking
/// the caller (via a scoped, single-socket poll) across `WouldBlock`
/// results from the underlying non-blocking socket. This keeps the
/// tunnel's header-then-payload reads behaving as one logical reader
/// despite every socket being non-blocking under mio.
pub fn read_fill_blocking<S: Read + Source>(source: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => block_until(source, Interest::READABLE)?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes the full buffer, retrying on partial writes until it drains.
pub fn write_all_blocking<S: Write + Source>(source: &mut S, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match source.write(&buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => block_until(source, Interest::WRITABLE)?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn block_until<S: Source>(source: &mut S, interest: Interest) -> io::Result<()> {
    let mut poll = Poll::new()?;
    poll.registry().register(source, Token(0), interest)?;
    let mut events = Events::with_capacity(1);
    poll.poll(&mut events, None)?;
    let _ = poll.registry().deregister(source);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::net::SocketAddr;

    #[test]
    fn wait_reports_listener_readiness_on_connect() {
        let mut set = SocketSet::new(16).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local_addr = listener.local_addr().unwrap();

        set.add(&mut listener, Token(0), Interest::READABLE).unwrap();

        let _client = TcpStream::connect(local_addr).unwrap();

        let ready = set.wait().unwrap();
        assert!(ready.iter().any(|e| e.token == Token(0) && e.readable));
    }

    #[test]
    fn snapshot_reflects_add_and_remove() {
        let mut set = SocketSet::new(16).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();

        set.add(&mut listener, Token(5), Interest::READABLE).unwrap();
        assert_eq!(set.snapshot(), vec![Token(5)]);

        set.remove(&mut listener, Token(5)).unwrap();
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn bind_listener_accepts_with_requested_backlog() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = bind_listener(addr, 16).unwrap();
        let local_addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(local_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (mut server_side, _) = listener.accept().unwrap();

        write_all_blocking(&mut client, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = read_fill_blocking(&mut server_side, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_fill_blocking_reports_short_read_on_eof() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local_addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(local_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (mut server_side, _) = listener.accept().unwrap();
        drop(client);

        let mut buf = [0u8; 10];
        let n = read_fill_blocking(&mut server_side, &mut buf).unwrap();
        assert_eq!(n, 0);
    }
}

//! `local-buddy`'s policy: the side that lives next to the developer's
//! workstation. Its listener does double duty — it is where a remote-buddy
//! tunnel dials in with a `HELLO`, and where a local client (a DB console,
//! say) dials in wanting traffic carried to whatever remote-buddy has on
//! the other end. A socket is "unclassified" until its first bytes settle
//! which of those two things it is.
//!
//! A single local-buddy can hold more than one live tunnel at once, so flows
//! are scoped per tunnel (`ConnectionInfo`) rather than globally.

use crate::buffer::RecvBuffer;
use crate::cli::Args;
use crate::error::{Error, Result};
use crate::flowid::{FlowId, FlowIdAllocator};
use crate::frame::{self, read_tunnel_frame, Command, Header, RawHeader};
use crate::gate::{AlwaysOpenGate, Http100ContinueGate, PipelineGate};
use crate::logging::hex_dump;
use crate::shutdown::{ShutdownHandle, WAKER_TOKEN};
use crate::socketset::{bind_listener, write_all_blocking, ReadyEvent, SocketSet};
use mio::net::TcpStream;
use mio::{Interest, Token};
use slog::Logger;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const PENDING_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn token_of(id: FlowId) -> Token {
    Token(id as usize)
}

fn flow_of(token: Token) -> Option<FlowId> {
    if token.0 <= i16::MAX as usize {
        Some(token.0 as FlowId)
    } else {
        None
    }
}

/// Bookkeeping for one flow multiplexed over a tunnel: the peer's flow id
/// (once learned), the pipelining gate appropriate to its command kind, and
/// any bytes withheld from the locally-dialed endpoint while that gate is
/// shut.
struct FlowState {
    kind: Command,
    peer: Option<FlowId>,
    gate: Box<dyn PipelineGate>,
    held: Vec<u8>,
}

impl FlowState {
    fn new(kind: Command, peer: Option<FlowId>) -> FlowState {
        let gate: Box<dyn PipelineGate> = match kind {
            Command::CliConnect => Box::new(Http100ContinueGate::new()),
            _ => Box::new(AlwaysOpenGate),
        };
        FlowState { kind, peer, gate, held: Vec::new() }
    }
}

/// Everything local-buddy knows about one tunnel: the ip/port remote-buddy
/// declared at `HELLO`, and the flows currently multiplexed over it, keyed
/// by local-buddy's own flow id for each.
struct ConnectionInfo {
    declared_ip: String,
    declared_port: u16,
    flows: HashMap<FlowId, FlowState>,
    /// Client source IPs this tunnel has already been asked to carry.
    /// Used by `select_tunnel_for` so repeat connections from the same
    /// client keep landing on the tunnel that has served them before.
    claimed_ips: std::collections::HashSet<String>,
}

impl ConnectionInfo {
    fn new(declared_ip: String, declared_port: u16) -> ConnectionInfo {
        ConnectionInfo {
            declared_ip,
            declared_port,
            flows: HashMap::new(),
            claimed_ips: std::collections::HashSet::new(),
        }
    }
}

pub struct LocalBuddy {
    listener: mio::net::TcpListener,
    sockets: HashMap<FlowId, TcpStream>,
    tunnels: HashMap<FlowId, ConnectionInfo>,
    /// Source IP recorded for every live, non-tunnel socket, keyed by its
    /// flow id — used for diagnostics and for `select_tunnel_for`.
    fdip: HashMap<FlowId, String>,
    /// Accepted sockets not yet classified as tunnel or flow, with the
    /// instant they were accepted so idle ones can be reaped.
    pending: HashMap<FlowId, Instant>,
    allocator: FlowIdAllocator,
    socketset: SocketSet,
    shutdown: ShutdownHandle,
    logger: Logger,
    recv_buf: RecvBuffer,
    l1: bool,
    l2: bool,
    l3: bool,
}

impl LocalBuddy {
    pub fn new(listen_addr: SocketAddr, backlog: u32, logger: Logger, args: &Args) -> Result<LocalBuddy> {
        let mut listener = bind_listener(listen_addr, backlog).map_err(Error::Startup)?;
        let mut socketset = SocketSet::new(1024).map_err(Error::Startup)?;
        socketset
            .add(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Startup)?;
        let shutdown = ShutdownHandle::install(socketset.registry()).map_err(Error::Startup)?;

        let buffer_size = args.buffer_size.unwrap_or(4096);
        Ok(LocalBuddy {
            listener,
            sockets: HashMap::new(),
            tunnels: HashMap::new(),
            fdip: HashMap::new(),
            pending: HashMap::new(),
            allocator: FlowIdAllocator::new(),
            socketset,
            shutdown,
            logger,
            recv_buf: RecvBuffer::with_capacity(buffer_size),
            l1: args.l1(),
            l2: args.l2(),
            l3: args.l3(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            self.evict_stale_pending();

            if self.l2 {
                slog::trace!(self.logger, "descriptor set";
                    "tokens" => crate::logging::fmt_tokens(&self.socketset.snapshot()));
            }

            let ready = self.socketset.wait().map_err(Error::SocketIo)?;

            if self.shutdown.requested() {
                slog::info!(self.logger, "shutdown requested, closing all flows");
                self.close_everything();
                return Ok(());
            }

            for event in ready {
                if event.token == WAKER_TOKEN {
                    continue;
                }
                if let Err(e) = self.dispatch(event) {
                    slog::warn!(self.logger, "dispatch failed"; "error" => %e);
                }
            }
        }
    }

    fn dispatch(&mut self, event: ReadyEvent) -> Result<()> {
        if event.token == LISTENER_TOKEN {
            return self.accept_loop();
        }

        let id = match flow_of(event.token) {
            Some(id) => id,
            None => return Ok(()),
        };

        if event.closed {
            self.handle_closed(id);
            return Ok(());
        }

        if !event.readable {
            return Ok(());
        }

        if self.tunnels.contains_key(&id) {
            return self.handle_tunnel_readable(id);
        }

        if self.pending.contains_key(&id) {
            return self.handle_unclassified_readable(id);
        }

        self.handle_endpoint_readable(id)
    }

    fn accept_loop(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let id = self.allocator.allocate()?;
                    self.socketset
                        .add(&mut stream, token_of(id), Interest::READABLE)
                        .map_err(Error::SocketIo)?;
                    self.fdip.insert(id, peer_addr.ip().to_string());
                    self.pending.insert(id, Instant::now());
                    self.sockets.insert(id, stream);
                    if self.l1 {
                        slog::info!(self.logger, "accepted connection"; "flow" => id, "peer" => %peer_addr);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::SocketIo(e)),
            }
        }
        Ok(())
    }

    fn evict_stale_pending(&mut self) {
        let now = Instant::now();
        let stale: Vec<FlowId> = self
            .pending
            .iter()
            .filter(|(_, &since)| now.duration_since(since) >= PENDING_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();

        for id in stale {
            if self.l1 {
                slog::info!(self.logger, "evicting idle unclassified socket"; "flow" => id);
            }
            self.drop_socket(id);
            self.pending.remove(&id);
        }
    }

    /// A socket with no application meaning left: released from every map
    /// and deregistered, without any protocol frame sent.
    fn drop_socket(&mut self, id: FlowId) {
        if let Some(mut stream) = self.sockets.remove(&id) {
            let _ = self.socketset.remove(&mut stream, token_of(id));
        }
        self.fdip.remove(&id);
        self.allocator.release(id);
    }

    fn handle_closed(&mut self, id: FlowId) {
        if self.tunnels.contains_key(&id) {
            self.teardown_tunnel(id);
            return;
        }
        if self.pending.remove(&id).is_some() {
            self.drop_socket(id);
            return;
        }
        if let Some(tunnel) = self.owning_tunnel(id) {
            self.close_flow(tunnel, id, false);
        } else {
            self.drop_socket(id);
        }
    }

    fn owning_tunnel(&self, local_id: FlowId) -> Option<FlowId> {
        self.tunnels
            .iter()
            .find(|(_, info)| info.flows.contains_key(&local_id))
            .map(|(&tunnel, _)| tunnel)
    }

    fn handle_unclassified_readable(&mut self, id: FlowId) -> Result<()> {
        let first_read = {
            let stream = self.sockets.get_mut(&id).expect("pending socket present");
            match self.recv_buf.fill_once(stream) {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    slog::warn!(self.logger, "read failed on unclassified socket"; "flow" => id, "error" => %e);
                    Vec::new()
                }
            }
        };

        if first_read.is_empty() {
            self.pending.remove(&id);
            self.drop_socket(id);
            return Ok(());
        }

        if !Header::looks_like_intap(&first_read) {
            return self.promote_to_flow(id, first_read);
        }

        self.promote_to_tunnel(id, first_read)
    }

    /// Finishes reading a header (and payload, if it is `HELLO`) that began
    /// with the INTAP signature, then registers the socket as a tunnel.
    fn promote_to_tunnel(&mut self, id: FlowId, mut prefix: Vec<u8>) -> Result<()> {
        while prefix.len() < frame::HEADER_LEN {
            let stream = self.sockets.get_mut(&id).expect("pending socket present");
            let mut one = [0u8; 1];
            if crate::socketset::read_fill_blocking(stream, &mut one).map_err(Error::SocketIo)? == 0 {
                self.pending.remove(&id);
                self.drop_socket(id);
                return Ok(());
            }
            prefix.push(one[0]);
        }

        let mut raw = [0u8; frame::HEADER_LEN];
        raw.copy_from_slice(&prefix[..frame::HEADER_LEN]);
        let header = RawHeader::parse(&raw);

        let mut payload = prefix.split_off(frame::HEADER_LEN);
        if (payload.len() as u32) < header.buf_len {
            let stream = self.sockets.get_mut(&id).expect("pending socket present");
            let want = header.buf_len as usize - payload.len();
            let mut rest = vec![0u8; want];
            let got = crate::socketset::read_fill_blocking(stream, &mut rest).map_err(Error::SocketIo)?;
            rest.truncate(got);
            payload.extend_from_slice(&rest);
        }

        if header.command() != Some(Command::Hello) {
            slog::warn!(self.logger, "unclassified socket did not open with HELLO"; "flow" => id);
            self.pending.remove(&id);
            self.drop_socket(id);
            return Ok(());
        }

        self.pending.remove(&id);
        self.tunnels.insert(id, ConnectionInfo::new(header.ip_str(), header.port));
        slog::info!(self.logger, "tunnel established"; "flow" => id, "declared_ip" => header.ip_str());

        let ack = Header::new(Command::Hello, id, -1);
        if let Some(stream) = self.sockets.get_mut(&id) {
            let _ = write_all_blocking(stream, &frame::encode_frame(&ack, &[]));
        }
        Ok(())
    }

    /// An unclassified socket whose first bytes were ordinary application
    /// data: find it a tunnel and open a `DB_CONNECT` flow for it.
    fn promote_to_flow(&mut self, id: FlowId, first_bytes: Vec<u8>) -> Result<()> {
        let origin_ip = self.fdip.get(&id).cloned().unwrap_or_default();
        self.pending.remove(&id);

        let tunnel = match self.select_tunnel_for(&origin_ip) {
            Some(t) => t,
            None => {
                slog::warn!(self.logger, "no tunnel available for client"; "peer" => %origin_ip);
                self.drop_socket(id);
                return Err(Error::RoutingMiss { origin_ip });
            }
        };

        let info = self.tunnels.get_mut(&tunnel).expect("selected tunnel exists");
        info.flows.insert(id, FlowState::new(Command::DbConnect, None));

        let header = Header::new(Command::DbConnect, id, -1).with_buf_len(first_bytes.len() as u32);
        let frame = frame::encode_frame(&header, &first_bytes);
        let tunnel_stream = self.sockets.get_mut(&tunnel).expect("tunnel socket present");
        write_all_blocking(tunnel_stream, &frame).map_err(Error::SocketIo)?;

        if self.l1 {
            slog::info!(self.logger, "opened db flow"; "flow" => id, "tunnel" => tunnel);
        }
        Ok(())
    }

    /// Exact match against a tunnel that has already served this IP, else
    /// the first tunnel nobody has claimed yet.
    fn select_tunnel_for(&mut self, origin_ip: &str) -> Option<FlowId> {
        if let Some((&tunnel, _)) = self.tunnels.iter().find(|(_, info)| info.claimed_ips.contains(origin_ip)) {
            return Some(tunnel);
        }

        let claim = self.tunnels.iter().find(|(_, info)| info.claimed_ips.is_empty()).map(|(&t, _)| t);
        if let Some(tunnel) = claim {
            self.tunnels.get_mut(&tunnel).unwrap().claimed_ips.insert(origin_ip.to_string());
            return Some(tunnel);
        }

        self.tunnels.keys().next().copied()
    }

    fn handle_tunnel_readable(&mut self, tunnel: FlowId) -> Result<()> {
        let frame = {
            let stream = self.sockets.get_mut(&tunnel).expect("tunnel socket present");
            read_tunnel_frame(stream).map_err(Error::SocketIo)?
        };

        let (header, payload) = match frame {
            Some(f) => f,
            None => {
                slog::info!(self.logger, "tunnel closed"; "flow" => tunnel);
                self.teardown_tunnel(tunnel);
                return Ok(());
            }
        };

        if !header.signature_ok {
            slog::warn!(self.logger, "bad signature on tunnel, dropping frame"; "tunnel" => tunnel);
            return Ok(());
        }
        let command = match header.command() {
            Some(c) => c,
            None => {
                slog::warn!(self.logger, "unknown command id, dropping frame"; "id" => header.command_raw);
                return Ok(());
            }
        };

        if self.l3 {
            slog::trace!(self.logger, "tunnel frame payload"; "dump" => hex_dump(&payload));
        }

        match command {
            Command::Echo => self.handle_echo(tunnel, &header, payload),
            Command::Byebye => {
                self.handle_byebye(tunnel, &header);
                Ok(())
            }
            Command::Hello => Ok(()), // only expected once, during bring-up
            Command::DbConnect | Command::CliConnect => self.handle_flow_frame(tunnel, command, &header, payload),
        }
    }

    /// `ECHO` carries data for an already-open flow: `dest_fd` names the
    /// local endpoint to deliver the payload to, same as `handle_flow_frame`'s
    /// continuation case.
    fn handle_echo(&mut self, tunnel: FlowId, header: &RawHeader, payload: Vec<u8>) -> Result<()> {
        if header.dest_fd < 0 {
            return Ok(());
        }
        self.learn_peer(tunnel, header.dest_fd, header.src_fd);
        self.forward_to_endpoint(tunnel, header.dest_fd, payload)
    }

    fn handle_byebye(&mut self, tunnel: FlowId, header: &RawHeader) {
        let local_id = if header.dest_fd >= 0 {
            Some(header.dest_fd)
        } else {
            self.tunnels
                .get(&tunnel)
                .and_then(|info| info.flows.iter().find(|(_, f)| f.peer == Some(header.src_fd)))
                .map(|(&id, _)| id)
        };

        if let Some(id) = local_id {
            self.close_flow(tunnel, id, true);
        }
    }

    fn handle_flow_frame(
        &mut self,
        tunnel: FlowId,
        command: Command,
        header: &RawHeader,
        payload: Vec<u8>,
    ) -> Result<()> {
        let local_id = if header.dest_fd >= 0 {
            self.learn_peer(tunnel, header.dest_fd, header.src_fd);
            header.dest_fd
        } else {
            self.open_dialed_flow(tunnel, command, header)?
        };

        self.forward_to_endpoint(tunnel, local_id, payload)
    }

    fn learn_peer(&mut self, tunnel: FlowId, local_id: FlowId, peer_id: FlowId) {
        if let Some(info) = self.tunnels.get_mut(&tunnel) {
            if let Some(flow) = info.flows.get_mut(&local_id) {
                if flow.peer.is_none() {
                    flow.peer = Some(peer_id);
                }
            }
        }
    }

    /// `CLI_CONNECT` with `dest_fd == -1`: remote-buddy is opening a brand
    /// new flow and needs local-buddy to dial the address it declared.
    fn open_dialed_flow(&mut self, tunnel: FlowId, command: Command, header: &RawHeader) -> Result<FlowId> {
        let target: SocketAddr = format!("{}:{}", header.ip_str(), header.port)
            .parse()
            .map_err(|_| Error::RoutingMiss { origin_ip: header.ip_str() })?;

        let id = self.allocator.allocate()?;
        let std_stream = StdTcpStream::connect_timeout(&target, DIAL_TIMEOUT).map_err(Error::SocketIo)?;
        std_stream.set_nonblocking(true).map_err(Error::SocketIo)?;
        let mut stream = TcpStream::from_std(std_stream);
        self.socketset
            .add(&mut stream, token_of(id), Interest::READABLE)
            .map_err(Error::SocketIo)?;
        self.sockets.insert(id, stream);

        let info = self.tunnels.get_mut(&tunnel).expect("tunnel exists for flow frame");
        info.flows.insert(id, FlowState::new(command, Some(header.src_fd)));

        if self.l1 {
            slog::info!(self.logger, "dialed endpoint for flow"; "flow" => id, "target" => %target);
        }
        Ok(id)
    }

    fn forward_to_endpoint(&mut self, tunnel: FlowId, local_id: FlowId, payload: Vec<u8>) -> Result<()> {
        let flow = match self.tunnels.get_mut(&tunnel).and_then(|info| info.flows.get_mut(&local_id)) {
            Some(f) => f,
            None => return Ok(()),
        };

        flow.gate.on_outbound(&payload);
        flow.held.extend_from_slice(&payload);

        if !flow.gate.is_open() {
            return Ok(());
        }

        let held = std::mem::take(&mut flow.held);
        if held.is_empty() {
            return Ok(());
        }

        if let Some(stream) = self.sockets.get_mut(&local_id) {
            if let Err(e) = write_all_blocking(stream, &held) {
                slog::warn!(self.logger, "endpoint write failed"; "flow" => local_id, "error" => %e);
                self.close_flow(tunnel, local_id, false);
            }
        }
        Ok(())
    }

    /// A dialed (or accepted) endpoint became readable: read once, and
    /// either forward the reply over its tunnel or tear the flow down on EOF.
    fn handle_endpoint_readable(&mut self, id: FlowId) -> Result<()> {
        let tunnel = match self.owning_tunnel(id) {
            Some(t) => t,
            None => {
                self.drop_socket(id);
                return Ok(());
            }
        };

        let bytes = {
            let stream = self.sockets.get_mut(&id).expect("endpoint socket present");
            self.recv_buf.fill_once(stream).map_err(Error::SocketIo)?.to_vec()
        };

        if bytes.is_empty() {
            self.close_flow(tunnel, id, false);
            return Ok(());
        }

        if let Some(info) = self.tunnels.get_mut(&tunnel) {
            if let Some(flow) = info.flows.get_mut(&id) {
                flow.gate.on_inbound(&bytes);
            }
        }

        let (peer, kind) = self
            .tunnels
            .get(&tunnel)
            .and_then(|info| info.flows.get(&id))
            .map(|f| (f.peer.unwrap_or(-1), f.kind))
            .unwrap_or((-1, Command::DbConnect));

        let header = Header::new(kind, id, peer).with_buf_len(bytes.len() as u32);
        let frame = frame::encode_frame(&header, &bytes);
        let tunnel_stream = self.sockets.get_mut(&tunnel).expect("tunnel socket present");
        write_all_blocking(tunnel_stream, &frame).map_err(Error::SocketIo)
    }

    /// Closes one flow's endpoint socket and removes its bookkeeping. Sends
    /// a `BYEBYE` to the peer unless `suppress_outgoing` is set, which is
    /// the case when this close is itself the reaction to a peer `BYEBYE`.
    fn close_flow(&mut self, tunnel: FlowId, local_id: FlowId, suppress_outgoing: bool) {
        let peer = self
            .tunnels
            .get_mut(&tunnel)
            .and_then(|info| info.flows.remove(&local_id))
            .and_then(|f| f.peer);

        self.drop_socket(local_id);

        if suppress_outgoing {
            return;
        }

        let header = Header::new(Command::Byebye, local_id, peer.unwrap_or(-1));
        if let Some(stream) = self.sockets.get_mut(&tunnel) {
            let _ = write_all_blocking(stream, &frame::encode_frame(&header, &[]));
        }
    }

    /// A tunnel died: every flow it owned loses its endpoint without a
    /// `BYEBYE`, since there is no live socket left to carry one.
    fn teardown_tunnel(&mut self, tunnel: FlowId) {
        if let Some(info) = self.tunnels.remove(&tunnel) {
            for local_id in info.flows.into_keys() {
                self.drop_socket(local_id);
            }
        }
        self.drop_socket(tunnel);
    }

    fn close_everything(&mut self) {
        let tunnels: Vec<FlowId> = self.tunnels.keys().copied().collect();
        for tunnel in tunnels {
            self.teardown_tunnel(tunnel);
        }
        let pending: Vec<FlowId> = self.pending.keys().copied().collect();
        for id in pending {
            self.drop_socket(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;

    fn test_args() -> Args {
        Args { debug: 0, port: None, config_path: None, buffer_size: None, backlog: None }
    }

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn hello_frame(ip: &str, port: u16) -> Vec<u8> {
        let header = Header::new(Command::Hello, 0, -1).with_ip(ip, port).unwrap();
        frame::encode_frame(&header, &[])
    }

    #[test]
    fn tunnel_bring_up_registers_connection_info_and_acks() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut buddy = LocalBuddy::new(addr, 16, test_logger(), &test_args()).unwrap();
        let listen_addr = buddy.listener.local_addr().unwrap();

        let mut remote = StdStream::connect(listen_addr).unwrap();
        remote.write_all(&hello_frame("10.0.0.9", 9999)).unwrap();

        let ready = buddy.socketset.wait().unwrap();
        for event in ready {
            buddy.dispatch(event).unwrap();
        }
        // listener accept only queues the socket; drive it again until classified.
        loop {
            let ready = buddy.socketset.wait().unwrap();
            let mut progressed = false;
            for event in ready {
                if event.token != LISTENER_TOKEN {
                    progressed = true;
                }
                buddy.dispatch(event).unwrap();
            }
            if !progressed {
                continue;
            }
            break;
        }

        assert_eq!(buddy.tunnels.len(), 1);
        let info = buddy.tunnels.values().next().unwrap();
        assert_eq!(info.declared_ip, "10.0.0.9");
        assert_eq!(info.declared_port, 9999);

        let mut ack = [0u8; frame::HEADER_LEN];
        remote.read_exact(&mut ack).unwrap();
        assert_eq!(&ack[..8], &frame::SIGNATURE);
    }

    #[test]
    fn select_tunnel_for_claims_then_reuses_wildcard_slot() {
        let mut info_map = HashMap::new();
        info_map.insert(0i16, ConnectionInfo::new("1.2.3.4".to_string(), 80));

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut buddy = LocalBuddy::new(addr, 16, test_logger(), &test_args()).unwrap();
        buddy.tunnels = info_map;

        let first = buddy.select_tunnel_for("192.168.1.5").unwrap();
        assert_eq!(first, 0);
        assert!(buddy.tunnels[&0].claimed_ips.contains("192.168.1.5"));

        let second = buddy.select_tunnel_for("192.168.1.5").unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn close_flow_suppresses_byebye_when_reacting_to_peer() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut buddy = LocalBuddy::new(addr, 16, test_logger(), &test_args()).unwrap();

        let (tunnel_server, mut tunnel_client) = pipe_pair();
        let tunnel_id = buddy.allocator.allocate().unwrap();
        let mut tunnel_mio = TcpStream::from_std(tunnel_server);
        buddy.socketset.add(&mut tunnel_mio, token_of(tunnel_id), Interest::READABLE).unwrap();
        buddy.sockets.insert(tunnel_id, tunnel_mio);
        buddy.tunnels.insert(tunnel_id, ConnectionInfo::new("0.0.0.0".to_string(), 0));

        let (flow_server, _flow_client) = pipe_pair();
        let flow_id = buddy.allocator.allocate().unwrap();
        let mut flow_mio = TcpStream::from_std(flow_server);
        buddy.socketset.add(&mut flow_mio, token_of(flow_id), Interest::READABLE).unwrap();
        buddy.sockets.insert(flow_id, flow_mio);
        buddy
            .tunnels
            .get_mut(&tunnel_id)
            .unwrap()
            .flows
            .insert(flow_id, FlowState::new(Command::DbConnect, Some(5)));

        buddy.close_flow(tunnel_id, flow_id, true);

        assert!(!buddy.sockets.contains_key(&flow_id));
        // suppressed: nothing was written to the tunnel.
        tunnel_client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            tunnel_client.read(&mut buf),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    fn pipe_pair() -> (StdStream, StdStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }
}

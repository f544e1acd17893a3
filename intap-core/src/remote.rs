//! `remote-buddy`'s policy: the side that lives next to the production
//! services being debugged. It dials local-buddy once at startup to raise
//! the tunnel, then binds its own listener directly on the REST server's
//! configured address — hijacking real client traffic so it can be relayed
//! down the tunnel instead of served locally. Database flows run the other
//! way: local-buddy's accepted DB client asks, and remote-buddy dials the
//! real database on its behalf.
//!
//! Unlike local-buddy, remote-buddy holds exactly one tunnel, so its flow
//! table is a single flat map rather than one scoped per tunnel.

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
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const TUNNEL_TOKEN: Token = Token(usize::MAX - 2);
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

pub struct RemoteBuddy {
    tunnel: TcpStream,
    listener: mio::net::TcpListener,
    sockets: HashMap<FlowId, TcpStream>,
    flows: HashMap<FlowId, FlowState>,
    rest_addr: SocketAddr,
    database_addr: SocketAddr,
    allocator: FlowIdAllocator,
    socketset: SocketSet,
    shutdown: ShutdownHandle,
    logger: Logger,
    recv_buf: RecvBuffer,
    l1: bool,
    l2: bool,
    l3: bool,
}

impl RemoteBuddy {
    pub fn new(
        local_buddy_addr: SocketAddr,
        rest_addr: SocketAddr,
        database_addr: SocketAddr,
        backlog: u32,
        logger: Logger,
        args: &Args,
    ) -> Result<RemoteBuddy> {
        let std_tunnel = StdTcpStream::connect_timeout(&local_buddy_addr, DIAL_TIMEOUT).map_err(Error::Startup)?;
        std_tunnel.set_nonblocking(true).map_err(Error::Startup)?;
        let mut tunnel = TcpStream::from_std(std_tunnel);

        let mut listener = bind_listener(rest_addr, backlog).map_err(Error::Startup)?;
        let rest_addr = listener.local_addr().map_err(Error::Startup)?;

        let mut socketset = SocketSet::new(1024).map_err(Error::Startup)?;
        socketset.add(&mut tunnel, TUNNEL_TOKEN, Interest::READABLE).map_err(Error::Startup)?;
        socketset
            .add(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Startup)?;
        let shutdown = ShutdownHandle::install(socketset.registry()).map_err(Error::Startup)?;

        let hello = Header::new(Command::Hello, 0, -1)
            .with_ip(&rest_addr.ip().to_string(), rest_addr.port())
            .map_err(Error::from)?;
        write_all_blocking(&mut tunnel, &frame::encode_frame(&hello, &[])).map_err(Error::Startup)?;

        slog::info!(logger, "tunnel raised"; "local_buddy" => %local_buddy_addr, "rest_addr" => %rest_addr);

        let buffer_size = args.buffer_size.unwrap_or(4096);
        Ok(RemoteBuddy {
            tunnel,
            listener,
            sockets: HashMap::new(),
            flows: HashMap::new(),
            rest_addr,
            database_addr,
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
                match self.dispatch(event) {
                    Ok(()) => {}
                    Err(Error::TunnelLost) => {
                        slog::error!(self.logger, "tunnel lost, shutting down");
                        self.close_everything();
                        return Err(Error::TunnelLost);
                    }
                    Err(e) => slog::warn!(self.logger, "dispatch failed"; "error" => %e),
                }
            }
        }
    }

    fn dispatch(&mut self, event: ReadyEvent) -> Result<()> {
        if event.token == LISTENER_TOKEN {
            return self.accept_loop();
        }
        if event.token == TUNNEL_TOKEN {
            if event.closed {
                return Err(Error::TunnelLost);
            }
            if event.readable {
                return self.handle_tunnel_readable();
            }
            return Ok(());
        }

        let id = match flow_of(event.token) {
            Some(id) => id,
            None => return Ok(()),
        };

        if event.closed {
            self.close_flow(id, false);
            return Ok(());
        }
        if event.readable {
            return self.handle_endpoint_readable(id);
        }
        Ok(())
    }

    fn accept_loop(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let id = self.allocator.allocate()?;
                    self.socketset
                        .add(&mut stream, token_of(id), Interest::READABLE)
                        .map_err(Error::SocketIo)?;
                    self.sockets.insert(id, stream);
                    self.flows.insert(id, FlowState::new(Command::CliConnect, None));
                    if self.l1 {
                        slog::info!(self.logger, "accepted rest client"; "flow" => id, "peer" => %peer_addr);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::SocketIo(e)),
            }
        }
        Ok(())
    }

    fn handle_tunnel_readable(&mut self) -> Result<()> {
        let frame = read_tunnel_frame(&mut self.tunnel).map_err(Error::SocketIo)?;

        let (header, payload) = match frame {
            Some(f) => f,
            None => return Err(Error::TunnelLost),
        };

        if !header.signature_ok {
            slog::warn!(self.logger, "bad signature on tunnel, dropping frame");
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
            Command::Echo => self.handle_echo(&header, payload),
            Command::Byebye => {
                self.handle_byebye(&header);
                Ok(())
            }
            Command::Hello => Ok(()),
            Command::DbConnect | Command::CliConnect => self.handle_flow_frame(command, &header, payload),
        }
    }

    /// `ECHO` carries data for an already-open flow: `dest_fd` names the
    /// local endpoint (accepted REST client or dialed database socket) to
    /// deliver the payload to, same as `handle_flow_frame`'s continuation
    /// case.
    fn handle_echo(&mut self, header: &RawHeader, payload: Vec<u8>) -> Result<()> {
        if header.dest_fd < 0 {
            return Ok(());
        }
        if let Some(flow) = self.flows.get_mut(&header.dest_fd) {
            if flow.peer.is_none() {
                flow.peer = Some(header.src_fd);
            }
        }
        self.forward_to_endpoint(header.dest_fd, payload)
    }

    fn handle_byebye(&mut self, header: &RawHeader) {
        let local_id = if header.dest_fd >= 0 {
            Some(header.dest_fd)
        } else {
            self.flows.iter().find(|(_, f)| f.peer == Some(header.src_fd)).map(|(&id, _)| id)
        };

        if let Some(id) = local_id {
            self.close_flow(id, true);
        }
    }

    fn handle_flow_frame(&mut self, command: Command, header: &RawHeader, payload: Vec<u8>) -> Result<()> {
        let local_id = if header.dest_fd >= 0 {
            if let Some(flow) = self.flows.get_mut(&header.dest_fd) {
                if flow.peer.is_none() {
                    flow.peer = Some(header.src_fd);
                }
            }
            header.dest_fd
        } else {
            self.open_dialed_flow(command, header)?
        };

        self.forward_to_endpoint(local_id, payload)
    }

    /// Local-buddy asked for a new flow (`dest_fd == -1`). The only command
    /// that legitimately arrives this way is `DB_CONNECT`: remote-buddy
    /// dials the database it was configured with, ignoring whatever ip/port
    /// the frame carries.
    fn open_dialed_flow(&mut self, command: Command, header: &RawHeader) -> Result<FlowId> {
        let id = self.allocator.allocate()?;
        let std_stream = StdTcpStream::connect_timeout(&self.database_addr, DIAL_TIMEOUT).map_err(Error::SocketIo)?;
        std_stream.set_nonblocking(true).map_err(Error::SocketIo)?;
        let mut stream = TcpStream::from_std(std_stream);
        self.socketset
            .add(&mut stream, token_of(id), Interest::READABLE)
            .map_err(Error::SocketIo)?;
        self.sockets.insert(id, stream);
        self.flows.insert(id, FlowState::new(command, Some(header.src_fd)));

        if self.l1 {
            slog::info!(self.logger, "dialed database for flow"; "flow" => id, "target" => %self.database_addr);
        }
        Ok(id)
    }

    /// Bytes arriving off the tunnel are the server's reply flowing back
    /// toward the client, so they are fed to the flow's gate as inbound
    /// traffic (the leg where `Http100ContinueGate` sees the
    /// `"HTTP/1.1 100 Continue"` reply and reopens) before delivery.
    fn forward_to_endpoint(&mut self, local_id: FlowId, payload: Vec<u8>) -> Result<()> {
        match self.flows.get_mut(&local_id) {
            Some(flow) => flow.gate.on_inbound(&payload),
            None => return Ok(()),
        }

        if let Some(stream) = self.sockets.get_mut(&local_id) {
            if let Err(e) = write_all_blocking(stream, &payload) {
                slog::warn!(self.logger, "endpoint write failed"; "flow" => local_id, "error" => %e);
                self.close_flow(local_id, false);
            }
        }
        Ok(())
    }

    /// An accepted REST client or a dialed database socket became readable.
    /// For CLI flows this is the leg where the 100-continue gate actually
    /// withholds bytes; for DB flows the gate is always open.
    fn handle_endpoint_readable(&mut self, id: FlowId) -> Result<()> {
        let bytes = {
            let stream = match self.sockets.get_mut(&id) {
                Some(s) => s,
                None => return Ok(()),
            };
            self.recv_buf.fill_once(stream).map_err(Error::SocketIo)?.to_vec()
        };

        if bytes.is_empty() {
            self.close_flow(id, false);
            return Ok(());
        }

        let (peer, kind) = {
            let flow = match self.flows.get_mut(&id) {
                Some(f) => f,
                None => return Ok(()),
            };
            flow.gate.on_outbound(&bytes);
            flow.held.extend_from_slice(&bytes);
            if !flow.gate.is_open() {
                return Ok(());
            }
            (flow.peer.unwrap_or(-1), flow.kind)
        };

        let held = std::mem::take(&mut self.flows.get_mut(&id).unwrap().held);
        if held.is_empty() {
            return Ok(());
        }

        let header = Header::new(kind, id, peer)
            .with_ip(&self.rest_addr.ip().to_string(), self.rest_addr.port())
            .map_err(Error::from)?
            .with_buf_len(held.len() as u32);
        write_all_blocking(&mut self.tunnel, &frame::encode_frame(&header, &held)).map_err(Error::SocketIo)
    }

    fn close_flow(&mut self, local_id: FlowId, suppress_outgoing: bool) {
        let peer = self.flows.remove(&local_id).and_then(|f| f.peer);

        if let Some(mut stream) = self.sockets.remove(&local_id) {
            let _ = self.socketset.remove(&mut stream, token_of(local_id));
        }
        self.allocator.release(local_id);

        if suppress_outgoing {
            return;
        }

        let header = Header::new(Command::Byebye, local_id, peer.unwrap_or(-1));
        let _ = write_all_blocking(&mut self.tunnel, &frame::encode_frame(&header, &[]));
    }

    fn close_everything(&mut self) {
        let ids: Vec<FlowId> = self.flows.keys().copied().collect();
        for id in ids {
            self.close_flow(id, true);
        }
    }
}

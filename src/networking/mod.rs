//! Client connections: accepting, reading and parsing requests, queueing
//! and writing replies, and closing.
//!
//! Clients live in [`ServerState::clients`] keyed by descriptor. A handler
//! working on a client takes it out of the map for the duration of the
//! call, so command procedures get `&mut ServerState` and `&mut Client`
//! side by side, and puts it back unless the client was freed.

pub mod buffer;
pub mod protocol;
pub mod reply;

use std::cell::Cell;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use intrusive_collections::{LinkedList, LinkedListLink, intrusive_adapter};
use socket2::Socket;
use tracing::{debug, info, warn};

use crate::ae::{EventLoop, FileHandler, Mask};
use crate::anet;
use crate::config::ClientClass;
use crate::server::ServerState;
use crate::util;

use buffer::Buffer;
use protocol::RequestParser;
use reply::Reply;

/// Bytes requested per read.
pub const IOBUF_LEN: usize = 16 * 1024;

/// Connections accepted per readable event on a listener.
pub const MAX_ACCEPTS_PER_CALL: usize = 1000;

/// Query buffers larger than this are candidates for shrinking.
const QUERYBUF_SHRINK_MIN: usize = 32 * 1024;

// Client flags.
pub const CLIENT_CLOSE_AFTER_REPLY: u32 = 1 << 0;
pub const CLIENT_CLOSE_ASAP: u32 = 1 << 1;
pub const CLIENT_PENDING_WRITE: u32 = 1 << 2;
pub const CLIENT_UNIX_SOCKET: u32 = 1 << 3;

/// Position of a client in the idle ordering.
#[derive(Debug)]
pub struct IdleNode {
    link: LinkedListLink,
    fd: RawFd,
    last_interaction: Cell<i64>,
}

intrusive_adapter!(pub IdleAdapter = Rc<IdleNode>: IdleNode { link: LinkedListLink });

impl IdleNode {
    pub fn new(fd: RawFd, now: i64) -> Rc<Self> {
        Rc::new(Self {
            link: LinkedListLink::new(),
            fd,
            last_interaction: Cell::new(now),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn last_interaction(&self) -> i64 {
        self.last_interaction.get()
    }
}

/// Clients ordered by last interaction, least recent at the front.
pub struct IdleList {
    list: LinkedList<IdleAdapter>,
}

impl Default for IdleList {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleList {
    pub fn new() -> Self {
        Self {
            list: LinkedList::new(IdleAdapter::new()),
        }
    }

    pub fn push(&mut self, node: Rc<IdleNode>) {
        self.list.push_back(node);
    }

    /// Records activity and moves the node to the back.
    pub fn touch(&mut self, node: &Rc<IdleNode>, now: i64) {
        node.last_interaction.set(now);
        if self.remove(node) {
            self.list.push_back(Rc::clone(node));
        }
    }

    pub fn remove(&mut self, node: &Rc<IdleNode>) -> bool {
        if !node.link.is_linked() {
            return false;
        }
        // SAFETY: every IdleNode is only ever linked into the server's
        // single IdleList, so a linked node belongs to this list.
        let mut cursor = unsafe { self.list.cursor_mut_from_ptr(Rc::as_ptr(node)) };
        cursor.remove().is_some()
    }

    /// Descriptors idle since before `cutoff`, oldest first.
    pub fn idle_since(&self, cutoff: i64) -> Vec<RawFd> {
        self.list
            .iter()
            .take_while(|n| n.last_interaction.get() < cutoff)
            .map(|n| n.fd)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

pub struct Client {
    pub id: u64,
    pub fd: RawFd,
    socket: Socket,
    pub peer: String,
    pub name: Option<Vec<u8>>,
    pub db: usize,
    pub flags: u32,
    pub class: ClientClass,
    pub querybuf: Buffer,
    /// Largest query buffer length seen since the last cron pass.
    pub querybuf_peak: usize,
    pub parser: RequestParser,
    pub argv: Vec<Vec<u8>>,
    pub reply: Reply,
    /// Creation time, Unix milliseconds.
    pub ctime: i64,
    pub last_cmd: &'static str,
    pub soft_limit_since: Option<u64>,
    idle: Rc<IdleNode>,
}

impl Client {
    pub fn new(id: u64, socket: Socket, peer: String, flags: u32, now: i64, chunk_bytes: usize) -> Self {
        let fd = socket.as_raw_fd();
        Self {
            id,
            fd,
            socket,
            peer,
            name: None,
            db: 0,
            flags,
            class: ClientClass::Normal,
            querybuf: Buffer::new(),
            querybuf_peak: 0,
            parser: RequestParser::new(),
            argv: Vec::new(),
            reply: Reply::new(chunk_bytes),
            ctime: now,
            last_cmd: "NULL",
            soft_limit_since: None,
            idle: IdleNode::new(fd, now),
        }
    }

    pub fn idle_node(&self) -> &Rc<IdleNode> {
        &self.idle
    }

    pub fn last_interaction(&self) -> i64 {
        self.idle.last_interaction()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn flag_letters(&self) -> String {
        let mut s = String::new();
        if self.has_flag(CLIENT_CLOSE_ASAP) {
            s.push('A');
        }
        if self.has_flag(CLIENT_CLOSE_AFTER_REPLY) {
            s.push('c');
        }
        if self.has_flag(CLIENT_UNIX_SOCKET) {
            s.push('U');
        }
        if s.is_empty() {
            s.push('N');
        }
        s
    }

    /// One line of CLIENT LIST output.
    pub fn info_line(&self, now: i64) -> String {
        let mut line = String::new();
        let _ = write!(
            line,
            "id={} addr={} fd={} name={} age={} idle={} flags={} db={} qbuf={} qbuf-free={} obl={} oll={} omem={} cmd={}",
            self.id,
            self.peer,
            self.fd,
            String::from_utf8_lossy(self.name.as_deref().unwrap_or_default()),
            (now - self.ctime) / 1000,
            (now - self.last_interaction()) / 1000,
            self.flag_letters(),
            self.db,
            self.querybuf.len(),
            self.querybuf.capacity().saturating_sub(self.querybuf.len()),
            self.reply.buf_len(),
            self.reply.chunk_count(),
            self.reply.reply_bytes(),
            self.last_cmd,
        );
        line
    }
}

/// Accepts connections on a TCP or Unix listener.
pub struct AcceptHandler {
    pub unix: bool,
}

pub struct ReadHandler;

pub struct WriteHandler;

impl FileHandler<ServerState> for AcceptHandler {
    fn on_readable(&self, el: &mut EventLoop<ServerState>, state: &mut ServerState, fd: RawFd) {
        state.accept_connections(el, fd, self.unix);
    }
}

impl FileHandler<ServerState> for ReadHandler {
    fn on_readable(&self, el: &mut EventLoop<ServerState>, state: &mut ServerState, fd: RawFd) {
        state.read_query_from_client(el, fd);
    }
}

impl FileHandler<ServerState> for WriteHandler {
    fn on_writable(&self, el: &mut EventLoop<ServerState>, state: &mut ServerState, fd: RawFd) {
        state.send_reply_to_client(el, fd);
    }
}

impl ServerState {
    pub(crate) fn accept_connections(&mut self, el: &mut EventLoop<ServerState>, fd: RawFd, unix: bool) {
        let Some(listener) = self.listeners.iter().find(|l| l.as_raw_fd() == fd) else {
            return;
        };
        let mut accepted = Vec::new();
        for _ in 0..MAX_ACCEPTS_PER_CALL {
            match anet::accept(listener) {
                Ok(conn) => accepted.push(conn),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accepting client connection");
                    break;
                }
            }
        }
        for (socket, peer) in accepted {
            self.accept_common(el, socket, peer, unix);
        }
    }

    fn accept_common(&mut self, el: &mut EventLoop<ServerState>, socket: Socket, peer: String, unix: bool) {
        if self.clients.len() >= self.config.maxclients {
            // Best effort: the socket is non-blocking and about to close.
            let _ = (&socket).write(b"-ERR max number of clients reached\r\n");
            self.stats.rejected_conn += 1;
            warn!(%peer, "rejected connection: max number of clients reached");
            return;
        }
        if !unix {
            if self.config.tcp_nodelay {
                if let Err(e) = anet::enable_tcp_nodelay(&socket) {
                    debug!(%peer, error = %e, "setting TCP_NODELAY");
                }
            }
            if self.config.tcp_keepalive > 0 {
                if let Err(e) = anet::keepalive(&socket, self.config.tcp_keepalive) {
                    debug!(%peer, error = %e, "enabling keepalive");
                }
            }
        }

        let fd = socket.as_raw_fd();
        if let Err(e) = el.create_file_event(fd, Mask::READABLE, self.read_handler.clone()) {
            warn!(%peer, error = %e, "registering client");
            return;
        }

        self.next_client_id += 1;
        let flags = if unix { CLIENT_UNIX_SOCKET } else { 0 };
        let client = Client::new(
            self.next_client_id,
            socket,
            peer,
            flags,
            util::mstime(),
            self.config.reply_chunk_bytes,
        );
        info!(id = client.id, peer = %client.peer, "accepted connection");
        self.idle.push(Rc::clone(client.idle_node()));
        self.clients.insert(fd, client);
        self.stats.numconnections += 1;
    }

    /// Unregisters and closes a client. The socket closes when the client
    /// is dropped, after its descriptor left the event loop.
    pub(crate) fn free_client(&mut self, el: &mut EventLoop<ServerState>, c: Client, reason: &str) {
        el.delete_file_event(c.fd, Mask::READABLE | Mask::WRITABLE);
        self.idle.remove(c.idle_node());
        debug!(id = c.id, peer = %c.peer, reason, "closing client");
    }

    /// Marks a client to be freed from `before_sleep`.
    pub(crate) fn free_client_async(&mut self, c: &mut Client) {
        if c.has_flag(CLIENT_CLOSE_ASAP) {
            return;
        }
        c.flags |= CLIENT_CLOSE_ASAP;
        self.clients_to_close.push((c.fd, c.id));
    }

    pub(crate) fn free_clients_in_async_free_queue(&mut self, el: &mut EventLoop<ServerState>) {
        for (fd, id) in std::mem::take(&mut self.clients_to_close) {
            if self.clients.get(&fd).is_some_and(|c| c.id == id) {
                if let Some(c) = self.clients.remove(&fd) {
                    self.free_client(el, c, "scheduled close");
                }
            }
        }
    }

    pub(crate) fn read_query_from_client(&mut self, el: &mut EventLoop<ServerState>, fd: RawFd) {
        let Some(mut c) = self.clients.remove(&fd) else {
            return;
        };

        let limits = self.parse_limits();
        let readlen = c.parser.pending_big_bulk(c.querybuf.len(), &limits).unwrap_or(IOBUF_LEN);
        let mut sock = &c.socket;
        let n = match c.querybuf.read_from(&mut sock, readlen) {
            Ok(0) => return self.free_client(el, c, "client closed connection"),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                self.clients.insert(fd, c);
                return;
            }
            Err(e) => {
                debug!(id = c.id, error = %e, "reading from client");
                return self.free_client(el, c, "read error");
            }
        };

        self.stats.net_input_bytes += n as u64;
        self.idle.touch(c.idle_node(), util::mstime());
        c.querybuf_peak = c.querybuf_peak.max(c.querybuf.len());

        if c.querybuf.len() > self.config.max_querybuf_len {
            warn!(
                id = c.id,
                peer = %c.peer,
                qbuf = c.querybuf.len(),
                "closing client that reached max query buffer length"
            );
            return self.free_client(el, c, "query buffer limit");
        }

        self.process_input_buffer(&mut c);
        self.after_client_io(c);
    }

    fn parse_limits(&self) -> protocol::ParseLimits {
        protocol::ParseLimits {
            inline_max: self.config.inline_max_size,
            mbulk_big_arg: self.config.mbulk_big_arg,
            proto_max_bulk_len: self.config.proto_max_bulk_len,
        }
    }

    /// Runs every complete request buffered for `c`.
    pub(crate) fn process_input_buffer(&mut self, c: &mut Client) {
        let limits = self.parse_limits();
        while !c.querybuf.is_empty() {
            if c.has_flag(CLIENT_CLOSE_AFTER_REPLY | CLIENT_CLOSE_ASAP) {
                break;
            }
            match c.parser.parse(&mut c.querybuf, &limits) {
                Ok(None) => break,
                Ok(Some(argv)) if argv.is_empty() => continue,
                Ok(Some(argv)) => {
                    c.argv = argv;
                    self.process_command(c);
                    c.argv.clear();
                }
                Err(e) => {
                    debug!(id = c.id, peer = %c.peer, error = %e, "protocol error");
                    reply::out_err(&mut c.reply, &e.to_string());
                    c.flags |= CLIENT_CLOSE_AFTER_REPLY;
                    c.parser.reset();
                    break;
                }
            }
        }
    }

    /// Queues the client for writing if it has output, enforces output
    /// limits, and puts it back into the registry.
    fn after_client_io(&mut self, mut c: Client) {
        if c.reply.has_pending() && !c.has_flag(CLIENT_PENDING_WRITE | CLIENT_CLOSE_ASAP) {
            c.flags |= CLIENT_PENDING_WRITE;
            self.clients_pending_write.push((c.fd, c.id));
        }
        self.check_output_buffer_limits(&mut c);
        self.clients.insert(c.fd, c);
    }

    fn check_output_buffer_limits(&mut self, c: &mut Client) {
        if c.has_flag(CLIENT_CLOSE_ASAP) {
            return;
        }
        let limit = self.config.output_limit(c.class);
        let now_secs = (util::mstime() / 1000) as u64;
        if reply::output_limit_reached(c.reply.reply_bytes(), &limit, &mut c.soft_limit_since, now_secs) {
            warn!(
                id = c.id,
                peer = %c.peer,
                class = c.class.name(),
                omem = c.reply.reply_bytes(),
                "client scheduled to be closed for overcoming of output buffer limits"
            );
            self.free_client_async(c);
        }
    }

    /// Writes as much pending output as the socket takes. Returns false
    /// when the client must be closed.
    fn write_to_client(&mut self, c: &mut Client) -> bool {
        let mut sock = &c.socket;
        match c.reply.write_to(&mut sock) {
            Ok(n) => {
                self.stats.net_output_bytes += n as u64;
                if n > 0 {
                    self.idle.touch(c.idle_node(), util::mstime());
                }
                true
            }
            Err(e) => {
                debug!(id = c.id, error = %e, "writing to client");
                false
            }
        }
    }

    pub(crate) fn send_reply_to_client(&mut self, el: &mut EventLoop<ServerState>, fd: RawFd) {
        let Some(mut c) = self.clients.remove(&fd) else {
            return;
        };
        if !self.write_to_client(&mut c) {
            return self.free_client(el, c, "write error");
        }
        if !c.reply.has_pending() {
            el.delete_file_event(fd, Mask::WRITABLE);
            if c.has_flag(CLIENT_CLOSE_AFTER_REPLY) {
                return self.free_client(el, c, "closed after reply");
            }
        }
        self.clients.insert(fd, c);
    }

    /// Writes to every client that got output during this iteration,
    /// installing a write handler only for those the socket did not drain.
    pub(crate) fn handle_clients_with_pending_writes(&mut self, el: &mut EventLoop<ServerState>) -> usize {
        let pending = std::mem::take(&mut self.clients_pending_write);
        let count = pending.len();
        for (fd, id) in pending {
            if !self.clients.get(&fd).is_some_and(|c| c.id == id) {
                continue;
            }
            let Some(mut c) = self.clients.remove(&fd) else {
                continue;
            };
            c.flags &= !CLIENT_PENDING_WRITE;
            if c.has_flag(CLIENT_CLOSE_ASAP) {
                self.clients.insert(fd, c);
                continue;
            }
            if !self.write_to_client(&mut c) {
                self.free_client(el, c, "write error");
                continue;
            }
            if c.reply.has_pending() {
                if let Err(e) = el.create_file_event(fd, Mask::WRITABLE, self.write_handler.clone()) {
                    warn!(id = c.id, error = %e, "registering write handler");
                    self.free_client(el, c, "write handler registration");
                    continue;
                }
            } else if c.has_flag(CLIENT_CLOSE_AFTER_REPLY) {
                self.free_client(el, c, "closed after reply");
                continue;
            }
            self.clients.insert(fd, c);
        }
        count
    }

    /// Per-client housekeeping from the cron: idle timeouts and query
    /// buffer shrinking.
    pub(crate) fn clients_cron(&mut self, el: &mut EventLoop<ServerState>, now: i64) {
        if self.config.maxidletime > 0 {
            let cutoff = now - (self.config.maxidletime * 1000) as i64;
            for fd in self.idle.idle_since(cutoff) {
                if let Some(c) = self.clients.remove(&fd) {
                    info!(id = c.id, peer = %c.peer, "closing idle client");
                    self.free_client(el, c, "idle timeout");
                }
            }
        }

        for c in self.clients.values_mut() {
            let idle_ms = now - c.last_interaction();
            let cap = c.querybuf.capacity();
            if cap > QUERYBUF_SHRINK_MIN && (cap / 2 > c.querybuf_peak || idle_ms > 2000) {
                c.querybuf.shrink();
            }
            c.querybuf_peak = 0;
        }
    }
}

//! Server context, lifecycle and command dispatch.
//!
//! [`Server`] pairs the event loop with the [`ServerState`] every callback
//! receives. There are no globals: the state is built from a
//! [`ServerConfig`], handed to the loop on every call, and torn down by
//! [`Server::shutdown`].

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::ae::{EventLoop, FileHandler, Mask, TimerAction};
use crate::anet;
use crate::commands::{CommandTable, RedisCommand};
use crate::config::ServerConfig;
use crate::db::{self, Db, KeyspaceEvents, NoopEvents};
use crate::dict::hash;
use crate::error::{ServerError, ServerResult};
use crate::networking::{
    AcceptHandler, CLIENT_CLOSE_AFTER_REPLY, Client, IdleList, ReadHandler, WriteHandler, reply,
};
use crate::object::RObj;
use crate::util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set from the signal handler, polled by the loop.
static SHUTDOWN_SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_sig: i32) {
    SHUTDOWN_SIGNALLED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM to a graceful shutdown and ignores SIGPIPE.
pub fn install_signal_handlers() -> nix::Result<()> {
    let graceful = SigAction::new(SigHandler::Handler(on_shutdown_signal), SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        sigaction(Signal::SIGINT, &graceful)?;
        sigaction(Signal::SIGTERM, &graceful)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Policy gate consulted before a command runs: authentication, memory
/// limits, loading state and the like. An `Err` carries the full error
/// line including its code (`NOAUTH ...`, `ERR ...`); it is sent to the
/// client and the command is skipped.
pub trait CommandFilter {
    fn check(&self, cmd: &RedisCommand, c: &Client) -> Result<(), String>;
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub numcommands: u64,
    pub numconnections: u64,
    pub rejected_conn: u64,
    pub net_input_bytes: u64,
    pub net_output_bytes: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
}

pub struct ServerState {
    pub config: ServerConfig,
    pub dbs: Vec<Db>,
    pub commands: CommandTable,
    pub clients: HashMap<RawFd, Client>,
    pub stats: Stats,
    /// Keyspace changes since startup.
    pub dirty: u64,
    pub events: Box<dyn KeyspaceEvents>,
    pub filter: Option<Box<dyn CommandFilter>>,
    /// Unix milliseconds at startup.
    pub start_time: i64,
    pub cronloops: u64,
    pub shutdown_asap: bool,
    /// Port the TCP listener is bound to.
    pub port: u16,
    pub(crate) idle: IdleList,
    pub(crate) clients_pending_write: Vec<(RawFd, u64)>,
    pub(crate) clients_to_close: Vec<(RawFd, u64)>,
    pub(crate) next_client_id: u64,
    pub(crate) listeners: Vec<Socket>,
    pub(crate) read_handler: Rc<dyn FileHandler<ServerState>>,
    pub(crate) write_handler: Rc<dyn FileHandler<ServerState>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let dbs = (0..config.databases).map(Db::new).collect();
        Self {
            dbs,
            commands: CommandTable::new(),
            clients: HashMap::new(),
            stats: Stats::default(),
            dirty: 0,
            events: Box::new(NoopEvents),
            filter: None,
            start_time: util::mstime(),
            cronloops: 0,
            shutdown_asap: false,
            port: config.port,
            idle: IdleList::new(),
            clients_pending_write: Vec::new(),
            clients_to_close: Vec::new(),
            next_client_id: 0,
            listeners: Vec::new(),
            read_handler: Rc::new(ReadHandler),
            write_handler: Rc::new(WriteHandler),
            config,
        }
    }

    /// Looks a key up for reading, counting hits and misses.
    pub fn lookup_key_read(&mut self, db: usize, key: &[u8]) -> Option<&mut RObj> {
        let now = util::mstime();
        match self.dbs[db].lookup(key, now, self.events.as_mut()) {
            Some(obj) => {
                self.stats.keyspace_hits += 1;
                Some(obj)
            }
            None => {
                self.stats.keyspace_misses += 1;
                None
            }
        }
    }

    /// Looks a key up before modifying it.
    pub fn lookup_key_write(&mut self, db: usize, key: &[u8]) -> Option<&mut RObj> {
        let now = util::mstime();
        self.dbs[db].lookup(key, now, self.events.as_mut())
    }

    pub fn key_exists(&mut self, db: usize, key: &[u8]) -> bool {
        let now = util::mstime();
        self.dbs[db].exists(key, now, self.events.as_mut())
    }

    /// Notifies observers that `key` changed.
    pub fn signal_modified_key(&mut self, db: usize, key: &[u8]) {
        self.events.key_modified(db, key);
    }

    /// Notifies observers that `db` was emptied.
    pub fn signal_flushed_db(&mut self, db: usize) {
        self.events.db_flushed(db);
    }

    pub fn expired_keys(&self) -> u64 {
        self.dbs.iter().map(Db::expired_keys).sum()
    }

    /// Executes the command in `c.argv`.
    pub fn process_command(&mut self, c: &mut Client) {
        if c.argv[0].eq_ignore_ascii_case(b"quit") {
            reply::out_ok(&mut c.reply);
            c.flags |= CLIENT_CLOSE_AFTER_REPLY;
            return;
        }

        let Some(cmd) = self.commands.lookup(&c.argv[0]) else {
            let name = String::from_utf8_lossy(&c.argv[0]).into_owned();
            reply::out_err(&mut c.reply, &format!("unknown command '{name}'"));
            return;
        };
        let argc = c.argv.len() as i32;
        if (cmd.arity > 0 && cmd.arity != argc) || argc < -cmd.arity {
            reply::out_err(
                &mut c.reply,
                &format!("wrong number of arguments for '{}' command", cmd.name),
            );
            return;
        }
        if let Some(filter) = &self.filter {
            if let Err(msg) = filter.check(&cmd, c) {
                reply::out_err_code(&mut c.reply, &msg);
                return;
            }
        }
        self.call(c, &cmd);
    }

    /// Runs a resolved command, timing it and updating its stats.
    pub fn call(&mut self, c: &mut Client, cmd: &RedisCommand) {
        let start = util::ustime();
        (cmd.proc_)(self, c);
        let duration = (util::ustime() - start).max(0) as u64;
        cmd.record_call(duration);
        c.last_cmd = cmd.name;
        self.stats.numcommands += 1;
    }

    pub(crate) fn server_cron(&mut self, el: &mut EventLoop<ServerState>) -> TimerAction {
        let now = util::mstime();
        self.cronloops += 1;

        self.clients_cron(el, now);
        self.databases_cron(now);

        if self.shutdown_asap {
            el.stop();
        }
        TimerAction::Again(1000 / self.config.hz as u64)
    }

    fn databases_cron(&mut self, now: i64) {
        let deadline = db::active_expire_deadline(self.config.hz);
        for db in &mut self.dbs {
            db.active_expire_cycle(now, deadline, self.events.as_mut());
            if Instant::now() >= deadline {
                break;
            }
        }

        for db in &mut self.dbs {
            db.try_resize();
        }
        if self.config.active_rehashing {
            // One database per run gets the rehash budget.
            for db in &mut self.dbs {
                if db.incremental_rehash(1) {
                    break;
                }
            }
        }
    }

    pub(crate) fn before_sleep(&mut self, el: &mut EventLoop<ServerState>) {
        self.handle_clients_with_pending_writes(el);
        self.free_clients_in_async_free_queue(el);
        if SHUTDOWN_SIGNALLED.swap(false, Ordering::SeqCst) {
            warn!("received shutdown signal, scheduling shutdown");
            self.shutdown_asap = true;
        }
        if self.shutdown_asap {
            el.stop();
        }
    }
}

pub struct Server {
    el: EventLoop<ServerState>,
    state: ServerState,
}

impl Server {
    pub fn new(mut config: ServerConfig) -> ServerResult<Self> {
        for note in config.sanitize() {
            warn!("{note}");
        }
        hash::seed_once();
        let el = EventLoop::new(config.setsize())?;
        Ok(Self {
            el,
            state: ServerState::new(config),
        })
    }

    pub fn with_events(mut self, events: Box<dyn KeyspaceEvents>) -> Self {
        self.state.events = events;
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn CommandFilter>) -> Self {
        self.state.filter = Some(filter);
        self
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ServerState {
        &mut self.state
    }

    /// Port of the TCP listener, useful when the configured port was 0.
    pub fn local_port(&self) -> u16 {
        self.state.port
    }

    /// Binds the listeners and installs the cron timer and the
    /// before-sleep hook.
    pub fn listen(&mut self) -> ServerResult<()> {
        let cfg = &self.state.config;
        let addr = format!("{}:{}", cfg.bind, cfg.port);
        let tcp = anet::tcp_server(&cfg.bind, cfg.port, cfg.tcp_backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.state.port = anet::local_port(&tcp)?;
        self.add_listener(tcp, false)?;

        if let Some(path) = self.state.config.unixsocket.clone() {
            let unix = anet::unix_server(&path, self.state.config.tcp_backlog).map_err(|source| ServerError::Bind {
                addr: path.display().to_string(),
                source,
            })?;
            self.add_listener(unix, true)?;
            info!(path = %path.display(), "accepting connections on unix socket");
        }

        let period = 1000 / self.state.config.hz as u64;
        self.el
            .create_time_event(period, |el, state: &mut ServerState, _| state.server_cron(el), None);
        self.el.set_before_sleep(Some(Rc::new(
            |el: &mut EventLoop<ServerState>, state: &mut ServerState| state.before_sleep(el),
        )));

        info!(
            version = VERSION,
            port = self.state.port,
            api = self.el.api_name(),
            "server started, ready to accept connections"
        );
        Ok(())
    }

    fn add_listener(&mut self, socket: Socket, unix: bool) -> ServerResult<()> {
        self.el
            .create_file_event(socket.as_raw_fd(), Mask::READABLE, Rc::new(AcceptHandler { unix }))?;
        self.state.listeners.push(socket);
        Ok(())
    }

    /// Runs the event loop until a shutdown is requested, then shuts down.
    pub fn serve(&mut self) -> ServerResult<()> {
        let result = self.el.main(&mut self.state);
        self.shutdown();
        result.map_err(ServerError::from)
    }

    /// Asks a running loop to exit after the current iteration.
    pub fn request_shutdown(&mut self) {
        self.state.shutdown_asap = true;
    }

    /// Closes every client and listener and removes the Unix socket file.
    pub fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.state.clients.keys().copied().collect();
        for fd in fds {
            if let Some(c) = self.state.clients.remove(&fd) {
                self.state.free_client(&mut self.el, c, "server shutdown");
            }
        }
        for listener in self.state.listeners.drain(..) {
            self.el.delete_file_event(listener.as_raw_fd(), Mask::READABLE);
        }
        if let Some(path) = &self.state.config.unixsocket {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "removing unix socket");
            }
        }
        info!("server is now ready to exit, bye bye");
    }
}

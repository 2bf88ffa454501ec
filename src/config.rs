//! Runtime settings for the server.

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_HZ: u32 = 10;
pub const MIN_HZ: u32 = 1;
pub const MAX_HZ: u32 = 500;

/// Descriptors reserved beyond `maxclients` for listeners and internals.
pub const EVENTLOOP_FDSET_INCR: usize = 128;

/// Output buffer class a client's limits are taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientClass {
    Normal,
    Replica,
    PubSub,
}

impl ClientClass {
    pub fn name(self) -> &'static str {
        match self {
            ClientClass::Normal => "normal",
            ClientClass::Replica => "slave",
            ClientClass::PubSub => "pubsub",
        }
    }
}

/// Output buffer limits for one class. A zero means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputBufferLimit {
    pub hard_bytes: usize,
    pub soft_bytes: usize,
    pub soft_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub unixsocket: Option<PathBuf>,
    pub tcp_backlog: i32,
    /// Keepalive probe interval in seconds, 0 disables.
    pub tcp_keepalive: u64,
    pub tcp_nodelay: bool,
    pub maxclients: usize,
    pub databases: usize,
    pub hz: u32,
    /// Close clients idle this many seconds, 0 disables.
    pub maxidletime: u64,
    pub active_rehashing: bool,
    pub client_output_buffer_limits: [OutputBufferLimit; 3],
    pub max_querybuf_len: usize,
    pub inline_max_size: usize,
    pub mbulk_big_arg: usize,
    pub proto_max_bulk_len: usize,
    pub reply_chunk_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: String::from("0.0.0.0"),
            port: DEFAULT_PORT,
            unixsocket: None,
            tcp_backlog: 511,
            tcp_keepalive: 0,
            tcp_nodelay: true,
            maxclients: 10_000,
            databases: 16,
            hz: DEFAULT_HZ,
            maxidletime: 0,
            active_rehashing: true,
            client_output_buffer_limits: [
                OutputBufferLimit::default(),
                OutputBufferLimit {
                    hard_bytes: 256 * 1024 * 1024,
                    soft_bytes: 64 * 1024 * 1024,
                    soft_seconds: 60,
                },
                OutputBufferLimit {
                    hard_bytes: 32 * 1024 * 1024,
                    soft_bytes: 8 * 1024 * 1024,
                    soft_seconds: 60,
                },
            ],
            max_querybuf_len: 1024 * 1024 * 1024,
            inline_max_size: 64 * 1024,
            mbulk_big_arg: 32 * 1024,
            proto_max_bulk_len: 512 * 1024 * 1024,
            reply_chunk_bytes: 16 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn output_limit(&self, class: ClientClass) -> OutputBufferLimit {
        let idx = match class {
            ClientClass::Normal => 0,
            ClientClass::Replica => 1,
            ClientClass::PubSub => 2,
        };
        self.client_output_buffer_limits[idx]
    }

    /// Clamps out-of-range values, returning a note per adjustment.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.hz < MIN_HZ || self.hz > MAX_HZ {
            let clamped = self.hz.clamp(MIN_HZ, MAX_HZ);
            notes.push(format!("hz {} out of range, using {}", self.hz, clamped));
            self.hz = clamped;
        }
        if self.databases == 0 {
            notes.push(String::from("databases must be at least 1, using 1"));
            self.databases = 1;
        }
        if self.maxclients == 0 {
            notes.push(String::from("maxclients must be at least 1, using 1"));
            self.maxclients = 1;
        }
        notes
    }

    /// Event loop capacity needed for `maxclients`.
    pub fn setsize(&self) -> usize {
        self.maxclients + EVENTLOOP_FDSET_INCR
    }

    /// Values reported by CONFIG GET, keyed by parameter name.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let limits = [ClientClass::Normal, ClientClass::Replica, ClientClass::PubSub]
            .iter()
            .map(|&c| {
                let l = self.output_limit(c);
                format!("{} {} {} {}", c.name(), l.hard_bytes, l.soft_bytes, l.soft_seconds)
            })
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            ("bind", self.bind.clone()),
            ("port", self.port.to_string()),
            (
                "unixsocket",
                self.unixsocket
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("tcp-backlog", self.tcp_backlog.to_string()),
            ("tcp-keepalive", self.tcp_keepalive.to_string()),
            ("maxclients", self.maxclients.to_string()),
            ("databases", self.databases.to_string()),
            ("hz", self.hz.to_string()),
            ("timeout", self.maxidletime.to_string()),
            ("activerehashing", yes_no(self.active_rehashing).to_string()),
            ("client-output-buffer-limit", limits),
            ("client-query-buffer-limit", self.max_querybuf_len.to_string()),
            ("proto-max-bulk-len", self.proto_max_bulk_len.to_string()),
        ]
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

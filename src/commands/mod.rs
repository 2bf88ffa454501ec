//! Command table and the helpers shared by command implementations.

mod keys;
mod server_cmds;
mod strings;
mod zset;

use std::cell::Cell;
use std::rc::Rc;

use crate::dict::{Dict, DictType, hash};
use crate::networking::Client;
use crate::networking::reply::{self, Reply};
use crate::server::ServerState;
use crate::util;

pub type CommandProc = fn(&mut ServerState, &mut Client);

// Command flags.
pub const CMD_WRITE: u32 = 1 << 0;
pub const CMD_READONLY: u32 = 1 << 1;
pub const CMD_DENYOOM: u32 = 1 << 2;
pub const CMD_ADMIN: u32 = 1 << 3;
pub const CMD_NOSCRIPT: u32 = 1 << 4;
pub const CMD_RANDOM: u32 = 1 << 5;
pub const CMD_LOADING: u32 = 1 << 6;
pub const CMD_STALE: u32 = 1 << 7;
pub const CMD_FAST: u32 = 1 << 8;

const FLAG_NAMES: [(u32, &str); 9] = [
    (CMD_WRITE, "write"),
    (CMD_READONLY, "readonly"),
    (CMD_DENYOOM, "denyoom"),
    (CMD_ADMIN, "admin"),
    (CMD_NOSCRIPT, "noscript"),
    (CMD_RANDOM, "random"),
    (CMD_LOADING, "loading"),
    (CMD_STALE, "stale"),
    (CMD_FAST, "fast"),
];

pub(crate) const ERR_WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
pub(crate) const ERR_SYNTAX: &str = "syntax error";
pub(crate) const ERR_NOT_INTEGER: &str = "value is not an integer or out of range";
pub(crate) const ERR_NOT_FLOAT: &str = "value is not a valid float";
pub(crate) const ERR_NO_SUCH_KEY: &str = "no such key";

/// Static description of a command plus its call statistics.
pub struct RedisCommand {
    pub name: &'static str,
    pub proc_: CommandProc,
    /// Exact argument count, or the negated minimum.
    pub arity: i32,
    pub flags: u32,
    /// First key argument, 0 when the command takes no keys.
    pub firstkey: i32,
    /// Last key argument, negative counts from the end.
    pub lastkey: i32,
    pub keystep: i32,
    calls: Cell<u64>,
    microseconds: Cell<u64>,
}

impl RedisCommand {
    /// `sflags` uses one letter per flag: `w` write, `r` read-only,
    /// `m` may grow memory, `a` admin, `s` not in scripts, `R` random
    /// output, `l` allowed while loading, `t` allowed on stale data,
    /// `F` fast.
    pub fn new(
        name: &'static str,
        proc_: CommandProc,
        arity: i32,
        sflags: &str,
        firstkey: i32,
        lastkey: i32,
        keystep: i32,
    ) -> Self {
        let flags = sflags.chars().fold(0, |acc, ch| {
            acc | match ch {
                'w' => CMD_WRITE,
                'r' => CMD_READONLY,
                'm' => CMD_DENYOOM,
                'a' => CMD_ADMIN,
                's' => CMD_NOSCRIPT,
                'R' => CMD_RANDOM,
                'l' => CMD_LOADING,
                't' => CMD_STALE,
                'F' => CMD_FAST,
                _ => 0,
            }
        });
        Self {
            name,
            proc_,
            arity,
            flags,
            firstkey,
            lastkey,
            keystep,
            calls: Cell::new(0),
            microseconds: Cell::new(0),
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(f, _)| self.has_flag(*f))
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn calls(&self) -> u64 {
        self.calls.get()
    }

    pub fn microseconds(&self) -> u64 {
        self.microseconds.get()
    }

    pub fn record_call(&self, micros: u64) {
        self.calls.set(self.calls.get() + 1);
        self.microseconds.set(self.microseconds.get() + micros);
    }

    pub fn reset_stats(&self) {
        self.calls.set(0);
        self.microseconds.set(0);
    }

    /// Positions of the key arguments in `argv`.
    pub fn key_positions(&self, argc: usize) -> Vec<usize> {
        if self.firstkey == 0 {
            return Vec::new();
        }
        let argc = argc as i32;
        let last = if self.lastkey < 0 { argc + self.lastkey } else { self.lastkey };
        let step = self.keystep.max(1);
        (self.firstkey..=last.min(argc - 1))
            .step_by(step as usize)
            .map(|i| i as usize)
            .collect()
    }
}

/// Case-insensitive command names.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandNameType;

impl DictType<Vec<u8>, Rc<RedisCommand>> for CommandNameType {
    fn hash(&self, key: &Vec<u8>) -> u64 {
        hash::gen_case_hash(key) as u64
    }

    fn key_eq(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a.eq_ignore_ascii_case(b)
    }
}

pub struct CommandTable {
    dict: Dict<Vec<u8>, Rc<RedisCommand>, CommandNameType>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        let mut dict = Dict::new(CommandNameType);
        for cmd in command_table() {
            let _ = dict.add(cmd.name.as_bytes().to_vec(), Rc::new(cmd));
        }
        Self { dict }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<Rc<RedisCommand>> {
        self.dict.peek(&name.to_vec()).cloned()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<RedisCommand>> + '_ {
        self.dict.iter().map(|(_, cmd)| cmd)
    }
}

#[rustfmt::skip]
fn command_table() -> Vec<RedisCommand> {
    use RedisCommand as C;
    vec![
        C::new("get", strings::get_command, 2, "rF", 1, 1, 1),
        C::new("set", strings::set_command, -3, "wm", 1, 1, 1),
        C::new("setnx", strings::setnx_command, 3, "wmF", 1, 1, 1),
        C::new("setex", strings::setex_command, 4, "wm", 1, 1, 1),
        C::new("psetex", strings::psetex_command, 4, "wm", 1, 1, 1),
        C::new("getset", strings::getset_command, 3, "wm", 1, 1, 1),
        C::new("append", strings::append_command, 3, "wm", 1, 1, 1),
        C::new("strlen", strings::strlen_command, 2, "rF", 1, 1, 1),
        C::new("incr", strings::incr_command, 2, "wmF", 1, 1, 1),
        C::new("decr", strings::decr_command, 2, "wmF", 1, 1, 1),
        C::new("incrby", strings::incrby_command, 3, "wmF", 1, 1, 1),
        C::new("decrby", strings::decrby_command, 3, "wmF", 1, 1, 1),
        C::new("mget", strings::mget_command, -2, "r", 1, -1, 1),
        C::new("mset", strings::mset_command, -3, "wm", 1, -1, 2),
        C::new("del", keys::del_command, -2, "w", 1, -1, 1),
        C::new("exists", keys::exists_command, -2, "rF", 1, -1, 1),
        C::new("type", keys::type_command, 2, "rF", 1, 1, 1),
        C::new("keys", keys::keys_command, 2, "rS", 0, 0, 0),
        C::new("scan", keys::scan_command, -2, "rR", 0, 0, 0),
        C::new("randomkey", keys::randomkey_command, 1, "rR", 0, 0, 0),
        C::new("dbsize", keys::dbsize_command, 1, "rF", 0, 0, 0),
        C::new("select", keys::select_command, 2, "rlF", 0, 0, 0),
        C::new("flushdb", keys::flushdb_command, 1, "w", 0, 0, 0),
        C::new("flushall", keys::flushall_command, 1, "w", 0, 0, 0),
        C::new("expire", keys::expire_command, 3, "wF", 1, 1, 1),
        C::new("pexpire", keys::pexpire_command, 3, "wF", 1, 1, 1),
        C::new("expireat", keys::expireat_command, 3, "wF", 1, 1, 1),
        C::new("pexpireat", keys::pexpireat_command, 3, "wF", 1, 1, 1),
        C::new("ttl", keys::ttl_command, 2, "rF", 1, 1, 1),
        C::new("pttl", keys::pttl_command, 2, "rF", 1, 1, 1),
        C::new("persist", keys::persist_command, 2, "wF", 1, 1, 1),
        C::new("rename", keys::rename_command, 3, "w", 1, 2, 1),
        C::new("object", keys::object_command, 3, "r", 2, 2, 1),
        C::new("zadd", zset::zadd_command, -4, "wmF", 1, 1, 1),
        C::new("zincrby", zset::zincrby_command, 4, "wmF", 1, 1, 1),
        C::new("zrem", zset::zrem_command, -3, "wF", 1, 1, 1),
        C::new("zscore", zset::zscore_command, 3, "rF", 1, 1, 1),
        C::new("zcard", zset::zcard_command, 2, "rF", 1, 1, 1),
        C::new("zrank", zset::zrank_command, 3, "rF", 1, 1, 1),
        C::new("zrevrank", zset::zrevrank_command, 3, "rF", 1, 1, 1),
        C::new("zrange", zset::zrange_command, -4, "r", 1, 1, 1),
        C::new("zrevrange", zset::zrevrange_command, -4, "r", 1, 1, 1),
        C::new("zrangebyscore", zset::zrangebyscore_command, -4, "r", 1, 1, 1),
        C::new("zrevrangebyscore", zset::zrevrangebyscore_command, -4, "r", 1, 1, 1),
        C::new("zcount", zset::zcount_command, 4, "rF", 1, 1, 1),
        C::new("zremrangebyscore", zset::zremrangebyscore_command, 4, "w", 1, 1, 1),
        C::new("zremrangebyrank", zset::zremrangebyrank_command, 4, "w", 1, 1, 1),
        C::new("ping", server_cmds::ping_command, -1, "rtF", 0, 0, 0),
        C::new("echo", server_cmds::echo_command, 2, "rF", 0, 0, 0),
        C::new("time", server_cmds::time_command, 1, "rRF", 0, 0, 0),
        C::new("info", server_cmds::info_command, -1, "rlt", 0, 0, 0),
        C::new("command", server_cmds::command_command, -1, "rlt", 0, 0, 0),
        C::new("config", server_cmds::config_command, -2, "art", 0, 0, 0),
        C::new("client", server_cmds::client_command, -2, "ar", 0, 0, 0),
        C::new("shutdown", server_cmds::shutdown_command, -1, "arlt", 0, 0, 0),
    ]
}

/// Parses `argv[idx]` as an integer, replying with an error when it is not.
pub(crate) fn arg_i64(c: &mut Client, idx: usize) -> Option<i64> {
    let parsed = util::string2ll(&c.argv[idx]);
    if parsed.is_none() {
        reply::out_err(&mut c.reply, ERR_NOT_INTEGER);
    }
    parsed
}

/// Parses `argv[idx]` as a float, replying with an error when it is not.
pub(crate) fn arg_f64(c: &mut Client, idx: usize) -> Option<f64> {
    let parsed = util::parse_f64(&c.argv[idx]);
    if parsed.is_none() {
        reply::out_err(&mut c.reply, ERR_NOT_FLOAT);
    }
    parsed
}

pub(crate) fn out_wrongtype(out: &mut Reply) {
    reply::out_err_code(out, ERR_WRONGTYPE);
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = CommandTable::new();
        assert_eq!(table.lookup(b"GeT").unwrap().name, "get");
        assert!(table.lookup(b"nosuch").is_none());
        let set = table.lookup(b"SET").unwrap();
        assert!(set.has_flag(CMD_WRITE) && set.has_flag(CMD_DENYOOM));
        assert_eq!(set.flag_names(), vec!["write", "denyoom"]);
    }

    #[test]
    fn test_key_positions() {
        let table = CommandTable::new();
        assert_eq!(table.lookup(b"mset").unwrap().key_positions(5), vec![1, 3]);
        assert_eq!(table.lookup(b"del").unwrap().key_positions(4), vec![1, 2, 3]);
        assert_eq!(table.lookup(b"rename").unwrap().key_positions(3), vec![1, 2]);
        assert!(table.lookup(b"ping").unwrap().key_positions(1).is_empty());
    }

    #[test]
    fn test_dispatch_errors_and_stats() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["nosuch", "x"]), "-ERR unknown command 'nosuch'\r\n");
        assert_eq!(
            run(&mut s, &mut c, &["GET"]),
            "-ERR wrong number of arguments for 'get' command\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["set", "k"]),
            "-ERR wrong number of arguments for 'set' command\r\n"
        );
        assert_eq!(run(&mut s, &mut c, &["set", "k", "v"]), "+OK\r\n");
        assert_eq!(run(&mut s, &mut c, &["get", "k"]), "$1\r\nv\r\n");
        assert_eq!(s.commands.lookup(b"get").unwrap().calls(), 1);
        assert_eq!(s.stats.numcommands, 2);
        assert_eq!(c.last_cmd, "get");
    }

    #[test]
    fn test_quit_closes_after_reply() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["QUIT"]), "+OK\r\n");
        assert!(c.has_flag(crate::networking::CLIENT_CLOSE_AFTER_REPLY));
    }

    struct DenyWrites;

    impl crate::server::CommandFilter for DenyWrites {
        fn check(&self, cmd: &RedisCommand, _c: &Client) -> Result<(), String> {
            if cmd.has_flag(CMD_WRITE) {
                Err(String::from("READONLY You can't write against a read only replica."))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_command_filter_gates_execution() {
        let mut s = state();
        s.filter = Some(Box::new(DenyWrites));
        let mut c = client();
        assert!(run(&mut s, &mut c, &["set", "k", "v"]).starts_with("-READONLY"));
        assert_eq!(run(&mut s, &mut c, &["get", "k"]), "$-1\r\n");
    }

    #[derive(Default)]
    struct Log(std::rc::Rc<std::cell::RefCell<Vec<String>>>);

    impl crate::db::KeyspaceEvents for Log {
        fn key_modified(&mut self, db: usize, key: &[u8]) {
            self.0.borrow_mut().push(format!("{db}:{}", String::from_utf8_lossy(key)));
        }

        fn db_flushed(&mut self, db: usize) {
            self.0.borrow_mut().push(format!("{db}:*"));
        }
    }

    #[test]
    fn test_writes_signal_modified_keys() {
        let log = Log::default();
        let seen = log.0.clone();
        let mut s = state();
        s.events = Box::new(log);
        let mut c = client();
        run(&mut s, &mut c, &["set", "a", "1"]);
        run(&mut s, &mut c, &["incr", "a"]);
        run(&mut s, &mut c, &["get", "a"]);
        run(&mut s, &mut c, &["del", "a", "missing"]);
        assert_eq!(*seen.borrow(), vec!["0:a", "0:a", "0:a"]);
        assert_eq!(s.dirty, 3);

        seen.borrow_mut().clear();
        run(&mut s, &mut c, &["set", "b", "1", "ex", "100"]);
        assert_eq!(run(&mut s, &mut c, &["persist", "b"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["persist", "b"]), ":0\r\n");
        run(&mut s, &mut c, &["flushdb"]);
        assert_eq!(*seen.borrow(), vec!["0:b", "0:b", "0:*"]);

        seen.borrow_mut().clear();
        run(&mut s, &mut c, &["flushall"]);
        let expected: Vec<String> = (0..s.dbs.len()).map(|id| format!("{id}:*")).collect();
        assert_eq!(*seen.borrow(), expected);
    }
}

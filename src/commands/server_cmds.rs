//! Connection and introspection commands.

use std::fmt::Write as _;

use tracing::{info, warn};

use crate::commands::{ERR_SYNTAX, RedisCommand};
use crate::networking::reply::{out_arr, out_bulk, out_err, out_int, out_nil, out_ok, out_status, out_str};
use crate::networking::{CLIENT_CLOSE_AFTER_REPLY, Client};
use crate::server::{ServerState, Stats, VERSION};
use crate::util;

pub fn ping_command(_s: &mut ServerState, c: &mut Client) {
    match c.argv.len() {
        1 => out_status(&mut c.reply, "PONG"),
        2 => out_bulk(&mut c.reply, &c.argv[1]),
        _ => out_err(&mut c.reply, "wrong number of arguments for 'ping' command"),
    }
}

pub fn echo_command(_s: &mut ServerState, c: &mut Client) {
    out_bulk(&mut c.reply, &c.argv[1]);
}

pub fn time_command(_s: &mut ServerState, c: &mut Client) {
    let us = util::ustime();
    out_arr(&mut c.reply, 2);
    out_str(&mut c.reply, &(us / 1_000_000).to_string());
    out_str(&mut c.reply, &(us % 1_000_000).to_string());
}

/// Renders the named INFO section, or every default section for
/// `default`/`all`.
fn gen_info_string(s: &ServerState, c: &Client, section: &str) -> String {
    let all = section == "all";
    let default = all || section == "default";
    let wants = |name: &str| default || section == name;
    let now = util::mstime();
    let mut info = String::new();

    if wants("server") {
        let uptime = (now - s.start_time) / 1000;
        let _ = write!(
            info,
            "# Server\r\n\
             redis_version:{VERSION}\r\n\
             arch_bits:{}\r\n\
             process_id:{}\r\n\
             tcp_port:{}\r\n\
             uptime_in_seconds:{uptime}\r\n\
             uptime_in_days:{}\r\n\
             hz:{}\r\n",
            usize::BITS,
            std::process::id(),
            s.port,
            uptime / 86400,
            s.config.hz,
        );
    }

    if wants("clients") {
        let others = s.clients.values();
        let longest_output = others.clone().map(|o| o.reply.chunk_count()).max().unwrap_or(0);
        let biggest_input = others.map(|o| o.querybuf.len()).max().unwrap_or(0);
        if !info.is_empty() {
            info.push_str("\r\n");
        }
        let _ = write!(
            info,
            "# Clients\r\n\
             connected_clients:{}\r\n\
             client_longest_output_list:{}\r\n\
             client_biggest_input_buf:{}\r\n",
            s.clients.len() + 1,
            longest_output.max(c.reply.chunk_count()),
            biggest_input.max(c.querybuf.len()),
        );
    }

    if wants("stats") {
        let Stats {
            numcommands,
            numconnections,
            rejected_conn,
            net_input_bytes,
            net_output_bytes,
            keyspace_hits,
            keyspace_misses,
        } = s.stats;
        if !info.is_empty() {
            info.push_str("\r\n");
        }
        let _ = write!(
            info,
            "# Stats\r\n\
             total_connections_received:{numconnections}\r\n\
             total_commands_processed:{numcommands}\r\n\
             rejected_connections:{rejected_conn}\r\n\
             total_net_input_bytes:{net_input_bytes}\r\n\
             total_net_output_bytes:{net_output_bytes}\r\n\
             expired_keys:{}\r\n\
             keyspace_hits:{keyspace_hits}\r\n\
             keyspace_misses:{keyspace_misses}\r\n",
            s.expired_keys(),
        );
    }

    if all || section == "commandstats" {
        if !info.is_empty() {
            info.push_str("\r\n");
        }
        info.push_str("# Commandstats\r\n");
        let mut used: Vec<_> = s.commands.iter().filter(|cmd| cmd.calls() > 0).collect();
        used.sort_by_key(|cmd| cmd.name);
        for cmd in used {
            let _ = write!(
                info,
                "cmdstat_{}:calls={},usec={},usec_per_call={:.2}\r\n",
                cmd.name,
                cmd.calls(),
                cmd.microseconds(),
                cmd.microseconds() as f64 / cmd.calls() as f64,
            );
        }
    }

    if wants("keyspace") {
        if !info.is_empty() {
            info.push_str("\r\n");
        }
        info.push_str("# Keyspace\r\n");
        for db in s.dbs.iter().filter(|db| !db.is_empty()) {
            let _ = write!(info, "db{}:keys={},expires={}\r\n", db.id(), db.len(), db.expires_len());
        }
    }
    info
}

/// INFO [section]
pub fn info_command(s: &mut ServerState, c: &mut Client) {
    let section = match c.argv.len() {
        1 => String::from("default"),
        2 => String::from_utf8_lossy(&c.argv[1]).to_ascii_lowercase(),
        _ => {
            out_err(&mut c.reply, ERR_SYNTAX);
            return;
        }
    };
    let info = gen_info_string(s, c, &section);
    out_bulk(&mut c.reply, info.as_bytes());
}

fn out_command_info(c: &mut Client, cmd: &RedisCommand) {
    let flags = cmd.flag_names();
    out_arr(&mut c.reply, 6);
    out_str(&mut c.reply, cmd.name);
    out_int(&mut c.reply, cmd.arity as i64);
    out_arr(&mut c.reply, flags.len());
    for flag in flags {
        out_status(&mut c.reply, flag);
    }
    out_int(&mut c.reply, cmd.firstkey as i64);
    out_int(&mut c.reply, cmd.lastkey as i64);
    out_int(&mut c.reply, cmd.keystep as i64);
}

/// COMMAND [COUNT | INFO name ...]
pub fn command_command(s: &mut ServerState, c: &mut Client) {
    if c.argv.len() == 1 {
        let mut cmds: Vec<_> = s.commands.iter().cloned().collect();
        cmds.sort_by_key(|cmd| cmd.name);
        out_arr(&mut c.reply, cmds.len());
        for cmd in &cmds {
            out_command_info(c, cmd);
        }
        return;
    }

    let sub = c.argv[1].to_ascii_lowercase();
    match sub.as_slice() {
        b"count" if c.argv.len() == 2 => out_int(&mut c.reply, s.commands.len() as i64),
        b"info" => {
            out_arr(&mut c.reply, c.argv.len() - 2);
            for i in 2..c.argv.len() {
                match s.commands.lookup(&c.argv[i]) {
                    Some(cmd) => out_command_info(c, &cmd),
                    None => out_nil(&mut c.reply),
                }
            }
        }
        _ => out_err(&mut c.reply, "Unknown subcommand or wrong number of arguments."),
    }
}

/// CONFIG GET pattern | CONFIG RESETSTAT
pub fn config_command(s: &mut ServerState, c: &mut Client) {
    let sub = c.argv[1].to_ascii_lowercase();
    match (sub.as_slice(), c.argv.len()) {
        (b"get", 3) => {
            let pattern = &c.argv[2];
            let matches: Vec<_> = s
                .config
                .params()
                .into_iter()
                .filter(|(name, _)| util::string_match(pattern, name.as_bytes(), true))
                .collect();
            out_arr(&mut c.reply, matches.len() * 2);
            for (name, value) in matches {
                out_str(&mut c.reply, name);
                out_str(&mut c.reply, &value);
            }
        }
        (b"resetstat", 2) => {
            s.stats = Stats::default();
            s.dbs.iter_mut().for_each(|db| db.reset_stats());
            s.commands.iter().for_each(|cmd| cmd.reset_stats());
            out_ok(&mut c.reply);
        }
        (b"get" | b"resetstat", _) => out_err(
            &mut c.reply,
            &format!(
                "Wrong number of arguments for CONFIG {}",
                String::from_utf8_lossy(&c.argv[1])
            ),
        ),
        _ => out_err(&mut c.reply, "CONFIG subcommand must be one of GET, RESETSTAT"),
    }
}

/// CLIENT SETNAME name | GETNAME | LIST | ID
pub fn client_command(s: &mut ServerState, c: &mut Client) {
    let sub = c.argv[1].to_ascii_lowercase();
    match (sub.as_slice(), c.argv.len()) {
        (b"list", 2) => {
            let now = util::mstime();
            let mut all: Vec<&Client> = s.clients.values().collect();
            all.push(&*c);
            all.sort_by_key(|cl| cl.id);
            let mut out = String::new();
            for cl in all {
                out.push_str(&cl.info_line(now));
                out.push('\n');
            }
            out_bulk(&mut c.reply, out.as_bytes());
        }
        (b"id", 2) => out_int(&mut c.reply, c.id as i64),
        (b"getname", 2) => match &c.name {
            Some(name) => out_bulk(&mut c.reply, name),
            None => out_nil(&mut c.reply),
        },
        (b"setname", 3) => {
            let name = &c.argv[2];
            if name.iter().any(|&b| !(b'!'..=b'~').contains(&b)) {
                out_err(
                    &mut c.reply,
                    "Client names cannot contain spaces, newlines or special characters.",
                );
                return;
            }
            c.name = if name.is_empty() { None } else { Some(name.clone()) };
            out_ok(&mut c.reply);
        }
        _ => out_err(
            &mut c.reply,
            "Syntax error, try CLIENT (LIST | SETNAME connection-name | GETNAME | ID)",
        ),
    }
}

/// Acknowledges and stops the server once pending replies are flushed.
pub fn shutdown_command(s: &mut ServerState, c: &mut Client) {
    if c.argv.len() > 2 {
        out_err(&mut c.reply, ERR_SYNTAX);
        return;
    }
    if c.argv.len() == 2 && !c.argv[1].eq_ignore_ascii_case(b"nosave") && !c.argv[1].eq_ignore_ascii_case(b"save") {
        out_err(&mut c.reply, ERR_SYNTAX);
        return;
    }
    if s.shutdown_asap {
        warn!("shutdown already in progress");
    }
    info!(client = %c.peer, "user requested shutdown");
    s.shutdown_asap = true;
    c.flags |= CLIENT_CLOSE_AFTER_REPLY;
    out_ok(&mut c.reply);
}

#[cfg(test)]
mod tests {
    use crate::commands::test_support::*;

    #[test]
    fn test_ping_echo_time() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["PING"]), "+PONG\r\n");
        assert_eq!(run(&mut s, &mut c, &["ping", "hi"]), "$2\r\nhi\r\n");
        assert_eq!(
            run(&mut s, &mut c, &["ping", "a", "b"]),
            "-ERR wrong number of arguments for 'ping' command\r\n"
        );
        assert_eq!(run(&mut s, &mut c, &["echo", "hello world"]), "$11\r\nhello world\r\n");
        assert!(run(&mut s, &mut c, &["time"]).starts_with("*2\r\n$10\r\n"));
    }

    #[test]
    fn test_info_sections() {
        let mut s = state();
        let mut c = client();
        run(&mut s, &mut c, &["set", "a", "1"]);
        run(&mut s, &mut c, &["expire", "a", "100"]);
        run(&mut s, &mut c, &["get", "a"]);
        run(&mut s, &mut c, &["get", "missing"]);

        let all = run(&mut s, &mut c, &["info"]);
        assert!(all.contains("# Server\r\n"));
        assert!(all.contains("connected_clients:1\r\n"));
        assert!(all.contains("keyspace_hits:1\r\n"));
        assert!(all.contains("keyspace_misses:1\r\n"));
        assert!(all.contains("db0:keys=1,expires=1\r\n"));
        assert!(!all.contains("cmdstat_"));

        let cmdstats = run(&mut s, &mut c, &["info", "commandstats"]);
        assert!(cmdstats.contains("cmdstat_get:calls=2,"));
        assert!(cmdstats.contains("cmdstat_set:calls=1,"));
        assert!(!cmdstats.contains("# Server"));

        let keyspace = run(&mut s, &mut c, &["INFO", "KEYSPACE"]);
        assert!(keyspace.contains("# Keyspace\r\n") && !keyspace.contains("# Stats"));
    }

    #[test]
    fn test_command_introspection() {
        let mut s = state();
        let mut c = client();
        let count = s.commands.len();
        assert_eq!(run(&mut s, &mut c, &["command", "count"]), format!(":{count}\r\n"));
        assert_eq!(
            run(&mut s, &mut c, &["command", "info", "get", "nosuch"]),
            "*2\r\n*6\r\n$3\r\nget\r\n:2\r\n*2\r\n+readonly\r\n+fast\r\n:1\r\n:1\r\n:1\r\n$-1\r\n"
        );
        assert!(run(&mut s, &mut c, &["command"]).starts_with(&format!("*{count}\r\n")));
    }

    #[test]
    fn test_config_get_and_resetstat() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["config", "get", "maxclients"]), "*2\r\n$10\r\nmaxclients\r\n$5\r\n10000\r\n");
        assert!(run(&mut s, &mut c, &["config", "get", "tcp-*"]).starts_with("*4\r\n"));
        assert_eq!(run(&mut s, &mut c, &["config", "get", "nosuch"]), "*0\r\n");
        assert_eq!(run(&mut s, &mut c, &["config", "resetstat"]), "+OK\r\n");
        assert_eq!(s.stats.numcommands, 1);
        assert_eq!(s.commands.lookup(b"config").unwrap().calls(), 1);
        assert!(run(&mut s, &mut c, &["config", "set", "x", "y"]).starts_with("-ERR CONFIG subcommand"));
    }

    #[test]
    fn test_client_subcommands() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["client", "getname"]), "$-1\r\n");
        assert_eq!(run(&mut s, &mut c, &["client", "setname", "worker-1"]), "+OK\r\n");
        assert_eq!(run(&mut s, &mut c, &["client", "getname"]), "$8\r\nworker-1\r\n");
        assert!(run(&mut s, &mut c, &["client", "setname", "bad name"]).starts_with("-ERR Client names"));
        assert_eq!(run(&mut s, &mut c, &["client", "id"]), ":1\r\n");
        let list = run(&mut s, &mut c, &["client", "list"]);
        assert!(list.contains("id=1 addr=test"));
        assert!(list.contains("name=worker-1"));
        assert!(list.contains("cmd=client"));
        assert!(run(&mut s, &mut c, &["client", "kill"]).starts_with("-ERR Syntax error"));
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["shutdown", "bogus"]), "-ERR syntax error\r\n");
        assert!(!s.shutdown_asap);
        assert_eq!(run(&mut s, &mut c, &["shutdown"]), "+OK\r\n");
        assert!(s.shutdown_asap);
        assert!(c.has_flag(crate::networking::CLIENT_CLOSE_AFTER_REPLY));
    }
}

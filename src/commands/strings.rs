//! String commands.

use crate::commands::{ERR_SYNTAX, arg_i64, out_wrongtype};
use crate::networking::Client;
use crate::networking::reply::{out_arr, out_bulk, out_err, out_int, out_nil, out_ok};
use crate::object::{ObjType, RObj};
use crate::server::ServerState;
use crate::util;

/// Writes the string at `argv[1]` (or nil). Returns false on a type error.
fn get_generic(s: &mut ServerState, c: &mut Client) -> bool {
    let Some(obj) = s.lookup_key_read(c.db, &c.argv[1]) else {
        out_nil(&mut c.reply);
        return true;
    };
    match obj.as_bytes() {
        Some(bytes) => {
            out_bulk(&mut c.reply, &bytes);
            true
        }
        None => {
            out_wrongtype(&mut c.reply);
            false
        }
    }
}

pub fn get_command(s: &mut ServerState, c: &mut Client) {
    get_generic(s, c);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetCondition {
    Always,
    IfMissing,
    IfExists,
}

/// Stores `argv[val_idx]` at `argv[1]`. `expire` is relative, in
/// milliseconds. Replies with `ok_reply` when the value was stored and
/// with `abort_reply` when the condition failed.
fn set_generic(
    s: &mut ServerState,
    c: &mut Client,
    val_idx: usize,
    cond: SetCondition,
    expire: Option<i64>,
    ok_reply: &[u8],
    abort_reply: &[u8],
) {
    // Absolute deadline, rejected when non-positive or past i64::MAX.
    let when = match expire {
        None => None,
        Some(ms) => match util::mstime().checked_add(ms).filter(|_| ms > 0) {
            Some(when) => Some(when),
            None => {
                let name = String::from_utf8_lossy(&c.argv[0]).to_ascii_lowercase();
                out_err(&mut c.reply, &format!("invalid expire time in '{name}' command"));
                return;
            }
        },
    };

    let key = &c.argv[1];
    let exists = s.lookup_key_write(c.db, key).is_some();
    if (cond == SetCondition::IfMissing && exists) || (cond == SetCondition::IfExists && !exists) {
        c.reply.add(abort_reply);
        return;
    }

    let db = &mut s.dbs[c.db];
    db.set_key(key.clone(), RObj::string(c.argv[val_idx].clone()));
    if let Some(when) = when {
        db.set_expire(key, when);
    }
    s.signal_modified_key(c.db, key);
    s.dirty += 1;
    c.reply.add(ok_reply);
}

/// SET key value [EX seconds] [PX milliseconds] [NX] [XX]
pub fn set_command(s: &mut ServerState, c: &mut Client) {
    let mut cond = SetCondition::Always;
    let mut expire = None;
    let mut i = 3;
    while i < c.argv.len() {
        let opt = c.argv[i].to_ascii_lowercase();
        let has_value = i + 1 < c.argv.len();
        match (opt.as_slice(), has_value) {
            (b"nx", _) if cond != SetCondition::IfExists => cond = SetCondition::IfMissing,
            (b"xx", _) if cond != SetCondition::IfMissing => cond = SetCondition::IfExists,
            (b"ex" | b"px", true) if expire.is_none() => {
                let Some(n) = arg_i64(c, i + 1) else {
                    return;
                };
                let unit = if opt.as_slice() == b"ex" { 1000 } else { 1 };
                expire = Some(n.saturating_mul(unit));
                i += 1;
            }
            _ => {
                out_err(&mut c.reply, ERR_SYNTAX);
                return;
            }
        }
        i += 1;
    }
    set_generic(s, c, 2, cond, expire, b"+OK\r\n", b"$-1\r\n");
}

pub fn setnx_command(s: &mut ServerState, c: &mut Client) {
    set_generic(s, c, 2, SetCondition::IfMissing, None, b":1\r\n", b":0\r\n");
}

pub fn setex_command(s: &mut ServerState, c: &mut Client) {
    let Some(secs) = arg_i64(c, 2) else {
        return;
    };
    set_generic(s, c, 3, SetCondition::Always, Some(secs.saturating_mul(1000)), b"+OK\r\n", b"");
}

pub fn psetex_command(s: &mut ServerState, c: &mut Client) {
    let Some(ms) = arg_i64(c, 2) else {
        return;
    };
    set_generic(s, c, 3, SetCondition::Always, Some(ms), b"+OK\r\n", b"");
}

pub fn getset_command(s: &mut ServerState, c: &mut Client) {
    if !get_generic(s, c) {
        return;
    }
    let key = &c.argv[1];
    s.dbs[c.db].set_key(key.clone(), RObj::string(c.argv[2].clone()));
    s.signal_modified_key(c.db, key);
    s.dirty += 1;
}

pub fn append_command(s: &mut ServerState, c: &mut Client) {
    let max = s.config.proto_max_bulk_len;
    let key = &c.argv[1];
    let appended = &c.argv[2];
    let len = match s.lookup_key_write(c.db, key) {
        None => {
            s.dbs[c.db].add(key.clone(), RObj::string(appended.clone()));
            appended.len()
        }
        Some(obj) => {
            let Some(raw) = obj.raw_mut() else {
                out_wrongtype(&mut c.reply);
                return;
            };
            if raw.len() + appended.len() > max {
                out_err(&mut c.reply, "string exceeds maximum allowed size (proto-max-bulk-len)");
                return;
            }
            raw.extend_from_slice(appended);
            raw.len()
        }
    };
    s.signal_modified_key(c.db, key);
    s.dirty += 1;
    out_int(&mut c.reply, len as i64);
}

pub fn strlen_command(s: &mut ServerState, c: &mut Client) {
    match s.lookup_key_read(c.db, &c.argv[1]) {
        None => out_int(&mut c.reply, 0),
        Some(obj) => match obj.as_bytes() {
            Some(bytes) => out_int(&mut c.reply, bytes.len() as i64),
            None => out_wrongtype(&mut c.reply),
        },
    }
}

/// Adds `delta` to the integer at `argv[1]`, keeping any expire.
fn incr_decr(s: &mut ServerState, c: &mut Client, delta: i64) {
    let key = &c.argv[1];
    let new = match s.lookup_key_write(c.db, key) {
        None => {
            s.dbs[c.db].add(key.clone(), RObj::int(delta));
            delta
        }
        Some(obj) => {
            if obj.obj_type() != ObjType::String {
                out_wrongtype(&mut c.reply);
                return;
            }
            let Some(cur) = obj.as_int() else {
                out_err(&mut c.reply, crate::commands::ERR_NOT_INTEGER);
                return;
            };
            let Some(new) = cur.checked_add(delta) else {
                out_err(&mut c.reply, "increment or decrement would overflow");
                return;
            };
            *obj = RObj::int(new);
            new
        }
    };
    s.signal_modified_key(c.db, key);
    s.dirty += 1;
    out_int(&mut c.reply, new);
}

pub fn incr_command(s: &mut ServerState, c: &mut Client) {
    incr_decr(s, c, 1);
}

pub fn decr_command(s: &mut ServerState, c: &mut Client) {
    incr_decr(s, c, -1);
}

pub fn incrby_command(s: &mut ServerState, c: &mut Client) {
    if let Some(delta) = arg_i64(c, 2) {
        incr_decr(s, c, delta);
    }
}

pub fn decrby_command(s: &mut ServerState, c: &mut Client) {
    let Some(delta) = arg_i64(c, 2) else {
        return;
    };
    match delta.checked_neg() {
        Some(delta) => incr_decr(s, c, delta),
        None => out_err(&mut c.reply, "decrement would overflow"),
    }
}

pub fn mget_command(s: &mut ServerState, c: &mut Client) {
    out_arr(&mut c.reply, c.argv.len() - 1);
    for key in &c.argv[1..] {
        match s.lookup_key_read(c.db, key).and_then(|o| o.as_bytes()) {
            Some(bytes) => out_bulk(&mut c.reply, &bytes),
            None => out_nil(&mut c.reply),
        }
    }
}

pub fn mset_command(s: &mut ServerState, c: &mut Client) {
    if c.argv.len() % 2 == 0 {
        out_err(&mut c.reply, "wrong number of arguments for 'mset' command");
        return;
    }
    for pair in c.argv[1..].chunks_exact(2) {
        s.dbs[c.db].set_key(pair[0].clone(), RObj::string(pair[1].clone()));
        s.signal_modified_key(c.db, &pair[0]);
    }
    s.dirty += (c.argv.len() / 2) as u64;
    out_ok(&mut c.reply);
}

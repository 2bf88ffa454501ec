//! Keyspace commands: deletion, expiry, iteration and database selection.

use crate::commands::{ERR_NO_SUCH_KEY, ERR_SYNTAX, arg_i64};
use crate::networking::Client;
use crate::networking::reply::{self, out_arr, out_bulk, out_err, out_int, out_nil, out_ok, out_status};
use crate::server::ServerState;
use crate::util;

/// Default number of buckets visited by one SCAN call.
const SCAN_DEFAULT_COUNT: usize = 10;

pub fn del_command(s: &mut ServerState, c: &mut Client) {
    let now = util::mstime();
    let mut deleted = 0;
    for key in &c.argv[1..] {
        let db = &mut s.dbs[c.db];
        db.expire_if_needed(key, now, s.events.as_mut());
        if db.delete(key) {
            s.signal_modified_key(c.db, key);
            s.dirty += 1;
            deleted += 1;
        }
    }
    out_int(&mut c.reply, deleted);
}

pub fn exists_command(s: &mut ServerState, c: &mut Client) {
    let mut count = 0;
    for key in &c.argv[1..] {
        if s.key_exists(c.db, key) {
            count += 1;
        }
    }
    out_int(&mut c.reply, count);
}

pub fn type_command(s: &mut ServerState, c: &mut Client) {
    let name = s
        .lookup_key_read(c.db, &c.argv[1])
        .map_or("none", |o| o.obj_type().name());
    out_status(&mut c.reply, name);
}

pub fn keys_command(s: &mut ServerState, c: &mut Client) {
    let keys = s.dbs[c.db].keys(&c.argv[1], util::mstime(), s.events.as_mut());
    out_arr(&mut c.reply, keys.len());
    for key in &keys {
        out_bulk(&mut c.reply, key);
    }
}

/// SCAN cursor [MATCH pattern] [COUNT count]
pub fn scan_command(s: &mut ServerState, c: &mut Client) {
    let Some(cursor) = util::string2ll(&c.argv[1]).and_then(|n| u64::try_from(n).ok()) else {
        out_err(&mut c.reply, "invalid cursor");
        return;
    };

    let mut count = SCAN_DEFAULT_COUNT;
    let mut pattern: Option<Vec<u8>> = None;
    let mut i = 2;
    while i < c.argv.len() {
        let opt = &c.argv[i];
        let has_value = i + 1 < c.argv.len();
        if opt.eq_ignore_ascii_case(b"count") && has_value {
            match util::string2ll(&c.argv[i + 1]) {
                Some(n) if n >= 1 => count = n as usize,
                Some(_) => {
                    out_err(&mut c.reply, ERR_SYNTAX);
                    return;
                }
                None => {
                    out_err(&mut c.reply, crate::commands::ERR_NOT_INTEGER);
                    return;
                }
            }
        } else if opt.eq_ignore_ascii_case(b"match") && has_value {
            pattern = Some(c.argv[i + 1].clone()).filter(|p| p.as_slice() != b"*");
        } else {
            out_err(&mut c.reply, ERR_SYNTAX);
            return;
        }
        i += 2;
    }

    // Bound the work when the table is sparse.
    let mut iterations = count.saturating_mul(10);
    let mut keys: Vec<Vec<u8>> = Vec::new();
    let mut next = cursor;
    loop {
        next = s.dbs[c.db].scan(next, |k| keys.push(k.to_vec()));
        iterations -= 1;
        if next == 0 || iterations == 0 || keys.len() >= count {
            break;
        }
    }

    let now = util::mstime();
    keys.retain(|k| pattern.as_deref().is_none_or(|p| util::string_match(p, k, false)));
    keys.retain(|k| !s.dbs[c.db].expire_if_needed(k, now, s.events.as_mut()));

    out_arr(&mut c.reply, 2);
    out_bulk(&mut c.reply, next.to_string().as_bytes());
    out_arr(&mut c.reply, keys.len());
    for key in &keys {
        out_bulk(&mut c.reply, key);
    }
}

pub fn randomkey_command(s: &mut ServerState, c: &mut Client) {
    match s.dbs[c.db].random_key(util::mstime(), s.events.as_mut()) {
        Some(key) => out_bulk(&mut c.reply, &key),
        None => out_nil(&mut c.reply),
    }
}

pub fn dbsize_command(s: &mut ServerState, c: &mut Client) {
    out_int(&mut c.reply, s.dbs[c.db].len() as i64);
}

pub fn select_command(s: &mut ServerState, c: &mut Client) {
    match util::string2ll(&c.argv[1]) {
        Some(id) if id >= 0 && (id as usize) < s.dbs.len() => {
            c.db = id as usize;
            out_ok(&mut c.reply);
        }
        Some(_) => out_err(&mut c.reply, "DB index is out of range"),
        None => out_err(&mut c.reply, "invalid DB index"),
    }
}

pub fn flushdb_command(s: &mut ServerState, c: &mut Client) {
    s.dirty += s.dbs[c.db].flush() as u64;
    s.signal_flushed_db(c.db);
    out_ok(&mut c.reply);
}

pub fn flushall_command(s: &mut ServerState, c: &mut Client) {
    for id in 0..s.dbs.len() {
        s.dirty += s.dbs[id].flush() as u64;
        s.signal_flushed_db(id);
    }
    out_ok(&mut c.reply);
}

/// Shared body of the EXPIRE family. `basetime` is added to the argument
/// after scaling it to milliseconds by `unit`.
fn expire_generic(s: &mut ServerState, c: &mut Client, basetime: i64, unit: i64) {
    let Some(n) = arg_i64(c, 2) else {
        return;
    };
    let Some(when) = n.checked_mul(unit).and_then(|ms| ms.checked_add(basetime)) else {
        out_err(&mut c.reply, "invalid expire time");
        return;
    };

    let key = &c.argv[1];
    if s.lookup_key_write(c.db, key).is_none() {
        out_int(&mut c.reply, 0);
        return;
    }
    if when <= util::mstime() {
        s.dbs[c.db].delete(key);
    } else {
        s.dbs[c.db].set_expire(key, when);
    }
    s.signal_modified_key(c.db, key);
    s.dirty += 1;
    out_int(&mut c.reply, 1);
}

pub fn expire_command(s: &mut ServerState, c: &mut Client) {
    expire_generic(s, c, util::mstime(), 1000);
}

pub fn pexpire_command(s: &mut ServerState, c: &mut Client) {
    expire_generic(s, c, util::mstime(), 1);
}

pub fn expireat_command(s: &mut ServerState, c: &mut Client) {
    expire_generic(s, c, 0, 1000);
}

pub fn pexpireat_command(s: &mut ServerState, c: &mut Client) {
    expire_generic(s, c, 0, 1);
}

fn ttl_generic(s: &mut ServerState, c: &mut Client, in_ms: bool) {
    let key = &c.argv[1];
    if s.lookup_key_read(c.db, key).is_none() {
        out_int(&mut c.reply, -2);
        return;
    }
    match s.dbs[c.db].get_expire(key) {
        None => out_int(&mut c.reply, -1),
        Some(when) => {
            let left = (when - util::mstime()).max(0);
            out_int(&mut c.reply, if in_ms { left } else { (left + 500) / 1000 });
        }
    }
}

pub fn ttl_command(s: &mut ServerState, c: &mut Client) {
    ttl_generic(s, c, false);
}

pub fn pttl_command(s: &mut ServerState, c: &mut Client) {
    ttl_generic(s, c, true);
}

pub fn persist_command(s: &mut ServerState, c: &mut Client) {
    let key = &c.argv[1];
    if s.lookup_key_write(c.db, key).is_some() && s.dbs[c.db].remove_expire(key) {
        s.signal_modified_key(c.db, key);
        s.dirty += 1;
        out_int(&mut c.reply, 1);
    } else {
        out_int(&mut c.reply, 0);
    }
}

pub fn rename_command(s: &mut ServerState, c: &mut Client) {
    let (from, to) = (&c.argv[1], &c.argv[2]);
    if s.lookup_key_write(c.db, from).is_none() {
        out_err(&mut c.reply, ERR_NO_SUCH_KEY);
        return;
    }
    if from != to {
        s.dbs[c.db].rename(from, to.clone());
        s.signal_modified_key(c.db, from);
        s.signal_modified_key(c.db, to);
        s.dirty += 1;
    }
    out_ok(&mut c.reply);
}

/// OBJECT ENCODING|IDLETIME|REFCOUNT key
pub fn object_command(s: &mut ServerState, c: &mut Client) {
    let sub = c.argv[1].to_ascii_lowercase();
    let now = util::mstime();
    let Some(obj) = s.dbs[c.db].lookup_quiet(&c.argv[2], now, s.events.as_mut()) else {
        out_nil(&mut c.reply);
        return;
    };
    match sub.as_slice() {
        b"encoding" => reply::out_str(&mut c.reply, obj.encoding().name()),
        b"idletime" => out_int(&mut c.reply, obj.idle_time() as i64),
        // Values are owned by the keyspace, never shared.
        b"refcount" => out_int(&mut c.reply, 1),
        _ => out_err(
            &mut c.reply,
            "Syntax error. Try OBJECT (refcount|encoding|idletime)",
        ),
    }
}

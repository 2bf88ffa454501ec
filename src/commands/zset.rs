//! Sorted set commands.

use crate::commands::{ERR_SYNTAX, arg_f64, arg_i64, out_wrongtype};
use crate::networking::Client;
use crate::networking::reply::{Reply, out_arr, out_bulk, out_dbl, out_err, out_int, out_nil};
use crate::object::RObj;
use crate::server::ServerState;
use crate::skiplist::RangeSpec;
use crate::zset::{ZAddResult, ZSet, normalize_range};

const ERR_MIN_MAX: &str = "min or max is not a float";

/// The key holds something other than a sorted set. The error reply has
/// already been written.
struct WrongType;

fn lookup_zset<'a>(s: &'a mut ServerState, c: &mut Client, write: bool) -> Result<Option<&'a mut ZSet>, WrongType> {
    let key = &c.argv[1];
    let obj = if write {
        s.lookup_key_write(c.db, key)
    } else {
        s.lookup_key_read(c.db, key)
    };
    let Some(obj) = obj else {
        return Ok(None);
    };
    match obj.zset_mut() {
        Some(zs) => Ok(Some(zs)),
        None => {
            out_wrongtype(&mut c.reply);
            Err(WrongType)
        }
    }
}

/// The sorted set at `argv[1]`, created empty when missing.
fn create_zset<'a>(s: &'a mut ServerState, c: &mut Client) -> Option<&'a mut ZSet> {
    if s.lookup_key_write(c.db, &c.argv[1]).is_none() {
        s.dbs[c.db].add(c.argv[1].clone(), RObj::zset(ZSet::new()));
    }
    lookup_zset(s, c, true).ok().flatten()
}

/// Finishes a write: drops the key once the set is empty and records the
/// change.
fn after_write(s: &mut ServerState, c: &Client, changed: usize) {
    if changed == 0 {
        return;
    }
    let key = &c.argv[1];
    let empty = s.dbs[c.db].dict().peek(key).and_then(RObj::as_zset).is_some_and(ZSet::is_empty);
    if empty {
        s.dbs[c.db].delete(key);
    }
    s.signal_modified_key(c.db, key);
    s.dirty += changed as u64;
}

fn out_elements(out: &mut Reply, elements: &[(Vec<u8>, f64)], withscores: bool) {
    out_arr(out, if withscores { elements.len() * 2 } else { elements.len() });
    for (member, score) in elements {
        out_bulk(out, member);
        if withscores {
            out_dbl(out, *score);
        }
    }
}

/// ZADD key score member [score member ...]
pub fn zadd_command(s: &mut ServerState, c: &mut Client) {
    if c.argv.len() % 2 != 0 {
        out_err(&mut c.reply, ERR_SYNTAX);
        return;
    }
    let mut scores = Vec::with_capacity((c.argv.len() - 2) / 2);
    for idx in (2..c.argv.len()).step_by(2) {
        let Some(score) = arg_f64(c, idx) else {
            return;
        };
        scores.push(score);
    }

    let Some(zs) = create_zset(s, c) else {
        return;
    };

    let (mut added, mut updated) = (0, 0);
    for (score, member) in scores.into_iter().zip(c.argv[3..].iter().step_by(2)) {
        match zs.add(score, member) {
            ZAddResult::Added => added += 1,
            ZAddResult::Updated => updated += 1,
            ZAddResult::Unchanged => {}
        }
    }
    after_write(s, c, added + updated);
    out_int(&mut c.reply, added as i64);
}

pub fn zincrby_command(s: &mut ServerState, c: &mut Client) {
    let Some(delta) = arg_f64(c, 2) else {
        return;
    };
    let Some(zs) = create_zset(s, c) else {
        return;
    };
    match zs.incr(delta, &c.argv[3]) {
        Some(score) => {
            after_write(s, c, 1);
            out_dbl(&mut c.reply, score);
        }
        None => {
            out_err(&mut c.reply, "resulting score is not a number (NaN)");
        }
    }
}

pub fn zrem_command(s: &mut ServerState, c: &mut Client) {
    let zs = match lookup_zset(s, c, true) {
        Ok(Some(zs)) => zs,
        Ok(None) => return out_int(&mut c.reply, 0),
        Err(WrongType) => return,
    };
    let removed = c.argv[2..].iter().filter(|m| zs.remove(m)).count();
    after_write(s, c, removed);
    out_int(&mut c.reply, removed as i64);
}

pub fn zscore_command(s: &mut ServerState, c: &mut Client) {
    match lookup_zset(s, c, false) {
        Ok(Some(zs)) => match zs.score(&c.argv[2]) {
            Some(score) => out_dbl(&mut c.reply, score),
            None => out_nil(&mut c.reply),
        },
        Ok(None) => out_nil(&mut c.reply),
        Err(WrongType) => {}
    }
}

pub fn zcard_command(s: &mut ServerState, c: &mut Client) {
    match lookup_zset(s, c, false) {
        Ok(Some(zs)) => out_int(&mut c.reply, zs.len() as i64),
        Ok(None) => out_int(&mut c.reply, 0),
        Err(WrongType) => {}
    }
}

fn zrank_generic(s: &mut ServerState, c: &mut Client, reverse: bool) {
    match lookup_zset(s, c, false) {
        Ok(Some(zs)) => match zs.rank(&c.argv[2], reverse) {
            Some(rank) => out_int(&mut c.reply, rank as i64),
            None => out_nil(&mut c.reply),
        },
        Ok(None) => out_nil(&mut c.reply),
        Err(WrongType) => {}
    }
}

pub fn zrank_command(s: &mut ServerState, c: &mut Client) {
    zrank_generic(s, c, false);
}

pub fn zrevrank_command(s: &mut ServerState, c: &mut Client) {
    zrank_generic(s, c, true);
}

/// ZRANGE key start stop [WITHSCORES]
fn zrange_generic(s: &mut ServerState, c: &mut Client, reverse: bool) {
    let Some(start) = arg_i64(c, 2) else {
        return;
    };
    let Some(end) = arg_i64(c, 3) else {
        return;
    };
    let withscores = match c.argv.len() {
        4 => false,
        5 if c.argv[4].eq_ignore_ascii_case(b"withscores") => true,
        _ => {
            out_err(&mut c.reply, ERR_SYNTAX);
            return;
        }
    };

    let zs = match lookup_zset(s, c, false) {
        Ok(Some(zs)) => zs,
        Ok(None) => return out_arr(&mut c.reply, 0),
        Err(WrongType) => return,
    };
    let elements = match normalize_range(start, end, zs.len()) {
        Some((start, end)) => zs.range_by_rank(start, end, reverse),
        None => Vec::new(),
    };
    out_elements(&mut c.reply, &elements, withscores);
}

pub fn zrange_command(s: &mut ServerState, c: &mut Client) {
    zrange_generic(s, c, false);
}

pub fn zrevrange_command(s: &mut ServerState, c: &mut Client) {
    zrange_generic(s, c, true);
}

/// ZRANGEBYSCORE key min max [WITHSCORES] [LIMIT offset count]. The
/// reverse form takes max before min.
fn zrangebyscore_generic(s: &mut ServerState, c: &mut Client, reverse: bool) {
    let (min, max) = if reverse { (3, 2) } else { (2, 3) };
    let Some(range) = RangeSpec::parse(&c.argv[min], &c.argv[max]) else {
        out_err(&mut c.reply, ERR_MIN_MAX);
        return;
    };

    let mut withscores = false;
    let mut offset: i64 = 0;
    let mut limit: i64 = -1;
    let mut i = 4;
    while i < c.argv.len() {
        if c.argv[i].eq_ignore_ascii_case(b"withscores") {
            withscores = true;
            i += 1;
        } else if c.argv[i].eq_ignore_ascii_case(b"limit") && i + 2 < c.argv.len() {
            let Some(o) = arg_i64(c, i + 1) else {
                return;
            };
            let Some(l) = arg_i64(c, i + 2) else {
                return;
            };
            offset = o;
            limit = l;
            i += 3;
        } else {
            out_err(&mut c.reply, ERR_SYNTAX);
            return;
        }
    }

    let zs = match lookup_zset(s, c, false) {
        Ok(Some(zs)) => zs,
        Ok(None) => return out_arr(&mut c.reply, 0),
        Err(WrongType) => return,
    };
    let elements = if offset < 0 {
        Vec::new()
    } else {
        let limit = usize::try_from(limit).ok();
        zs.range_by_score(&range, reverse, offset as usize, limit)
    };
    out_elements(&mut c.reply, &elements, withscores);
}

pub fn zrangebyscore_command(s: &mut ServerState, c: &mut Client) {
    zrangebyscore_generic(s, c, false);
}

pub fn zrevrangebyscore_command(s: &mut ServerState, c: &mut Client) {
    zrangebyscore_generic(s, c, true);
}

pub fn zcount_command(s: &mut ServerState, c: &mut Client) {
    let Some(range) = RangeSpec::parse(&c.argv[2], &c.argv[3]) else {
        out_err(&mut c.reply, ERR_MIN_MAX);
        return;
    };
    match lookup_zset(s, c, false) {
        Ok(Some(zs)) => out_int(&mut c.reply, zs.count(&range) as i64),
        Ok(None) => out_int(&mut c.reply, 0),
        Err(WrongType) => {}
    }
}

pub fn zremrangebyscore_command(s: &mut ServerState, c: &mut Client) {
    let Some(range) = RangeSpec::parse(&c.argv[2], &c.argv[3]) else {
        out_err(&mut c.reply, ERR_MIN_MAX);
        return;
    };
    let zs = match lookup_zset(s, c, true) {
        Ok(Some(zs)) => zs,
        Ok(None) => return out_int(&mut c.reply, 0),
        Err(WrongType) => return,
    };
    let removed = zs.remove_range_by_score(&range);
    after_write(s, c, removed);
    out_int(&mut c.reply, removed as i64);
}

pub fn zremrangebyrank_command(s: &mut ServerState, c: &mut Client) {
    let Some(start) = arg_i64(c, 2) else {
        return;
    };
    let Some(end) = arg_i64(c, 3) else {
        return;
    };
    let zs = match lookup_zset(s, c, true) {
        Ok(Some(zs)) => zs,
        Ok(None) => return out_int(&mut c.reply, 0),
        Err(WrongType) => return,
    };
    let removed = match normalize_range(start, end, zs.len()) {
        Some((start, end)) => zs.remove_range_by_rank(start, end),
        None => 0,
    };
    after_write(s, c, removed);
    out_int(&mut c.reply, removed as i64);
}

#[cfg(test)]
mod tests {
    use crate::commands::test_support::*;

    fn sample() -> (crate::server::ServerState, crate::networking::Client) {
        let mut s = state();
        let mut c = client();
        assert_eq!(run(&mut s, &mut c, &["zadd", "z", "1", "a", "2", "b", "3", "c"]), ":3\r\n");
        (s, c)
    }

    #[test]
    fn test_zadd_counts_only_new_members() {
        let (mut s, mut c) = sample();
        assert_eq!(run(&mut s, &mut c, &["zadd", "z", "5", "a", "4", "d"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["zscore", "z", "a"]), "$1\r\n5\r\n");
        assert_eq!(run(&mut s, &mut c, &["zcard", "z"]), ":4\r\n");
        assert_eq!(run(&mut s, &mut c, &["zadd", "z", "1"]), "-ERR wrong number of arguments for 'zadd' command\r\n");
        assert_eq!(run(&mut s, &mut c, &["zadd", "z", "1", "a", "2"]), "-ERR syntax error\r\n");
        assert_eq!(run(&mut s, &mut c, &["zadd", "z", "x", "a"]), "-ERR value is not a valid float\r\n");
        assert_eq!(run(&mut s, &mut c, &["zadd", "new", "x", "a"]), "-ERR value is not a valid float\r\n");
        assert_eq!(run(&mut s, &mut c, &["exists", "new"]), ":0\r\n");
    }

    #[test]
    fn test_rank_and_reverse_rank() {
        let (mut s, mut c) = sample();
        assert_eq!(run(&mut s, &mut c, &["zrank", "z", "a"]), ":0\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrank", "z", "c"]), ":2\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrevrank", "z", "c"]), ":0\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrank", "z", "zz"]), "$-1\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrank", "none", "a"]), "$-1\r\n");
    }

    #[test]
    fn test_zrange_by_rank() {
        let (mut s, mut c) = sample();
        assert_eq!(
            run(&mut s, &mut c, &["zrange", "z", "0", "-1"]),
            "*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zrevrange", "z", "0", "0", "WITHSCORES"]),
            "*2\r\n$1\r\nc\r\n$1\r\n3\r\n"
        );
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "5", "10"]), "*0\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "-100", "0"]), "*1\r\n$1\r\na\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "0", "1", "bogus"]), "-ERR syntax error\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "a", "1"]), "-ERR value is not an integer or out of range\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "0", "b"]), "-ERR value is not an integer or out of range\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "none", "0", "-1"]), "*0\r\n");
    }

    #[test]
    fn test_zrangebyscore_bounds_and_limit() {
        let (mut s, mut c) = sample();
        assert_eq!(
            run(&mut s, &mut c, &["zrangebyscore", "z", "(1", "+inf"]),
            "*2\r\n$1\r\nb\r\n$1\r\nc\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zrangebyscore", "z", "-inf", "+inf", "limit", "1", "1", "withscores"]),
            "*2\r\n$1\r\nb\r\n$1\r\n2\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zrevrangebyscore", "z", "2", "-inf"]),
            "*2\r\n$1\r\nb\r\n$1\r\na\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zrangebyscore", "z", "0", "10", "limit", "-1", "5"]),
            "*0\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zrangebyscore", "z", "0", "10", "limit", "1", "-1"]),
            "*2\r\n$1\r\nb\r\n$1\r\nc\r\n"
        );
        assert_eq!(run(&mut s, &mut c, &["zrangebyscore", "z", "x", "1"]), "-ERR min or max is not a float\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrangebyscore", "z", "0", "1", "limit", "0"]), "-ERR syntax error\r\n");
    }

    #[test]
    fn test_zcount() {
        let (mut s, mut c) = sample();
        assert_eq!(run(&mut s, &mut c, &["zcount", "z", "-inf", "+inf"]), ":3\r\n");
        assert_eq!(run(&mut s, &mut c, &["zcount", "z", "(1", "(3"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["zcount", "z", "5", "6"]), ":0\r\n");
    }

    #[test]
    fn test_zincrby() {
        let (mut s, mut c) = sample();
        assert_eq!(run(&mut s, &mut c, &["zincrby", "z", "2.5", "a"]), "$3\r\n3.5\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrange", "z", "-1", "-1"]), "*1\r\n$1\r\na\r\n");
        assert_eq!(run(&mut s, &mut c, &["zincrby", "fresh", "1", "m"]), "$1\r\n1\r\n");
        run(&mut s, &mut c, &["zadd", "inf", "+inf", "m"]);
        assert_eq!(
            run(&mut s, &mut c, &["zincrby", "inf", "-inf", "m"]),
            "-ERR resulting score is not a number (NaN)\r\n"
        );
        assert_eq!(
            run(&mut s, &mut c, &["zincrby", "empty", "+inf", "m"]),
            "$3\r\ninf\r\n"
        );
    }

    #[test]
    fn test_removal_deletes_empty_sets() {
        let (mut s, mut c) = sample();
        assert_eq!(run(&mut s, &mut c, &["zrem", "z", "a", "nope"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["zremrangebyscore", "z", "2", "2"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["zremrangebyrank", "z", "0", "-1"]), ":1\r\n");
        assert_eq!(run(&mut s, &mut c, &["exists", "z"]), ":0\r\n");
        assert_eq!(run(&mut s, &mut c, &["zrem", "z", "a"]), ":0\r\n");
        assert_eq!(run(&mut s, &mut c, &["zremrangebyrank", "z", "0", "-1"]), ":0\r\n");
    }

    #[test]
    fn test_wrongtype() {
        let mut s = state();
        let mut c = client();
        run(&mut s, &mut c, &["set", "str", "v"]);
        let wrongtype = "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";
        assert_eq!(run(&mut s, &mut c, &["zadd", "str", "1", "a"]), wrongtype);
        assert_eq!(run(&mut s, &mut c, &["zrange", "str", "0", "1"]), wrongtype);
        assert_eq!(run(&mut s, &mut c, &["zscore", "str", "a"]), wrongtype);
        assert_eq!(run(&mut s, &mut c, &["zcard", "str"]), wrongtype);
    }
}

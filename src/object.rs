//! Values stored in the keyspace.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::util;
use crate::zset::ZSet;

/// Resolution of the LRU clock in milliseconds.
pub const LRU_CLOCK_RESOLUTION: u64 = 1000;
pub const LRU_CLOCK_MAX: u32 = (1 << 24) - 1;

/// Strings longer than this are never stored as integers.
const INT_ENCODING_MAX_LEN: usize = 20;

/// Current value of the 24-bit LRU clock.
pub fn lru_clock() -> u32 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ((ms / LRU_CLOCK_RESOLUTION) & LRU_CLOCK_MAX as u64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
    ZSet,
}

impl ObjType {
    pub fn name(self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::ZSet => "zset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Int,
    SkipList,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Int => "int",
            Encoding::SkipList => "skiplist",
        }
    }
}

#[derive(Debug)]
pub enum Value {
    Raw(Vec<u8>),
    Int(i64),
    ZSet(Box<ZSet>),
}

#[derive(Debug)]
pub struct RObj {
    value: Value,
    lru: u32,
}

impl RObj {
    /// Creates a string, using the integer encoding when the bytes are a
    /// canonical integer.
    pub fn string(bytes: Vec<u8>) -> Self {
        let value = if bytes.len() <= INT_ENCODING_MAX_LEN {
            match util::string2ll(&bytes) {
                Some(n) => Value::Int(n),
                None => Value::Raw(bytes),
            }
        } else {
            Value::Raw(bytes)
        };
        Self::with_value(value)
    }

    pub fn int(n: i64) -> Self {
        Self::with_value(Value::Int(n))
    }

    pub fn zset(zset: ZSet) -> Self {
        Self::with_value(Value::ZSet(Box::new(zset)))
    }

    fn with_value(value: Value) -> Self {
        Self {
            value,
            lru: lru_clock(),
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match self.value {
            Value::Raw(_) | Value::Int(_) => ObjType::String,
            Value::ZSet(_) => ObjType::ZSet,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self.value {
            Value::Raw(_) => Encoding::Raw,
            Value::Int(_) => Encoding::Int,
            Value::ZSet(_) => Encoding::SkipList,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// String contents, decoding integers. `None` for non-strings.
    pub fn as_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match &self.value {
            Value::Raw(b) => Some(Cow::Borrowed(b)),
            Value::Int(n) => Some(Cow::Owned(n.to_string().into_bytes())),
            Value::ZSet(_) => None,
        }
    }

    /// Integer value of a string object.
    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            Value::Int(n) => Some(*n),
            Value::Raw(b) => util::string2ll(b),
            Value::ZSet(_) => None,
        }
    }

    /// Raw bytes of a string, converting an integer encoding in place.
    pub fn raw_mut(&mut self) -> Option<&mut Vec<u8>> {
        if let Value::Int(n) = self.value {
            self.value = Value::Raw(n.to_string().into_bytes());
        }
        match &mut self.value {
            Value::Raw(b) => Some(b),
            _ => None,
        }
    }

    pub fn zset_mut(&mut self) -> Option<&mut ZSet> {
        match &mut self.value {
            Value::ZSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_zset(&self) -> Option<&ZSet> {
        match &self.value {
            Value::ZSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.lru = lru_clock();
    }

    /// Seconds since the object was last accessed.
    pub fn idle_time(&self) -> u64 {
        let now = lru_clock();
        let ticks = if now >= self.lru {
            now - self.lru
        } else {
            (LRU_CLOCK_MAX - self.lru) + now
        };
        ticks as u64 * LRU_CLOCK_RESOLUTION / 1000
    }
}

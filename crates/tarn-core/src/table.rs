//! Hybrid array+hash table for Lua.

use crate::gc::{GcIdx, LuaClosure, UserData};
use crate::string::StringId;
use crate::value::{float_to_integer, NativeId, Number, ThreadId, Value};
use indexmap::IndexMap;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    /// Non-integral float, stored as raw bits for hashing.
    Float(u64),
    String(StringId),
    Boolean(bool),
    Table(GcIdx<Table>),
    Function(GcIdx<LuaClosure>),
    Native(NativeId),
    UserData(GcIdx<UserData>),
    Thread(ThreadId),
}

impl TableKey {
    /// Normalised key for a value, or None for nil, NaN and internal values.
    pub fn from_value(v: &Value) -> Option<TableKey> {
        Some(match v {
            Value::Number(Number::Integer(i)) => TableKey::Integer(*i),
            Value::Number(Number::Float(f)) => {
                if f.is_nan() {
                    return None;
                }
                match float_to_integer(*f) {
                    Some(i) => TableKey::Integer(i),
                    None => TableKey::Float(f.to_bits()),
                }
            }
            Value::String(s) => TableKey::String(*s),
            Value::Boolean(b) => TableKey::Boolean(*b),
            Value::Table(t) => TableKey::Table(*t),
            Value::Function(c) => TableKey::Function(*c),
            Value::NativeFunction(n) => TableKey::Native(*n),
            Value::UserData(u) => TableKey::UserData(*u),
            Value::Thread(t) => TableKey::Thread(*t),
            Value::Tuple(_) => return TableKey::from_value(&v.to_scalar()),
            Value::Nil | Value::Void | Value::TailCallRequest(_) | Value::YieldRequest(_) => {
                return None
            }
        })
    }

    pub fn to_value(self) -> Value {
        match self {
            TableKey::Integer(i) => Value::integer(i),
            TableKey::Float(bits) => Value::float(f64::from_bits(bits)),
            TableKey::String(s) => Value::String(s),
            TableKey::Boolean(b) => Value::Boolean(b),
            TableKey::Table(t) => Value::Table(t),
            TableKey::Function(c) => Value::Function(c),
            TableKey::Native(n) => Value::NativeFunction(n),
            TableKey::UserData(u) => Value::UserData(u),
            TableKey::Thread(t) => Value::Thread(t),
        }
    }
}

/// A Lua table: array part for `1..=n` plus an insertion-ordered hash part.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// array[0] holds key 1.
    array: Vec<Value>,
    hash: IndexMap<TableKey, Value>,
    pub metatable: Option<GcIdx<Table>>,
    /// Last positional index written by a table constructor.
    init_cursor: i64,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
            init_cursor: 0,
        }
    }

    pub fn raw_get(&self, key: &Value) -> Value {
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => self.raw_geti(i),
            Some(k) => self.hash.get(&k).cloned().unwrap_or_default(),
            None => Value::Nil,
        }
    }

    pub fn raw_set(&mut self, key: &Value, value: Value) -> Result<(), &'static str> {
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => {
                self.raw_seti(i, value);
                Ok(())
            }
            Some(k) => {
                self.set_hashed(k, value);
                Ok(())
            }
            None if matches!(key.to_scalar(), Value::Number(Number::Float(f)) if f.is_nan()) => {
                Err("table index is NaN")
            }
            None => Err("table index is nil"),
        }
    }

    pub fn raw_geti(&self, key: i64) -> Value {
        if key >= 1 && (key as u64) <= self.array.len() as u64 {
            self.array[(key - 1) as usize].clone()
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .cloned()
                .unwrap_or_default()
        }
    }

    pub fn raw_seti(&mut self, key: i64, value: Value) {
        let value = value.to_scalar();
        if key >= 1 {
            let idx = (key - 1) as u64;
            if idx < self.array.len() as u64 {
                self.array[idx as usize] = value;
                if idx as usize + 1 == self.array.len() {
                    self.trim_array();
                }
                return;
            }
            if idx == self.array.len() as u64 && !value.is_nil() {
                self.array.push(value);
                self.migrate_hash_to_array();
                return;
            }
        }
        self.set_hashed(TableKey::Integer(key), value);
    }

    pub fn raw_get_str(&self, key: StringId) -> Value {
        self.hash
            .get(&TableKey::String(key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn raw_set_str(&mut self, key: StringId, value: Value) {
        self.set_hashed(TableKey::String(key), value);
    }

    /// Appends after the current border (`t[#t + 1] = v`).
    pub fn append(&mut self, value: Value) {
        let n = self.length();
        self.raw_seti(n + 1, value);
    }

    /// Stores a positional constructor item (`{a, b, ...}`) at the next
    /// constructor index. Nil items still consume an index. With
    /// `expand_tuple`, a tuple contributes every element.
    pub fn init_next_array_key(&mut self, value: Value, expand_tuple: bool) {
        match value {
            Value::Tuple(items) if expand_tuple => {
                for item in items.iter() {
                    self.init_next_array_key(item.clone(), false);
                }
            }
            Value::Void if expand_tuple => {}
            other => {
                self.init_cursor += 1;
                self.raw_seti(self.init_cursor, other);
            }
        }
    }

    fn set_hashed(&mut self, key: TableKey, value: Value) {
        let value = value.to_scalar();
        if value.is_nil() {
            // Keep a tombstone so an in-progress `next` can continue.
            if let Some(slot) = self.hash.get_mut(&key) {
                *slot = Value::Nil;
            }
        } else {
            self.hash.insert(key, value);
        }
    }

    /// A border: `n` such that `t[n]` is non-nil and `t[n+1]` is nil.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            let mut n = 0;
            while !self.raw_geti(n + 1).is_nil() {
                n += 1;
            }
            return n;
        }
        let len = self.array.len();
        if !self.array[len - 1].is_nil() {
            let mut n = len as i64;
            while !self.raw_geti(n + 1).is_nil() {
                n += 1;
            }
            return n;
        }
        let (mut lo, mut hi) = (0usize, len);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// The entry following `key` in iteration order (nil starts iteration).
    /// `Err(())` means `key` is not present in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, ()> {
        let hash_start = if key.is_nil() {
            match self.next_in_array(0) {
                Some(pair) => return Ok(Some(pair)),
                None => 0,
            }
        } else {
            let tk = TableKey::from_value(key).ok_or(())?;
            match tk {
                TableKey::Integer(i) if i >= 1 && (i as u64) <= self.array.len() as u64 => {
                    match self.next_in_array(i as usize) {
                        Some(pair) => return Ok(Some(pair)),
                        None => 0,
                    }
                }
                _ => self.hash.get_index_of(&tk).ok_or(())? + 1,
            }
        };
        Ok(self
            .hash
            .iter()
            .skip(hash_start)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), v.clone())))
    }

    fn next_in_array(&self, from: usize) -> Option<(Value, Value)> {
        (from..self.array.len())
            .find(|&j| !self.array[j].is_nil())
            .map(|j| (Value::integer(j as i64 + 1), self.array[j].clone()))
    }

    fn migrate_hash_to_array(&mut self) {
        loop {
            let next_idx = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Integer(next_idx)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    fn trim_array(&mut self) {
        while self.array.last().is_some_and(Value::is_nil) {
            self.array.pop();
        }
    }
}

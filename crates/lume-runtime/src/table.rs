//! Table objects: dense array part plus hash part
//!
//! This is the minimal table the interpreter needs; hidden-class structures
//! and inline caches are external collaborators and deliberately absent, so
//! `PrepareGetById`-style staging collapses into direct lookups.

use std::collections::HashMap;

use ordered_float::NotNan;

use crate::heap::{Heap, HeapRef};
use crate::value::{RuntimeError, TValue};

/// Normalized hash-part key.
///
/// Integral doubles in `i32` range normalize to `Int`, so `t[1]` and
/// `t[1.0]` are the same slot. Strings are interned, so the cell ordinal is
/// a value key; other heap kinds key by identity.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum TableKey {
    Int(i32),
    Num(NotNan<f64>),
    Str(HeapRef),
    Bool(bool),
    Obj(HeapRef),
}

impl TableKey {
    fn from_int(idx: i64) -> TableKey {
        if let Ok(i) = i32::try_from(idx) {
            TableKey::Int(i)
        } else {
            TableKey::Num(NotNan::new(idx as f64).expect("integer index is not NaN"))
        }
    }

    fn from_double(d: f64) -> Option<TableKey> {
        if d.is_nan() {
            return None;
        }
        if d.trunc() == d && (i32::MIN as f64..=i32::MAX as f64).contains(&d) {
            return Some(TableKey::Int(d as i32));
        }
        Some(TableKey::Num(NotNan::new(d).expect("NaN handled above")))
    }

    /// Key for a read. `None` means the key can never be present (nil, NaN)
    /// and the read yields nil.
    pub(crate) fn for_get(heap: &Heap, v: TValue) -> Option<TableKey> {
        if v.is_int32() {
            Some(TableKey::Int(v.as_int32()))
        } else if v.is_double() {
            TableKey::from_double(v.as_double())
        } else if v.is_boolean() {
            Some(TableKey::Bool(v.as_boolean()))
        } else if v.is_pointer() {
            let r = v.as_pointer();
            if heap.str_value(r).is_some() {
                Some(TableKey::Str(r))
            } else {
                Some(TableKey::Obj(r))
            }
        } else {
            None
        }
    }

    /// Key for a write. Nil and NaN keys are type errors.
    pub(crate) fn for_put(heap: &Heap, v: TValue) -> Result<TableKey, RuntimeError> {
        if v.is_nil() {
            return Err(RuntimeError::type_error("table index is nil"));
        }
        if v.is_double() && v.as_double().is_nan() {
            return Err(RuntimeError::type_error("table index is NaN"));
        }
        TableKey::for_get(heap, v).ok_or_else(|| RuntimeError::type_error("invalid table index"))
    }
}

/// A table value. The array part holds the dense prefix `t[1..=n]` with no
/// trailing nils; everything else lives in the hash part.
#[derive(Clone, Debug)]
pub struct TableObject {
    array: Vec<TValue>,
    hash: HashMap<TableKey, TValue>,
}

impl TableObject {
    pub(crate) fn new(inline_capacity: usize, array_size_hint: usize) -> TableObject {
        TableObject {
            array: Vec::with_capacity(array_size_hint),
            hash: HashMap::with_capacity(inline_capacity),
        }
    }

    pub(crate) fn get_int(&self, idx: i64) -> TValue {
        if idx >= 1 && (idx as usize) <= self.array.len() {
            return self.array[(idx - 1) as usize];
        }
        self.hash
            .get(&TableKey::from_int(idx))
            .copied()
            .unwrap_or_else(TValue::nil)
    }

    pub(crate) fn put_int(&mut self, idx: i64, v: TValue) {
        if idx >= 1 && (idx as usize) <= self.array.len() {
            let i = (idx - 1) as usize;
            self.array[i] = v;
            if v.is_nil() && i + 1 == self.array.len() {
                while matches!(self.array.last(), Some(x) if x.is_nil()) {
                    self.array.pop();
                }
            }
        } else if idx >= 1 && idx as usize == self.array.len() + 1 && !v.is_nil() {
            self.array.push(v);
            // Pull consecutive successors out of the hash part so the dense
            // prefix stays canonical.
            loop {
                let next = self.array.len() as i64 + 1;
                match self.hash.remove(&TableKey::from_int(next)) {
                    Some(x) => self.array.push(x),
                    None => break,
                }
            }
        } else if v.is_nil() {
            self.hash.remove(&TableKey::from_int(idx));
        } else {
            self.hash.insert(TableKey::from_int(idx), v);
        }
    }

    pub(crate) fn get_double(&self, d: f64) -> TValue {
        match TableKey::from_double(d) {
            Some(TableKey::Int(i)) => self.get_int(i as i64),
            Some(key) => self.hash.get(&key).copied().unwrap_or_else(TValue::nil),
            None => TValue::nil(),
        }
    }

    pub(crate) fn put_double(&mut self, d: f64, v: TValue) -> Result<(), RuntimeError> {
        match TableKey::from_double(d) {
            Some(TableKey::Int(i)) => {
                self.put_int(i as i64, v);
                Ok(())
            }
            Some(key) => {
                self.put(key, v);
                Ok(())
            }
            None => Err(RuntimeError::type_error("table index is NaN")),
        }
    }

    pub(crate) fn get_str(&self, s: HeapRef) -> TValue {
        self.hash
            .get(&TableKey::Str(s))
            .copied()
            .unwrap_or_else(TValue::nil)
    }

    pub(crate) fn put_str(&mut self, s: HeapRef, v: TValue) {
        self.put(TableKey::Str(s), v);
    }

    pub(crate) fn get(&self, key: &TableKey) -> TValue {
        if let TableKey::Int(i) = key {
            return self.get_int(*i as i64);
        }
        self.hash.get(key).copied().unwrap_or_else(TValue::nil)
    }

    pub(crate) fn put(&mut self, key: TableKey, v: TValue) {
        if let TableKey::Int(i) = key {
            self.put_int(i as i64, v);
            return;
        }
        if v.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, v);
        }
    }

    /// Table length with the host language's border semantics: an `n >= 0`
    /// with `t[n] != nil` and `t[n+1] == nil`. The dense array-part length
    /// is always such a border and is deterministic for a given table.
    pub(crate) fn border(&self) -> u32 {
        debug_assert!(!matches!(self.array.last(), Some(x) if x.is_nil()));
        self.array.len() as u32
    }

    pub(crate) fn shallow_clone(&self) -> TableObject {
        self.clone()
    }
}

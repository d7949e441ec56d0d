//! Heap arenas with generational typed handles.
//!
//! Objects are never moved; a handle stays valid until its slot is freed, after
//! which the slot's generation is bumped and stale handles stop resolving.

use crate::string::StringId;
use crate::table::Table;
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A typed, generation-checked index into an `Arena<T>`.
pub struct GcIdx<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GcIdx<T> {
    fn new(index: u32, generation: u32) -> Self {
        GcIdx {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packs index and generation into one integer (used as an identity).
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T> fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcIdx({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with a free list.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, value: T) -> GcIdx<T> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return GcIdx::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        GcIdx::new(index, 0)
    }

    pub fn get(&self, idx: GcIdx<T>) -> Option<&T> {
        let slot = self.slots.get(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, idx: GcIdx<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, idx: GcIdx<T>) -> bool {
        self.get(idx).is_some()
    }

    /// Frees a slot. Existing handles to it become stale.
    pub fn remove(&mut self, idx: GcIdx<T>) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx.index);
        self.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<GcIdx<T>> for Arena<T> {
    type Output = T;

    fn index(&self, idx: GcIdx<T>) -> &T {
        match self.get(idx) {
            Some(v) => v,
            None => panic!("stale heap handle {idx:?}"),
        }
    }
}

impl<T> IndexMut<GcIdx<T>> for Arena<T> {
    fn index_mut(&mut self, idx: GcIdx<T>) -> &mut T {
        match self.get_mut(idx) {
            Some(v) => v,
            None => panic!("stale heap handle {idx:?}"),
        }
    }
}

/// A Lua closure: an entry point into the shared instruction stream plus the
/// context holding its captured upvalues.
#[derive(Debug, Clone, Copy)]
pub struct LuaClosure {
    /// Index of the function's `Meta` instruction.
    pub entry_point: usize,
    pub context: GcIdx<ClosureContext>,
}

/// The upvalue cells captured by one execution of a `Closure` instruction.
#[derive(Debug, Clone, Default)]
pub struct ClosureContext {
    pub cells: Vec<GcIdx<UpVal>>,
    /// Upvalue names, parallel to `cells`.
    pub names: Vec<StringId>,
}

/// A shared, mutable upvalue cell.
#[derive(Debug, Clone, Default)]
pub struct UpVal {
    pub value: Value,
}

/// Host data exposed to scripts.
pub struct UserData {
    pub metatable: Option<GcIdx<Table>>,
    pub data: Box<dyn Any>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("metatable", &self.metatable)
            .finish_non_exhaustive()
    }
}

/// All heap-allocated objects of one VM.
#[derive(Default)]
pub struct GcHeap {
    pub tables: Arena<Table>,
    pub closures: Arena<LuaClosure>,
    pub contexts: Arena<ClosureContext>,
    pub upvals: Arena<UpVal>,
    pub userdata: Arena<UserData>,
}

impl GcHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.tables.alloc(Table::new(array_hint, hash_hint))
    }

    pub fn alloc_upval(&mut self, value: Value) -> GcIdx<UpVal> {
        self.upvals.alloc(UpVal { value })
    }

    pub fn alloc_context(&mut self, context: ClosureContext) -> GcIdx<ClosureContext> {
        self.contexts.alloc(context)
    }

    pub fn alloc_closure(
        &mut self,
        entry_point: usize,
        context: GcIdx<ClosureContext>,
    ) -> GcIdx<LuaClosure> {
        self.closures.alloc(LuaClosure {
            entry_point,
            context,
        })
    }

    pub fn alloc_userdata(
        &mut self,
        data: Box<dyn Any>,
        metatable: Option<GcIdx<Table>>,
    ) -> GcIdx<UserData> {
        self.userdata.alloc(UserData { metatable, data })
    }

    /// Metatable of a table or userdata value.
    pub fn metatable_of(&self, value: &Value) -> Option<GcIdx<Table>> {
        match value {
            Value::Table(t) => self.tables.get(*t)?.metatable,
            Value::UserData(u) => self.userdata.get(*u)?.metatable,
            _ => None,
        }
    }
}

//! Metamethod lookup.

use crate::arith::ArithOp;
use crate::vm::Vm;
use std::rc::Rc;
use tarn_core::gc::GcIdx;
use tarn_core::string::{StringId, StringInterner};
use tarn_core::table::Table;
use tarn_core::value::{TailCallData, TypeTag, Value};

/// Pre-interned names the processor looks up at run time.
pub struct MetamethodNames {
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub mod_: StringId,
    pub pow: StringId,
    pub div: StringId,
    pub idiv: StringId,
    pub band: StringId,
    pub bor: StringId,
    pub bxor: StringId,
    pub shl: StringId,
    pub shr: StringId,
    pub unm: StringId,
    pub bnot: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub len: StringId,
    pub concat: StringId,
    pub tostring: StringId,
    pub close: StringId,
    pub name: StringId,
    pub metatable: StringId,
    pub iterator: StringId,
    /// `_ENV`, the only upvalue a dumpable function may have.
    pub env: StringId,
    /// `...`, the name of a variadic parameter.
    pub varargs: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            div: strings.intern(b"__div"),
            idiv: strings.intern(b"__idiv"),
            band: strings.intern(b"__band"),
            bor: strings.intern(b"__bor"),
            bxor: strings.intern(b"__bxor"),
            shl: strings.intern(b"__shl"),
            shr: strings.intern(b"__shr"),
            unm: strings.intern(b"__unm"),
            bnot: strings.intern(b"__bnot"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            tostring: strings.intern(b"__tostring"),
            close: strings.intern(b"__close"),
            name: strings.intern(b"__name"),
            metatable: strings.intern(b"__metatable"),
            iterator: strings.intern(b"__iterator"),
            env: strings.intern(b"_ENV"),
            varargs: strings.intern(b"..."),
        }
    }

    pub fn for_arith(&self, op: ArithOp) -> StringId {
        match op {
            ArithOp::Add => self.add,
            ArithOp::Sub => self.sub,
            ArithOp::Mul => self.mul,
            ArithOp::Div => self.div,
            ArithOp::Mod => self.mod_,
            ArithOp::IDiv => self.idiv,
            ArithOp::Pow => self.pow,
            ArithOp::BAnd => self.band,
            ArithOp::BOr => self.bor,
            ArithOp::BXor => self.bxor,
            ArithOp::Shl => self.shl,
            ArithOp::Shr => self.shr,
        }
    }
}

impl Vm {
    /// Metatable of any value: per-object for tables and userdata, per-type
    /// otherwise.
    pub fn metatable(&self, value: &Value) -> Option<GcIdx<Table>> {
        match value {
            Value::Table(_) | Value::UserData(_) => self.heap.metatable_of(value),
            other => self.type_metatables[other.type_tag()?.index()],
        }
    }

    /// Sets the metatable shared by all values of a non-table type.
    pub fn set_type_metatable(&mut self, tag: TypeTag, metatable: Option<GcIdx<Table>>) {
        self.type_metatables[tag.index()] = metatable;
    }

    pub fn type_metatable(&self, tag: TypeTag) -> Option<GcIdx<Table>> {
        self.type_metatables[tag.index()]
    }

    /// Look up metamethod `name` on `value`. Returns `None` when absent or nil.
    pub fn get_metamethod(&self, value: &Value, name: StringId) -> Option<Value> {
        let mt = self.metatable(&value.to_scalar())?;
        let mm = self.heap.tables.get(mt)?.raw_get_str(name);
        if mm.is_nil() {
            None
        } else {
            Some(mm)
        }
    }

    /// Binary metamethod: the left operand's first, then the right one's.
    pub fn get_binary_metamethod(&self, a: &Value, b: &Value, name: StringId) -> Option<Value> {
        self.get_metamethod(a, name)
            .or_else(|| self.get_metamethod(b, name))
    }

    /// A call request for `__name(a, b)`, if either operand defines it.
    pub fn binary_metamethod_request(
        &self,
        a: &Value,
        b: &Value,
        name: StringId,
    ) -> Option<Rc<TailCallData>> {
        let function = self.get_binary_metamethod(a, b, name)?;
        Some(Rc::new(TailCallData::new(
            function,
            vec![a.clone(), b.clone()],
        )))
    }
}

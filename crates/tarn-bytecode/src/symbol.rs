//! Compile-time-resolved variable references and runtime scope descriptors.

use std::fmt;
use std::rc::Rc;
use tarn_core::string::{StringId, StringInterner};

/// Attribute flags of a local declaration (`<const>`, `<close>`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SymbolAttributes(u8);

impl SymbolAttributes {
    pub const NONE: SymbolAttributes = SymbolAttributes(0);
    pub const CONST: SymbolAttributes = SymbolAttributes(1);
    pub const TO_BE_CLOSED: SymbolAttributes = SymbolAttributes(2);

    pub const fn contains(self, other: SymbolAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: SymbolAttributes) -> SymbolAttributes {
        SymbolAttributes(self.0 | other.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> SymbolAttributes {
        SymbolAttributes(bits & 3)
    }
}

/// Where a variable lives, decided once by the compiler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    /// Slot `index` of the current frame's local scope.
    Local {
        index: usize,
        name: StringId,
        attributes: SymbolAttributes,
    },
    /// Cell `index` of the current closure's context.
    UpValue { index: usize, name: StringId },
    /// Field `name` of the table held by `env`.
    Global { name: StringId, env: Rc<SymbolRef> },
    /// Placeholder for the implicit environment; never loaded or stored.
    DefaultEnv,
}

impl SymbolRef {
    pub fn local(index: usize, name: StringId) -> SymbolRef {
        SymbolRef::Local {
            index,
            name,
            attributes: SymbolAttributes::NONE,
        }
    }

    pub fn local_with(index: usize, name: StringId, attributes: SymbolAttributes) -> SymbolRef {
        SymbolRef::Local {
            index,
            name,
            attributes,
        }
    }

    pub fn upvalue(index: usize, name: StringId) -> SymbolRef {
        SymbolRef::UpValue { index, name }
    }

    pub fn global(name: StringId, env: SymbolRef) -> SymbolRef {
        SymbolRef::Global {
            name,
            env: Rc::new(env),
        }
    }

    /// Slot index for locals and upvalues.
    pub fn index(&self) -> Option<usize> {
        match self {
            SymbolRef::Local { index, .. } | SymbolRef::UpValue { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<StringId> {
        match self {
            SymbolRef::Local { name, .. }
            | SymbolRef::UpValue { name, .. }
            | SymbolRef::Global { name, .. } => Some(*name),
            SymbolRef::DefaultEnv => None,
        }
    }

    pub fn attributes(&self) -> SymbolAttributes {
        match self {
            SymbolRef::Local { attributes, .. } => *attributes,
            _ => SymbolAttributes::NONE,
        }
    }

    pub fn is_to_be_closed(&self) -> bool {
        self.attributes().contains(SymbolAttributes::TO_BE_CLOSED)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SymbolRef::Local { .. } => "local",
            SymbolRef::UpValue { .. } => "upvalue",
            SymbolRef::Global { .. } => "global",
            SymbolRef::DefaultEnv => "env",
        }
    }

    /// Human-readable form, e.g. `local x@2` or `global print`.
    pub fn display<'a>(&'a self, strings: &'a StringInterner) -> SymbolDisplay<'a> {
        SymbolDisplay {
            symbol: self,
            strings,
        }
    }
}

pub struct SymbolDisplay<'a> {
    symbol: &'a SymbolRef,
    strings: &'a StringInterner,
}

impl fmt::Display for SymbolDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol {
            SymbolRef::Local { index, name, .. } | SymbolRef::UpValue { index, name } => write!(
                f,
                "{} {}@{}",
                self.symbol.kind_name(),
                self.strings.get_str(*name),
                index
            ),
            SymbolRef::Global { name, .. } => write!(f, "global {}", self.strings.get_str(*name)),
            SymbolRef::DefaultEnv => f.write_str("env"),
        }
    }
}

/// A lexical block's slot range and its to-be-closed locals, as seen at run
/// time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeScopeBlock {
    /// First slot owned by the block.
    pub from: usize,
    /// Last slot owned by the block itself (before nested blocks).
    pub to: usize,
    /// Last slot owned by the block including nested blocks.
    pub to_inclusive: usize,
    /// To-be-closed locals declared directly in the block, in declaration order.
    pub to_be_closed: Vec<SymbolRef>,
}

/// A function's local layout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeScopeFrame {
    /// Every local of the function, indexed by slot.
    pub debug_symbols: Vec<SymbolRef>,
    /// Last slot of the root block.
    pub to_first_block: usize,
}

impl RuntimeScopeFrame {
    pub fn count(&self) -> usize {
        self.debug_symbols.len()
    }
}

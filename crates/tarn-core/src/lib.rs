//! Core data model for the tarn Lua VM: values, interned strings, tables and
//! the heap arenas that own them.
pub mod gc;
pub mod string;
pub mod table;
pub mod value;

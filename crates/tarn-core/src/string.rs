//! Interned byte strings.
//!
//! Every string the VM sees is interned, so two `StringId`s are equal exactly
//! when their contents are equal. Short strings are stored inline.
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Maximum bytes for inline (short) string storage.
const SSO_MAX: usize = 40;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StringId(pub u32);

#[derive(Clone)]
enum StringData {
    Short { buf: [u8; SSO_MAX], len: u8 },
    Long(Box<[u8]>),
}

/// A Lua string with precomputed hash.
#[derive(Clone)]
pub struct TString {
    data: StringData,
    hash: u32,
}

impl TString {
    fn new(bytes: &[u8], hash: u32) -> Self {
        let data = if bytes.len() <= SSO_MAX {
            let mut buf = [0u8; SSO_MAX];
            buf[..bytes.len()].copy_from_slice(bytes);
            StringData::Short {
                buf,
                len: bytes.len() as u8,
            }
        } else {
            StringData::Long(bytes.into())
        };
        TString { data, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StringData::Short { buf, len } => &buf[..*len as usize],
            StringData::Long(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this string is stored inline.
    pub fn is_short(&self) -> bool {
        matches!(&self.data, StringData::Short { .. })
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "<binary string len={}>", self.len()),
        }
    }
}

/// PUC Lua compatible string hash (luaS_hash).
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns every string and hands out deduplicated ids.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: Vec<TString>,
    /// hash -> ids with that hash
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a byte string, returning the existing id if already present.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let hash = lua_hash(bytes);
        if let Some(ids) = self.lookup.get(&hash) {
            for &id in ids {
                if self.strings[id as usize].as_bytes() == bytes {
                    return StringId(id);
                }
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(TString::new(bytes, hash));
        self.lookup.entry(hash).or_default().push(id);
        StringId(id)
    }

    /// Intern a UTF-8 string.
    pub fn intern_str(&mut self, s: &str) -> StringId {
        self.intern(s.as_bytes())
    }

    /// Look up an id without inserting.
    pub fn find(&self, bytes: &[u8]) -> Option<StringId> {
        let ids = self.lookup.get(&lua_hash(bytes))?;
        ids.iter()
            .copied()
            .find(|&id| self.strings[id as usize].as_bytes() == bytes)
            .map(StringId)
    }

    pub fn get(&self, id: StringId) -> &TString {
        &self.strings[id.0 as usize]
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].as_bytes()
    }

    /// Lossy UTF-8 view, for messages and display.
    pub fn get_str(&self, id: StringId) -> Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(id))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

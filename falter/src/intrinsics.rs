use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use object::{Array, ByteArray, Float, Value};

/// Uniform native signature for intrinsic operations. Unary intrinsics
/// ignore their second operand.
pub type IntrinsicFn = fn(Value, Value) -> Value;

/// Dense identifiers for the intrinsic operations compiled code may
/// reference. The numbering is part of the image ABI: a relocated image
/// only loads against a table with a matching [`IntrinsicsTable::abi_hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Intrinsic {
    FixnumAdd = 0,
    FixnumSub,
    FixnumEqual,
    ArrayLength,
    ArrayAt,
    ByteArrayLength,
    FloatAdd,
    Identity,
}

impl Intrinsic {
    pub const COUNT: usize = Self::Identity as usize + 1;

    pub fn from_raw(raw: u16) -> Option<Self> {
        if (raw as usize) < Self::COUNT {
            // SAFETY: range-checked against COUNT
            Some(unsafe { core::mem::transmute::<u16, Intrinsic>(raw) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FixnumAdd => "fixnum_add",
            Self::FixnumSub => "fixnum_sub",
            Self::FixnumEqual => "fixnum_equal",
            Self::ArrayLength => "array_length",
            Self::ArrayAt => "array_at",
            Self::ByteArrayLength => "byte_array_length",
            Self::FloatAdd => "float_add",
            Self::Identity => "identity",
        }
    }
}

// ── Native implementations ────────────────────────────────────────────

fn fixnum_add(a: Value, b: Value) -> Value {
    debug_assert!(a.is_fixnum() && b.is_fixnum());
    // SAFETY: fixnums by contract
    unsafe { Value::from_i64(a.to_i64().wrapping_add(b.to_i64())) }
}

fn fixnum_sub(a: Value, b: Value) -> Value {
    debug_assert!(a.is_fixnum() && b.is_fixnum());
    // SAFETY: fixnums by contract
    unsafe { Value::from_i64(a.to_i64().wrapping_sub(b.to_i64())) }
}

fn fixnum_equal(a: Value, b: Value) -> Value {
    Value::from_i64((a == b) as i64)
}

fn array_length(a: Value, _b: Value) -> Value {
    // SAFETY: intrinsic contract: `a` is an Array reference
    let array: &Array = unsafe { a.as_ref() };
    Value::from_i64(array.len() as i64)
}

fn array_at(a: Value, b: Value) -> Value {
    // SAFETY: intrinsic contract: `a` is an Array, `b` a fixnum index
    unsafe {
        let array: &Array = a.as_ref();
        array.element(b.to_i64() as u64)
    }
}

fn byte_array_length(a: Value, _b: Value) -> Value {
    // SAFETY: intrinsic contract: `a` is a ByteArray reference
    let bytes: &ByteArray = unsafe { a.as_ref() };
    Value::from_i64(bytes.len() as i64)
}

fn float_add(a: Value, b: Value) -> Value {
    // truncating: intrinsics cannot allocate, so no boxed result
    // SAFETY: intrinsic contract: both are Float references
    unsafe {
        let x: &Float = a.as_ref();
        let y: &Float = b.as_ref();
        Value::from_i64((x.value + y.value) as i64)
    }
}

fn identity(a: Value, _b: Value) -> Value {
    a
}

// ── Table ─────────────────────────────────────────────────────────────

/// Immutable mapping from intrinsic identifiers to native entry points,
/// consulted during relocation and image loading. Construct alternates
/// explicitly (tests, cross-target relocation); the process-wide default
/// comes from [`IntrinsicsTable::get_default`].
pub struct IntrinsicsTable {
    entries: Vec<(Intrinsic, IntrinsicFn)>,
}

impl IntrinsicsTable {
    /// The full built-in set, in id order.
    pub fn with_defaults() -> Self {
        let entries: Vec<(Intrinsic, IntrinsicFn)> = vec![
            (Intrinsic::FixnumAdd, fixnum_add),
            (Intrinsic::FixnumSub, fixnum_sub),
            (Intrinsic::FixnumEqual, fixnum_equal),
            (Intrinsic::ArrayLength, array_length),
            (Intrinsic::ArrayAt, array_at),
            (Intrinsic::ByteArrayLength, byte_array_length),
            (Intrinsic::FloatAdd, float_add),
            (Intrinsic::Identity, identity),
        ];
        debug_assert_eq!(entries.len(), Intrinsic::COUNT);
        Self { entries }
    }

    /// A table containing only the given intrinsics, e.g. the subset a
    /// different target ABI supports.
    pub fn with_entries(entries: Vec<(Intrinsic, IntrinsicFn)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an identifier to its native function, or `None` for an
    /// unknown intrinsic — always a fatal condition for the caller.
    pub fn resolve(&self, id: u16) -> Option<IntrinsicFn> {
        self.entries
            .iter()
            .find(|entry| entry.0 as u16 == id)
            .map(|entry| entry.1)
    }

    /// The native entry point address for an identifier.
    pub fn address_of(&self, id: u16) -> Option<u64> {
        self.resolve(id).map(|f| f as usize as u64)
    }

    /// Hash over the table's (id, name) pairs: the intrinsics ABI version
    /// stamped into every image.
    pub fn abi_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (intrinsic, _) in &self.entries {
            (*intrinsic as u16).hash(&mut hasher);
            intrinsic.name().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// The process-wide default table: constructed on first use, exactly
    /// once, and never mutated afterwards.
    pub fn get_default() -> &'static IntrinsicsTable {
        static DEFAULT: OnceLock<IntrinsicsTable> = OnceLock::new();
        DEFAULT.get_or_init(IntrinsicsTable::with_defaults)
    }
}

impl core::fmt::Debug for IntrinsicsTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntrinsicsTable")
            .field("entries", &self.entries.len())
            .field("abi_hash", &self.abi_hash())
            .finish()
    }
}

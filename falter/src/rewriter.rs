use std::collections::HashMap;

use heap::Space;
use object::{Array, ObjectType, Tagged, Value};

use crate::alloc::alloc_array;

/// Which global table a folded literal indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TableKind {
    Class = 0,
    Function = 1,
    Constant = 2,
}

impl TableKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Class),
            1 => Some(Self::Function),
            2 => Some(Self::Constant),
            _ => None,
        }
    }

    /// Classify a heap object by its header type. Classes and functions
    /// get their own tables; everything else is a constant.
    pub fn of(object_type: ObjectType) -> Self {
        match object_type {
            ObjectType::Class => Self::Class,
            ObjectType::Function => Self::Function,
            ObjectType::Array | ObjectType::ByteArray | ObjectType::Float => {
                Self::Constant
            }
        }
    }
}

/// Encode a folded literal-pool entry: fixnum `index << 2 | kind`.
///
/// Literal pools only ever hold heap references while unfolded (immediate
/// integers live in bytecode), so a fixnum entry is unambiguously an
/// encoded index.
#[inline]
pub fn encode_literal(kind: TableKind, index: u32) -> Value {
    Value::from_i64(((index as i64) << 2) | kind as i64)
}

/// Decode a folded literal-pool entry back into (kind, index).
///
/// # Safety
///
/// `value` must be a fixnum.
#[inline]
pub unsafe fn decode_literal(value: Value) -> (Option<TableKind>, u32) {
    // SAFETY: caller contract
    let raw = unsafe { value.to_i64() };
    (TableKind::from_raw((raw & 0b11) as u8), (raw >> 2) as u32)
}

/// One deduplicated, insertion-ordered table.
///
/// Identity (the reference's address bits), not structural equality, keys
/// the deduplication: two distinct mutable objects with equal contents
/// keep distinct slots.
struct LiteralTable {
    index_of: HashMap<u64, u32, ahash::RandomState>,
    objects: Vec<Value>,
}

impl LiteralTable {
    fn new() -> Self {
        Self {
            index_of: HashMap::default(),
            objects: Vec::new(),
        }
    }

    fn add(&mut self, value: Value) -> u32 {
        debug_assert!(value.is_ref(), "table entries are heap references");
        let key = value.ref_bits();
        if let Some(&index) = self.index_of.get(&key) {
            return index;
        }
        let index = self.objects.len() as u32;
        self.index_of.insert(key, index);
        self.objects.push(value);
        index
    }
}

/// Builds the three global tables during a Fold.
///
/// Index assignment is insertion-ordered and stable: once an object has a
/// slot, every later occurrence folds to the same index.
pub struct ProgramTableRewriter {
    classes: LiteralTable,
    functions: LiteralTable,
    constants: LiteralTable,
}

impl ProgramTableRewriter {
    pub fn new() -> Self {
        Self {
            classes: LiteralTable::new(),
            functions: LiteralTable::new(),
            constants: LiteralTable::new(),
        }
    }

    fn table_mut(&mut self, kind: TableKind) -> &mut LiteralTable {
        match kind {
            TableKind::Class => &mut self.classes,
            TableKind::Function => &mut self.functions,
            TableKind::Constant => &mut self.constants,
        }
    }

    /// Look up or insert `value` in the table for `kind`, returning its
    /// dense index.
    pub fn add(&mut self, kind: TableKind, value: Value) -> u32 {
        self.table_mut(kind).add(value)
    }

    pub fn len(&self, kind: TableKind) -> usize {
        match kind {
            TableKind::Class => self.classes.objects.len(),
            TableKind::Function => self.functions.objects.len(),
            TableKind::Constant => self.constants.objects.len(),
        }
    }

    /// The functions collected so far, in index order. Fold's worklist
    /// drains newly discovered entries from here.
    pub fn function(&self, index: usize) -> Option<Value> {
        self.functions.objects.get(index).copied()
    }

    /// Materialize one table as a heap array, the only allocation a Fold
    /// performs.
    ///
    /// # Safety
    ///
    /// Every value added to the table must be a live reference into
    /// `space`'s program.
    pub unsafe fn materialize(
        &self,
        kind: TableKind,
        space: &Space,
    ) -> Tagged<Array> {
        let objects = match kind {
            TableKind::Class => &self.classes.objects,
            TableKind::Function => &self.functions.objects,
            TableKind::Constant => &self.constants.objects,
        };
        // SAFETY: caller contract
        unsafe { alloc_array(space, objects) }
    }
}

impl Default for ProgramTableRewriter {
    fn default() -> Self {
        Self::new()
    }
}

use crate::header::{Header, ObjectType};
use crate::Value;

// ── Class ──────────────────────────────────────────────────────────

/// A class: name, optional superclass, and its instance field count.
///
/// ```text
/// [Header 8B] [name: Value 8B] [superclass: Value 8B] [field_count: u64 8B]
/// ```
///
/// `name` is a tagged reference to a [`ByteArray`]. `superclass` is a
/// tagged reference to another `Class`, or fixnum 0 for a root class.
#[repr(C)]
pub struct Class {
    pub header: Header,
    pub name: Value,
    pub superclass: Value,
    pub field_count: u64,
}

const _: () = assert!(size_of::<Class>() == 32);

/// Initialize a class object at a raw allocation.
///
/// # Safety
///
/// `ptr` must point to at least `size_of::<Class>()` (32) bytes of writable
/// memory; `name` and `superclass` must be valid tagged values.
pub unsafe fn init_class(
    ptr: *mut Class,
    name: Value,
    superclass: Value,
    field_count: u64,
) {
    unsafe {
        ptr.write(Class {
            header: Header::new(ObjectType::Class),
            name,
            superclass,
            field_count,
        });
    }
}

/// Allocation size for a [`Class`] object.
pub const fn class_allocation_size() -> usize {
    size_of::<Class>()
}

// ── Function ───────────────────────────────────────────────────────

/// A compiled function: literal pool + bytecode, optionally backed by an
/// intrinsic.
///
/// ```text
/// [Header 8B] [name: Value 8B]
/// [literal_count: u32] [bytecode_len: u32]
/// [arity: u16] [intrinsic: i16] [_pad: u32]
/// [entry_point: u64 8B]
/// [literal_0: Value 8B] [literal_1: Value 8B] ...
/// [bytecode byte_0] [bytecode byte_1] ...
/// ```
///
/// While the owning program is unfolded, every literal is a direct tagged
/// reference; while folded, every literal is a fixnum index into one of
/// the program's global tables. `intrinsic` is a dense intrinsic id or −1.
/// `entry_point` is 0 until relocation patches in the native address for
/// the intrinsic; it is plain data, never a heap reference.
#[repr(C)]
pub struct Function {
    pub header: Header,
    pub name: Value,
    literal_count: u32,
    bytecode_len: u32,
    arity: u16,
    intrinsic: i16,
    _pad: u32,
    pub entry_point: u64,
}

const _: () = assert!(size_of::<Function>() == 40);

impl Function {
    #[inline(always)]
    pub fn literal_count(&self) -> u32 {
        self.literal_count
    }

    #[inline(always)]
    pub fn bytecode_len(&self) -> u32 {
        self.bytecode_len
    }

    #[inline(always)]
    pub fn arity(&self) -> u16 {
        self.arity
    }

    /// The dense intrinsic id backing this function, if any.
    #[inline(always)]
    pub fn intrinsic(&self) -> Option<u16> {
        if self.intrinsic < 0 {
            None
        } else {
            Some(self.intrinsic as u16)
        }
    }

    #[inline(always)]
    fn literals_ptr(&self) -> *const Value {
        unsafe { (self as *const Function).add(1) as *const Value }
    }

    /// Access the inline literal pool.
    ///
    /// # Safety
    ///
    /// The memory after this `Function` must contain `literal_count` valid
    /// [`Value`] entries followed by `bytecode_len` bytes.
    #[inline(always)]
    pub unsafe fn literals(&self) -> &[Value] {
        unsafe {
            core::slice::from_raw_parts(
                self.literals_ptr(),
                self.literal_count as usize,
            )
        }
    }

    /// Mutable access to the inline literal pool. Fold/Unfold rewrite the
    /// pool entries in place through this.
    ///
    /// # Safety
    ///
    /// Same layout requirements as [`Function::literals`], and no other
    /// references to the pool may exist.
    #[inline(always)]
    pub unsafe fn literals_mut(&mut self) -> &mut [Value] {
        unsafe {
            let ptr = (self as *mut Function).add(1) as *mut Value;
            core::slice::from_raw_parts_mut(ptr, self.literal_count as usize)
        }
    }

    /// Access the raw bytecode bytes (after the literal pool).
    ///
    /// # Safety
    ///
    /// The memory must be properly laid out (literals then bytecode).
    #[inline(always)]
    pub unsafe fn bytecode(&self) -> &[u8] {
        unsafe {
            let ptr = self.literals_ptr().add(self.literal_count as usize)
                as *const u8;
            core::slice::from_raw_parts(ptr, self.bytecode_len as usize)
        }
    }

    /// Total allocation size for this function.
    #[inline(always)]
    pub fn byte_size(&self) -> usize {
        function_allocation_size(self.literal_count, self.bytecode_len)
    }
}

/// Compute the total allocation size for a [`Function`] object.
pub const fn function_allocation_size(
    literal_count: u32,
    bytecode_len: u32,
) -> usize {
    size_of::<Function>()
        + literal_count as usize * size_of::<Value>()
        + bytecode_len as usize
}

/// Initialize a function object at a raw allocation. The caller must then
/// write the literals and bytecode into the inline areas.
///
/// # Safety
///
/// `ptr` must point to at least
/// `function_allocation_size(literal_count, bytecode_len)` bytes of
/// writable memory; `name` must be a valid tagged value.
pub unsafe fn init_function(
    ptr: *mut Function,
    name: Value,
    literal_count: u32,
    bytecode_len: u32,
    arity: u16,
    intrinsic: i16,
) {
    unsafe {
        ptr.write(Function {
            header: Header::new(ObjectType::Function),
            name,
            literal_count,
            bytecode_len,
            arity,
            intrinsic,
            _pad: 0,
            entry_point: 0,
        });
    }
}

// ── Array ──────────────────────────────────────────────────────────

/// A variable-length array of tagged [`Value`]s.
///
/// ```text
/// [Header 8B] [length: u64 8B] [elem_0 8B] [elem_1 8B] ...
/// ```
///
/// The program's root listings and global tables are Arrays.
#[repr(C)]
pub struct Array {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<Array>() == 16);

impl Array {
    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.length
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` valid elements.
    #[inline(always)]
    pub unsafe fn elements(&self) -> &[Value] {
        unsafe {
            let ptr = (self as *const Array).add(1) as *const Value;
            core::slice::from_raw_parts(ptr, self.length as usize)
        }
    }

    /// # Safety
    ///
    /// Same layout requirements as [`Array::elements`], and no other
    /// references to the elements may exist.
    #[inline(always)]
    pub unsafe fn elements_mut(&mut self) -> &mut [Value] {
        unsafe {
            let ptr = (self as *mut Array).add(1) as *mut Value;
            core::slice::from_raw_parts_mut(ptr, self.length as usize)
        }
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn element(&self, index: u64) -> Value {
        debug_assert!(index < self.length);
        unsafe {
            let ptr = (self as *const Array).add(1) as *const Value;
            *ptr.add(index as usize)
        }
    }
}

/// Initialize an array header at a raw allocation.
///
/// # Safety
///
/// `ptr` must point to at least `size_of::<Array>() + length * 8` bytes.
pub unsafe fn init_array(ptr: *mut Array, length: u64) {
    unsafe {
        ptr.write(Array {
            header: Header::new(ObjectType::Array),
            length,
        });
    }
}

/// Compute the total allocation size for an [`Array`].
pub const fn array_allocation_size(length: u64) -> usize {
    size_of::<Array>() + length as usize * size_of::<Value>()
}

// ── ByteArray ──────────────────────────────────────────────────────

/// A variable-length byte buffer; the representation of string literals
/// and other raw-data constants.
///
/// ```text
/// [Header 8B] [length: u64 8B] [byte_0] [byte_1] ...
/// ```
#[repr(C)]
pub struct ByteArray {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<ByteArray>() == 16);

impl ByteArray {
    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.length
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` valid bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        unsafe {
            let ptr = (self as *const ByteArray).add(1) as *const u8;
            core::slice::from_raw_parts(ptr, self.length as usize)
        }
    }

    /// The bytes as UTF-8, if they are.
    ///
    /// # Safety
    ///
    /// Same layout requirements as [`ByteArray::bytes`].
    #[inline(always)]
    pub unsafe fn as_str(&self) -> Option<&str> {
        unsafe { core::str::from_utf8(self.bytes()).ok() }
    }
}

/// Initialize a byte array header at a raw allocation.
///
/// # Safety
///
/// `ptr` must point to at least `size_of::<ByteArray>() + length` bytes.
pub unsafe fn init_byte_array(ptr: *mut ByteArray, length: u64) {
    unsafe {
        ptr.write(ByteArray {
            header: Header::new(ObjectType::ByteArray),
            length,
        });
    }
}

/// Compute the total allocation size for a [`ByteArray`], rounded up to
/// 8-byte alignment so a following allocation stays aligned.
pub const fn byte_array_allocation_size(length: u64) -> usize {
    (size_of::<ByteArray>() + length as usize + 7) & !7
}

// ── Float ──────────────────────────────────────────────────────────

/// A boxed IEEE 754 double-precision floating-point constant.
///
/// ```text
/// [Header 8B] [value: f64 8B]
/// ```
#[repr(C)]
pub struct Float {
    pub header: Header,
    pub value: f64,
}

const _: () = assert!(size_of::<Float>() == 16);

/// Initialize a float object at a raw allocation.
///
/// # Safety
///
/// `ptr` must point to at least `float_allocation_size()` (16) bytes of
/// writable memory.
pub unsafe fn init_float(ptr: *mut Float, value: f64) {
    unsafe {
        ptr.write(Float {
            header: Header::new(ObjectType::Float),
            value,
        });
    }
}

/// Allocation size for a [`Float`] object.
pub const fn float_allocation_size() -> usize {
    size_of::<Float>()
}

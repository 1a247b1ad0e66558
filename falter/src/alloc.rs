use std::alloc::Layout;
use std::ptr;

use heap::Space;
use object::{
    Array, ByteArray, Class, Float, Function, Tagged, Value,
    array_allocation_size, byte_array_allocation_size, class_allocation_size,
    float_allocation_size, function_allocation_size, init_array,
    init_byte_array, init_class, init_float, init_function,
};

#[inline]
fn object_layout(size: usize) -> Layout {
    Layout::from_size_align(size, heap::OBJECT_ALIGNMENT)
        .expect("object layout")
}

/// Allocate a [`Class`].
///
/// # Safety
///
/// `name` must be a valid tagged reference to a [`ByteArray`];
/// `superclass` must be a valid tagged class reference or fixnum 0.
pub unsafe fn alloc_class(
    space: &Space,
    name: Value,
    superclass: Value,
    field_count: u64,
) -> Tagged<Class> {
    let ptr = space.allocate(object_layout(class_allocation_size()));
    let class_ptr = ptr.as_ptr() as *mut Class;
    // SAFETY: just allocated with the class layout
    unsafe { init_class(class_ptr, name, superclass, field_count) };
    Tagged::from_value(Value::from_ptr(class_ptr))
}

/// Allocate a [`Function`] with inline literals and bytecode.
///
/// `intrinsic` is a dense intrinsic id, or −1 for a plain function.
///
/// # Safety
///
/// `name` must be a valid tagged reference to a [`ByteArray`]; `literals`
/// must contain valid [`Value`]s.
pub unsafe fn alloc_function(
    space: &Space,
    name: Value,
    literals: &[Value],
    bytecode: &[u8],
    arity: u16,
    intrinsic: i16,
) -> Tagged<Function> {
    let literal_count = literals.len() as u32;
    let bytecode_len = bytecode.len() as u32;
    let size = function_allocation_size(literal_count, bytecode_len);
    let ptr = space.allocate(object_layout(size));

    let fn_ptr = ptr.as_ptr() as *mut Function;
    // SAFETY: just allocated with the function layout
    unsafe {
        init_function(
            fn_ptr,
            name,
            literal_count,
            bytecode_len,
            arity,
            intrinsic,
        );
    }

    if !literals.is_empty() {
        // SAFETY: the literal pool starts right after the struct
        unsafe {
            let literals_dst = fn_ptr.add(1) as *mut Value;
            ptr::copy_nonoverlapping(
                literals.as_ptr(),
                literals_dst,
                literals.len(),
            );
        }
    }

    if !bytecode.is_empty() {
        // SAFETY: bytecode follows the literal pool
        unsafe {
            let bc_dst = (fn_ptr.add(1) as *mut Value).add(literals.len())
                as *mut u8;
            ptr::copy_nonoverlapping(
                bytecode.as_ptr(),
                bc_dst,
                bytecode.len(),
            );
        }
    }

    Tagged::from_value(Value::from_ptr(fn_ptr))
}

/// Allocate an [`Array`] with the given elements.
///
/// # Safety
///
/// All elements must be valid [`Value`]s.
pub unsafe fn alloc_array(space: &Space, elements: &[Value]) -> Tagged<Array> {
    let len = elements.len();
    let ptr = space.allocate(object_layout(array_allocation_size(len as u64)));

    let arr_ptr = ptr.as_ptr() as *mut Array;
    // SAFETY: just allocated with the array layout
    unsafe { init_array(arr_ptr, len as u64) };

    if !elements.is_empty() {
        // SAFETY: elements start right after the struct
        unsafe {
            let elems_dst = arr_ptr.add(1) as *mut Value;
            ptr::copy_nonoverlapping(elements.as_ptr(), elems_dst, len);
        }
    }

    Tagged::from_value(Value::from_ptr(arr_ptr))
}

/// Allocate a [`ByteArray`] with the given bytes.
///
/// # Safety
///
/// `space` must outlive every use of the returned reference.
pub unsafe fn alloc_byte_array(space: &Space, bytes: &[u8]) -> Tagged<ByteArray> {
    let len = bytes.len();
    let ptr =
        space.allocate(object_layout(byte_array_allocation_size(len as u64)));

    let ba_ptr = ptr.as_ptr() as *mut ByteArray;
    // SAFETY: just allocated with the byte array layout
    unsafe { init_byte_array(ba_ptr, len as u64) };

    if !bytes.is_empty() {
        // SAFETY: the payload starts right after the struct
        unsafe {
            let bytes_dst = ba_ptr.add(1) as *mut u8;
            ptr::copy_nonoverlapping(bytes.as_ptr(), bytes_dst, len);
        }
    }

    Tagged::from_value(Value::from_ptr(ba_ptr))
}

/// Allocate a [`Float`].
///
/// # Safety
///
/// `space` must outlive every use of the returned reference.
pub unsafe fn alloc_float(space: &Space, value: f64) -> Tagged<Float> {
    let ptr = space.allocate(object_layout(float_allocation_size()));
    let float_ptr = ptr.as_ptr() as *mut Float;
    // SAFETY: just allocated with the float layout
    unsafe { init_float(float_ptr, value) };
    Tagged::from_value(Value::from_ptr(float_ptr))
}

use heap::SizeFn;
use object::{
    Array, ByteArray, Class, Float, Function, Header, ObjectType, Value,
};

/// Trace all Value edges of a heap object.
///
/// Fixnum fields pass through the visitor unchanged by convention — every
/// visitor in this crate checks `is_ref()` before acting. In a folded
/// program a function's literal pool holds fixnum table indices, so the
/// pool contributes no edges until the program is unfolded again.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub unsafe fn trace_object(
    obj: *const u8,
    visitor: &mut dyn FnMut(&mut Value),
) {
    // SAFETY: caller contract
    let header = unsafe { &*(obj as *const Header) };
    match header.object_type() {
        ObjectType::Class => {
            // SAFETY: header says Class
            let class = unsafe { &mut *(obj as *mut Class) };
            visitor(&mut class.name);
            visitor(&mut class.superclass);
        }
        ObjectType::Function => {
            // SAFETY: header says Function
            let function = unsafe { &mut *(obj as *mut Function) };
            visitor(&mut function.name);
            // SAFETY: inline pool follows the struct by construction
            for literal in unsafe { function.literals_mut() } {
                visitor(literal);
            }
        }
        ObjectType::Array => {
            // SAFETY: header says Array
            let array = unsafe { &mut *(obj as *mut Array) };
            // SAFETY: inline elements follow the struct by construction
            for element in unsafe { array.elements_mut() } {
                visitor(element);
            }
        }
        ObjectType::ByteArray | ObjectType::Float => {
            // No reference fields
        }
    }
}

/// Compute the total byte size of a heap object, the counterpart of
/// [`trace_object`] used by linear walks and by image layout.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub unsafe fn object_size(obj: *const u8) -> usize {
    // SAFETY: caller contract
    let header = unsafe { &*(obj as *const Header) };
    match header.object_type() {
        ObjectType::Class => object::class_allocation_size(),
        ObjectType::Function => {
            // SAFETY: header says Function
            let function = unsafe { &*(obj as *const Function) };
            function.byte_size()
        }
        ObjectType::Array => {
            // SAFETY: header says Array
            let array = unsafe { &*(obj as *const Array) };
            object::array_allocation_size(array.len())
        }
        ObjectType::ByteArray => {
            // SAFETY: header says ByteArray
            let bytes = unsafe { &*(obj as *const ByteArray) };
            object::byte_array_allocation_size(bytes.len())
        }
        ObjectType::Float => object::float_allocation_size(),
    }
}

/// The [`SizeFn`] for this object model, e.g. for [`heap::Space::walk`].
pub const OBJECT_SIZE_FN: SizeFn = object_size;

mod value;
mod handle;
mod header;
mod objects;

pub use value::Value;
pub use handle::Tagged;
pub use header::{Header, ObjectType};
pub use objects::{
    Array, ByteArray, Class, Float, Function,
    array_allocation_size, byte_array_allocation_size, class_allocation_size,
    float_allocation_size, function_allocation_size,
    init_array, init_byte_array, init_class, init_float, init_function,
};

//! Shared fixture: a small but representative program for the fold,
//! relocation and image tests.

use object::Value;

use crate::alloc::{
    alloc_array, alloc_byte_array, alloc_class, alloc_float, alloc_function,
};
use crate::intrinsics::Intrinsic;
use crate::program::Program;

pub(crate) struct SampleProgram {
    pub program: Program,
    /// A constant referenced by both `main` and `helper` (identity-shared).
    pub shared_constant: Value,
    pub class_point: Value,
    pub f_main: Value,
    pub f_helper: Value,
    /// A literal-free function backed by an intrinsic.
    pub f_intrinsic: Value,
}

/// Two functions sharing a constant, a class literal, a function literal,
/// and one intrinsic-backed function.
pub(crate) fn sample_program() -> SampleProgram {
    let program = Program::new(64 * 1024);

    let (shared_constant, class_point, f_main, f_helper, f_intrinsic) = {
        let space = program.space();
        // SAFETY: all names/constants are freshly allocated in `space`
        unsafe {
            let shared_constant =
                alloc_byte_array(space, b"shared literal").value();
            let pi = alloc_float(space, 3.14159).value();

            let point_name = alloc_byte_array(space, b"Point").value();
            let class_point =
                alloc_class(space, point_name, Value::from_i64(0), 2).value();

            let helper_name = alloc_byte_array(space, b"helper").value();
            let f_helper = alloc_function(
                space,
                helper_name,
                &[shared_constant, pi],
                &[0x01, 0x02],
                1,
                -1,
            )
            .value();

            let add_name = alloc_byte_array(space, b"fixnum_add").value();
            let f_intrinsic = alloc_function(
                space,
                add_name,
                &[],
                &[],
                2,
                Intrinsic::FixnumAdd as i16,
            )
            .value();

            let main_name = alloc_byte_array(space, b"main").value();
            let f_main = alloc_function(
                space,
                main_name,
                &[shared_constant, class_point, f_helper],
                &[0x10, 0x20, 0x30, 0x40],
                0,
                -1,
            )
            .value();

            (shared_constant, class_point, f_main, f_helper, f_intrinsic)
        }
    };

    let mut program = program;
    // SAFETY: roots reference objects allocated above
    unsafe {
        program.classes =
            alloc_array(program.space(), &[class_point]).value();
        program.functions =
            alloc_array(program.space(), &[f_main, f_helper, f_intrinsic])
                .value();
    }
    program.entry = f_main;

    SampleProgram {
        program,
        shared_constant,
        class_point,
        f_main,
        f_helper,
        f_intrinsic,
    }
}

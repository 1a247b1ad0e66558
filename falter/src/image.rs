use std::alloc::Layout;
use std::fs;
use std::io;
use std::path::Path;
use std::ptr;

use log::info;

use heap::{Space, align_object_size};
use object::Header;

use crate::intrinsics::IntrinsicsTable;
use crate::program::Program;
use crate::relocate::{
    IMAGE_MAGIC, IMAGE_VERSION, ImageHeader, ProgramHeapRelocator,
    mode_from_header, rebase_body, rebase_value, relocated_size,
};
use crate::trace::object_size;

/// Extra space a loaded program gets beyond its image body, so fold,
/// unfold and small edits can allocate without immediately exhausting
/// the space.
const LOAD_HEADROOM: usize = 64 * 1024;

/// Relocate `program` at `base_address` and write the image to `path`.
pub fn save_image(
    program: &Program,
    base_address: u64,
    path: &Path,
) -> io::Result<()> {
    program.assert_quiescent("save_image");

    let size = relocated_size(program).map_err(to_io_error)?;
    let mut buffer = vec![0u8; size];
    ProgramHeapRelocator::new(program, &mut buffer, base_address)
        .relocate()
        .map_err(to_io_error)?;

    fs::write(path, &buffer)?;
    info!(
        "saved image: {} bytes at base 0x{:x} -> {}",
        size,
        base_address,
        path.display()
    );
    Ok(())
}

/// Load an image produced by [`save_image`], rebasing it into a fresh
/// space and resolving intrinsics against the process-wide default table.
pub fn load_image(path: &Path) -> io::Result<Program> {
    load_image_with(path, IntrinsicsTable::get_default())
}

/// [`load_image`] against an explicit intrinsics table.
pub fn load_image_with(
    path: &Path,
    table: &IntrinsicsTable,
) -> io::Result<Program> {
    let bytes = fs::read(path)?;
    if bytes.len() < size_of::<ImageHeader>() {
        return Err(invalid_data("image shorter than its header"));
    }

    // SAFETY: length checked above
    let header = unsafe {
        ptr::read_unaligned(bytes.as_ptr() as *const ImageHeader)
    };
    if header.magic != IMAGE_MAGIC {
        return Err(invalid_data("invalid image magic"));
    }
    if header.version != IMAGE_VERSION {
        return Err(invalid_data("unsupported image version"));
    }
    if header.intrinsics_hash != table.abi_hash() {
        return Err(invalid_data("intrinsics ABI mismatch"));
    }
    let heap_size = header.heap_size as usize;
    if bytes.len() != size_of::<ImageHeader>() + heap_size {
        return Err(invalid_data("image size does not match its header"));
    }
    let Some(mode) = mode_from_header(header.mode) else {
        return Err(invalid_data("invalid program mode in image"));
    };

    let body = &bytes[size_of::<ImageHeader>()..];
    validate_body(body)?;

    // Move the body into a fresh space and rebase it there.
    let space = Space::new(heap_size + LOAD_HEADROOM);
    let dst = space.allocate(
        Layout::from_size_align(heap_size, heap::OBJECT_ALIGNMENT)
            .map_err(|_| invalid_data("image body too large"))?,
    );
    // SAFETY: dst holds heap_size bytes
    unsafe {
        ptr::copy_nonoverlapping(body.as_ptr(), dst.as_ptr(), heap_size);
    }

    let actual_base = dst.as_ptr() as u64;
    // SAFETY: a validated image body, references expressed at the stored
    // base address
    unsafe {
        rebase_body(
            dst.as_ptr(),
            heap_size,
            header.base_address,
            actual_base,
            table,
        )
        .map_err(to_io_error)?;
    }

    let rebase =
        |raw: u64| rebase_value(object::Value::from_raw(raw), header.base_address, actual_base);
    let program = Program::from_parts(
        space,
        rebase(header.classes),
        rebase(header.functions),
        rebase(header.entry),
        rebase(header.class_table),
        rebase(header.function_table),
        rebase(header.constant_table),
        mode,
    );
    info!(
        "loaded image: {} bytes rebased 0x{:x} -> 0x{:x}",
        heap_size, header.base_address, actual_base
    );
    Ok(program)
}

/// Walk the raw body once before trusting it: every object must carry a
/// well-formed header and stay inside the body.
fn validate_body(body: &[u8]) -> io::Result<()> {
    use object::ObjectType;

    let mut offset = 0;
    while offset < body.len() {
        if body.len() - offset < size_of::<Header>() {
            return Err(invalid_data("truncated object header in image"));
        }
        // SAFETY: at least a header's worth of bytes remain
        let header = unsafe { &*(body.as_ptr().add(offset) as *const Header) };
        let Some(object_type) = header.checked_object_type() else {
            return Err(invalid_data("corrupt object header in image"));
        };
        // the fixed part of the struct must be present before its length
        // fields can be read
        let fixed_size = match object_type {
            ObjectType::Class => object::class_allocation_size(),
            ObjectType::Function => object::function_allocation_size(0, 0),
            ObjectType::Array => object::array_allocation_size(0),
            ObjectType::ByteArray => object::byte_array_allocation_size(0),
            ObjectType::Float => object::float_allocation_size(),
        };
        if body.len() - offset < fixed_size {
            return Err(invalid_data("truncated object in image"));
        }
        // SAFETY: header and fixed fields validated above
        let size = unsafe { object_size(body.as_ptr().add(offset)) };
        let aligned = align_object_size(size);
        if aligned == 0 || aligned > body.len() - offset {
            return Err(invalid_data("object overruns the image body"));
        }
        offset += aligned;
    }
    Ok(())
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn to_io_error(err: crate::relocate::RelocateError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::ProgramFolder;
    use crate::intrinsics::Intrinsic;
    use crate::program::ProgramMode;
    use crate::testutil::sample_program;
    use object::{Array, ByteArray, Function, Value};

    const BASE: u64 = 0x5000_0000;

    fn temp_image_path(tag: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_nanos();
        path.push(format!(
            "falter-image-test-{tag}-{}-{nanos}.img",
            std::process::id()
        ));
        path
    }

    unsafe fn nth_function(program: &Program, index: u64) -> &Function {
        unsafe {
            let functions: &Array = program.functions.as_ref();
            &*(functions.element(index).ref_bits() as *const Function)
        }
    }

    #[test]
    fn image_round_trip_preserves_structure_and_sharing() {
        let sample = sample_program();
        let path = temp_image_path("roundtrip");
        save_image(&sample.program, BASE, &path).expect("save image");

        let restored = load_image(&path).expect("load image");
        assert_eq!(restored.mode(), ProgramMode::Unfolded);

        unsafe {
            let main = nth_function(&restored, 0);
            let helper = nth_function(&restored, 1);

            assert_eq!(main.name.as_ref::<ByteArray>().bytes(), b"main");
            assert_eq!(main.bytecode(), &[0x10, 0x20, 0x30, 0x40]);
            assert_eq!(helper.literals().len(), 2);

            // identity sharing survives the image: both pools still point
            // at the *same* constant object
            assert_eq!(
                main.literals()[0],
                helper.literals()[0],
                "shared constant must stay shared after load"
            );
            assert_eq!(
                main.literals()[0].as_ref::<ByteArray>().bytes(),
                b"shared literal"
            );

            // the entry root points at main
            assert_eq!(restored.entry, Value::from_ptr(main as *const Function));

            // the intrinsic function got this process's entry point
            let add = nth_function(&restored, 2);
            assert_eq!(
                Some(add.entry_point),
                IntrinsicsTable::get_default()
                    .address_of(Intrinsic::FixnumAdd as u16)
            );
        }

        let _ = fs::remove_file(path);
    }

    #[test]
    fn folded_image_round_trip_then_unfold() {
        let mut sample = sample_program();
        ProgramFolder::new(&mut sample.program).fold();

        let path = temp_image_path("folded");
        save_image(&sample.program, BASE, &path).expect("save image");
        let mut restored = load_image(&path).expect("load image");
        assert_eq!(restored.mode(), ProgramMode::Folded);

        // the loaded program unfolds against its rebased tables
        ProgramFolder::new(&mut restored)
            .unfold()
            .expect("unfold loaded image");
        unsafe {
            let main = nth_function(&restored, 0);
            assert!(main.literals().iter().all(|l| l.is_ref()));
            assert_eq!(
                main.literals()[0].as_ref::<ByteArray>().bytes(),
                b"shared literal"
            );
        }

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_at_a_different_address_is_equivalent() {
        // two loads of the same file land at different addresses but must
        // be structurally identical
        let sample = sample_program();
        let path = temp_image_path("rebase");
        save_image(&sample.program, BASE, &path).expect("save image");

        let first = load_image(&path).expect("first load");
        let second = load_image(&path).expect("second load");

        unsafe {
            let f1 = nth_function(&first, 1);
            let f2 = nth_function(&second, 1);
            assert_eq!(f1.name.as_ref::<ByteArray>().bytes(), b"helper");
            assert_eq!(f2.name.as_ref::<ByteArray>().bytes(), b"helper");
            assert_eq!(f1.bytecode(), f2.bytecode());
        }

        let _ = fs::remove_file(path);
    }

    #[test]
    fn abi_mismatch_is_rejected() {
        let sample = sample_program();
        let path = temp_image_path("abi");
        save_image(&sample.program, BASE, &path).expect("save image");

        // flip a bit of the stored intrinsics hash
        let mut bytes = fs::read(&path).expect("read image");
        let hash_offset = core::mem::offset_of!(ImageHeader, intrinsics_hash);
        bytes[hash_offset] ^= 0xFF;
        fs::write(&path, &bytes).expect("rewrite image");

        let err = load_image(&path).expect_err("mismatched ABI must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("ABI"));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let sample = sample_program();
        let path = temp_image_path("magic");
        save_image(&sample.program, BASE, &path).expect("save image");

        let mut bytes = fs::read(&path).expect("read image");
        bytes[0] = b'X';
        fs::write(&path, &bytes).expect("rewrite image");

        let err = load_image(&path).expect_err("bad magic must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let sample = sample_program();
        let path = temp_image_path("truncated");
        save_image(&sample.program, BASE, &path).expect("save image");

        let bytes = fs::read(&path).expect("read image");
        fs::write(&path, &bytes[..bytes.len() / 2]).expect("truncate image");

        let err = load_image(&path).expect_err("truncated image must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let _ = fs::remove_file(path);
    }
}

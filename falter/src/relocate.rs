use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ptr;

use log::debug;

use heap::align_object_size;
use object::{ByteArray, Function, Header, ObjectType, Value};

use crate::intrinsics::IntrinsicsTable;
use crate::program::{Program, ProgramMode};
use crate::trace::{object_size, trace_object};

pub const IMAGE_MAGIC: [u8; 8] = *b"FALTIMG\0";
pub const IMAGE_VERSION: u32 = 1;

/// Metadata at the front of every relocated image.
///
/// ```text
/// [magic 8B] [version 4B] [mode 4B]
/// [base_address 8B] [heap_size 8B] [intrinsics_hash 8B]
/// [classes 8B] [functions 8B]
/// [class_table 8B] [function_table 8B] [constant_table 8B]
/// [entry 8B]
/// ```
///
/// The six root fields hold raw [`Value`] bits expressed at
/// `base_address`; the body that follows is the object heap with every
/// reference expressed the same way. Copy the body to `base_address` and
/// the heap is immediately valid.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImageHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub mode: u32,
    pub base_address: u64,
    pub heap_size: u64,
    pub intrinsics_hash: u64,
    pub classes: u64,
    pub functions: u64,
    pub class_table: u64,
    pub function_table: u64,
    pub constant_table: u64,
    pub entry: u64,
}

const _: () = assert!(size_of::<ImageHeader>() == 88);

/// Relocation faults. Only [`RelocateError::TargetTooSmall`] is
/// recoverable — resize the target and retry. The fatal classes leave the
/// operation aborted and must surface as termination, not be caught and
/// continued past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateError {
    /// The caller-supplied target cannot hold the image.
    TargetTooSmall { required: usize, provided: usize },
    /// A function references an intrinsic the supplied table does not
    /// know. The program cannot run on the relocation target.
    UnresolvedIntrinsic { id: u16, function: String },
    /// An edge points outside the program's managed space.
    ForeignReference { address: u64 },
}

impl RelocateError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TargetTooSmall { .. })
    }
}

impl fmt::Display for RelocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetTooSmall { required, provided } => write!(
                f,
                "relocation target too small: {required} bytes required, {provided} provided"
            ),
            Self::UnresolvedIntrinsic { id, function } => write!(
                f,
                "unresolved intrinsic {id} referenced by function `{function}`"
            ),
            Self::ForeignReference { address } => write!(
                f,
                "reference 0x{address:016x} escapes the program's space"
            ),
        }
    }
}

impl std::error::Error for RelocateError {}

// ── Layout pass ───────────────────────────────────────────────────────

/// The result of the first pass: every reachable object mapped to its
/// offset in the image body, in a deterministic discovery order.
struct ImagePlan {
    offsets: HashMap<u64, u64, ahash::RandomState>,
    order: Vec<u64>,
    heap_bytes: usize,
}

fn discover(
    program: &Program,
    value: Value,
    plan: &mut ImagePlan,
    queue: &mut VecDeque<u64>,
) -> Result<(), RelocateError> {
    if !value.is_ref() {
        return Ok(());
    }
    let address = value.ref_bits();
    if plan.offsets.contains_key(&address) {
        return Ok(());
    }
    if !program.space().contains(address) {
        return Err(RelocateError::ForeignReference { address });
    }
    plan.offsets.insert(address, plan.heap_bytes as u64);
    // SAFETY: a contained reference points at a live object
    let size = unsafe { object_size(address as *const u8) };
    plan.heap_bytes += align_object_size(size);
    plan.order.push(address);
    queue.push_back(address);
    Ok(())
}

/// Breadth-first traversal from the roots in fixed order. Offsets are
/// assigned in discovery order, so an unchanged program always lays out
/// identically.
fn plan_layout(program: &Program) -> Result<ImagePlan, RelocateError> {
    let mut plan = ImagePlan {
        offsets: HashMap::default(),
        order: Vec::new(),
        heap_bytes: 0,
    };
    let mut queue = VecDeque::new();

    for root in program.roots() {
        discover(program, root, &mut plan, &mut queue)?;
    }

    let mut edges = Vec::new();
    while let Some(address) = queue.pop_front() {
        edges.clear();
        // SAFETY: discovered addresses point at live objects
        unsafe {
            trace_object(address as *const u8, &mut |slot| {
                edges.push(*slot);
            });
        }
        for &edge in &edges {
            discover(program, edge, &mut plan, &mut queue)?;
        }
    }

    Ok(plan)
}

/// Bytes required to relocate `program`, header included. Run this before
/// sizing the target buffer.
pub fn relocated_size(program: &Program) -> Result<usize, RelocateError> {
    Ok(size_of::<ImageHeader>() + plan_layout(program)?.heap_bytes)
}

// ── Relocator ─────────────────────────────────────────────────────────

/// Walks a program's heap and writes a byte-exact image positioned at an
/// arbitrary base address into caller-supplied storage.
///
/// Purely a transform: the source program is only read; all writes go to
/// the target buffer.
pub struct ProgramHeapRelocator<'a> {
    program: &'a Program,
    target: &'a mut [u8],
    base_address: u64,
    table: &'a IntrinsicsTable,
}

impl<'a> ProgramHeapRelocator<'a> {
    /// Relocate against the process-wide default intrinsics table.
    pub fn new(
        program: &'a Program,
        target: &'a mut [u8],
        base_address: u64,
    ) -> Self {
        Self::with_table(
            program,
            target,
            base_address,
            IntrinsicsTable::get_default(),
        )
    }

    /// Relocate against an explicit table, e.g. when targeting a
    /// different native ABI.
    pub fn with_table(
        program: &'a Program,
        target: &'a mut [u8],
        base_address: u64,
        table: &'a IntrinsicsTable,
    ) -> Self {
        assert!(
            base_address % heap::OBJECT_ALIGNMENT as u64 == 0,
            "base address must be object-aligned"
        );
        Self {
            program,
            target,
            base_address,
            table,
        }
    }

    /// Two passes: lay out and size every reachable object, then copy and
    /// patch. Returns the number of bytes written.
    pub fn relocate(self) -> Result<usize, RelocateError> {
        self.program.assert_quiescent("Relocate");

        let plan = plan_layout(self.program)?;
        let required = size_of::<ImageHeader>() + plan.heap_bytes;
        if self.target.len() < required {
            return Err(RelocateError::TargetTooSmall {
                required,
                provided: self.target.len(),
            });
        }

        // Deterministic padding: the whole image starts as zeroes.
        self.target[..required].fill(0);

        let reloc_root = |value: Value| -> u64 {
            if value.is_ref() {
                let offset = plan.offsets[&value.ref_bits()];
                Value::from_addr(self.base_address + offset).raw()
            } else {
                value.raw()
            }
        };
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            mode: self.program.mode() as u32,
            base_address: self.base_address,
            heap_size: plan.heap_bytes as u64,
            intrinsics_hash: self.table.abi_hash(),
            classes: reloc_root(self.program.classes),
            functions: reloc_root(self.program.functions),
            class_table: reloc_root(self.program.class_table),
            function_table: reloc_root(self.program.function_table),
            constant_table: reloc_root(self.program.constant_table),
            entry: reloc_root(self.program.entry),
        };
        // SAFETY: target holds at least `required` bytes
        unsafe {
            ptr::write_unaligned(
                self.target.as_mut_ptr() as *mut ImageHeader,
                header,
            );
        }

        // SAFETY: body region sits right after the header
        let body =
            unsafe { self.target.as_mut_ptr().add(size_of::<ImageHeader>()) };
        for &address in &plan.order {
            let offset = plan.offsets[&address] as usize;
            // SAFETY: source object is live; destination is inside the
            // target buffer by the layout plan
            let copy = unsafe {
                let size = object_size(address as *const u8);
                ptr::copy_nonoverlapping(
                    address as *const u8,
                    body.add(offset),
                    size,
                );
                body.add(offset)
            };

            // Rewrite every reference edge of the copy to its target
            // address. The layout pass discovered all of them, so the
            // offset lookups cannot miss.
            // SAFETY: the copy is a byte-exact live object image
            unsafe {
                trace_object(copy, &mut |slot| {
                    if slot.is_ref() {
                        let offset = plan.offsets[&slot.ref_bits()];
                        *slot = Value::from_addr(self.base_address + offset);
                    }
                });
            }

            // SAFETY: the copy starts with a valid header
            let object_type =
                unsafe { (*(copy as *const Header)).object_type() };
            if object_type == ObjectType::Function {
                // SAFETY: header says Function
                let function = unsafe { &mut *(copy as *mut Function) };
                match function.intrinsic() {
                    Some(id) => match self.table.address_of(id) {
                        Some(entry) => function.entry_point = entry,
                        None => {
                            // diagnose with the source object; the copy's
                            // name edge already points into the image
                            // SAFETY: source object is live
                            let source =
                                unsafe { &*(address as *const Function) };
                            return Err(RelocateError::UnresolvedIntrinsic {
                                id,
                                function: source_function_name(source),
                            });
                        }
                    },
                    None => function.entry_point = 0,
                }
            }
        }

        debug!(
            "relocated {} objects ({} bytes) to base 0x{:x}",
            plan.order.len(),
            required,
            self.base_address
        );
        Ok(required)
    }
}

fn source_function_name(function: &Function) -> String {
    if function.name.is_ref() {
        // SAFETY: function names are byte arrays
        let bytes: &ByteArray = unsafe { function.name.as_ref() };
        // SAFETY: live name object
        if let Some(s) = unsafe { bytes.as_str() } {
            return s.to_owned();
        }
    }
    "<anonymous>".to_owned()
}

// ── Inverse pass ──────────────────────────────────────────────────────

/// Rebase an image body in place: the relocation algorithm run in
/// reverse, subtracting the stored base and adding the actual load
/// address, then re-resolving every intrinsic against `table` (entry
/// points stamped by another process name nothing in this one).
///
/// # Safety
///
/// `body` must hold `len` bytes of a relocated image body whose
/// references are expressed at `stored_base`.
pub unsafe fn rebase_body(
    body: *mut u8,
    len: usize,
    stored_base: u64,
    actual_base: u64,
    table: &IntrinsicsTable,
) -> Result<(), RelocateError> {
    let delta = actual_base.wrapping_sub(stored_base);
    let mut offset = 0;
    while offset < len {
        // SAFETY: offsets advance by object sizes, staying inside `len`
        let obj = unsafe { body.add(offset) };
        // SAFETY: body objects carry valid headers
        unsafe {
            trace_object(obj, &mut |slot| {
                if slot.is_ref() {
                    *slot =
                        Value::from_addr(slot.ref_bits().wrapping_add(delta));
                }
            });
        }

        // SAFETY: valid header by image contract
        let object_type = unsafe { (*(obj as *const Header)).object_type() };
        if object_type == ObjectType::Function {
            // SAFETY: header says Function
            let function = unsafe { &mut *(obj as *mut Function) };
            if let Some(id) = function.intrinsic() {
                match table.address_of(id) {
                    Some(entry) => function.entry_point = entry,
                    None => {
                        // the name edge is already rebased and live
                        return Err(RelocateError::UnresolvedIntrinsic {
                            id,
                            function: source_function_name(function),
                        });
                    }
                }
            }
        }

        // SAFETY: valid object by image contract
        offset += align_object_size(unsafe { object_size(obj) });
    }
    Ok(())
}

/// Rebase a single root value from `stored_base` to `actual_base`.
pub(crate) fn rebase_value(
    value: Value,
    stored_base: u64,
    actual_base: u64,
) -> Value {
    if value.is_ref() {
        let delta = actual_base.wrapping_sub(stored_base);
        Value::from_addr(value.ref_bits().wrapping_add(delta))
    } else {
        value
    }
}

/// Decode a [`ProgramMode`] from an image header field.
pub(crate) fn mode_from_header(raw: u32) -> Option<ProgramMode> {
    ProgramMode::from_raw(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{alloc_array, alloc_byte_array, alloc_function};
    use crate::folder::ProgramFolder;
    use crate::intrinsics::{Intrinsic, IntrinsicsTable};
    use crate::testutil::sample_program;
    use heap::Space;

    const BASE: u64 = 0x4000_0000;

    fn relocate_to_vec(
        program: &Program,
        base: u64,
    ) -> Result<Vec<u8>, RelocateError> {
        let size = relocated_size(program)?;
        let mut buffer = vec![0u8; size];
        let written =
            ProgramHeapRelocator::new(program, &mut buffer, base).relocate()?;
        assert_eq!(written, size, "dry-run size must match bytes written");
        Ok(buffer)
    }

    fn read_header(image: &[u8]) -> ImageHeader {
        // SAFETY: images start with a header
        unsafe {
            ptr::read_unaligned(image.as_ptr() as *const ImageHeader)
        }
    }

    #[test]
    fn relocation_is_deterministic() {
        let sample = sample_program();
        let first = relocate_to_vec(&sample.program, BASE).expect("relocate");
        let second = relocate_to_vec(&sample.program, BASE).expect("relocate");
        assert_eq!(first, second, "unchanged program must produce identical images");
    }

    #[test]
    fn header_records_base_and_roots_inside_the_image() {
        let sample = sample_program();
        let image = relocate_to_vec(&sample.program, BASE).expect("relocate");
        let header = read_header(&image);

        assert_eq!(header.magic, IMAGE_MAGIC);
        assert_eq!(header.version, IMAGE_VERSION);
        assert_eq!(header.base_address, BASE);
        assert_eq!(
            header.heap_size as usize,
            image.len() - size_of::<ImageHeader>()
        );

        let end = BASE + header.heap_size;
        for root in [header.classes, header.functions, header.entry] {
            let root = Value::from_raw(root);
            assert!(root.is_ref());
            assert!(
                (BASE..end).contains(&root.ref_bits()),
                "root must land inside the image address range"
            );
        }
    }

    #[test]
    fn every_reference_in_the_image_points_inside_it() {
        let mut sample = sample_program();
        ProgramFolder::new(&mut sample.program).fold();
        let image = relocate_to_vec(&sample.program, BASE).expect("relocate");
        let header = read_header(&image);
        let end = BASE + header.heap_size;

        let body = &image[size_of::<ImageHeader>()..];
        let mut offset = 0;
        while offset < body.len() {
            let obj = body[offset..].as_ptr();
            // SAFETY: walking well-formed image objects read-only; the
            // trace's &mut access never actually mutates here
            unsafe {
                trace_object(obj, &mut |slot| {
                    if slot.is_ref() {
                        assert!(
                            (BASE..end).contains(&slot.ref_bits()),
                            "edge 0x{:x} escapes the image",
                            slot.ref_bits()
                        );
                    }
                });
                offset += align_object_size(object_size(obj));
            }
        }
        assert_eq!(offset, body.len());
    }

    #[test]
    fn target_too_small_is_recoverable() {
        let sample = sample_program();
        let required = relocated_size(&sample.program).expect("size");
        let mut buffer = vec![0u8; required - 1];
        let err = ProgramHeapRelocator::new(&sample.program, &mut buffer, BASE)
            .relocate()
            .expect_err("short target must fail");
        assert!(!err.is_fatal(), "capacity failure is the recoverable class");
        match err {
            RelocateError::TargetTooSmall { required: r, provided } => {
                assert_eq!(r, required);
                assert_eq!(provided, required - 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn all_default_intrinsics_patch_to_table_addresses() {
        let mut program = Program::new(64 * 1024);
        let functions: Vec<Value> = {
            let space = program.space();
            (0..Intrinsic::COUNT as u16)
                .map(|id| unsafe {
                    let name = alloc_byte_array(space, b"i").value();
                    alloc_function(space, name, &[], &[], 2, id as i16).value()
                })
                .collect()
        };
        // SAFETY: functions allocated above
        program.functions =
            unsafe { alloc_array(program.space(), &functions) }.value();

        let image = relocate_to_vec(&program, BASE).expect("relocate");
        let table = IntrinsicsTable::get_default();

        let body = &image[size_of::<ImageHeader>()..];
        let mut offset = 0;
        let mut patched = 0;
        while offset < body.len() {
            let obj = body[offset..].as_ptr();
            // SAFETY: well-formed image objects
            unsafe {
                let header = &*(obj as *const Header);
                if header.object_type() == ObjectType::Function {
                    let function = &*(obj as *const Function);
                    if let Some(id) = function.intrinsic() {
                        assert_eq!(
                            Some(function.entry_point),
                            table.address_of(id),
                            "entry point for intrinsic {id} must match the table"
                        );
                        assert_ne!(function.entry_point, 0);
                        patched += 1;
                    }
                }
                offset += align_object_size(object_size(obj));
            }
        }
        assert_eq!(patched, Intrinsic::COUNT);
    }

    #[test]
    fn unresolved_intrinsic_is_fatal() {
        let mut program = Program::new(16 * 1024);
        let function = {
            let space = program.space();
            // SAFETY: fresh allocations
            unsafe {
                let name = alloc_byte_array(space, b"mystery").value();
                alloc_function(space, name, &[], &[], 0, 999).value()
            }
        };
        // SAFETY: allocated above
        program.functions =
            unsafe { alloc_array(program.space(), &[function]) }.value();

        let size = relocated_size(&program).expect("size");
        let mut buffer = vec![0u8; size];
        let err = ProgramHeapRelocator::new(&program, &mut buffer, BASE)
            .relocate()
            .expect_err("unknown intrinsic must fail");
        assert!(err.is_fatal());
        match err {
            RelocateError::UnresolvedIntrinsic { id, function } => {
                assert_eq!(id, 999);
                assert_eq!(function, "mystery");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn partial_table_rejects_missing_intrinsic() {
        let sample = sample_program();
        // the sample contains a FixnumAdd function; this table knows only
        // Identity
        let entries: Vec<(Intrinsic, crate::intrinsics::IntrinsicFn)> =
            vec![(Intrinsic::Identity, |a, _| a)];
        let table = IntrinsicsTable::with_entries(entries);
        let size = relocated_size(&sample.program).expect("size");
        let mut buffer = vec![0u8; size];
        let err = ProgramHeapRelocator::with_table(
            &sample.program,
            &mut buffer,
            BASE,
            &table,
        )
        .relocate()
        .expect_err("partial table must fail");
        assert!(matches!(
            err,
            RelocateError::UnresolvedIntrinsic { id, .. }
                if id == Intrinsic::FixnumAdd as u16
        ));
    }

    #[test]
    fn foreign_reference_is_fatal() {
        let mut program = Program::new(16 * 1024);
        let foreign_space = Space::new(1024);
        // SAFETY: allocated in the foreign space, referenced from the
        // program under test
        let foreign =
            unsafe { alloc_byte_array(&foreign_space, b"outside") }.value();
        let function = {
            let space = program.space();
            // SAFETY: fresh allocations
            unsafe {
                let name = alloc_byte_array(space, b"f").value();
                alloc_function(space, name, &[foreign], &[], 0, -1).value()
            }
        };
        // SAFETY: allocated above
        program.functions =
            unsafe { alloc_array(program.space(), &[function]) }.value();

        let err = relocated_size(&program).expect_err("foreign ref must fail");
        assert_eq!(
            err,
            RelocateError::ForeignReference {
                address: foreign.ref_bits()
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn relocate_does_not_mutate_the_source_program() {
        let sample = sample_program();
        let space = sample.program.space();
        let used_before = space.used();
        let snapshot: Vec<u8> = unsafe {
            std::slice::from_raw_parts(space.base().as_ptr(), used_before)
                .to_vec()
        };

        let _ = relocate_to_vec(&sample.program, BASE).expect("relocate");

        assert_eq!(sample.program.space().used(), used_before);
        let after: &[u8] = unsafe {
            std::slice::from_raw_parts(space.base().as_ptr(), used_before)
        };
        assert_eq!(after, snapshot.as_slice(), "source heap must be untouched");
    }

    #[test]
    fn rebase_round_trips_between_bases() {
        let sample = sample_program();
        let image_at_b =
            relocate_to_vec(&sample.program, BASE).expect("relocate");
        let header = read_header(&image_at_b);

        // rebase a copy of the body to a different address and back
        let mut body = image_at_b[size_of::<ImageHeader>()..].to_vec();
        let other_base = BASE + 0x10_0000;
        let table = IntrinsicsTable::get_default();
        // SAFETY: body is a well-formed image body at BASE
        unsafe {
            rebase_body(
                body.as_mut_ptr(),
                body.len(),
                header.base_address,
                other_base,
                table,
            )
            .expect("rebase to other base");
            rebase_body(
                body.as_mut_ptr(),
                body.len(),
                other_base,
                header.base_address,
                table,
            )
            .expect("rebase back");
        }
        assert_eq!(
            body.as_slice(),
            &image_at_b[size_of::<ImageHeader>()..],
            "rebasing there and back must be byte-identical"
        );

        // the degenerate rebase (same base) must be the identity
        // SAFETY: same body, still expressed at BASE
        unsafe {
            rebase_body(
                body.as_mut_ptr(),
                body.len(),
                header.base_address,
                header.base_address,
                table,
            )
            .expect("identity rebase");
        }
        assert_eq!(body.as_slice(), &image_at_b[size_of::<ImageHeader>()..]);
    }
}

use std::collections::HashSet;
use std::fmt;

use log::{debug, info};

use object::{Array, ByteArray, Function, Header, Value};

use crate::program::{Program, ProgramMode};
use crate::rewriter::{
    ProgramTableRewriter, TableKind, decode_literal, encode_literal,
};

/// Options consulted by [`ProgramFolder::fold_program_by_default`]. The
/// single recognized knob: a VM built for live editing keeps its programs
/// unfolded so methods stay self-contained and patchable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldOptions {
    pub unfold_program: bool,
}

/// Fatal faults while resolving folded literals. A program that produced
/// one of these is unusable: its pools hold indices that look
/// interpretable but name nothing. Callers must abort, not continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnfoldError {
    /// A folded literal names a table slot that does not exist.
    MissingTableEntry {
        kind: TableKind,
        index: u32,
        function: String,
    },
    /// A literal-pool entry is not an encoded index at all.
    CorruptLiteral { raw: u64, function: String },
}

impl fmt::Display for UnfoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTableEntry {
                kind,
                index,
                function,
            } => write!(
                f,
                "unfold: function `{function}` references missing {kind:?} table entry {index}"
            ),
            Self::CorruptLiteral { raw, function } => write!(
                f,
                "unfold: function `{function}` holds corrupt literal 0x{raw:016x}"
            ),
        }
    }
}

impl std::error::Error for UnfoldError {}

/// Fold/Unfold state toggle for a [`Program`].
///
/// Fold rewrites every reachable function's literal pool from direct
/// references into dense indices in the program's global tables; Unfold is
/// the inverse. Both mutate the heap in place and require a quiescent
/// program.
pub struct ProgramFolder<'a> {
    program: &'a mut Program,
}

impl<'a> ProgramFolder<'a> {
    pub fn new(program: &'a mut Program) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Program {
        self.program
    }

    /// Fold the program into its compact, tables-based form. A no-op on an
    /// already-folded program.
    pub fn fold(&mut self) {
        self.program.assert_quiescent("Fold");
        if self.program.is_folded() {
            debug!("fold: program already folded");
            return;
        }

        let mut rewriter = ProgramTableRewriter::new();

        // Seed the function table with the root functions; literal
        // traversal below discovers the rest.
        if self.program.entry.is_ref() {
            rewriter.add(TableKind::Function, self.program.entry);
        }
        // SAFETY: the functions root is an array of function references
        unsafe {
            let functions: &Array = self.program.functions.as_ref();
            for &function in functions.elements() {
                rewriter.add(TableKind::Function, function);
            }
        }

        // The function table doubles as the worklist: newly discovered
        // functions land at its tail and get processed in index order.
        let mut next = 0;
        while let Some(function) = rewriter.function(next) {
            next += 1;
            // SAFETY: function table entries are live Function references
            let function =
                unsafe { &mut *(function.ref_bits() as *mut Function) };
            // SAFETY: inline pool follows the struct by construction
            for literal in unsafe { function.literals_mut() } {
                assert!(
                    literal.is_ref(),
                    "fold: literal pool entry is not a heap reference: {literal:?}"
                );
                // SAFETY: every heap reference points at a header
                let kind = TableKind::of(unsafe {
                    literal.as_ref::<Header>().object_type()
                });
                let index = rewriter.add(kind, *literal);
                *literal = encode_literal(kind, index);
            }
        }

        // SAFETY: table entries are live references into this space
        unsafe {
            self.program.class_table = rewriter
                .materialize(TableKind::Class, self.program.space())
                .value();
            self.program.function_table = rewriter
                .materialize(TableKind::Function, self.program.space())
                .value();
            self.program.constant_table = rewriter
                .materialize(TableKind::Constant, self.program.space())
                .value();
        }

        info!(
            "folded program: {} classes, {} functions, {} constants",
            rewriter.len(TableKind::Class),
            rewriter.len(TableKind::Function),
            rewriter.len(TableKind::Constant)
        );
        self.program.set_mode(ProgramMode::Folded);
    }

    /// Unfold the program back into self-contained functions. A no-op on
    /// an already-unfolded program.
    pub fn unfold(&mut self) -> Result<(), UnfoldError> {
        self.program.assert_quiescent("Unfold");
        if !self.program.is_folded() {
            debug!("unfold: program already unfolded");
            return Ok(());
        }

        let tables = [
            self.program.class_table,
            self.program.function_table,
            self.program.constant_table,
        ];

        // Every reachable function: roots plus the function table itself.
        let mut pending: Vec<Value> = Vec::new();
        let mut seen: HashSet<u64, ahash::RandomState> = HashSet::default();
        let push = |value: Value,
                    pending: &mut Vec<Value>,
                    seen: &mut HashSet<u64, ahash::RandomState>| {
            if value.is_ref() && seen.insert(value.ref_bits()) {
                pending.push(value);
            }
        };
        push(self.program.entry, &mut pending, &mut seen);
        // SAFETY: roots and tables are arrays of references
        unsafe {
            let functions: &Array = self.program.functions.as_ref();
            for &function in functions.elements() {
                push(function, &mut pending, &mut seen);
            }
            let function_table: &Array =
                self.program.function_table.as_ref();
            for &function in function_table.elements() {
                push(function, &mut pending, &mut seen);
            }
        }

        for function_value in pending {
            // SAFETY: collected above as live Function references
            let function =
                unsafe { &mut *(function_value.ref_bits() as *mut Function) };
            let name = function_name(function);
            // SAFETY: inline pool follows the struct by construction
            for literal in unsafe { function.literals_mut() } {
                if !literal.is_fixnum() {
                    return Err(UnfoldError::CorruptLiteral {
                        raw: literal.raw(),
                        function: name.clone(),
                    });
                }
                // SAFETY: checked fixnum above
                let (kind, index) = unsafe { decode_literal(*literal) };
                let Some(kind) = kind else {
                    return Err(UnfoldError::CorruptLiteral {
                        raw: literal.raw(),
                        function: name.clone(),
                    });
                };
                // SAFETY: the tables are live arrays
                let table: &Array =
                    unsafe { tables[kind as usize].as_ref() };
                if index as u64 >= table.len() {
                    return Err(UnfoldError::MissingTableEntry {
                        kind,
                        index,
                        function: name.clone(),
                    });
                }
                // SAFETY: index checked against the table length
                *literal = unsafe { table.element(index as u64) };
            }
        }

        // The tables are no longer authoritative; point them back at a
        // fresh empty array so relocation of an unfolded program carries
        // no stale table contents.
        // SAFETY: an empty array has no edges
        let empty = unsafe {
            crate::alloc::alloc_array(self.program.space(), &[])
        }
        .value();
        self.program.class_table = empty;
        self.program.function_table = empty;
        self.program.constant_table = empty;

        info!("unfolded program: {} functions resolved", seen.len());
        self.program.set_mode(ProgramMode::Unfolded);
        Ok(())
    }

    /// Fold `program` unless the configuration says otherwise
    /// (`--unfold-program`). The one convenience entry point.
    pub fn fold_program_by_default(
        program: &mut Program,
        options: &FoldOptions,
    ) {
        if options.unfold_program {
            debug!("fold_program_by_default: overridden by unfold-program");
            return;
        }
        ProgramFolder::new(program).fold();
    }
}

fn function_name(function: &Function) -> String {
    if function.name.is_ref() {
        // SAFETY: function names are byte arrays
        let bytes: &ByteArray = unsafe { function.name.as_ref() };
        // SAFETY: allocated alongside the name
        if let Some(s) = unsafe { bytes.as_str() } {
            return s.to_owned();
        }
    }
    "<anonymous>".to_owned()
}

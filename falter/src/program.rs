use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use heap::Space;
use object::Value;

use crate::alloc::alloc_array;

/// Whether a program's functions carry direct literal references
/// (edit-friendly) or fixnum indices into the global tables (compact).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgramMode {
    Unfolded = 0,
    Folded = 1,
}

impl ProgramMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unfolded),
            1 => Some(Self::Folded),
            _ => None,
        }
    }
}

/// The root entity: one object space plus the roots everything reachable
/// hangs off.
///
/// `classes` and `functions` list every top-level class and function;
/// `entry` is the program's entry function. The three `*_table` roots are
/// the global deduplicated tables — authoritative only while the mode is
/// [`ProgramMode::Folded`]; while unfolded they point at an empty array.
///
/// Fold, Unfold and Relocate require that no process is attached; that is
/// the scheduler's responsibility, and this type only *asserts* it.
pub struct Program {
    space: Space,
    pub classes: Value,
    pub functions: Value,
    pub entry: Value,
    pub class_table: Value,
    pub function_table: Value,
    pub constant_table: Value,
    mode: ProgramMode,
    attached: Mutex<usize>,
    quiescent: Condvar,
}

impl Program {
    /// Create an empty unfolded program backed by a fresh space of
    /// `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let space = Space::new(capacity);
        // SAFETY: the space was just created; an empty array has no edges
        let empty = unsafe { alloc_array(&space, &[]) }.value();
        Self {
            space,
            classes: empty,
            functions: empty,
            entry: Value::from_i64(0),
            class_table: empty,
            function_table: empty,
            constant_table: empty,
            mode: ProgramMode::Unfolded,
            attached: Mutex::new(0),
            quiescent: Condvar::new(),
        }
    }

    /// Reassemble a program around an already-populated space, e.g. one
    /// rebuilt from a loaded image.
    pub(crate) fn from_parts(
        space: Space,
        classes: Value,
        functions: Value,
        entry: Value,
        class_table: Value,
        function_table: Value,
        constant_table: Value,
        mode: ProgramMode,
    ) -> Self {
        Self {
            space,
            classes,
            functions,
            entry,
            class_table,
            function_table,
            constant_table,
            mode,
            attached: Mutex::new(0),
            quiescent: Condvar::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> &Space {
        &self.space
    }

    #[inline]
    pub fn mode(&self) -> ProgramMode {
        self.mode
    }

    #[inline]
    pub fn is_folded(&self) -> bool {
        self.mode == ProgramMode::Folded
    }

    pub(crate) fn set_mode(&mut self, mode: ProgramMode) {
        debug!("program mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    /// The six roots in their canonical traversal order. Relocation
    /// layout depends on this order staying fixed.
    pub fn roots(&self) -> [Value; 6] {
        [
            self.classes,
            self.functions,
            self.class_table,
            self.function_table,
            self.constant_table,
            self.entry,
        ]
    }

    // ── Process accounting ─────────────────────────────────────────

    /// Record a process running against this program.
    pub fn attach_process(&self) {
        *self.attached.lock() += 1;
    }

    /// Record that a process stopped running against this program.
    pub fn detach_process(&self) {
        let mut attached = self.attached.lock();
        assert!(*attached > 0, "detach_process without attach_process");
        *attached -= 1;
        if *attached == 0 {
            self.quiescent.notify_all();
        }
    }

    #[inline]
    pub fn attached_processes(&self) -> usize {
        *self.attached.lock()
    }

    /// Fold, Unfold and Relocate call this on entry. A process still
    /// attached is a caller bug, not a runtime condition.
    pub fn assert_quiescent(&self, operation: &str) {
        let attached = *self.attached.lock();
        assert!(
            attached == 0,
            "{operation} requires a quiescent program, {attached} process(es) attached"
        );
    }

    /// Block until no process is attached, or until `timeout` elapses.
    /// Returns `true` when the program is quiescent. The deadline
    /// arithmetic saturates, so an already-expired timeout degrades to a
    /// single check rather than a negative wait.
    pub fn wait_until_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attached = self.attached.lock();
        while *attached > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self
                .quiescent
                .wait_for(&mut attached, remaining)
                .timed_out()
            {
                return *attached == 0;
            }
        }
        true
    }
}

impl core::fmt::Debug for Program {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Program")
            .field("mode", &self.mode)
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_program_is_unfolded_and_quiescent() {
        let program = Program::new(4096);
        assert_eq!(program.mode(), ProgramMode::Unfolded);
        assert_eq!(program.attached_processes(), 0);
        program.assert_quiescent("test");
    }

    #[test]
    #[should_panic(expected = "requires a quiescent program")]
    fn assert_quiescent_panics_with_attached_process() {
        let program = Program::new(4096);
        program.attach_process();
        program.assert_quiescent("fold");
    }

    #[test]
    #[should_panic(expected = "detach_process without attach_process")]
    fn detach_underflow_panics() {
        let program = Program::new(4096);
        program.detach_process();
    }

    #[test]
    fn wait_until_quiescent_times_out_while_attached() {
        let program = Program::new(4096);
        program.attach_process();
        assert!(!program.wait_until_quiescent(Duration::from_millis(10)));
        program.detach_process();
        assert!(program.wait_until_quiescent(Duration::from_millis(10)));
    }

    #[test]
    fn wait_until_quiescent_wakes_on_detach() {
        let program = Arc::new(Program::new(4096));
        program.attach_process();

        let waiter = Arc::clone(&program);
        let handle = std::thread::spawn(move || {
            waiter.wait_until_quiescent(Duration::from_secs(5))
        });

        std::thread::sleep(Duration::from_millis(20));
        program.detach_process();
        assert!(handle.join().expect("waiter thread panicked"));
    }

    #[test]
    fn zero_timeout_degrades_to_a_check() {
        let program = Program::new(4096);
        assert!(program.wait_until_quiescent(Duration::ZERO));
        program.attach_process();
        assert!(!program.wait_until_quiescent(Duration::ZERO));
    }
}

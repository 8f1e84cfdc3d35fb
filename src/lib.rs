//! Stack unwinding through pre-compiled per-object unwinders ("eh_elf"
//! modules), instead of interpreting call-frame-information tables at every
//! step.
//!
//! Each loaded binary object is expected to have a companion shared object,
//! named `<basename>.eh_elf.so` and produced ahead of time by an external
//! generator, exporting a single `_eh_elf` function that computes the
//! caller's register state from the callee's. This crate provides the two
//! pieces a host runtime (debugger, profiler, exception runtime) needs to
//! drive them:
//!
//! * [MemoryMapIndex] is a sorted table of the executable, file-backed
//!   regions of one target process, each with its unwinder module loaded
//!   and its entry symbol resolved. It is built from `/proc/<pid>/maps` or
//!   from an explicitly supplied layout, and queried once per unwound
//!   frame.
//! * [UnwindCursor] is one in-progress unwind. Each [step] resolves the
//!   current instruction pointer to its region, invokes that region's
//!   generated unwinder, validates the result and projects it back into
//!   the cursor's register-location table.
//!
//! Simple usage:
//! ```ignore
//! let mut index = MemoryMapIndex::new(LoadPolicy::Require);
//! index.init_local()?;
//!
//! let mut cursor = UnwindCursor::new(LocalAddressSpace);
//! cursor.set_ip(ip);
//! cursor.set_cfa(sp);
//! cursor.set_reg(Reg::Rip, RegisterLocation::Value(ip));
//! cursor.set_reg(Reg::Rbp, RegisterLocation::Value(bp));
//!
//! while cursor.step(&index)? == StepOutcome::Continue {
//!     println!("{:#x}", cursor.ip());
//! }
//! ```
//!
//! An unwind is a plain synchronous loop; nothing here spawns work or
//! retries. Hosts unwinding several targets at once build one index per
//! target. Step failures ([StepError]) abort only the failing step, so the
//! host can fall back to a slower reference unwinder for that frame.
//!
//! [step]: UnwindCursor::step

mod accessor;
mod cursor;
mod eh_elf;
mod maps;

pub use accessor::{AddressSpace, LocalAddressSpace};
pub use cursor::{Reg, RegisterLocation, StepError, StepOutcome, StopRule, UnwindCursor};
pub use eh_elf::{
    module_name_for, ContextFlag, ContextFlags, DerefFn, EhElfFn, EhElfModule, UnwindContext, UnwinderResolution,
    EH_ELF_SUFFIX, EH_ELF_SYMBOL,
};
pub use maps::{InitError, LoadPolicy, MapEntry, MappedRegion, MemoryMapIndex};

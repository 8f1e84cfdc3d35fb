use crate::accessor::AddressSpace;
use crate::eh_elf::{ContextFlag, UnwindContext};
use crate::maps::MemoryMapIndex;
use std::os::raw::c_void;

/// Failed reads within this many bytes below the CFA are answered with 0
/// instead of failing the step; capture tooling routinely omits a few bytes
/// below the stack pointer it snapshotted, and those slots are provably
/// unused.
const STACK_SLACK_BYTES: u64 = 128;

/// Returned register values below this are treated as effectively null.
const MIN_PLAUSIBLE_REG: u64 = 10;

/// Outcome of one successful [UnwindCursor::step].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A new, valid caller frame was produced.
    Continue,
    /// Unwinding terminated normally; there is no further caller.
    EndOfChain,
}

impl StepOutcome {
    /// Stable numeric code for hosts driving the loop across a flat ABI.
    #[inline]
    pub fn code(self) -> i32 {
        match self {
            StepOutcome::EndOfChain => 0,
            StepOutcome::Continue => 1,
        }
    }
}

/// Failure of one [UnwindCursor::step]. Aborts only the current step; the
/// host decides whether to fall back to a slower unwinder or give up.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepError {
    #[error("no mapped region contains address {0:#x}")]
    NoMapping(u64),

    #[error("no unwinder loaded for region {0}")]
    NoUnwinder(usize),

    #[error("the generated unwinder reported an error")]
    UnwinderError,

    #[error("memory read failed at {0:#x}")]
    MemoryAccess(u64),

    #[error("implausible register value {0:#x}")]
    ImplausibleRegister(u64),
}

impl StepError {
    /// Stable numeric code, disjoint from [StepOutcome::code].
    #[inline]
    pub fn code(self) -> i32 {
        match self {
            StepError::NoMapping(_) => -1,
            StepError::NoUnwinder(_) => -2,
            StepError::UnwinderError => -3,
            StepError::MemoryAccess(_) => -4,
            StepError::ImplausibleRegister(_) => -5,
        }
    }
}

/// End-of-chain predicate consulted once per step, before any other work.
///
/// Which condition actually terminates the chain depends on the calling
/// convention the unwinder modules were generated for, so it is
/// configuration rather than a hard-coded rule.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StopRule {
    /// Stop only when the return-address slot is undefined.
    UndefinedRip,
    /// Additionally stop on a literal-zero frame pointer, the usual
    /// outermost-frame convention on x86_64.
    #[default]
    UndefinedRipOrNullRbp,
}

/// Register slots tracked across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rip = 0,
    Rsp = 1,
    Rbp = 2,
    Rbx = 3,
}

const TRACKED_REGS: usize = 4;

/// Where a tracked register of the current frame lives.
///
/// The step engine itself only ever writes `Undefined` or `Value`;
/// `Memory` locations come from the host's initial frame capture.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLocation {
    #[default]
    Undefined,
    /// The register's value is known literally.
    Value(u64),
    /// The register's value is stored at this address in the target.
    Memory(u64),
}

/// One in-progress unwind: the current frame's register locations, its
/// canonical frame address and instruction pointer, and the accessor used
/// to read the target's memory.
///
/// The host seeds the cursor from its initial register capture, then calls
/// [step] once per frame:
///
/// ```ignore
/// let mut cursor = UnwindCursor::new(LocalAddressSpace);
/// cursor.set_ip(ip);
/// cursor.set_cfa(sp);
/// cursor.set_reg(Reg::Rip, RegisterLocation::Value(ip));
/// cursor.set_reg(Reg::Rbp, RegisterLocation::Value(bp));
/// while cursor.step(&index)? == StepOutcome::Continue {
///     println!("{:#x}", cursor.ip());
/// }
/// ```
///
/// [step]: UnwindCursor::step
pub struct UnwindCursor<A> {
    accessor: A,
    regs: [RegisterLocation; TRACKED_REGS],
    cfa: u64,
    ip: u64,
    stop: StopRule,
}

impl<A: AddressSpace> UnwindCursor<A> {
    pub fn new(accessor: A) -> Self {
        Self {
            accessor,
            regs: [RegisterLocation::Undefined; TRACKED_REGS],
            cfa: 0,
            ip: 0,
            stop: StopRule::default(),
        }
    }

    pub fn with_stop_rule(mut self, stop: StopRule) -> Self {
        self.stop = stop;
        self
    }

    /// The current frame's instruction pointer.
    #[inline]
    pub fn ip(&self) -> u64 {
        self.ip
    }

    #[inline]
    pub fn set_ip(&mut self, ip: u64) {
        self.ip = ip;
    }

    /// The current canonical frame address: the stack pointer value from
    /// just before the current function's call instruction executed.
    #[inline]
    pub fn cfa(&self) -> u64 {
        self.cfa
    }

    #[inline]
    pub fn set_cfa(&mut self, cfa: u64) {
        self.cfa = cfa;
    }

    #[inline]
    pub fn reg(&self, reg: Reg) -> RegisterLocation {
        self.regs[reg as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, reg: Reg, loc: RegisterLocation) {
        self.regs[reg as usize] = loc;
    }

    /// Attempts to restore the parent function's register state based on
    /// the current register state, by invoking the generated unwinder of
    /// the region owning the current instruction pointer.
    ///
    /// The cursor is only mutated once the unwinder's result has passed
    /// validation; any `Err` leaves it describing the same frame as before.
    pub fn step(&mut self, index: &MemoryMapIndex) -> Result<StepOutcome, StepError> {
        if self.chain_ended() {
            return Ok(StepOutcome::EndOfChain);
        }
        let ip = self.ip;
        let region = index.lookup(ip).ok_or(StepError::NoMapping(ip))?;
        let entry = region.entry().ok_or(StepError::NoUnwinder(region.id))?;

        let input = self.materialize()?;
        let mut deref = DerefState {
            accessor: &mut self.accessor,
            cfa: self.cfa,
            fault: None,
        };
        let output = unsafe {
            entry(
                input,
                ip.wrapping_sub(region.bias),
                deref_trampoline::<A>,
                &mut deref as *mut DerefState<'_, A> as *mut c_void,
            )
        };
        if let Some(addr) = deref.fault {
            return Err(StepError::MemoryAccess(addr));
        }
        if output.flags.contains(ContextFlag::Error) {
            return Err(StepError::UnwinderError);
        }
        for (flag, value) in [(ContextFlag::Rip, output.rip), (ContextFlag::Rsp, output.rsp)] {
            if output.flags.contains(flag) && value < MIN_PLAUSIBLE_REG {
                return Err(StepError::ImplausibleRegister(value));
            }
        }

        self.project(&output);
        if self.regs[Reg::Rip as usize] == RegisterLocation::Undefined {
            Ok(StepOutcome::EndOfChain)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    /// End-of-chain pre-checks, evaluated before any lookup or load work.
    fn chain_ended(&self) -> bool {
        if self.regs[Reg::Rip as usize] == RegisterLocation::Undefined {
            return true;
        }
        self.stop == StopRule::UndefinedRipOrNullRbp && self.regs[Reg::Rbp as usize] == RegisterLocation::Value(0)
    }

    /// Builds the unwinder's input context from the cursor's current frame.
    /// The stack pointer handed over is the CFA, per the calling contract.
    fn materialize(&mut self) -> Result<UnwindContext, StepError> {
        let mut ctx = UnwindContext {
            rip: self.ip,
            rsp: self.cfa,
            ..UnwindContext::default()
        };
        ctx.flags.insert(ContextFlag::Rip);
        ctx.flags.insert(ContextFlag::Rsp);
        for (reg, flag) in [(Reg::Rbp, ContextFlag::Rbp), (Reg::Rbx, ContextFlag::Rbx)] {
            let value = match self.regs[reg as usize] {
                RegisterLocation::Undefined => continue,
                RegisterLocation::Value(value) => value,
                RegisterLocation::Memory(addr) => {
                    self.accessor.read_word(addr).ok_or(StepError::MemoryAccess(addr))?
                }
            };
            match reg {
                Reg::Rbp => ctx.rbp = value,
                Reg::Rbx => ctx.rbx = value,
                _ => unreachable!(),
            }
            ctx.flags.insert(flag);
        }
        Ok(ctx)
    }

    /// Projects the unwinder's result back into the register-location
    /// table. Every slot is reset to `Undefined` first and only the
    /// flagged-present ones are written: a slot's liveness is a property
    /// of the current frame only, so a frame-N value must never survive
    /// into frame N+1.
    fn project(&mut self, output: &UnwindContext) {
        self.regs = [RegisterLocation::Undefined; TRACKED_REGS];
        for (reg, flag, value) in [
            (Reg::Rip, ContextFlag::Rip, output.rip),
            (Reg::Rsp, ContextFlag::Rsp, output.rsp),
            (Reg::Rbp, ContextFlag::Rbp, output.rbp),
            (Reg::Rbx, ContextFlag::Rbx, output.rbx),
        ] {
            if output.flags.contains(flag) {
                self.regs[reg as usize] = RegisterLocation::Value(value);
            }
        }
        if output.flags.contains(ContextFlag::Rsp) {
            self.cfa = output.rsp;
        }
        if output.flags.contains(ContextFlag::Rip) {
            self.ip = output.rip;
        }
    }
}

/// Step-local state behind the deref callback. Stack-allocated per step;
/// the generated unwinder must not retain a pointer to it.
struct DerefState<'a, A> {
    accessor: &'a mut A,
    cfa: u64,
    fault: Option<u64>,
}

unsafe extern "C" fn deref_trampoline<A: AddressSpace>(arg: *mut c_void, addr: u64) -> u64 {
    let state = &mut *(arg as *mut DerefState<'_, A>);
    match state.accessor.read_word(addr) {
        Some(value) => value,
        None => {
            let below = state.cfa.wrapping_sub(addr);
            if addr < state.cfa && below <= STACK_SLACK_BYTES {
                // Just below the CFA; recovered as zero.
                return 0;
            }
            if state.fault.is_none() {
                state.fault = Some(addr);
            }
            0
        }
    }
}

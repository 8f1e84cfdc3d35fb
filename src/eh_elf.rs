use std::ffi::CString;
use std::os::raw::c_void;
use std::path::Path;

/// Suffix appended to a binary object's base name to form its companion
/// unwinder module, e.g. `libfoo.so` -> `libfoo.so.eh_elf.so`. The module is
/// resolved through the dynamic loader's regular search path.
pub const EH_ELF_SUFFIX: &str = ".eh_elf.so";

/// Exported entry symbol every generated unwinder module must define.
pub const EH_ELF_SYMBOL: &[u8] = b"_eh_elf\0";

/// Memory-read callback passed to a generated unwinder. `arg` is an opaque
/// pointer to step-local state; the callee must not retain either beyond
/// the call.
pub type DerefFn = unsafe extern "C" fn(arg: *mut c_void, addr: u64) -> u64;

/// Entry point of a generated unwinder.
///
/// `pc` is the intra-object offset of the instruction pointer (the in-file
/// address, not the mapped one). The returned context's flags state which
/// registers the unwinder actually determined, and whether it failed.
///
/// This signature is the versioned calling contract with the module
/// generator; a layout mismatch between the two sides is a configuration
/// error and is not detected at runtime.
pub type EhElfFn = unsafe extern "C" fn(ctx: UnwindContext, pc: u64, deref: DerefFn, arg: *mut c_void) -> UnwindContext;

/// Register context exchanged with a generated unwinder.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnwindContext {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub flags: ContextFlags,
}

/// One presence (or error) bit of [ContextFlags].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFlag {
    Rip = 0,
    Rsp = 1,
    Rbp = 2,
    Rbx = 3,
    /// The unwinder could not unwind at this location.
    Error = 7,
}

/// Set of [ContextFlag]s. The in-memory representation is the single byte
/// the calling contract fixes, but members are only ever named, never
/// manipulated as raw masks.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContextFlags(u8);

impl ContextFlags {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn contains(self, flag: ContextFlag) -> bool {
        self.0 & (1u8 << flag as u8) != 0
    }

    #[inline]
    pub fn insert(&mut self, flag: ContextFlag) {
        self.0 |= 1u8 << flag as u8;
    }

    #[inline]
    pub fn with(mut self, flag: ContextFlag) -> Self {
        self.insert(flag);
        self
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Whether a region's companion unwinder could be located, resolved once at
/// index build time and cached on [MappedRegion].
///
/// [MappedRegion]: crate::maps::MappedRegion
pub enum UnwinderResolution {
    /// The index was built without attempting resolution for this region.
    NotLoaded,
    /// Module loaded and entry symbol resolved. The handle is retained so
    /// the module stays mapped while the entry pointer is reachable; it is
    /// `None` only for entries supplied directly rather than dlopen'd.
    Loaded {
        module: Option<EhElfModule>,
        entry: EhElfFn,
    },
    /// Resolution was attempted and failed; do not retry per step.
    LoadFailed,
}

impl UnwinderResolution {
    #[inline]
    pub fn entry(&self) -> Option<EhElfFn> {
        match self {
            UnwinderResolution::Loaded { entry, .. } => Some(*entry),
            _ => None,
        }
    }

    /// Resolution for an entry function obtained outside the dynamic loader.
    pub fn from_entry(entry: EhElfFn) -> Self {
        UnwinderResolution::Loaded { module: None, entry }
    }
}

impl std::fmt::Debug for UnwinderResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnwinderResolution::NotLoaded => f.write_str("NotLoaded"),
            UnwinderResolution::Loaded { .. } => f.write_str("Loaded"),
            UnwinderResolution::LoadFailed => f.write_str("LoadFailed"),
        }
    }
}

/// Derive the companion module name for a mapped object's path, following
/// the generator's naming convention. `None` when the path has no final
/// component.
pub fn module_name_for(object_path: &str) -> Option<String> {
    let base = Path::new(object_path).file_name()?.to_str()?;
    Some(format!("{}{}", base, EH_ELF_SUFFIX))
}

/// An eh_elf module opened through the dynamic loader. Closed exactly once
/// on drop.
pub struct EhElfModule {
    handle: *mut c_void,
}

impl EhElfModule {
    /// Opens `name` through the dynamic loader search path.
    pub fn open(name: &str) -> Option<Self> {
        let c_name = CString::new(name).ok()?;
        let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return None;
        }
        Some(Self { handle })
    }

    /// Resolves the fixed entry symbol within this module.
    pub fn entry(&self) -> Option<EhElfFn> {
        let sym = unsafe { libc::dlsym(self.handle, EH_ELF_SYMBOL.as_ptr() as _) };
        if sym.is_null() {
            return None;
        }
        Some(unsafe { std::mem::transmute::<*mut c_void, EhElfFn>(sym) })
    }
}

// Safety: `handle` is written once in `open` and only read afterwards;
// dlopen handles are process-global and the dynamic loader serializes
// dlclose. Without these impls a shared `&MemoryMapIndex` could not be
// handed to concurrent lookup callers.
unsafe impl Send for EhElfModule {}
unsafe impl Sync for EhElfModule {}

impl Drop for EhElfModule {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        let mut flags = ContextFlags::EMPTY;
        assert!(flags.is_empty());
        flags.insert(ContextFlag::Rip);
        flags.insert(ContextFlag::Rbx);
        assert!(flags.contains(ContextFlag::Rip));
        assert!(flags.contains(ContextFlag::Rbx));
        assert!(!flags.contains(ContextFlag::Rsp));
        assert!(!flags.contains(ContextFlag::Error));
        assert!(!flags.is_empty());
    }

    #[test]
    fn test_flags_with_builder() {
        let flags = ContextFlags::EMPTY.with(ContextFlag::Rsp).with(ContextFlag::Error);
        assert!(flags.contains(ContextFlag::Rsp));
        assert!(flags.contains(ContextFlag::Error));
        assert!(!flags.contains(ContextFlag::Rip));
    }

    #[test]
    fn test_module_name_for() {
        assert_eq!(module_name_for("/usr/bin/prog"), Some("prog.eh_elf.so".to_string()));
        assert_eq!(module_name_for("/lib/libc.so.6"), Some("libc.so.6.eh_elf.so".to_string()));
        assert_eq!(module_name_for("relative"), Some("relative.eh_elf.so".to_string()));
        assert_eq!(module_name_for("/"), None);
    }

    #[test]
    fn test_open_missing_module() {
        assert!(EhElfModule::open("definitely-not-a-real-module.eh_elf.so").is_none());
    }

    #[test]
    fn test_context_layout() {
        // The flags byte trails the four registers; the contract fixes this.
        assert_eq!(std::mem::offset_of!(UnwindContext, rip), 0);
        assert_eq!(std::mem::offset_of!(UnwindContext, rsp), 8);
        assert_eq!(std::mem::offset_of!(UnwindContext, rbp), 16);
        assert_eq!(std::mem::offset_of!(UnwindContext, rbx), 24);
        assert_eq!(std::mem::offset_of!(UnwindContext, flags), 32);
    }
}

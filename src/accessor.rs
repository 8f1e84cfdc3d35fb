use std::mem::MaybeUninit;

thread_local! {
    static PROBE_PIPE: [libc::c_int; 2] = {
        unsafe {
            let mut fds = MaybeUninit::<[libc::c_int; 2]>::uninit();
            let res = libc::pipe2(fds.as_mut_ptr() as *mut libc::c_int, libc::O_CLOEXEC | libc::O_NONBLOCK);
            if res == 0 {
                [fds.assume_init()[0], fds.assume_init()[1]]
            } else {
                [-1, -1]
            }
        }
    };
}

/// Abstract word-sized memory read against the unwound target.
///
/// The engine reads through this both when materializing registers whose
/// location is "lives in memory at address X" and from the deref callback
/// handed to a generated unwinder. A host unwinding a remote process
/// (e.g. over ptrace) supplies its own implementation.
pub trait AddressSpace {
    /// Reads one word at `addr`, or `None` if the address is not readable.
    fn read_word(&mut self, addr: u64) -> Option<u64>;
}

/// [AddressSpace] over the current process's own memory.
///
/// Dereferencing an arbitrary address directly would fault on stale or
/// corrupt frame data, so each read is first validated by asking the kernel
/// to access the address on our behalf: we `write` one byte *from* the
/// target address into a non-blocking pipe. If the address is invalid the
/// write fails with no signal raised.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAddressSpace;

impl AddressSpace for LocalAddressSpace {
    fn read_word(&mut self, addr: u64) -> Option<u64> {
        // The load spans eight bytes; probe both ends, or a word starting
        // in the last seven bytes of a mapping would still fault.
        let last = addr.checked_add(7)?;
        if !can_access(addr) || !can_access(last) {
            return None;
        }
        Some(unsafe { *(addr as *const u64) })
    }
}

fn can_access(address: u64) -> bool {
    PROBE_PIPE.with(|pipes| unsafe {
        // No pipe to probe with; its setup failed for this thread.
        if pipes[0] == -1 || pipes[1] == -1 {
            return false;
        }
        // Drain whatever an earlier probe left buffered, so the write
        // below cannot stall on a full pipe.
        let mut buffer = [0u8; 8];
        let drained = loop {
            let size = libc::read(pipes[0], buffer.as_mut_ptr() as _, buffer.len() as _);
            if size == -1 {
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => break true,
                    _ => break false,
                }
            } else if size > 0 {
                break true;
            }
        };
        if !drained {
            return false;
        }
        // Write one byte *from* the target address into the pipe. The
        // kernel performs the access on our behalf: an unmapped address
        // fails the write with EFAULT instead of faulting this thread.
        loop {
            let size = libc::write(pipes[1], address as _, 1);
            if size == -1 {
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => break true,
                    _ => break false,
                }
            } else if size > 0 {
                break true;
            }
        }
    })
}

#[inline]
fn errno() -> libc::c_int {
    unsafe { (*libc::__errno_location()) as libc::c_int }
}

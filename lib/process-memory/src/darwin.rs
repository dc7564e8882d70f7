use std::mem::{size_of, MaybeUninit};

use libc::{c_int, c_void, proc_pidinfo, proc_taskinfo, PROC_PIDTASKINFO};

/// A memory usage querier.
pub struct Querier {
    pid: c_int,
}

impl Querier {
    /// Creates a querier for the process with the given process ID.
    pub fn for_process(pid: u32) -> Self {
        Self { pid: pid as c_int }
    }

    /// Gets the resident set size of the target process, in bytes.
    ///
    /// If the resident set size cannot be determined, `None` is returned. For other processes this usually means the
    /// process has exited, or that we lack the privileges to inspect it.
    pub fn resident_set_size(&mut self) -> Option<usize> {
        let mut task_info = MaybeUninit::<proc_taskinfo>::uninit();
        let task_info_len = size_of::<proc_taskinfo>() as c_int;

        // SAFETY: We're passing a valid pointer to a buffer of exactly `task_info_len` bytes.
        let written = unsafe {
            proc_pidinfo(
                self.pid,
                PROC_PIDTASKINFO,
                0,
                task_info.as_mut_ptr() as *mut c_void,
                task_info_len,
            )
        };

        // The kernel reports how many bytes it wrote; anything short of the full structure is a failure.
        if written != task_info_len {
            return None;
        }

        // SAFETY: The structure was fully populated by `proc_pidinfo`.
        let task_info = unsafe { task_info.assume_init() };
        Some(task_info.pti_resident_size as usize)
    }
}

impl Default for Querier {
    /// Creates a querier for the current process.
    fn default() -> Self {
        Self::for_process(std::process::id())
    }
}

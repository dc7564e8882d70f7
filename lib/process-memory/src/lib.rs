//! Process memory querying.
//!
//! This crate provides a cross-platform way to query the RSS (resident set size) usage of a process: either the
//! current process, or any other process on the same host that we're allowed to inspect, identified by its process ID.
//!
//! ## Linux
//!
//! On Linux, [procfs](https://docs.kernel.org/filesystems/proc.html) is used, and one of three files may be read,
//! depending on their availability:
//!
//! - `/proc/<pid>/smaps_rollup`: This file is a pre-aggregated version of `/proc/<pid>/smaps`, and is the most
//!   efficient way to query RSS. (Available in Linux 4.14+)
//! - `/proc/<pid>/smaps`: This file contains detailed information about the memory mappings of the process, and can be
//!   aggregated to determine the resident set size. (Available in Linux 2.6.14+)
//! - `/proc/<pid>/statm`: This file contains lazily-updated memory statistics about the process, and is the least
//!   accurate, but is generally good enough for most use-cases. (Available in Linux 2.6+)
//!
//! ## macOS
//!
//! On macOS, we ask the kernel for the task information of the process via `proc_pidinfo`.
//!
//! ## Other platforms
//!
//! No support yet: queries always return `None`.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::Querier;

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "macos")]
pub use darwin::Querier;

#[cfg(all(not(target_os = "linux"), not(target_os = "macos")))]
mod unsupported {
    /// A memory usage querier.
    ///
    /// Memory querying is not supported on this platform, so every query returns `None`.
    #[derive(Default)]
    pub struct Querier;

    impl Querier {
        /// Creates a querier for the process with the given process ID.
        pub fn for_process(_pid: u32) -> Self {
            Self
        }

        /// Gets the resident set size of the target process, in bytes.
        pub fn resident_set_size(&mut self) -> Option<usize> {
            None
        }
    }
}

#[cfg(all(not(target_os = "linux"), not(target_os = "macos")))]
pub use unsupported::Querier;

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::ptr::NonNull;
use std::io;

/// Anonymous `MAP_SHARED` mapping, zero-filled, unmapped on drop.
///
/// A shared anonymous mapping is inherited by `fork`ed children, which is
/// enough to run a producer and a reader in separate processes.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is only reached through the shared memory ABI, which
// synchronizes with atomics.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn anonymous(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        // SAFETY: anonymous mapping, no fd and no fixed address.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The whole mapping, to hand to [`SharedMemoryAbi::new`](crate::SharedMemoryAbi::new).
    pub fn as_non_null(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.ptr, self.size)
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap.
        unsafe {
            _ = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

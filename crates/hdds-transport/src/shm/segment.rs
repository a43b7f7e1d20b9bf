// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named POSIX shared memory segments.
//!
//! Safe wrapper around `shm_open`, `ftruncate` and `mmap`, plus a small
//! self-describing header so every process attaching to a segment sees the
//! same identity, creator pid and synchronization primitives.
//!
//! # Layout
//!
//! ```text
//! offset 0          HEADER_SIZE                                   size
//! +-----------------+----------------------------------------------+
//! | SegmentHeader   | bump-allocated area (allocate / root)        |
//! +-----------------+----------------------------------------------+
//! ```
//!
//! # Segment Lifecycle
//!
//! 1. Owner creates segment with [`SharedSegment::create`]
//! 2. Peers attach with [`SharedSegment::open`]
//! 3. Mapping is released on drop
//! 4. Owner calls [`SharedSegment::remove`] on cleanup
//!
//! # Naming Convention
//!
//! Names must start with `/` and contain no other `/`, e.g. `/hdds_port7411`.

use super::sync::{ShmCondvar, ShmMutex};
use super::{is_process_alive, this_process_pid, Result, ShmError};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// "HDDSSEG1"
const SEGMENT_MAGIC: u64 = 0x4844_4453_5345_4731;
const SEGMENT_VERSION: u32 = 1;

/// How long `open` waits for a concurrent creator to finish initializing
const INIT_WAIT: Duration = Duration::from_millis(200);

/// Bytes reserved at the start of every segment.
pub const HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();

#[repr(C, align(64))]
struct SegmentHeader {
    /// Written last (Release) by the creator
    magic: AtomicU64,
    version: u32,
    creator_pid: u32,
    size: u64,
    id: [u8; 16],
    alloc_cursor: AtomicU64,
    root: AtomicU64,
    mutex: ShmMutex,
    condvar: ShmCondvar,
}

/// Position inside a segment, relative to its base address.
///
/// Only meaningful for the segment it was produced by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    /// Raw value
    #[inline]
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Offset `bytes` further into the segment.
    #[inline]
    #[must_use]
    pub fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// Random 128-bit segment identity (UUID v4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Identity from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Mapped shared memory segment.
///
/// Unmapped on drop. Never unlinked automatically: the owner decides when
/// the name disappears.
pub struct SharedSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
    id: SegmentId,
}

// SAFETY: the mapping stays valid for the life of the struct. Cross-thread
// access to header fields goes through atomics; payload copies are
// serialized by callers through the segment mutex.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("id", &self.id)
            .finish()
    }
}

impl SharedSegment {
    /// Create a new segment of `size` bytes (header included).
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the name is taken
    /// - `ResourceExhausted` if the OS refuses storage or mapping
    /// - `InvalidName` for malformed names
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = validate_name(name)?;
        if size < HEADER_SIZE {
            return Err(ShmError::ResourceExhausted {
                name: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{size} bytes cannot hold a {HEADER_SIZE}-byte header"),
                ),
            });
        }

        // SAFETY: c_name is a valid null-terminated string; O_EXCL makes
        // creation fail instead of reusing a segment someone else owns.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(ShmError::AlreadyExists(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let cleanup = |source: io::Error| {
            // SAFETY: fd came from the successful shm_open above and is
            // closed exactly once on this error path; the name is ours.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            ShmError::ResourceExhausted {
                name: name.to_string(),
                source,
            }
        };

        // SAFETY: fd is valid; a failing ftruncate leaves it usable for close.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            return Err(cleanup(io::Error::last_os_error()));
        }

        let ptr = match map(fd, size) {
            Ok(ptr) => ptr,
            Err(e) => return Err(cleanup(e)),
        };
        // SAFETY: the mapping holds its own reference to the object.
        unsafe { libc::close(fd) };

        let id = SegmentId::new();
        let hdr = ptr.cast::<SegmentHeader>();
        // SAFETY: ptr is a fresh page-aligned mapping of at least HEADER_SIZE
        // zeroed bytes. Plain fields are written before the Release store of
        // `magic`; openers read them only after an Acquire load sees it.
        unsafe {
            ptr::addr_of_mut!((*hdr).version).write(SEGMENT_VERSION);
            ptr::addr_of_mut!((*hdr).creator_pid).write(this_process_pid());
            ptr::addr_of_mut!((*hdr).size).write(size as u64);
            ptr::addr_of_mut!((*hdr).id).write(*id.as_bytes());
            (*hdr)
                .alloc_cursor
                .store(HEADER_SIZE as u64, Ordering::Relaxed);
            (*hdr).magic.store(SEGMENT_MAGIC, Ordering::Release);
        }

        log::debug!("[SHM] created segment {} ({} bytes, id {})", name, size, id);
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            id,
        })
    }

    /// Attach to an existing segment. The size comes from the OS object.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no segment has this name
    /// - `Corruption` if the header never becomes valid
    pub fn open(name: &str) -> Result<Self> {
        let c_name = validate_name(name)?;

        // SAFETY: c_name is a valid null-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // A concurrent creator may not have truncated yet
        let deadline = Instant::now() + INIT_WAIT;
        let size = loop {
            match object_size(fd) {
                Ok(size) if size >= HEADER_SIZE => break size,
                Ok(size) if Instant::now() >= deadline => {
                    // SAFETY: fd is valid and closed once.
                    unsafe { libc::close(fd) };
                    return Err(ShmError::Corruption(format!(
                        "{name}: {size} bytes, smaller than segment header"
                    )));
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    // SAFETY: fd is valid and closed once.
                    unsafe { libc::close(fd) };
                    return Err(ShmError::SegmentOpen(e));
                }
            }
        };

        let mapped = map(fd, size);
        // SAFETY: fd is valid; the mapping (if any) keeps its own reference.
        unsafe { libc::close(fd) };
        let ptr = mapped.map_err(ShmError::SegmentOpen)?;

        // SAFETY: mapping covers at least HEADER_SIZE bytes, page aligned.
        let hdr = unsafe { &*ptr.cast::<SegmentHeader>() };
        while hdr.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            if Instant::now() >= deadline {
                unmap(ptr, size);
                return Err(ShmError::Corruption(format!("{name}: bad magic")));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if hdr.version != SEGMENT_VERSION || hdr.size != size as u64 {
            let detail = format!(
                "{name}: version {} size {} (mapped {size})",
                hdr.version, hdr.size
            );
            unmap(ptr, size);
            return Err(ShmError::Corruption(detail));
        }

        let id = SegmentId::from_bytes(hdr.id);
        log::debug!("[SHM] opened segment {} ({} bytes, id {})", name, size, id);
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            id,
        })
    }

    /// Create the segment, or attach if it exists with exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// `SizeMismatch` when an existing segment has a different size.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        // Second round covers a segment removed between create and open
        for _ in 0..2 {
            match Self::create(name, size) {
                Err(ShmError::AlreadyExists(_)) => {}
                other => return other,
            }
            match Self::open(name) {
                Ok(seg) if seg.size == size => return Ok(seg),
                Ok(seg) => {
                    return Err(ShmError::SizeMismatch {
                        name: name.to_string(),
                        expected: size,
                        actual: seg.size,
                    })
                }
                Err(ShmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(ShmError::NotFound(name.to_string()))
    }

    /// Unlink a segment name. Mappings stay valid until dropped.
    ///
    /// # Errors
    ///
    /// Fails on OS errors other than "not found".
    pub fn remove(name: &str) -> Result<()> {
        let c_name = validate_name(name)?;
        // SAFETY: c_name is a valid null-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        } else {
            log::debug!("[SHM] removed segment {}", name);
        }
        Ok(())
    }

    /// True if a segment with this name exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; a returned fd is closed right away.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Remove the segment if its creator process is gone.
    ///
    /// Returns `true` if it was removed.
    ///
    /// # Errors
    ///
    /// Propagates open failures other than `NotFound`.
    pub fn remove_if_stale(name: &str) -> Result<bool> {
        let segment = match Self::open(name) {
            Ok(seg) => seg,
            Err(ShmError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !segment.is_stale() {
            return Ok(false);
        }
        log::info!(
            "[SHM] removing stale segment {} (creator pid {} gone)",
            name,
            segment.creator_pid()
        );
        drop(segment);
        Self::remove(name)?;
        Ok(true)
    }

    /// Names (with leading `/`) of segments starting with `prefix`.
    ///
    /// Reads `/dev/shm`; returns an empty list where it is unavailable.
    #[must_use]
    pub fn list(prefix: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir("/dev/shm") else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.starts_with(prefix))
            .map(|n| format!("/{n}"))
            .collect();
        names.sort();
        names
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping starts with an initialized header (checked in
        // open, written in create) and outlives &self.
        unsafe { &*self.ptr.cast::<SegmentHeader>() }
    }

    /// Absolute address of `offset` in this process.
    ///
    /// # Errors
    ///
    /// `OutOfRange` unless `offset < size`.
    pub fn address_from_offset(&self, offset: Offset) -> Result<*mut u8> {
        if offset.0 >= self.size as u64 {
            return Err(ShmError::OutOfRange {
                offset: offset.0,
                size: self.size,
            });
        }
        // SAFETY: bounds checked above; the result stays inside the mapping.
        Ok(unsafe { self.ptr.add(offset.0 as usize) })
    }

    /// Offset of an absolute address inside this mapping.
    ///
    /// # Errors
    ///
    /// `OutOfRange` for addresses outside `[base, base + size)`.
    pub fn offset_from_address(&self, address: *const u8) -> Result<Offset> {
        let base = self.ptr as usize;
        let addr = address as usize;
        let rel = addr.wrapping_sub(base);
        if addr < base || rel >= self.size {
            return Err(ShmError::OutOfRange {
                offset: rel as u64,
                size: self.size,
            });
        }
        Ok(Offset(rel as u64))
    }

    /// Reserve `size` bytes aligned to `align` (a power of two).
    ///
    /// Allocations are never freed; the area lives as long as the segment.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the segment has no room left.
    pub fn allocate(&self, size: usize, align: usize) -> Result<Offset> {
        let align = align.max(1) as u64;
        debug_assert!(align.is_power_of_two());
        let cursor = &self.header().alloc_cursor;
        let mut current = cursor.load(Ordering::Relaxed);
        loop {
            let start = (current + align - 1) & !(align - 1);
            let end = start + size as u64;
            if end > self.size as u64 {
                return Err(ShmError::ResourceExhausted {
                    name: self.name.clone(),
                    source: io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        format!("{size} bytes requested, {} free", self.size as u64 - current),
                    ),
                });
            }
            match cursor.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(Offset(start)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Offset of the well-known root structure, if published.
    #[must_use]
    pub fn root(&self) -> Option<Offset> {
        match self.header().root.load(Ordering::Acquire) {
            0 => None,
            off => Some(Offset(off)),
        }
    }

    /// Publish the root structure. Its contents must be initialized first.
    pub fn set_root(&self, offset: Offset) {
        self.header().root.store(offset.0, Ordering::Release);
    }

    /// Copy `data` into the segment at `offset`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if the range does not fit.
    pub fn write_bytes(&self, offset: Offset, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked; caller serializes writers through the mutex.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset.0 as usize), data.len());
        }
        Ok(())
    }

    /// Copy `out.len()` bytes from `offset` into `out`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if the range does not fit.
    pub fn read_bytes(&self, offset: Offset, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        // SAFETY: range checked; see write_bytes.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset.0 as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Reference to a `T` stored at `offset`.
    ///
    /// # Safety
    ///
    /// `T` must be `#[repr(C)]` with interior mutability only (atomics) and
    /// valid for any bit pattern, and the bytes at `offset` must have been
    /// laid out as a `T` by the segment's owner.
    pub(crate) unsafe fn at<T>(&self, offset: Offset) -> Result<&T> {
        self.check_range(offset, mem::size_of::<T>())?;
        if offset.0 % mem::align_of::<T>() as u64 != 0 {
            return Err(ShmError::Corruption(format!(
                "{}: misaligned offset {}",
                self.name, offset
            )));
        }
        Ok(&*self.ptr.add(offset.0 as usize).cast::<T>())
    }

    fn check_range(&self, offset: Offset, len: usize) -> Result<()> {
        match offset.0.checked_add(len as u64) {
            Some(end) if end <= self.size as u64 => Ok(()),
            _ => Err(ShmError::OutOfRange {
                offset: offset.0,
                size: self.size,
            }),
        }
    }

    /// Segment identity, identical in every attached process.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Segment name (with leading `/`).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address of the mapping in this process.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// pid of the process that created the segment.
    #[must_use]
    pub fn creator_pid(&self) -> u32 {
        self.header().creator_pid
    }

    /// Overwrite the recorded creator, as if `pid` had created the segment.
    #[cfg(test)]
    pub(crate) fn set_creator_pid(&self, pid: u32) {
        // SAFETY: the header starts the live mapping; tests own the segment.
        unsafe {
            ptr::addr_of_mut!((*self.ptr.cast::<SegmentHeader>()).creator_pid).write(pid);
        }
    }

    /// True when the creator process no longer exists.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        !is_process_alive(self.creator_pid())
    }

    /// Segment-wide cross-process mutex.
    #[must_use]
    pub fn mutex(&self) -> &ShmMutex {
        &self.header().mutex
    }

    /// Condition variable paired with [`Self::mutex`].
    #[must_use]
    pub fn condvar(&self) -> &ShmCondvar {
        &self.header().condvar
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unmap(self.ptr, self.size);
    }
}

fn validate_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(ShmError::InvalidName(format!(
            "segment name must be '/' followed by a name: {name}"
        )));
    }
    if name[1..].contains('/') {
        return Err(ShmError::InvalidName(format!(
            "segment name cannot contain '/' after prefix: {name}"
        )));
    }
    if name.len() > 255 {
        return Err(ShmError::InvalidName(format!(
            "segment name too long (max 255): {name}"
        )));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

fn map(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
    // SAFETY: null hint lets the kernel pick the address; fd is a valid
    // shm descriptor at least `size` bytes long. MAP_FAILED is checked.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast::<u8>())
}

fn unmap(ptr: *mut u8, size: usize) {
    // SAFETY: ptr/size describe a live mapping created by `map`, unmapped
    // exactly once.
    unsafe {
        libc::munmap(ptr.cast::<libc::c_void>(), size);
    }
}

fn object_size(fd: libc::c_int) -> io::Result<usize> {
    // SAFETY: stat is plain old data; fstat fills it on success.
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as usize)
}

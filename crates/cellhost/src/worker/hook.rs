//! Pre-init hook and its scratch arena.
//!
//! The hook runs once per worker, after the init message arrived and before
//! the entry point. It gets a private mmap-backed bump arena; everything it
//! allocated there is zeroed and unmapped before the entry point starts, so
//! secrets handled by the hook do not linger in the worker's memory.

use std::cell::Cell;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::bridge::protocol::Message;

const ALIGN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("arena limit must be non-zero")]
    ZeroLimit,
    #[error("arena exhausted: {requested} bytes requested, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
    #[error("mapping arena failed: {0}")]
    Map(#[from] nix::errno::Errno),
}

/// Runs between the sync point and the worker entry point.
pub trait PreInitHook: Send + Sync {
    fn run(&self, arena: &HookArena, init: &Message) -> anyhow::Result<()>;
}

impl<F> PreInitHook for F
where
    F: Fn(&HookArena, &Message) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, arena: &HookArena, init: &Message) -> anyhow::Result<()> {
        self(arena, init)
    }
}

/// Bump allocator over a private anonymous mapping.
pub struct HookArena {
    base: NonNull<u8>,
    limit: usize,
    used: Cell<usize>,
}

impl HookArena {
    pub fn new(limit: usize) -> Result<Self, ArenaError> {
        let len = NonZeroUsize::new(limit).ok_or(ArenaError::ZeroLimit)?;
        // SAFETY: a fresh private mapping aliases nothing.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }?;
        Ok(Self {
            base: base.cast(),
            limit,
            used: Cell::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Allocate `len` zeroed bytes, 16-byte aligned.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, len: usize) -> Result<&mut [u8], ArenaError> {
        let start = self.used.get().next_multiple_of(ALIGN);
        let remaining = self.limit.saturating_sub(start);
        if len > remaining {
            return Err(ArenaError::Exhausted {
                requested: len,
                remaining,
            });
        }
        self.used.set(start + len);
        // SAFETY: [start, start + len) is inside the mapping and was never
        // handed out before, so this is the only reference to it.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(start), len) })
    }

    pub fn alloc_copy(&self, bytes: &[u8]) -> Result<&mut [u8], ArenaError> {
        let out = self.alloc(bytes.len())?;
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Zero every byte handed out so far and reset the arena.
    pub fn scrub(&mut self) {
        for i in 0..self.used.get() {
            // SAFETY: within the mapping; `&mut self` rules out live allocations.
            unsafe { self.base.as_ptr().add(i).write_volatile(0) };
        }
        self.used.set(0);
    }

    #[cfg(test)]
    fn contents(&self, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), len.min(self.limit)) }
    }
}

impl Drop for HookArena {
    fn drop(&mut self) {
        self.scrub();
        // SAFETY: base/limit describe the mapping created in new().
        if let Err(error) = unsafe { munmap(self.base.cast(), self.limit) } {
            tracing::warn!(%error, "Failed to unmap hook arena");
        }
    }
}

/// Run `hook` with a fresh arena, scrubbing it before returning.
pub(crate) fn run_pre_init_hook(
    hook: &dyn PreInitHook,
    init: &Message,
    limit: usize,
) -> Result<(), HookError> {
    let arena = HookArena::new(limit)?;
    let result = hook.run(&arena, init);
    let used = arena.used();
    drop(arena);
    tracing::debug!(used, "Pre-init hook finished, arena scrubbed");
    result.map_err(HookError::Failed)
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("pre-init hook failed: {0:#}")]
    Failed(anyhow::Error),
}

//! Fixed-size block allocator with per-thread batched free-lists.
//!
//! Every connection's receive buffer is a block from a [`Pool`] rather than
//! a fresh heap allocation, so steady-state request handling does no
//! allocator work beyond the occasional slab grow. The fast path (allocate /
//! release) never touches a mutex: each thread keeps its own capped
//! free-list and only falls back to the pool's global, mutex-guarded list
//! when its local list is empty or overflowing.

use rustc_hash::FxHashMap;
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Blocks a thread-local list may hold before it is bulk-flushed back to the
/// global free-list (at `2 * BATCH`), and the number bulk-moved out of the
/// global list on refill.
const BATCH: usize = 64;

/// Below this size a slab is a single page-aligned heap allocation; at or
/// above it a slab is an anonymous `mmap`, which is itself page-granular
/// and avoids fragmenting the regular allocator with large requests.
const MMAP_THRESHOLD: usize = 4096;

const CACHE_LINE: usize = 64;

const BLOCKS_PER_SLAB: usize = 256;

#[derive(Debug)]
pub enum PoolError {
    /// Growth failed and both the thread-local and global free-lists were empty.
    Exhausted,
}

struct Slab {
    base: NonNull<u8>,
    len: usize,
    mmap: bool,
}

// Slabs are never mutated after creation and only read for the
// contains-pointer reverse lookup, so sharing the pointer across threads is safe.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.len;
        let p = ptr.as_ptr() as usize;
        p >= start && p < end
    }
}

struct Inner {
    block_size: usize,
    global: Mutex<Vec<NonNull<u8>>>,
    slabs: Mutex<Vec<Slab>>,
    used_blocks: AtomicUsize,
}

unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// A fixed-size block allocator. `block_size` is rounded up to a multiple
/// of the cache-line size so adjacent blocks never share a cache line.
#[derive(Clone)]
pub struct Pool(Arc<Inner>);

thread_local! {
    static LOCAL: RefCell<FxHashMap<usize, Vec<NonNull<u8>>>> = RefCell::new(FxHashMap::default());
}

impl Pool {
    pub fn new(block_size: usize) -> Self {
        let block_size = (block_size + CACHE_LINE - 1) / CACHE_LINE * CACHE_LINE;
        Pool(Arc::new(Inner {
            block_size,
            global: Mutex::new(Vec::new()),
            slabs: Mutex::new(Vec::new()),
            used_blocks: AtomicUsize::new(0),
        }))
    }

    pub fn block_size(&self) -> usize {
        self.0.block_size
    }

    /// Number of blocks currently checked out of the pool. Used by shutdown
    /// cleanup assertions: this must reach zero once every connection has
    /// released its buffer.
    pub fn used_blocks(&self) -> usize {
        self.0.used_blocks.load(Ordering::Relaxed)
    }

    fn local_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn allocate(&self) -> Result<Block, PoolError> {
        let key = self.local_key();
        let ptr = LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            local.entry(key).or_default().pop()
        });
        let ptr = match ptr {
            Some(p) => p,
            None => self.refill_local(key)?,
        };
        self.0.used_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(Block { ptr, pool: self.clone() })
    }

    /// Moves up to `BATCH` blocks from the global list into the calling
    /// thread's local list, growing the pool by one slab first if the
    /// global list is empty. Returns the one block the caller actually wants.
    fn refill_local(&self, key: usize) -> Result<NonNull<u8>, PoolError> {
        let mut global = self.0.global.lock().unwrap();
        if global.is_empty() {
            self.grow_slab(&mut global)?;
        }
        let take = global.len().min(BATCH);
        let moved: Vec<NonNull<u8>> = global.split_off(global.len() - take);
        drop(global);

        LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            let list = local.entry(key).or_default();
            list.extend(moved);
            list.pop().ok_or(PoolError::Exhausted)
        })
    }

    fn grow_slab(&self, global: &mut Vec<NonNull<u8>>) -> Result<(), PoolError> {
        let block_size = self.0.block_size;
        let slab_len = block_size * BLOCKS_PER_SLAB;
        let (base, mmap) = if block_size >= MMAP_THRESHOLD {
            (mmap_anon(slab_len).ok_or(PoolError::Exhausted)?, true)
        } else {
            (page_aligned_alloc(slab_len).ok_or(PoolError::Exhausted)?, false)
        };

        for i in 0..BLOCKS_PER_SLAB {
            // SAFETY: offset stays within the slab just allocated above.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * block_size)) };
            global.push(ptr);
        }

        self.0.slabs.lock().unwrap().push(Slab { base, len: slab_len, mmap });
        Ok(())
    }

    /// Returns `block` to this pool's free-lists. A pointer that did not
    /// originate from this pool is a detected error: it is logged and
    /// dropped on the floor rather than corrupting the free-list.
    fn release(&self, ptr: NonNull<u8>) {
        let slabs = self.0.slabs.lock().unwrap();
        if !slabs.iter().any(|s| s.contains(ptr)) {
            tracing::error!("pool: release of foreign pointer ignored");
            return;
        }
        drop(slabs);

        self.0.used_blocks.fetch_sub(1, Ordering::Relaxed);
        let key = self.local_key();
        let overflow = LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            let list = local.entry(key).or_default();
            list.push(ptr);
            if list.len() >= 2 * BATCH {
                Some(list.split_off(list.len() - BATCH))
            } else {
                None
            }
        });
        if let Some(overflow) = overflow {
            self.0.global.lock().unwrap().extend(overflow);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slab in self.slabs.lock().unwrap().drain(..) {
            if slab.mmap {
                unsafe {
                    libc::munmap(slab.base.as_ptr() as *mut libc::c_void, slab.len);
                }
            } else {
                let layout = Layout::from_size_align(slab.len, page_size()).unwrap();
                unsafe {
                    alloc::dealloc(slab.base.as_ptr(), layout);
                }
            }
        }
    }
}

fn mmap_anon(len: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

fn page_aligned_alloc(len: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(len, page_size()).ok()?;
    NonNull::new(unsafe { alloc::alloc(layout) })
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A block checked out of a [`Pool`]. Derefs to a fixed-size byte slice;
/// returned to the pool automatically on drop.
pub struct Block {
    ptr: NonNull<u8>,
    pool: Pool,
}

// A Block is exclusively owned by whichever connection holds it; sending
// that ownership across threads (e.g. a connection migrating workers) is sound.
unsafe impl Send for Block {}

impl std::ops::Deref for Block {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.pool.block_size()) }
    }
}

impl std::ops::DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.pool.block_size()) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.pool.release(self.ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_block_of_configured_size() {
        let pool = Pool::new(8192);
        let block = pool.allocate().unwrap();
        assert_eq!(block.len(), 8192);
    }

    #[test]
    fn release_returns_block_to_pool() {
        let pool = Pool::new(4096);
        assert_eq!(pool.used_blocks(), 0);
        let block = pool.allocate().unwrap();
        assert_eq!(pool.used_blocks(), 1);
        drop(block);
        assert_eq!(pool.used_blocks(), 0);
    }

    #[test]
    fn block_size_rounds_up_to_cache_line() {
        let pool = Pool::new(10);
        assert_eq!(pool.block_size(), CACHE_LINE);
    }

    #[test]
    fn many_allocations_grow_multiple_slabs() {
        let pool = Pool::new(64);
        let blocks: Vec<_> = (0..(BLOCKS_PER_SLAB * 3)).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.used_blocks(), BLOCKS_PER_SLAB * 3);
        drop(blocks);
        assert_eq!(pool.used_blocks(), 0);
    }

    #[test]
    fn foreign_release_is_ignored_not_corrupting() {
        let pool = Pool::new(64);
        let mut buf = [0u8; 64];
        let foreign = NonNull::new(buf.as_mut_ptr()).unwrap();
        pool.release(foreign);
        // Pool is still usable afterward.
        let block = pool.allocate().unwrap();
        assert_eq!(block.len(), 64);
    }
}

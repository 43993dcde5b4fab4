//! Process-wide table of reference records, giving O(1) handle-to-object
//! resolution with lock/unlock and autodelete semantics.
//!
//! References are allocated in fixed-size blocks (`SLOTS_PER_BLOCK` slots
//! each, up to `MAX_BLOCKS` blocks); freed slots are threaded onto a
//! recycle list using the slot itself, and destruction busy-waits for
//! outstanding locks to drain before clearing the owning pointer. The owner
//! pointer is modeled as `Option<Arc<dyn Any>>` downcast at `lock()` time,
//! since Rust has no raw "pointer to the object" escape hatch that is also
//! safe.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::error;

const SLOTS_PER_BLOCK: usize = 1024;
const MAX_BLOCKS: usize = 1024;

/// Opaque 1-based handle into the `RefTable`. `0` is never issued and stands
/// for "no handle" / allocation failure.
pub type Handle = u32;

enum Slot {
    /// Free slot; `next` links to the next free slot, or `NONE` to mark the
    /// end of the free list (mirrors `RefInfo::next` sharing storage with
    /// `RefInfo::ptr` in the source).
    Free { next: Option<u32> },
    Live {
        owner: Option<Arc<dyn Any + Send + Sync>>,
        strong_count: u32,
        lock_count: u32,
        autodelete: bool,
        name: Option<String>,
    },
}

struct Inner {
    blocks: Vec<Vec<Slot>>,
    free_list: Option<u32>,
    high_water: u32,
}

/// A process-wide (or per-`Network`, if the application prefers several)
/// table of reference records.
pub struct RefTable {
    inner: Mutex<Inner>,
}

impl Default for RefTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RefTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                free_list: None,
                high_water: 0,
            }),
        }
    }

    /// Registers `obj` and returns a handle to it, or `0` on allocation
    /// failure (block table exhausted).
    pub fn acquire<T: Send + Sync + 'static>(&self, obj: Arc<T>, name: Option<&str>) -> Handle {
        let mut inner = self.inner.lock().unwrap();
        let id = if let Some(free) = inner.free_list {
            inner.free_list = match slot_at(&inner.blocks, free) {
                Slot::Free { next } => *next,
                Slot::Live { .. } => unreachable!("free list points at a live slot"),
            };
            free
        } else {
            let id = inner.high_water;
            let block = (id as usize) / SLOTS_PER_BLOCK;
            if block >= MAX_BLOCKS {
                error!("RefTable: exhausted {MAX_BLOCKS} blocks, cannot acquire a new handle");
                return 0;
            }
            if block == inner.blocks.len() {
                inner.blocks.push(Vec::new());
            }
            inner.high_water += 1;
            id
        };

        let slot = Slot::Live {
            owner: Some(obj),
            strong_count: 1,
            lock_count: 0,
            autodelete: false,
            name: name.map(str::to_owned),
        };
        set_slot(&mut inner.blocks, id, slot);
        id + 1
    }

    /// Increments the strong count and returns the same handle, or `0` if
    /// the handle is dead.
    pub fn grab(&self, handle: Handle) -> Handle {
        if handle == 0 {
            return 0;
        }
        let mut inner = self.inner.lock().unwrap();
        let id = handle - 1;
        match slot_mut(&mut inner.blocks, id) {
            Some(Slot::Live { strong_count, .. }) => {
                *strong_count += 1;
                handle
            }
            _ => 0,
        }
    }

    /// Drops a strong reference. If the count reaches zero and autodelete
    /// is enabled, the owner `Arc` is dropped here (decrement-then-delete
    /// ordering, matching the source).
    pub fn release(&self, handle: Handle) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let id = handle - 1;
        let should_recycle = match slot_mut(&mut inner.blocks, id) {
            Some(Slot::Live {
                strong_count,
                lock_count,
                autodelete,
                owner,
                ..
            }) => {
                debug_assert!(*strong_count > 0);
                *strong_count = strong_count.saturating_sub(1);
                if *strong_count == 0 {
                    debug_assert_eq!(*lock_count, 0, "releasing a still-locked reference");
                    if *autodelete {
                        owner.take();
                    }
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if should_recycle {
            let next = inner.free_list;
            set_slot(&mut inner.blocks, id, Slot::Free { next });
            inner.free_list = Some(id);
        }
    }

    /// Looks up the object and increments its lock count, or returns `None`
    /// if the handle is dead or the owner has been torn down.
    pub fn lock<T: Send + Sync + 'static>(&self, handle: Handle) -> Option<Arc<T>> {
        if handle == 0 {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let id = handle - 1;
        match slot_mut(&mut inner.blocks, id) {
            Some(Slot::Live {
                owner, lock_count, ..
            }) => {
                let owner = owner.as_ref()?;
                let typed = owner.clone().downcast::<T>().ok()?;
                *lock_count += 1;
                Some(typed)
            }
            _ => None,
        }
    }

    /// Releases a lock taken by `lock()`.
    pub fn unlock(&self, handle: Handle) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let id = handle - 1;
        if let Some(Slot::Live { lock_count, .. }) = slot_mut(&mut inner.blocks, id) {
            debug_assert!(*lock_count > 0);
            *lock_count = lock_count.saturating_sub(1);
        }
    }

    pub fn set_autodelete(&self, handle: Handle, enabled: bool) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let id = handle - 1;
        if let Some(Slot::Live { autodelete, .. }) = slot_mut(&mut inner.blocks, id) {
            *autodelete = enabled;
        }
    }

    /// Clears the owner pointer and waits (bounded ~2s, ~1ms polls) for the
    /// lock count to reach zero. Logs a fatal "still locked" record and
    /// proceeds past the deadline rather than deadlocking shutdown.
    pub fn destroy(&self, handle: Handle) {
        if handle == 0 {
            return;
        }
        let id = handle - 1;
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(Slot::Live { owner, .. }) = slot_mut(&mut inner.blocks, id) {
                owner.take();
            } else {
                return;
            }
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let lock_count = {
                let inner = self.inner.lock().unwrap();
                match slot_at(&inner.blocks, id) {
                    Slot::Live { lock_count, .. } => *lock_count,
                    Slot::Free { .. } => 0,
                }
            };
            if lock_count == 0 {
                break;
            }
            if Instant::now() >= deadline {
                error!(
                    "RefTable: timeout waiting on release of reference handle {handle} \
                     (still locked {lock_count} time(s)); proceeding anyway"
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut inner = self.inner.lock().unwrap();
        let should_recycle = matches!(slot_at(&inner.blocks, id), Slot::Live { strong_count, .. } if *strong_count == 0);
        if should_recycle {
            let next = inner.free_list;
            set_slot(&mut inner.blocks, id, Slot::Free { next });
            inner.free_list = Some(id);
        }
    }

    /// Returns `(handle, name, strong_count, lock_count)` for every live
    /// reference, for diagnostics (`RefObj::LogRefs` in the source).
    pub fn dump(&self) -> Vec<(Handle, Option<String>, u32, u32)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for id in 0..inner.high_water {
            if let Slot::Live {
                strong_count,
                lock_count,
                name,
                ..
            } = slot_at(&inner.blocks, id)
            {
                out.push((id + 1, name.clone(), *strong_count, *lock_count));
            }
        }
        out
    }
}

fn slot_at(blocks: &[Vec<Slot>], id: u32) -> &Slot {
    let block = (id as usize) / SLOTS_PER_BLOCK;
    let offset = (id as usize) % SLOTS_PER_BLOCK;
    &blocks[block][offset]
}

fn slot_mut(blocks: &mut [Vec<Slot>], id: u32) -> Option<&mut Slot> {
    let block = (id as usize) / SLOTS_PER_BLOCK;
    let offset = (id as usize) % SLOTS_PER_BLOCK;
    blocks.get_mut(block).and_then(|b| b.get_mut(offset))
}

fn set_slot(blocks: &mut Vec<Vec<Slot>>, id: u32, slot: Slot) {
    let block = (id as usize) / SLOTS_PER_BLOCK;
    let offset = (id as usize) % SLOTS_PER_BLOCK;
    while blocks[block].len() <= offset {
        blocks[block].push(Slot::Free { next: None });
    }
    blocks[block][offset] = slot;
}

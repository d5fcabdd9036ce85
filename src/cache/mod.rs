//! Bounded in-process key/value caches with pluggable eviction.
//!
//! A cache is limited both by entry count (`max_items`) and by total byte
//! count including per-entry overhead (`max_bytes`). All operations are
//! asynchronous through the task API; blocking wrappers are provided.
//! Three eviction policies exist: a single-hand [`clock`], a classic
//! [`lru`] deque, and [`cart`] (Clock with Adaptive Replacement and
//! Temporal filtering), which is what `BestAvailable` selects.

use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use slab::Slab;

use crate::io::SharedBuf;
use crate::manager::wait;
use crate::options::Options;
use crate::status::Status;
use crate::task::Task;

pub mod cart;
pub mod clock;
pub mod lru;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub num_items: usize,
    pub num_bytes: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CacheType {
    Clock,
    Lru,
    Cart,
    #[default]
    BestAvailable,
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CacheType::Clock => "clock",
            CacheType::Lru => "lru",
            CacheType::Cart => "cart",
            CacheType::BestAvailable => "best_available",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub kind: CacheType,
    pub max_items: usize,
    pub max_bytes: usize,
}

impl CacheOptions {
    pub fn new(kind: CacheType, max_items: usize) -> CacheOptions {
        CacheOptions {
            kind,
            max_items,
            max_bytes: usize::MAX,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            kind: CacheType::BestAvailable,
            max_items: 1024,
            max_bytes: usize::MAX,
        }
    }
}

/// A bounded key/value byte store.
///
/// `get` marks the entry referenced and never returns ghost entries.
/// `put` evicts as needed to fit; an entry larger than `max_bytes` fails
/// with `OUT_OF_RANGE`. Missing keys (and ghost-only hits) report
/// `NOT_FOUND`.
pub trait Cache: Send + Sync {
    fn get(&self, task: &Arc<Task>, out: &SharedBuf, key: &[u8], opts: &Options);
    fn put(&self, task: &Arc<Task>, key: &[u8], value: &[u8], opts: &Options);
    fn remove(&self, task: &Arc<Task>, key: &[u8], opts: &Options);
    fn clear(&self, task: &Arc<Task>, opts: &Options);
    fn stats(&self, task: &Arc<Task>, out: &Arc<Mutex<CacheStats>>, opts: &Options);
    /// Renders a human-readable dump of the policy's internal arrangement.
    fn visualize(&self, task: &Arc<Task>, out: &SharedBuf, opts: &Options);

    // Blocking versions of the above {{{

    fn get_sync(&self, key: &[u8], opts: &Options) -> Result<Vec<u8>, Status> {
        let task = Task::new();
        let out = SharedBuf::new();
        self.get(&task, &out, key, opts);
        wait(&crate::io::get_manager(opts), &task);
        let r = task.result();
        if r.is_ok() {
            Ok(out.take())
        } else {
            Err(r)
        }
    }

    fn put_sync(&self, key: &[u8], value: &[u8], opts: &Options) -> Status {
        let task = Task::new();
        self.put(&task, key, value, opts);
        wait(&crate::io::get_manager(opts), &task);
        task.result()
    }

    fn remove_sync(&self, key: &[u8], opts: &Options) -> Status {
        let task = Task::new();
        self.remove(&task, key, opts);
        wait(&crate::io::get_manager(opts), &task);
        task.result()
    }

    fn clear_sync(&self, opts: &Options) -> Status {
        let task = Task::new();
        self.clear(&task, opts);
        wait(&crate::io::get_manager(opts), &task);
        task.result()
    }

    fn stats_sync(&self, opts: &Options) -> Result<CacheStats, Status> {
        let task = Task::new();
        let out = Arc::new(Mutex::new(CacheStats::default()));
        self.stats(&task, &out, opts);
        wait(&crate::io::get_manager(opts), &task);
        let r = task.result();
        if r.is_ok() {
            Ok(out.lock().unwrap().clone())
        } else {
            Err(r)
        }
    }

    fn visualize_sync(&self, opts: &Options) -> Result<String, Status> {
        let task = Task::new();
        let out = SharedBuf::new();
        self.visualize(&task, &out, opts);
        wait(&crate::io::get_manager(opts), &task);
        let r = task.result();
        if r.is_ok() {
            Ok(String::from_utf8_lossy(&out.take()).into_owned())
        } else {
            Err(r)
        }
    }

    // }}}
}

pub type CachePtr = Arc<dyn Cache>;

/// One cache slot. A `dead` item is a ghost: its key is remembered in the
/// eviction history but the value is gone.
pub(crate) struct Item {
    pub key: Box<[u8]>,
    pub value: Vec<u8>,
    pub dead: bool,
    pub used: bool,
    pub longterm: bool,
}

pub(crate) const ITEM_OVERHEAD: usize = std::mem::size_of::<Item>();

impl Item {
    fn new(key: &[u8]) -> Item {
        Item {
            key: key.into(),
            value: Vec::new(),
            dead: false,
            used: false,
            longterm: false,
        }
    }

    pub fn wire_size(key: &[u8], value: &[u8]) -> usize {
        ITEM_OVERHEAD + key.len() + value.len()
    }

    pub fn byte_size(&self) -> usize {
        Item::wire_size(&self.key, &self.value)
    }

    /// Turns the slot into a ghost: the value is released, the key stays.
    pub fn kill(&mut self) {
        self.dead = true;
        self.value = Vec::new();
    }

    fn assign(&mut self, value: &[u8]) {
        debug_assert!(!self.dead);
        self.value = value.to_vec();
    }
}

/// Bookkeeping shared by every policy: the item arena, the key map, and
/// the item/byte accounting.
pub(crate) struct CacheCore {
    pub arena: Slab<Item>,
    pub map: IndexMap<Box<[u8]>, usize>,
    pub max_items: usize,
    pub max_bytes: usize,
    pub num_items: usize,
    pub num_bytes: usize,
}

impl CacheCore {
    fn new(max_items: usize, max_bytes: usize) -> CacheCore {
        assert!(max_items > 0);
        assert!(max_bytes > 0);
        CacheCore {
            arena: Slab::with_capacity(max_items),
            map: IndexMap::with_capacity(max_items),
            max_items,
            max_bytes,
            num_items: 0,
            num_bytes: 0,
        }
    }

    /// Books the eviction of a live item's value.
    pub fn mark_evicted(&mut self, id: usize) {
        let n = self.arena[id].byte_size();
        debug_assert!(self.num_bytes >= n);
        debug_assert!(self.num_items >= 1);
        self.num_items -= 1;
        self.num_bytes -= n;
    }

    /// Erases the item's key from the map; the slot itself is the
    /// caller's to free.
    pub fn mark_forgotten(&mut self, id: usize) {
        let key = self.arena[id].key.clone();
        self.map.swap_remove(key.as_ref());
    }

    /// Full disposal: forget the key and free the arena slot.
    pub fn forget_and_free(&mut self, id: usize) {
        self.mark_forgotten(id);
        self.arena.remove(id);
    }
}

/// The eviction-policy half of a cache.
pub(crate) trait Policy: Send {
    fn clear(&mut self, core: &CacheCore);
    /// Targeted removal of one item (live or ghost).
    fn evict_one(&mut self, core: &mut CacheCore, id: usize);
    /// Frees one slot of the policy's choosing.
    fn evict_any(&mut self, core: &mut CacheCore);
    /// Installs a brand-new item.
    fn place(&mut self, core: &mut CacheCore, id: usize);
    /// Resurrects a ghost the caller is about to re-assign.
    fn replace(&mut self, core: &mut CacheCore, id: usize);
    /// Marks an item referenced.
    fn touch(&mut self, core: &mut CacheCore, id: usize);
    fn visualize(&self, core: &CacheCore, out: &mut String);
}

pub(crate) struct LocalCache {
    guts: Mutex<Guts>,
}

struct Guts {
    core: CacheCore,
    policy: Box<dyn Policy>,
}

impl LocalCache {
    fn evict_until_fits(core: &mut CacheCore, policy: &mut Box<dyn Policy>) {
        while core.num_items >= core.max_items {
            debug_assert!(core.num_items > 0);
            policy.evict_any(core);
        }
    }
}

impl Cache for LocalCache {
    fn get(&self, task: &Arc<Task>, out: &SharedBuf, key: &[u8], _opts: &Options) {
        if !task.start() {
            return;
        }
        out.clear();

        let mut guts = self.guts.lock().unwrap();
        let Guts { core, policy } = &mut *guts;
        let id = match core.map.get(key) {
            None => {
                task.finish(Status::not_found());
                return;
            }
            Some(&id) => id,
        };
        if core.arena[id].dead {
            task.finish(Status::not_found());
            return;
        }

        policy.touch(core, id);
        out.append(&core.arena[id].value);
        task.finish_ok();
    }

    fn put(&self, task: &Arc<Task>, key: &[u8], value: &[u8], _opts: &Options) {
        if !task.start() {
            return;
        }

        let mut guts = self.guts.lock().unwrap();
        let Guts { core, policy } = &mut *guts;

        let new_size = Item::wire_size(key, value);
        if core.max_bytes < new_size {
            task.finish(Status::out_of_range("item too large"));
            return;
        }

        debug_assert!(core.num_items <= core.max_items);
        debug_assert!(core.num_bytes <= core.max_bytes);
        match core.map.get(key).copied() {
            None => {
                LocalCache::evict_until_fits(core, policy);
                let id = core.arena.insert(Item::new(key));
                core.arena[id].assign(value);
                core.num_items += 1;
                core.num_bytes += new_size;
                core.map.insert(key.into(), id);
                policy.place(core, id);
            }
            Some(id) if core.arena[id].dead => {
                LocalCache::evict_until_fits(core, policy);
                // Eviction may have trimmed the very ghost being
                // resurrected; fall back to a fresh insert if so.
                if core.map.get(key).copied() == Some(id) {
                    policy.replace(core, id);
                    core.num_items += 1;
                    core.arena[id].assign(value);
                    core.num_bytes += new_size;
                } else {
                    let id = core.arena.insert(Item::new(key));
                    core.arena[id].assign(value);
                    core.num_items += 1;
                    core.num_bytes += new_size;
                    core.map.insert(key.into(), id);
                    policy.place(core, id);
                }
            }
            Some(id) => {
                let old_size = core.arena[id].byte_size();
                debug_assert!(core.num_bytes >= old_size);
                core.num_bytes -= old_size;
                core.arena[id].assign(value);
                core.num_bytes += new_size;
            }
        }
        while core.num_bytes > core.max_bytes {
            policy.evict_any(core);
        }
        debug_assert!(core.num_items <= core.max_items);
        debug_assert!(core.num_bytes <= core.max_bytes);
        task.finish_ok();
    }

    fn remove(&self, task: &Arc<Task>, key: &[u8], _opts: &Options) {
        if !task.start() {
            return;
        }

        let mut guts = self.guts.lock().unwrap();
        let Guts { core, policy } = &mut *guts;
        let id = match core.map.get(key) {
            None => {
                task.finish(Status::not_found());
                return;
            }
            Some(&id) => id,
        };
        policy.evict_one(core, id);
        task.finish_ok();
    }

    fn clear(&self, task: &Arc<Task>, _opts: &Options) {
        if !task.start() {
            return;
        }

        let mut guts = self.guts.lock().unwrap();
        let Guts { core, policy } = &mut *guts;
        policy.clear(core);
        core.arena.clear();
        core.map.clear();
        core.num_items = 0;
        core.num_bytes = 0;
        task.finish_ok();
    }

    fn stats(&self, task: &Arc<Task>, out: &Arc<Mutex<CacheStats>>, _opts: &Options) {
        if !task.start() {
            return;
        }
        let guts = self.guts.lock().unwrap();
        *out.lock().unwrap() = CacheStats {
            num_items: guts.core.num_items,
            num_bytes: guts.core.num_bytes,
        };
        task.finish_ok();
    }

    fn visualize(&self, task: &Arc<Task>, out: &SharedBuf, _opts: &Options) {
        if !task.start() {
            return;
        }
        out.clear();
        let guts = self.guts.lock().unwrap();
        let mut text = String::new();
        guts.policy.visualize(&guts.core, &mut text);
        out.append(text.as_bytes());
        task.finish_ok();
    }
}

/// Builds a cache with the requested policy and bounds.
pub fn new_cache(co: &CacheOptions) -> CachePtr {
    let policy: Box<dyn Policy> = match co.kind {
        CacheType::Clock => Box::new(clock::ClockPolicy::new(co.max_items)),
        CacheType::Lru => Box::new(lru::LruPolicy::new()),
        CacheType::Cart | CacheType::BestAvailable => Box::new(cart::CartPolicy::new(co.max_items)),
    };
    Arc::new(LocalCache {
        guts: Mutex::new(Guts {
            core: CacheCore::new(co.max_items, co.max_bytes),
            policy,
        }),
    })
}

/// Renders one slot: key, value size, and flag markers.
pub(crate) fn visualize_slot(out: &mut String, prefix: &str, slot: Option<&Item>) {
    use std::fmt::Write;
    match slot {
        Some(item) => {
            let key = String::from_utf8_lossy(&item.key);
            let _ = write!(out, "{} \"{}\" = ", prefix, key);
            if item.value.is_empty() {
                out.push_str("\"\"");
            } else {
                let _ = write!(out, "... ({} bytes)", item.value.len());
            }
            if item.dead {
                out.push_str(" [dead]");
            }
            if item.used {
                out.push_str(" [used]");
            }
            if item.longterm {
                out.push_str(" [L]");
            } else {
                out.push_str(" [S]");
            }
            out.push_str(",\n");
        }
        None => {
            let _ = write!(out, "{} NULL,\n", prefix);
        }
    }
}

/// Renders a clock region with a `->` hand marker.
pub(crate) fn visualize_clock(
    out: &mut String,
    name: &str,
    core: &CacheCore,
    cells: &[Option<usize>],
    hand: usize,
) {
    use std::fmt::Write;
    if cells.is_empty() {
        let _ = write!(out, "{} = []\n", name);
        return;
    }
    let _ = write!(out, "{} = [\n", name);
    for (i, cell) in cells.iter().enumerate() {
        let prefix = if i == hand { " ->" } else { "   " };
        visualize_slot(out, prefix, cell.map(|id| &core.arena[id]));
    }
    out.push_str("]\n");
}

/// Renders a recency list, marking the most- and least-recent entries.
pub(crate) fn visualize_lru<'a>(
    out: &mut String,
    name: &str,
    core: &CacheCore,
    ids: impl ExactSizeIterator<Item = &'a usize>,
) {
    use std::fmt::Write;
    let len = ids.len();
    if len == 0 {
        let _ = write!(out, "{} = []\n", name);
        return;
    }
    let _ = write!(out, "{} = [\n", name);
    for (i, &id) in ids.enumerate() {
        let prefix = if i == 0 {
            "  M"
        } else if i + 1 == len {
            "  L"
        } else {
            "   "
        };
        visualize_slot(out, prefix, Some(&core.arena[id]));
    }
    out.push_str("]\n");
}

pub(crate) fn visualize_param(out: &mut String, name: &str, value: usize) {
    use std::fmt::Write;
    let _ = write!(out, "{} = {}\n", name, value);
}

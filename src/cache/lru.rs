//! Least-recently-used eviction: a deque ordered most-recent-first.

use std::collections::VecDeque;

use super::{visualize_lru, CacheCore, Policy};

pub(crate) struct LruPolicy {
    q: VecDeque<usize>,
}

impl LruPolicy {
    pub fn new() -> LruPolicy {
        LruPolicy { q: VecDeque::new() }
    }
}

impl Policy for LruPolicy {
    fn clear(&mut self, _core: &CacheCore) {
        self.q.clear();
    }

    fn evict_one(&mut self, core: &mut CacheCore, id: usize) {
        match self.q.iter().position(|&x| x == id) {
            Some(pos) => {
                core.mark_evicted(id);
                core.forget_and_free(id);
                self.q.remove(pos);
            }
            None => error!("BUG! Item in map but not in cache"),
        }
    }

    fn evict_any(&mut self, core: &mut CacheCore) {
        let id = self.q.pop_back().expect("evict_any on an empty cache");
        core.mark_evicted(id);
        core.forget_and_free(id);
    }

    fn place(&mut self, _core: &mut CacheCore, id: usize) {
        self.q.push_front(id);
    }

    fn replace(&mut self, _core: &mut CacheCore, _id: usize) {}

    fn touch(&mut self, _core: &mut CacheCore, id: usize) {
        match self.q.iter().position(|&x| x == id) {
            Some(pos) => {
                self.q.remove(pos);
                self.q.push_front(id);
            }
            None => error!("BUG! Item in map but not in cache"),
        }
    }

    fn visualize(&self, core: &CacheCore, out: &mut String) {
        visualize_lru(out, "LRU", core, self.q.iter());
    }
}

//! CART eviction: Clock with Adaptive Replacement and Temporal filtering.
//!
//! Bansal & Modha, "CAR: Clock with Adaptive Replacement" (FAST '04),
//! figure 3, with the CART temporal-filtering extension.
//!
//! Live slots occupy one contiguous vector split into two clock regions:
//! T1 (`[0, split)`, recency) and T2 (`[split, max_items)`, frequency;
//! every T2 slot is long-term). Two FIFO ghost lists, B1 and B2, remember
//! keys recently evicted from T1 and T2. Scalar state: the two clock
//! hands, `p` (target T1 size), `q` (target B1 size), and the slot
//! counters `nn` (free), `ns` (short-term), `nl` (long-term), which always
//! sum to `max_items`.
//!
//! Region moves are in-place vector rotations so that clock order is
//! preserved across the T1/T2 boundary; cells hold arena keys, so a
//! rotation is a plain element shuffle.

use std::collections::VecDeque;

use super::{visualize_clock, visualize_lru, visualize_param, CacheCore, Policy};

pub(crate) struct CartPolicy {
    cells: Vec<Option<usize>>, // T1: [0..split); T2: [split..max_items)
    b1: VecDeque<usize>,
    b2: VecDeque<usize>,
    split: usize,
    t1hand: usize,
    t2hand: usize,
    p: usize,
    q: usize,
    nn: usize,
    ns: usize,
    nl: usize,
}

impl CartPolicy {
    pub fn new(max_items: usize) -> CartPolicy {
        CartPolicy {
            cells: vec![None; max_items],
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            split: max_items,
            t1hand: 0,
            t2hand: 0,
            p: 0,
            q: 0,
            nn: max_items,
            ns: 0,
            nl: 0,
        }
    }

    fn max_items(&self) -> usize {
        self.cells.len()
    }

    // T1 {{{

    fn t1_size(&self) -> usize {
        self.split - self.nn
    }

    fn t1_wrap(&mut self) {
        if self.split == 0 {
            self.t1hand = 0;
        } else {
            self.t1hand %= self.split;
        }
    }

    fn t1_advance(&mut self) {
        self.t1hand += 1;
        self.t1_wrap();
    }

    fn t1_regress(&mut self) {
        if self.t1hand == 0 {
            self.t1hand += self.split;
        }
        self.t1hand -= 1;
    }

    // }}}
    // T2 {{{

    fn t2_size(&self) -> usize {
        self.max_items() - self.split
    }

    fn t2_wrap(&mut self) {
        let n = self.max_items() - self.split;
        if n == 0 {
            self.t2hand = 0;
        } else {
            self.t2hand %= n;
        }
    }

    fn t2_advance(&mut self) {
        self.t2hand += 1;
        self.t2_wrap();
    }

    // }}}

    fn grow_p(&mut self) {
        let x = (self.ns / self.b1.len()).max(1);
        self.p = (self.p + x).min(self.max_items());
    }

    fn shrink_p(&mut self) {
        let x = (self.nl / self.b2.len()).max(1);
        if self.p > x {
            self.p -= x;
        } else {
            self.p = 0;
        }
    }

    fn grow_q(&mut self) {
        self.q = (self.q + 1).min(2 * self.max_items() - self.t1_size());
    }

    fn shrink_q(&mut self) {
        let x = self.max_items() - self.t1_size();
        if self.q > x + 1 {
            self.q -= 1;
        } else {
            self.q = x;
        }
    }

    /// Moves the T1 cell at `i` to the T1 tail (the cell just behind the
    /// hand), preserving clock order of everything else.
    fn move_t1_index_to_t1_tail(&mut self, i: usize) {
        debug_assert!(self.split > 0);
        debug_assert!(i < self.split);
        if i < self.t1hand {
            if i == self.t1hand - 1 {
                return;
            }
            let tmp = self.cells[i];
            for j in i..self.t1hand - 1 {
                self.cells[j] = self.cells[j + 1];
            }
            self.cells[self.t1hand - 1] = tmp;
        } else if self.t1hand == i {
            self.t1_advance();
        } else {
            if self.t1hand == 0 && i == self.split - 1 {
                return;
            }
            let tmp = self.cells[i];
            let mut j = i;
            while j > self.t1hand {
                self.cells[j] = self.cells[j - 1];
                j -= 1;
            }
            self.cells[self.t1hand] = tmp;
            self.t1_advance();
        }
    }

    /// Moves the T2 cell at `i` into the T1 tail, growing T1 by one slot.
    fn move_t2_index_to_t1_tail(&mut self, i: usize) {
        debug_assert!(self.split < self.max_items());
        debug_assert!(i >= self.split);
        debug_assert!(i < self.max_items());

        let p = if self.t1hand == 0 {
            self.split
        } else {
            let p = self.t1hand;
            self.t1hand += 1;
            p
        };
        if p != i {
            let tmp = self.cells[i];
            let mut j = i;
            while j > p {
                self.cells[j] = self.cells[j - 1];
                j -= 1;
            }
            self.cells[p] = tmp;
        }
        if self.t2hand > i - self.split {
            self.t2hand -= 1;
        }
        self.split += 1;
        self.t2_wrap();
    }

    /// Fills a free T1 cell with `id` and rotates it to the T1 tail.
    fn move_dead_to_t1_tail(&mut self, id: usize) {
        debug_assert!(self.nn > 0);

        let mut i = self.t1hand;
        while i > 0 {
            i -= 1;
            if self.cells[i].is_none() {
                self.cells[i] = Some(id);
                self.move_t1_index_to_t1_tail(i);
                return;
            }
        }

        let mut i = self.split;
        while i > self.t1hand {
            i -= 1;
            if self.cells[i].is_none() {
                self.cells[i] = Some(id);
                self.move_t1_index_to_t1_tail(i);
                return;
            }
        }

        error!("BUG! Found no free cell even though nn > 0");
    }

    fn move_t2_head_to_t1_tail(&mut self) {
        let i = self.split + self.t2hand;
        self.t2_advance();
        self.move_t2_index_to_t1_tail(i);
    }

    /// Moves the T1 head into the T2 tail, shrinking T1 by one slot.
    fn move_t1_head_to_t2_tail(&mut self) {
        let p = self.t1hand + 1;
        let q = self.split + self.t2hand;
        if p != q {
            let tmp = self.cells[self.t1hand];
            for j in p..q {
                self.cells[j - 1] = self.cells[j];
            }
            self.cells[q - 1] = tmp;
        }
        if self.split < self.max_items() {
            self.t2hand += 1;
        }
        self.split -= 1;
        self.t1_wrap();
    }

    /// Validates the full invariant set. Counter drift or map desync here
    /// is a code bug, so failure is fatal (debug builds only).
    fn check(&self, core: &CacheCore) {
        if !cfg!(debug_assertions) {
            return;
        }
        let maxi = self.max_items();
        assert_eq!(self.cells.len(), maxi);
        assert!(self.split <= maxi);
        if self.split > 0 {
            assert!(self.t1hand < self.split);
        } else {
            assert_eq!(self.t1hand, 0);
        }
        if self.split < maxi {
            assert!(self.t2hand < maxi - self.split);
        } else {
            assert_eq!(self.t2hand, 0);
        }
        assert!(self.p <= maxi);
        assert!(self.q <= 2 * maxi);
        assert!(self.nn <= self.split);
        assert!(self.ns + self.nl <= maxi);
        assert_eq!(self.nn + self.ns + self.nl, maxi);

        let tb1 = self.t1_size() + self.b1.len();
        let tb2 = self.t2_size() + self.b2.len();
        assert!(tb2 <= maxi);
        assert!(tb1 <= 2 * maxi);
        assert!(tb1 + tb2 <= 2 * maxi);

        let (mut nn, mut ns, mut nl) = (0, 0, 0);
        for (i, cell) in self.cells.iter().enumerate() {
            if i >= self.split {
                let id = (*cell).expect("T2 cell must be occupied");
                assert!(core.arena[id].longterm);
            }
            match cell {
                None => nn += 1,
                Some(id) => {
                    let item = &core.arena[*id];
                    assert!(!item.dead);
                    if item.longterm {
                        nl += 1;
                    } else {
                        ns += 1;
                    }
                }
            }
        }
        assert_eq!(nn, self.nn);
        assert_eq!(ns, self.ns);
        assert_eq!(nl, self.nl);

        for &id in &self.b1 {
            let item = &core.arena[id];
            assert!(item.dead);
            assert!(!item.used);
            assert!(!item.longterm);
        }
        for &id in &self.b2 {
            let item = &core.arena[id];
            assert!(item.dead);
            assert!(!item.used);
            assert!(item.longterm);
        }
    }
}

impl Policy for CartPolicy {
    fn clear(&mut self, _core: &CacheCore) {
        let maxi = self.max_items();
        for cell in self.cells.iter_mut() {
            *cell = None;
        }
        self.b1.clear();
        self.b2.clear();
        self.split = maxi;
        self.t1hand = 0;
        self.t2hand = 0;
        self.p = 0;
        self.q = 0;
        self.nn = maxi;
        self.ns = 0;
        self.nl = 0;
    }

    fn evict_one(&mut self, core: &mut CacheCore, id: usize) {
        self.check(core);

        if let Some(i) = self.cells.iter().position(|&c| c == Some(id)) {
            let longterm = core.arena[id].longterm;
            core.mark_evicted(id);
            core.forget_and_free(id);
            self.cells[i] = None;
            if longterm {
                self.nl -= 1;
            } else {
                self.ns -= 1;
            }
            self.nn += 1;
            if i >= self.split {
                self.move_t2_index_to_t1_tail(i);
            } else {
                self.move_t1_index_to_t1_tail(i);
            }
            // Back the hand up one, so that it points at the hole.
            self.t1_regress();
            self.check(core);
            debug_assert!(self.cells[self.t1hand].is_none());
            return;
        }

        if let Some(pos) = self.b1.iter().position(|&x| x == id) {
            core.forget_and_free(id);
            self.b1.remove(pos);
        } else if let Some(pos) = self.b2.iter().position(|&x| x == id) {
            core.forget_and_free(id);
            self.b2.remove(pos);
        } else {
            error!("BUG! Item in map but not in cache");
            return;
        }

        // Ghost removal rebalances by freeing one live slot. Only needed
        // (and only safe) when the live region is actually full.
        if self.nn == 0 {
            self.evict_any(core);
        }
        self.check(core);
    }

    fn evict_any(&mut self, core: &mut CacheCore) {
        self.check(core);

        // If the cache is not full, skip straight to victim selection.
        if self.nn == 0 {
            // Aging: recycle referenced T2 heads back through T1.
            while self.t2_size() > 0 {
                let id = self.cells[self.split + self.t2hand].unwrap();
                if !core.arena[id].used {
                    break;
                }
                core.arena[id].used = false;
                self.move_t2_head_to_t1_tail();
                // |T2| + |B2| + |T1| - ns >= c  <=>  |B2| >= ns + nn
                if self.b2.len() >= self.nn + self.ns {
                    self.grow_q();
                }
            }

            // Aging: sweep T1 until its head is unreferenced short-term.
            while self.t1_size() > 0 {
                let id = self.cells[self.t1hand].unwrap();
                if core.arena[id].used {
                    core.arena[id].used = false;
                    self.t1_advance();
                    let threshold = (self.p + 1).min(self.b1.len());
                    if !core.arena[id].longterm && self.t1_size() >= threshold {
                        core.arena[id].longterm = true;
                        self.nl += 1;
                        self.ns -= 1;
                    }
                } else if core.arena[id].longterm {
                    self.move_t1_head_to_t2_tail();
                    self.shrink_q();
                } else {
                    break;
                }
            }
        }

        // Victim selection. Byte-pressure evictions can arrive while free
        // cells remain; free cells are never victims, and the hand may be
        // resting on one, so sweep past them.
        if self.t1_size() >= self.p.max(1) || self.t2_size() == 0 {
            while self.cells[self.t1hand].is_none() {
                self.t1_advance();
            }
            let id = self.cells[self.t1hand].take().unwrap();
            core.mark_evicted(id);
            let longterm = core.arena[id].longterm;
            core.arena[id].used = false;
            core.arena[id].kill();
            if longterm {
                self.b2.push_front(id);
                self.nl -= 1;
            } else {
                self.b1.push_front(id);
                self.ns -= 1;
            }
            self.nn += 1;
        } else {
            let idx = self.split + self.t2hand;
            let id = self.cells[idx].take().unwrap();
            core.mark_evicted(id);
            core.arena[id].kill();
            self.b2.push_front(id);
            self.move_t2_head_to_t1_tail();
            self.nl -= 1;
            self.nn += 1;
            // Back the hand up one, so that it points at the hole.
            self.t1_regress();
        }

        // Ghost trimming.
        if self.nn == 1 && self.b1.len() + self.b2.len() > self.max_items() {
            let from_b1 = self.b1.len() > self.q || self.b2.is_empty();
            let id = if from_b1 {
                self.b1.pop_back().unwrap()
            } else {
                self.b2.pop_back().unwrap()
            };
            core.forget_and_free(id);
        }

        if self.t2_size() + self.b2.len() > self.max_items() {
            let id = self.b2.pop_back().unwrap();
            core.forget_and_free(id);
        }

        self.check(core);
        debug_assert!(self.cells[self.t1hand].is_none());
    }

    fn place(&mut self, core: &mut CacheCore, id: usize) {
        // Precondition: the key is in neither B1 nor B2, and a free cell
        // exists.
        self.check(core);
        debug_assert!(self.nn > 0);

        // The hand normally rests on the hole the last eviction opened;
        // after mixed byte-pressure evictions it may not, so seek the next
        // free cell.
        while self.cells[self.t1hand].is_some() {
            self.t1_advance();
        }
        debug_assert!(!core.arena[id].dead);
        debug_assert!(!core.arena[id].used);
        debug_assert!(!core.arena[id].longterm);
        self.cells[self.t1hand] = Some(id);
        self.nn -= 1;
        self.ns += 1;
        self.t1_advance();

        self.check(core);
    }

    fn replace(&mut self, core: &mut CacheCore, id: usize) {
        // Precondition: the key is in B1 or B2.
        self.check(core);

        if core.arena[id].longterm {
            // A recent long-term evictee returned: T1 was too large.
            if let Some(pos) = self.b2.iter().position(|&x| x == id) {
                self.shrink_p();
                core.arena[id].dead = false;
                self.b2.remove(pos);
                self.move_dead_to_t1_tail(id);
                self.nl += 1;
                self.nn -= 1;
                // |T2| + |B2| + |T1| - ns >= c  <=>  |B2| >= ns + nn
                if self.b2.len() >= self.nn + self.ns {
                    self.grow_q();
                }
                self.check(core);
                return;
            }
        } else {
            // A recent short-term evictee returned: T1 was too small, and
            // the key has proven itself worth keeping long-term.
            if let Some(pos) = self.b1.iter().position(|&x| x == id) {
                self.grow_p();
                core.arena[id].dead = false;
                core.arena[id].longterm = true;
                self.b1.remove(pos);
                self.move_dead_to_t1_tail(id);
                self.nl += 1;
                self.nn -= 1;
                self.check(core);
                return;
            }
        }
        error!("BUG! Item in map but not in cache history");
    }

    fn touch(&mut self, core: &mut CacheCore, id: usize) {
        core.arena[id].used = true;
    }

    fn visualize(&self, core: &CacheCore, out: &mut String) {
        visualize_clock(out, "T1", core, &self.cells[..self.split], self.t1hand);
        visualize_clock(out, "T2", core, &self.cells[self.split..], self.t2hand);
        visualize_lru(out, "B1", core, self.b1.iter());
        visualize_lru(out, "B2", core, self.b2.iter());
        visualize_param(out, "p", self.p);
        visualize_param(out, "q", self.q);
        visualize_param(out, "nn", self.nn);
        visualize_param(out, "ns", self.ns);
        visualize_param(out, "nl", self.nl);
    }
}

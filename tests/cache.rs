use hive_io::cache::{new_cache, CacheOptions, CachePtr, CacheType};
use hive_io::io;
use hive_io::manager::{new_manager, ManagerOptions};
use hive_io::options::Options;
use hive_io::status::Code;

fn test_opts() -> Options {
    let m = new_manager(&ManagerOptions::async_mode()).unwrap();
    let mut opts = Options::new();
    opts.get_mut::<io::Options>().manager = Some(m);
    opts
}

/// A tiny drill harness: `get` falls back to `<miss>`, `check` re-puts on
/// a miss and verifies the value on a hit.
struct Drill {
    cache: CachePtr,
    opts: Options,
    hits: usize,
    misses: usize,
}

impl Drill {
    fn new(cache: CachePtr, opts: Options) -> Drill {
        Drill {
            cache,
            opts,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &str) -> String {
        match self.cache.get_sync(key.as_bytes(), &self.opts) {
            Ok(value) => {
                self.hits += 1;
                String::from_utf8(value).unwrap()
            }
            Err(err) => {
                self.misses += 1;
                assert_eq!(err.code(), Code::NotFound, "key {:?}: {}", key, err);
                "<miss>".to_string()
            }
        }
    }

    fn put(&mut self, key: &str, value: &str) {
        let r = self
            .cache
            .put_sync(key.as_bytes(), value.as_bytes(), &self.opts);
        assert!(r.is_ok(), "put {:?}: {}", key, r);
    }

    fn check(&mut self, key: &str, value: &str) -> bool {
        let got = self.get(key);
        if got == "<miss>" {
            self.put(key, value);
            false
        } else {
            assert_eq!(got, value);
            true
        }
    }

    fn num_items(&self) -> usize {
        self.cache.stats_sync(&self.opts).unwrap().num_items
    }

    fn clear(&mut self) {
        assert!(self.cache.clear_sync(&self.opts).is_ok());
        assert_eq!(self.num_items(), 0);
    }

    fn basics(&mut self) {
        assert_eq!(self.get("a"), "<miss>");
        assert_eq!(self.num_items(), 0);

        self.put("a", "aaaa");
        assert_eq!(self.get("b"), "<miss>");
        assert_eq!(self.num_items(), 1);

        self.put("b", "bbbb");
        assert_eq!(self.get("c"), "<miss>");
        assert_eq!(self.num_items(), 2);

        self.put("c", "cccc");
        assert_eq!(self.get("d"), "<miss>");
        assert_eq!(self.num_items(), 3);

        self.put("d", "dddd");
        assert_eq!(self.get("e"), "<miss>");
        assert_eq!(self.num_items(), 4);

        self.put("e", "eeee");
        assert_eq!(self.num_items(), 4);

        self.check("a", "aaaa");
        self.check("b", "bbbb");
        self.check("c", "cccc");
        self.check("d", "dddd");
        self.check("e", "eeee");
        self.check("f", "ffff");
        self.check("g", "gggg");
        self.check("h", "hhhh");
        assert!(self.num_items() <= 4);

        self.clear();
    }

    fn removal(&mut self) {
        assert_eq!(self.get("a"), "<miss>");
        self.put("a", "aaaa");
        assert_eq!(self.get("a"), "aaaa");
        assert!(self.cache.remove_sync(b"a", &self.opts).is_ok());
        assert_eq!(self.get("a"), "<miss>");

        self.check("a", "aaaa");
        self.check("b", "bbbb");
        self.check("c", "cccc");
        self.check("d", "dddd");
        self.cache.remove_sync(b"c", &self.opts).is_ok();
        self.check("e", "eeee");
        assert!(self.num_items() <= 4);

        self.clear();
    }
}

fn drill(kind: CacheType) {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(kind, 4));
    let mut drill = Drill::new(cache, opts);
    drill.basics();
    drill.removal();
    // Every drill mixes hits and misses; a policy that served neither is
    // broken.
    assert!(drill.hits > 0);
    assert!(drill.misses > 0);
}

#[test]
fn clock_end_to_end() {
    drill(CacheType::Clock);
}

#[test]
fn lru_end_to_end() {
    drill(CacheType::Lru);
}

#[test]
fn cart_end_to_end() {
    drill(CacheType::Cart);
}

#[test]
fn best_available_is_cart_shaped() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::BestAvailable, 4));
    cache.put_sync(b"k", b"v", &opts).expect_ok();
    let dump = cache.visualize_sync(&opts).unwrap();
    assert!(dump.contains("T1 = "));
    assert!(dump.contains("B2 = "));
}

#[test]
fn clock_evicts_oldest_unused() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::Clock, 4));

    for key in [b"a", b"b", b"c", b"d", b"e"] {
        assert!(cache.put_sync(key, b"....", &opts).is_ok());
    }
    // Five puts into four slots: the first key fell out.
    assert_eq!(
        cache.get_sync(b"a", &opts).unwrap_err().code(),
        Code::NotFound
    );

    // Touch d, then insert: the victim is the oldest unused, which is b.
    assert!(cache.get_sync(b"d", &opts).is_ok());
    assert!(cache.put_sync(b"f", b"....", &opts).is_ok());
    assert_eq!(
        cache.get_sync(b"b", &opts).unwrap_err().code(),
        Code::NotFound
    );
    assert!(cache.get_sync(b"c", &opts).is_ok());
    assert!(cache.get_sync(b"d", &opts).is_ok());
    assert!(cache.get_sync(b"e", &opts).is_ok());
    assert!(cache.get_sync(b"f", &opts).is_ok());
}

#[test]
fn lru_evicts_least_recent() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::Lru, 3));

    assert!(cache.put_sync(b"a", b"1", &opts).is_ok());
    assert!(cache.put_sync(b"b", b"2", &opts).is_ok());
    assert!(cache.put_sync(b"c", b"3", &opts).is_ok());

    // Refresh a; b is now the least recent.
    assert!(cache.get_sync(b"a", &opts).is_ok());
    assert!(cache.put_sync(b"d", b"4", &opts).is_ok());

    assert_eq!(
        cache.get_sync(b"b", &opts).unwrap_err().code(),
        Code::NotFound
    );
    assert!(cache.get_sync(b"a", &opts).is_ok());
    assert!(cache.get_sync(b"c", &opts).is_ok());
    assert!(cache.get_sync(b"d", &opts).is_ok());
}

#[test]
fn cart_ghost_resurrection_adapts() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::Cart, 4));

    for key in [b"a", b"b", b"c", b"d"] {
        assert!(cache.put_sync(key, b"....", &opts).is_ok());
    }
    // Reference a so the next eviction passes over it.
    assert!(cache.get_sync(b"a", &opts).is_ok());

    // The insert of e evicts b into the B1 ghost history.
    assert!(cache.put_sync(b"e", b"....", &opts).is_ok());
    assert_eq!(
        cache.get_sync(b"b", &opts).unwrap_err().code(),
        Code::NotFound
    );

    // Re-putting b is a B1 ghost hit: the recency target grows and b
    // comes back long-term.
    assert!(cache.put_sync(b"b", b"....", &opts).is_ok());
    assert!(cache.get_sync(b"b", &opts).is_ok());
    assert!(cache.get_sync(b"a", &opts).is_ok());

    let stats = cache.stats_sync(&opts).unwrap();
    assert!(stats.num_items <= 4);

    let dump = cache.visualize_sync(&opts).unwrap();
    assert!(dump.contains("p = 1"), "dump:\n{}", dump);
    assert!(dump.contains("\"b\" = ... (4 bytes) [L]"), "dump:\n{}", dump);
}

#[test]
fn byte_bound_evicts_and_oversize_rejects() {
    let opts = test_opts();
    let mut co = CacheOptions::new(CacheType::Cart, 64);
    // Room for roughly two entries once overhead is counted.
    co.max_bytes = 2 * (std::mem::size_of::<usize>() * 16 + 1 + 64);
    let cache = new_cache(&co);

    let r = cache.put_sync(b"huge", &vec![0u8; 1 << 20], &opts);
    assert_eq!(r.code(), Code::OutOfRange);

    for key in [&b"a"[..], &b"b"[..], &b"c"[..], &b"d"[..]] {
        assert!(cache.put_sync(key, &vec![1u8; 64], &opts).is_ok());
        let stats = cache.stats_sync(&opts).unwrap();
        assert!(stats.num_bytes <= co.max_bytes);
        assert!(stats.num_items <= co.max_items);
    }
}

#[test]
fn stats_track_puts_and_removes() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::Lru, 8));

    assert_eq!(cache.stats_sync(&opts).unwrap().num_items, 0);
    assert!(cache.put_sync(b"x", b"123", &opts).is_ok());
    let s1 = cache.stats_sync(&opts).unwrap();
    assert_eq!(s1.num_items, 1);
    assert!(s1.num_bytes > 3);

    // Overwriting replaces the byte count, not the item count.
    assert!(cache.put_sync(b"x", b"12345", &opts).is_ok());
    let s2 = cache.stats_sync(&opts).unwrap();
    assert_eq!(s2.num_items, 1);
    assert_eq!(s2.num_bytes, s1.num_bytes + 2);

    assert!(cache.remove_sync(b"x", &opts).is_ok());
    let s3 = cache.stats_sync(&opts).unwrap();
    assert_eq!(s3.num_items, 0);
    assert_eq!(s3.num_bytes, 0);

    assert_eq!(
        cache.remove_sync(b"x", &opts).code(),
        Code::NotFound
    );
}

#[test]
fn cart_random_workload_keeps_invariants() {
    let opts = test_opts();
    let cache = new_cache(&CacheOptions::new(CacheType::Cart, 8));

    // A deterministic LCG workload; the policy validates its own
    // structure after every operation in debug builds.
    let mut x: u64 = 0x2545F4914F6CDD1D;
    for i in 0..5000u64 {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let key = format!("k{}", x % 24);
        match x % 7 {
            0 | 1 | 2 => {
                let _ = cache.get_sync(key.as_bytes(), &opts);
            }
            3 | 4 | 5 => {
                let value = format!("v{}", i);
                assert!(cache.put_sync(key.as_bytes(), value.as_bytes(), &opts).is_ok());
            }
            _ => {
                let _ = cache.remove_sync(key.as_bytes(), &opts);
            }
        }
        let stats = cache.stats_sync(&opts).unwrap();
        assert!(stats.num_items <= 8);
    }
}

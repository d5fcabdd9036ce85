//! A type-indexed container for passing around options.
//!
//! [`Options`] holds at most one instance per option type. Components pull
//! the option structs they understand out of the bag (constructing defaults
//! when absent), so a single bag can be threaded through every asynchronous
//! call without each layer knowing the full set of knobs.
//!
//! # Examples
//!
//! ```
//! use hive_io::options::Options;
//!
//! #[derive(Clone, Default, PartialEq, Debug)]
//! struct Verbosity(u32);
//!
//! let mut opts = Options::new();
//! opts.set(Verbosity(3));
//!
//! let copied = opts.clone();
//! assert_eq!(copied.get::<Verbosity>(), Verbosity(3));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

trait OptEntry: Any + Send + Sync {
    fn clone_entry(&self) -> Box<dyn OptEntry>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + Send + Sync> OptEntry for T {
    fn clone_entry(&self) -> Box<dyn OptEntry> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A heterogeneous map from option type to value, deep-copied on clone.
#[derive(Default)]
pub struct Options {
    map: HashMap<TypeId, Box<dyn OptEntry>>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Returns the stored `T`, or `T::default()` if the bag has none.
    pub fn get<T>(&self) -> T
    where
        T: Any + Clone + Default + Send + Sync,
    {
        match self.map.get(&TypeId::of::<T>()) {
            Some(entry) => {
                let entry: &dyn OptEntry = &**entry;
                entry
                    .as_any()
                    .downcast_ref::<T>()
                    .expect("options map holds mistyped entry")
                    .clone()
            }
            None => T::default(),
        }
    }

    /// Returns a mutable reference to the stored `T`, materializing the
    /// default first if the bag has none.
    pub fn get_mut<T>(&mut self) -> &mut T
    where
        T: Any + Clone + Default + Send + Sync,
    {
        let entry: &mut dyn OptEntry = &mut **self
            .map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        entry
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("options map holds mistyped entry")
    }

    /// Stores `value`, replacing any previous `T`.
    pub fn set<T>(&mut self, value: T)
    where
        T: Any + Clone + Default + Send + Sync,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Builder-style [`set`](Options::set).
    pub fn with<T>(mut self, value: T) -> Options
    where
        T: Any + Clone + Default + Send + Sync,
    {
        self.set(value);
        self
    }
}

impl Clone for Options {
    fn clone(&self) -> Options {
        let map = self
            .map
            .iter()
            .map(|(k, v)| {
                let v: &dyn OptEntry = &**v;
                (*k, v.clone_entry())
            })
            .collect();
        Options { map }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Options({} entries)", self.map.len())
    }
}

static DEFAULT: Mutex<Option<Options>> = Mutex::new(None);

/// Returns a copy of the process-wide default options. Thread-safe.
pub fn default_options() -> Options {
    let guard = DEFAULT.lock().unwrap();
    match &*guard {
        Some(opts) => opts.clone(),
        None => Options::new(),
    }
}

/// Replaces the process-wide default options. Thread-safe, but callers are
/// expected to do this during startup, before options-consuming work is in
/// flight.
pub fn set_default_options(opts: Options) {
    *DEFAULT.lock().unwrap() = Some(opts);
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Default, PartialEq, Debug)]
    struct Alpha(u32);

    #[derive(Clone, Default, PartialEq, Debug)]
    struct Beta(String);

    #[test]
    fn absent_yields_default() {
        let opts = Options::new();
        assert_eq!(opts.get::<Alpha>(), Alpha(0));
    }

    #[test]
    fn distinct_types_coexist() {
        let mut opts = Options::new();
        opts.set(Alpha(7));
        opts.set(Beta("hum".into()));
        assert_eq!(opts.get::<Alpha>(), Alpha(7));
        assert_eq!(opts.get::<Beta>(), Beta("hum".into()));
    }

    #[test]
    fn clone_is_deep() {
        let mut opts = Options::new();
        opts.set(Alpha(1));
        let copied = opts.clone();
        opts.get_mut::<Alpha>().0 = 2;
        assert_eq!(copied.get::<Alpha>(), Alpha(1));
        assert_eq!(opts.get::<Alpha>(), Alpha(2));
    }

    #[test]
    fn get_mut_materializes() {
        let mut opts = Options::new();
        opts.get_mut::<Alpha>().0 = 9;
        assert_eq!(opts.get::<Alpha>(), Alpha(9));
    }
}

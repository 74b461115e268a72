use foldhash::HashMap;
use parking_lot::RwLock;
use std::hash::Hash;

/// A map caching answers that are fixed for the lifetime of a physical device, such as the
/// external handle properties.
///
/// Entries are written once and never change afterwards, so readers only contend with the
/// single write of a vacant entry.
#[derive(Debug)]
pub(crate) struct OnceCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for OnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OnceCache<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    /// Returns the value for `key`, computing it with `f` if the entry is vacant. An error from
    /// `f` is propagated and leaves the entry vacant.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: K,
        f: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let value = f(&key)?;

        Ok(self
            .inner
            .write()
            .entry(key)
            .or_insert(value)
            .clone())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::OnceCache;
    use std::cell::Cell;

    #[test]
    fn computes_once() {
        let cache = OnceCache::<u32, u64>::new();
        let calls = Cell::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert(7, |&key| {
                    calls.set(calls.get() + 1);
                    Ok::<_, ()>(u64::from(key) * 2)
                })
                .unwrap();
            assert_eq!(value, 14);
        }

        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn error_leaves_entry_vacant() {
        let cache = OnceCache::<u32, u64>::new();

        assert!(cache.get_or_try_insert(1, |_| Err("nope")).is_err());
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get_or_try_insert(1, |_| Ok::<_, ()>(5)), Ok(5));
    }
}

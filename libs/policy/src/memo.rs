//! Generational memoization of expensive rule-file compilations.
//!
//! Regexes and IP-range sets are memoized across reloads of the rules file.
//! Each successful load ends a generation via [`Memos::age`]; entries not
//! used for a full generation are evicted. A failed load calls
//! [`Memos::discard`], which throws the whole store away.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use doorman_netblock::IpRanges;
use regex::Regex;

use crate::matchers::BadArg;

#[derive(Debug)]
pub struct Memo<K, V> {
    generation: u64,
    entries: HashMap<K, (u64, Arc<V>)>,
}

impl<K: Eq + Hash, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V> Memo<K, V> {
    pub fn compile_with<E>(
        &mut self,
        key: &K,
        generate: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some((generation, value)) = self.entries.get_mut(key) {
            *generation = self.generation;
            return Ok(value.clone());
        }

        let value = Arc::new(generate(key)?);
        self.entries
            .insert(key.clone(), (self.generation, value.clone()));

        Ok(value)
    }

    fn age(&mut self) {
        self.generation += 1;
        let cutoff = self.generation;
        self.entries.retain(|_, (generation, _)| *generation + 1 >= cutoff);
    }

    fn discard(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The memo stores threaded through rule-file parsing.
#[derive(Debug, Default)]
pub struct Memos {
    pub regexes: Memo<String, Regex>,
    pub ranges: Memo<Vec<String>, IpRanges>,
}

impl Memos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile_regex(&mut self, pattern: &str) -> Result<Arc<Regex>, BadArg> {
        self.regexes.compile_with(&pattern.to_owned(), |p| {
            regex::RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| BadArg::BadRegex(p.clone(), e.to_string()))
        })
    }

    /// Compiles a list of address fragments into one [`IpRanges`] set.
    /// Prefix fragments (trailing dot) become equivalent CIDR netblocks.
    pub fn compile_ranges(&mut self, parts: &Vec<String>) -> Result<Arc<IpRanges>, BadArg> {
        self.ranges.compile_with(parts, |parts| {
            let mut ranges = IpRanges::new();
            for part in parts {
                let cidr;
                let spec = if let Some(prefix) = part.strip_suffix('.') {
                    cidr = format!("{}/{}", prefix, 8 * part.matches('.').count());
                    &cidr
                } else {
                    part
                };
                ranges
                    .add(spec)
                    .map_err(|e| BadArg::BadNetblock(part.clone(), e.to_string()))?;
            }

            Ok(ranges)
        })
    }

    /// Called after a rules file loads successfully.
    pub fn age(&mut self) {
        self.regexes.age();
        self.ranges.age();
    }

    /// Called when a rules file fails to load; on errors everything is dead.
    pub fn discard(&mut self) {
        self.regexes.discard();
        self.ranges.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memoized_regexes_are_shared() {
        let mut memos = Memos::new();
        let a = memos.compile_regex("foo.*bar").unwrap();
        let b = memos.compile_regex("foo.*bar").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn bad_regexes_error() {
        let mut memos = Memos::new();

        assert!(matches!(
            memos.compile_regex("foo("),
            Err(BadArg::BadRegex(..))
        ));
    }

    #[test]
    fn entries_survive_one_generation_without_use() {
        let mut memos = Memos::new();
        memos.compile_regex("one").unwrap();
        memos.age();

        // Not used this generation, but still resident from the last one.
        assert_eq!(memos.regexes.len(), 1);
        memos.age();
        assert_eq!(memos.regexes.len(), 0);
    }

    #[test]
    fn use_refreshes_an_entry() {
        let mut memos = Memos::new();
        let first = memos.compile_regex("one").unwrap();
        memos.age();
        let second = memos.compile_regex("one").unwrap();
        memos.age();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memos.regexes.len(), 1);
    }

    #[test]
    fn discard_empties_the_store() {
        let mut memos = Memos::new();
        let first = memos.compile_regex("one").unwrap();
        memos.discard();
        let second = memos.compile_regex("one").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn prefix_fragments_become_cidrs() {
        let mut memos = Memos::new();
        let ranges = memos
            .compile_ranges(&vec!["127.10.".to_owned(), "10.0.0.1".to_owned()])
            .unwrap();

        assert!(ranges.contains_addr("127.10.3.4".parse().unwrap()));
        assert!(!ranges.contains_addr("127.11.0.0".parse().unwrap()));
        assert!(ranges.contains_addr("10.0.0.1".parse().unwrap()));
    }
}

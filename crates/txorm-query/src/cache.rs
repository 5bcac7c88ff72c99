//! Statement caching for compiled SQL.
//!
//! Caches compiled statements keyed by the value-free [`SqlAst`] so repeated
//! saves of the same shape skip the compiler.

use std::collections::HashMap;

use txorm_core::Result;

use crate::ast::SqlAst;
use crate::compiler::CompiledSql;

/// A cached compiled SQL statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    /// The compiled statement.
    pub compiled: CompiledSql,
    /// Logical access time, larger is more recent.
    pub last_used: u64,
    /// Number of times this statement has been reused.
    pub hit_count: u64,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU-style cache for compiled SQL statements.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
///
/// # Example
///
/// ```
/// use txorm_query::{GenericCompiler, SqlAst, SqlCompiler, StatementCache};
///
/// let compiler = GenericCompiler::default();
/// let mut cache = StatementCache::new(100);
/// let ast = SqlAst::select_by("person", vec!["name".into()], &["id".into()]);
///
/// let first = cache.get_or_compile(&ast, |ast| compiler.compile(ast)).unwrap();
/// let second = cache.get_or_compile(&ast, |_| unreachable!()).unwrap();
/// assert_eq!(first, second);
/// assert_eq!(cache.stats().hits, 1);
/// ```
#[derive(Debug)]
pub struct StatementCache {
    cache: HashMap<SqlAst, CachedStatement>,
    max_size: usize,
    clock: u64,
    stats: CacheStats,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Get a cached statement or compile and insert it.
    ///
    /// The `compile` closure is only called on cache miss; a failed compile
    /// leaves the cache untouched.
    pub fn get_or_compile(
        &mut self,
        ast: &SqlAst,
        compile: impl FnOnce(&SqlAst) -> Result<CompiledSql>,
    ) -> Result<CompiledSql> {
        self.clock += 1;
        if let Some(entry) = self.cache.get_mut(ast) {
            entry.last_used = self.clock;
            entry.hit_count += 1;
            self.stats.hits += 1;
            return Ok(entry.compiled.clone());
        }

        let compiled = compile(ast)?;
        self.stats.misses += 1;
        if self.max_size == 0 {
            return Ok(compiled);
        }
        if self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            ast.clone(),
            CachedStatement {
                compiled: compiled.clone(),
                last_used: self.clock,
                hit_count: 0,
            },
        );
        Ok(compiled)
    }

    /// Check if a statement is cached.
    pub fn contains(&self, ast: &SqlAst) -> bool {
        self.cache.contains_key(ast)
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Clear all cached statements.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        let lru = self
            .cache
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(ast, _)| ast.clone());
        if let Some(ast) = lru {
            self.cache.remove(&ast);
            self.stats.evictions += 1;
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Criterion;
    use crate::compiler::{GenericCompiler, SqlCompiler};
    use txorm_core::Error;

    fn select(table: &str) -> SqlAst {
        SqlAst::select_by(table, vec!["id".into()], &["id".into()])
    }

    fn compile(ast: &SqlAst) -> Result<CompiledSql> {
        GenericCompiler::default().compile(ast)
    }

    #[test]
    fn test_cache_hit() {
        let mut cache = StatementCache::new(10);
        let first = cache.get_or_compile(&select("a"), compile).unwrap();

        let called = std::cell::Cell::new(false);
        let second = cache
            .get_or_compile(&select("a"), |ast| {
                called.set(true);
                compile(ast)
            })
            .unwrap();
        assert_eq!(first, second);
        assert!(!called.get());
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, evictions: 0 });
    }

    #[test]
    fn test_shape_not_values_is_the_key() {
        let mut cache = StatementCache::new(10);
        let a = SqlAst::update("t", vec!["x".into()], vec![Criterion::Eq("id".into())]);
        let b = SqlAst::update("t", vec!["x".into()], vec![Criterion::IsNull("id".into())]);
        cache.get_or_compile(&a, compile).unwrap();
        cache.get_or_compile(&b, compile).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction() {
        let mut cache = StatementCache::new(2);
        cache.get_or_compile(&select("a"), compile).unwrap();
        cache.get_or_compile(&select("b"), compile).unwrap();
        cache.get_or_compile(&select("c"), compile).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&select("a")));
        assert!(cache.contains(&select("b")));
        assert!(cache.contains(&select("c")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_ordering() {
        let mut cache = StatementCache::new(2);
        cache.get_or_compile(&select("a"), compile).unwrap();
        cache.get_or_compile(&select("b"), compile).unwrap();
        // touch "a" so "b" becomes least recently used
        cache.get_or_compile(&select("a"), compile).unwrap();
        cache.get_or_compile(&select("c"), compile).unwrap();

        assert!(cache.contains(&select("a")));
        assert!(!cache.contains(&select("b")));
        assert!(cache.contains(&select("c")));
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let mut cache = StatementCache::new(4);
        let result = cache.get_or_compile(&select("a"), |_| Err(Error::Custom("boom".into())));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let mut cache = StatementCache::new(0);
        cache.get_or_compile(&select("a"), compile).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = StatementCache::new(10);
        cache.get_or_compile(&select("a"), compile).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}

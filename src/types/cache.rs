//! Lazy, memoized type descriptor cache.
//!
//! Descriptors are resolved from the host catalog on first use and shared
//! by `Rc` afterwards. There is no eviction: catalog types do not change
//! underneath a running engine.

use super::{CatalogType, Oid, RowDescriptor, TypeClass, TypeDescriptor, TypeKind};
use crate::host::TypeCatalog;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Statistics for cache monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// Memoizes [`TypeDescriptor`]s by type identifier.
///
/// # Example
///
/// ```rust
/// use pllua::host::MemoryHost;
/// use pllua::types::{oid, TypeCache};
///
/// let host = MemoryHost::new();
/// let cache = TypeCache::new();
/// let first = cache.get(&host, oid::INT4).unwrap();
/// let second = cache.get(&host, oid::INT4).unwrap();
/// assert!(std::rc::Rc::ptr_eq(&first, &second));
/// ```
#[derive(Debug, Default)]
pub struct TypeCache {
    entries: RefCell<HashMap<Oid, Rc<TypeDescriptor>>>,
    stats: RefCell<CacheStats>,
}

impl TypeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the descriptor for `type_oid`, resolving it on first use.
    ///
    /// Fails with a conversion error when the catalog does not know the type.
    pub fn get<C: TypeCatalog + ?Sized>(&self, catalog: &C, type_oid: Oid) -> Result<Rc<TypeDescriptor>> {
        self.stats.borrow_mut().lookups += 1;

        if let Some(desc) = self.entries.borrow().get(&type_oid) {
            self.stats.borrow_mut().hits += 1;
            return Ok(Rc::clone(desc));
        }
        self.stats.borrow_mut().misses += 1;

        let entry = catalog
            .lookup_type(type_oid)?
            .ok_or_else(|| Error::conversion(format!("cache lookup failed for type {}", type_oid)))?;
        let desc = Rc::new(resolve(entry)?);

        log::debug!("type cache: resolved {} ({})", desc.name, type_oid);
        self.entries.borrow_mut().insert(type_oid, Rc::clone(&desc));
        self.stats.borrow_mut().insertions += 1;
        Ok(desc)
    }

    /// Follows domains down to the underlying type, accumulating the
    /// innermost type modifier.
    pub fn resolve_domain<C: TypeCatalog + ?Sized>(
        &self,
        catalog: &C,
        type_oid: Oid,
        type_mod: i32,
    ) -> Result<(Rc<TypeDescriptor>, i32)> {
        let mut desc = self.get(catalog, type_oid)?;
        let mut type_mod = type_mod;
        let mut hops = 0;
        while let TypeKind::Domain { base, type_mod: base_mod } = desc.kind {
            hops += 1;
            if hops > 32 {
                return Err(Error::conversion(format!("domain chain too deep for type {}", type_oid)));
            }
            if base_mod != -1 {
                type_mod = base_mod;
            }
            desc = self.get(catalog, base)?;
        }
        Ok((desc, type_mod))
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.borrow().clone()
    }
}

fn resolve(entry: CatalogType) -> Result<TypeDescriptor> {
    let kind = match entry.class {
        TypeClass::Base => match entry.element {
            Some(element) if entry.len == -1 => TypeKind::Array { element },
            _ => TypeKind::Base,
        },
        TypeClass::Domain => {
            let base = entry.base.ok_or_else(|| {
                Error::conversion(format!("domain '{}' has no underlying type", entry.name))
            })?;
            TypeKind::Domain { base, type_mod: entry.base_type_mod }
        }
        TypeClass::Enum => TypeKind::Enum { labels: entry.labels },
        TypeClass::Composite => {
            TypeKind::Composite(Rc::new(RowDescriptor::new(entry.oid, entry.attributes)))
        }
        TypeClass::Pseudo => TypeKind::Pseudo,
    };

    Ok(TypeDescriptor {
        oid: entry.oid,
        name: entry.name,
        kind,
        len: entry.len,
        by_value: entry.by_value,
        align: entry.align,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::types::{oid, Attribute};

    #[test]
    fn test_cache_memoizes() {
        let host = MemoryHost::new();
        let cache = TypeCache::new();

        let a = cache.get(&host, oid::TEXT).unwrap();
        let b = cache.get(&host, oid::TEXT).unwrap();
        assert!(Rc::ptr_eq(&a, &b));

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_unknown_type_is_conversion_error() {
        let host = MemoryHost::new();
        let cache = TypeCache::new();
        let err = cache.get(&host, 999_999).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_kinds_resolved() {
        let host = MemoryHost::new();
        let mood = host.define_enum("mood", &["sad", "ok", "happy"]);
        let pair = host.define_composite(
            "pair",
            vec![Attribute::new("a", oid::INT4), Attribute::new("b", oid::TEXT)],
        );
        let cache = TypeCache::new();

        assert!(matches!(cache.get(&host, oid::INT4_ARRAY).unwrap().kind, TypeKind::Array { element } if element == oid::INT4));
        assert!(matches!(&cache.get(&host, mood).unwrap().kind, TypeKind::Enum { labels } if labels.len() == 3));
        match &cache.get(&host, pair).unwrap().kind {
            TypeKind::Composite(row) => assert_eq!(row.position("b"), Some(1)),
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(cache.get(&host, oid::VOID).unwrap().kind, TypeKind::Pseudo);
    }

    #[test]
    fn test_domain_resolution() {
        let host = MemoryHost::new();
        let short_name = host.define_domain("short_name", oid::VARCHAR, 14);
        let cache = TypeCache::new();

        let (desc, type_mod) = cache.resolve_domain(&host, short_name, -1).unwrap();
        assert_eq!(desc.oid, oid::VARCHAR);
        assert_eq!(type_mod, 14);
    }
}

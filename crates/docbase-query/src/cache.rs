//! Template cache (§4.2 "Template cache"): caches compiled SQL text keyed
//! on filter/option *shape*, FIFO-evicted at a configurable capacity.

use std::collections::{HashMap, VecDeque};

/// One cached compilation result: the `WHERE` and `ORDER BY` SQL text for
/// a given filter/option shape. Parameter values are never cached — they
/// are re-extracted from the live filter on every lookup.
#[derive(Debug, Clone)]
pub struct Template {
    pub where_sql: String,
    pub order_by_sql: Option<String>,
}

/// Default cache capacity per collection, per §4.2.
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// A FIFO-evicted cache from shape key to compiled [`Template`].
#[derive(Debug)]
pub struct TemplateCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Template>,
}

impl TemplateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Template> {
        let hit = self.entries.get(key);
        if hit.is_some() {
            tracing::debug!(key, "query template cache hit");
        } else {
            tracing::debug!(key, "query template cache miss");
        }
        hit
    }

    pub fn insert(&mut self, key: String, template: Template) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, template);
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, template);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(tag: &str) -> Template {
        Template {
            where_sql: format!("where-{tag}"),
            order_by_sql: None,
        }
    }

    #[test]
    fn evicts_oldest_entry_when_full() {
        let mut cache = TemplateCache::new(2);
        cache.insert("a".into(), template("a"));
        cache.insert("b".into(), template("b"));
        cache.insert("c".into(), template("c"));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinserting_same_key_does_not_evict() {
        let mut cache = TemplateCache::new(2);
        cache.insert("a".into(), template("a"));
        cache.insert("b".into(), template("b"));
        cache.insert("a".into(), template("a2"));

        assert_eq!(cache.get("a").unwrap().where_sql, "where-a2");
        assert_eq!(cache.len(), 2);
    }
}

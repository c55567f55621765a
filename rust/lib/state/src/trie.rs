use std::collections::HashMap;
use std::sync::RwLock;

use crate::path::{MULTI_WILDCARD, SEPARATOR, SINGLE_WILDCARD};

/// Thread-safe segment trie routing dot paths to subscriber entries.
///
/// Patterns are inserted once; each delivered change walks the trie with the
/// concrete path and collects every entry whose pattern matches, so wildcard
/// resolution costs one walk per change rather than one comparison per
/// registered pattern.
///
/// ```ignore
/// let trie = Trie::new();
/// trie.insert("ui.isLoading", 1);
/// trie.insert("ui.*", 2);
/// trie.insert("ui.**", 3);
///
/// assert_eq!(trie.match_path("ui.isLoading"), vec![1, 2, 3]);
/// ```
pub struct Trie<T> {
    root: RwLock<Node<T>>,
}

struct Node<T> {
    children: HashMap<String, Node<T>>,
    /// `*` child.
    any: Option<Box<Node<T>>>,
    /// Entries registered with a trailing `**` at this depth.
    rest: Vec<T>,
    /// Entries whose pattern ends exactly here.
    values: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            any: None,
            rest: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T: Clone> Trie<T> {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::default()),
        }
    }

    /// Register `value` under `pattern`. The pattern must already be valid
    /// (see [`crate::path::Pattern::parse`]).
    pub fn insert(&self, pattern: &str, value: T) {
        let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
        self.root.write().unwrap().insert(&segments, value);
    }

    /// All entries whose pattern matches the concrete `path`.
    ///
    /// Entries are cloned out so callers can invoke them without holding
    /// the trie lock.
    pub fn match_path(&self, path: &str) -> Vec<T> {
        let segments: Vec<&str> = path.split(SEPARATOR).collect();
        let mut out = Vec::new();
        self.root.read().unwrap().collect(&segments, &mut out);
        out
    }

    /// Remove entries under exactly `pattern` for which `predicate` holds.
    /// Returns how many were removed.
    pub fn remove<F>(&self, pattern: &str, predicate: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
        self.root.write().unwrap().remove(&segments, &predicate)
    }

    /// Total number of registered entries.
    pub fn len(&self) -> usize {
        self.root.read().unwrap().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Node<T> {
    fn insert(&mut self, segments: &[&str], value: T) {
        let Some((first, rest)) = segments.split_first() else {
            self.values.push(value);
            return;
        };
        match *first {
            MULTI_WILDCARD => self.rest.push(value),
            SINGLE_WILDCARD => self
                .any
                .get_or_insert_with(Box::default)
                .insert(rest, value),
            literal => self
                .children
                .entry(literal.to_string())
                .or_default()
                .insert(rest, value),
        }
    }

    fn collect(&self, segments: &[&str], out: &mut Vec<T>) {
        // `**` matches zero or more remaining segments.
        out.extend(self.rest.iter().cloned());

        let Some((first, rest)) = segments.split_first() else {
            out.extend(self.values.iter().cloned());
            return;
        };
        if let Some(child) = self.children.get(*first) {
            child.collect(rest, out);
        }
        if let Some(any) = &self.any {
            any.collect(rest, out);
        }
    }

    fn remove<F>(&mut self, segments: &[&str], predicate: &F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        fn retain<T, F: Fn(&T) -> bool>(values: &mut Vec<T>, predicate: &F) -> usize {
            let before = values.len();
            values.retain(|v| !predicate(v));
            before - values.len()
        }

        let Some((first, rest)) = segments.split_first() else {
            return retain(&mut self.values, predicate);
        };
        match *first {
            MULTI_WILDCARD => retain(&mut self.rest, predicate),
            SINGLE_WILDCARD => self
                .any
                .as_mut()
                .map_or(0, |child| child.remove(rest, predicate)),
            literal => self
                .children
                .get_mut(literal)
                .map_or(0, |child| child.remove(rest, predicate)),
        }
    }

    fn count(&self) -> usize {
        self.values.len()
            + self.rest.len()
            + self.any.as_ref().map_or(0, |a| a.count())
            + self.children.values().map(Node::count).sum::<usize>()
    }
}

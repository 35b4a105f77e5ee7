//! Subscription matcher
//!
//! A trie (prefix tree) keyed by topic level that maps MQTT topic patterns to
//! the names of the rules subscribed with them. Supports the single-level (`+`)
//! and multi-level (`#`) wildcards.
//!
//! The matcher is filled once while the rule table is built and only read
//! afterwards, so lookups take `&self` and it can be shared freely between
//! connection tasks.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Rule names registered at one trie position (usually one or two)
type RuleNames = SmallVec<[Arc<str>; 2]>;

/// Node in the matcher trie
#[derive(Debug, Default)]
struct TrieNode {
    /// Rules whose pattern ends exactly at this node
    rules: RuleNames,
    /// Children indexed by topic level
    children: AHashMap<CompactString, TrieNode>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode>>,
    /// Rules registered with a multi-level wildcard (#) at this level
    multi_wildcard: RuleNames,
}

/// Inserts `name` unless already present, returns whether it was added
fn insert_unique(names: &mut RuleNames, name: &str) -> bool {
    if names.iter().any(|n| n.as_ref() == name) {
        return false;
    }
    names.push(Arc::from(name));
    true
}

/// Topic pattern -> rule name index
#[derive(Debug, Default)]
pub struct Matcher {
    root: TrieNode,
    count: usize,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rule` under `pattern`.
    ///
    /// The same rule registered twice under the same pattern is stored once.
    /// Patterns are expected to be valid topic filters (see
    /// [`validate_topic_filter`](super::validate_topic_filter)); a `#` that is
    /// not the last level swallows the remaining levels.
    pub fn add(&mut self, pattern: &str, rule: &str) {
        let mut node = &mut self.root;
        let mut levels = pattern.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                if insert_unique(&mut node.multi_wildcard, rule) {
                    self.count += 1;
                }
                return;
            } else if level == "+" {
                node = node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::default()));
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if is_last {
                if insert_unique(&mut node.rules, rule) {
                    self.count += 1;
                }
                return;
            }
        }
    }

    /// All rule names whose pattern matches `topic`.
    ///
    /// Matching is exact per level and case-sensitive. Topics starting with
    /// `$` are not matched by patterns whose first level is a wildcard.
    pub fn matches(&self, topic: &str) -> BTreeSet<Arc<str>> {
        let mut result = BTreeSet::new();
        self.for_each_match(topic, |name| {
            result.insert(name.clone());
        });
        result
    }

    /// Callback form of [`matches`](Self::matches); a name may be reported
    /// more than once when several patterns of the same rule match.
    pub fn for_each_match<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Arc<str>),
    {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Arc<str>),
    {
        let at_root_of_system_topic = is_system_topic && index == 0;

        // `a/#` also matches `a` itself, so the multi-level set is checked
        // before looking at the remaining levels
        if !at_root_of_system_topic {
            node.multi_wildcard.iter().for_each(&mut *callback);
        }

        if index >= levels.len() {
            node.rules.iter().for_each(&mut *callback);
            return;
        }

        let level = levels[index];

        if !at_root_of_system_topic {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Number of distinct (pattern, rule) registrations
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

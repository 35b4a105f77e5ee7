//! Topic matching for rule subscriptions
//!
//! Implements topic pattern validation and the matcher trie that maps an
//! inbound topic to every rule subscribed to it.

mod trie;
pub mod validation;

pub use trie::Matcher;
pub use validation::{
    has_wildcard, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

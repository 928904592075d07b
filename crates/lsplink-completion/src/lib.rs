//! Prefix-indexed completion cache for lsplink
//!
//! A language server answers one completion request per identifier, not one
//! per keystroke. This crate stores the items of the most recent completion
//! response in a set of prefix trees so that every subsequent keystroke on
//! the same identifier can be answered locally, without another round trip.
//!
//! # Module Organization
//!
//! - `trie`: fixed-alphabet prefix tree over printable ASCII
//! - `cache`: position-keyed cache of the last completion response

pub mod cache;
pub mod trie;

pub use cache::{kind_code, CompletionCache, CompletionItem, QueryPosition, KIND_ORDER};
pub use trie::Trie;

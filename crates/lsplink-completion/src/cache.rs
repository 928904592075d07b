//! Position-keyed cache of the last completion response.
//!
//! The cache is valid for exactly one `(line, start_column)` query position.
//! Repeated keystrokes at the same position filter the cached tries; moving
//! the cursor anywhere else invalidates the whole set. Responses that arrive
//! for a position the user already left are dropped, so an out-of-order
//! async reply can never clobber the cache of a newer query.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::trie::Trie;

/// One-letter completion kind codes in presentation order.
pub const KIND_ORDER: [char; 6] = ['m', 'f', 'c', 'v', 't', 'k'];

/// Map an LSP `CompletionItemKind` number to its one-letter code.
///
/// Text/Module collapse to `m`, callables to `f`, type-like kinds to `c`,
/// value-like kinds to `v`, Unit/Reference to `t`, and keyword-ish kinds to
/// `k`. Anything outside the known range maps to `None` and the item is
/// expected to be skipped by the caller.
pub fn kind_code(kind: i64) -> Option<char> {
    match kind {
        1 | 9 => Some('m'),
        2..=4 => Some('f'),
        7 | 8 | 13 => Some('c'),
        5 | 6 | 10 | 12 => Some('v'),
        11 | 18 => Some('t'),
        14..=17 => Some('k'),
        _ => None,
    }
}

/// One completion surfaced to the editor: insertable text, one-letter kind
/// code, and a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionItem {
    pub word: String,
    pub kind: char,
    pub info: String,
}

/// The `(line, start_column)` pair identifying which query the cached tries
/// answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPosition {
    pub line: u64,
    pub start_column: u64,
}

/// Cache of the last completion response, one trie per kind code.
pub struct CompletionCache {
    position: Option<QueryPosition>,
    tries: Vec<(char, Trie<CompletionItem>)>,
}

impl CompletionCache {
    pub fn new() -> Self {
        Self {
            position: None,
            tries: empty_tries(),
        }
    }

    /// Position of the query the cache currently answers, if any.
    pub fn position(&self) -> Option<QueryPosition> {
        self.position
    }

    /// Begin a query at `(line, start_column)`.
    ///
    /// Returns `true` when the cache already answers this position, so the
    /// caller can filter locally instead of asking the server. Returns
    /// `false` after recording the new position and discarding the previous
    /// trie set.
    pub fn begin_query(&mut self, line: u64, start_column: u64) -> bool {
        let position = QueryPosition { line, start_column };
        if self.position == Some(position) {
            return true;
        }
        debug!(line, start_column, "completion cache invalidated");
        self.position = Some(position);
        self.tries = empty_tries();
        false
    }

    /// Store the server's response for the query at `(line, start_column)`,
    /// replacing the previous trie set atomically.
    ///
    /// Returns `false` without touching the cache when the position no
    /// longer matches the current query: the reply is stale and a newer
    /// query owns the cache now.
    pub fn store<I>(&mut self, line: u64, start_column: u64, items: I) -> bool
    where
        I: IntoIterator<Item = CompletionItem>,
    {
        let position = QueryPosition { line, start_column };
        if self.position != Some(position) {
            debug!(line, start_column, "stale completion response dropped");
            return false;
        }

        let mut tries = empty_tries();
        let mut stored = 0usize;
        for item in items {
            if let Some((_, trie)) = tries.iter_mut().find(|(code, _)| *code == item.kind) {
                let word = item.word.clone();
                if trie.insert(&word, item) {
                    stored += 1;
                }
            }
        }
        debug!(line, start_column, stored, "completion cache updated");
        self.tries = tries;
        true
    }

    /// All cached items whose word starts with `prefix`, flattened over the
    /// kinds in [`KIND_ORDER`].
    pub fn filter(&self, prefix: &str) -> Vec<CompletionItem> {
        self.filter_limited(prefix, usize::MAX)
    }

    /// Like [`filter`](Self::filter), keeping at most `per_kind` items from
    /// each kind's trie.
    pub fn filter_limited(&self, prefix: &str, per_kind: usize) -> Vec<CompletionItem> {
        let mut results = Vec::new();
        for (_, trie) in &self.tries {
            results.extend(
                trie.search_prefix(prefix)
                    .into_iter()
                    .take(per_kind)
                    .cloned(),
            );
        }
        results
    }

    /// Forget the cached response and its position.
    pub fn clear(&mut self) {
        self.position = None;
        self.tries = empty_tries();
    }
}

impl Default for CompletionCache {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_tries() -> Vec<(char, Trie<CompletionItem>)> {
    KIND_ORDER.iter().map(|&code| (code, Trie::new())).collect()
}

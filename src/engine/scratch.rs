//! Per-request scratch buffers, reused across calls.
//!
//! One `MatchScratch` lives on the engine; every pipeline entry resets it and
//! fills the same allocations again. Nothing here grows in steady state, so
//! the hot path settles to zero allocation after the first few requests.

use crate::api::RuleAction;
use crate::hash::Hash64;
use crate::url::TokenBuf;

/// A verified rule occurrence waiting for precedence resolution.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub rule_id: u32,
    pub action: RuleAction,
    pub flags: u16,
    pub priority: i16,
}

/// Reusable buffers for one match call.
pub struct MatchScratch {
    /// URL token hashes.
    pub tokens: TokenBuf,
    /// Suffix-walk hashes of the request host, most specific first.
    pub req_suffixes: Vec<Hash64>,
    /// Suffix-walk hashes of the document host.
    pub doc_suffixes: Vec<Hash64>,
    /// Posting-list decode target.
    pub postings: Vec<u32>,
    /// Verified candidates for the current request.
    pub candidates: Vec<Candidate>,
    /// Whether the fallback bucket was already folded into `candidates`.
    pub fallback_scanned: bool,
}

impl MatchScratch {
    pub fn new() -> Self {
        Self {
            tokens: TokenBuf::new(),
            req_suffixes: Vec::with_capacity(8),
            doc_suffixes: Vec::with_capacity(8),
            postings: Vec::with_capacity(128),
            candidates: Vec::with_capacity(32),
            fallback_scanned: false,
        }
    }

    pub fn reset(&mut self) {
        self.tokens.clear();
        self.req_suffixes.clear();
        self.doc_suffixes.clear();
        self.postings.clear();
        self.candidates.clear();
        self.fallback_scanned = false;
    }
}

impl Default for MatchScratch {
    fn default() -> Self {
        Self::new()
    }
}

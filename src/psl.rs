//! Public-suffix handling: eTLD+1 computation and hostname suffix walks.
//!
//! The PSL travels inside the snapshot as three hash sets (exact rules,
//! wildcard rules, exception rules). At runtime the sets live on the engine;
//! nothing here is global. When a snapshot carries no PSL section, a small
//! registrable-domain heuristic takes over.
//!
//! eTLD+1 results are expressed as a byte offset into the input host, so the
//! hot path never allocates; suffix walks borrow the same slice.

use std::collections::HashSet;

use crate::hash::{hash_domain, Hash64};

/// Most specific label depth considered; deeper hosts fall back to the
/// heuristic. Real hostnames stay far below this.
const MAX_LABELS: usize = 64;

/// Two-part suffixes recognized by the no-PSL fallback.
const COMMON_TWO_PART_TLDS: &[&str] = &[
    "co.uk", "co.jp", "co.nz", "co.za", "co.in", "co.kr", "com.au", "com.br", "com.cn", "com.mx",
    "com.tw", "com.hk", "net.au", "net.nz", "org.uk", "org.au", "gov.uk", "gov.au", "ac.uk",
    "ac.jp", "ne.jp", "or.jp",
];

/// Runtime PSL rule sets, keyed by [`hash_domain`] of the rule text.
#[derive(Debug, Default)]
pub struct PslSets {
    exact: HashSet<u64, ahash::RandomState>,
    /// `*.ck` rules, stored under the hash of `ck`.
    wildcard: HashSet<u64, ahash::RandomState>,
    /// `!www.ck` rules, stored under the hash of `www.ck`.
    exception: HashSet<u64, ahash::RandomState>,
}

impl PslSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty() && self.exception.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len() + self.exception.len()
    }

    pub fn insert_exact(&mut self, h: Hash64) {
        self.exact.insert(h.to_u64());
    }

    pub fn insert_wildcard(&mut self, h: Hash64) {
        self.wildcard.insert(h.to_u64());
    }

    pub fn insert_exception(&mut self, h: Hash64) {
        self.exception.insert(h.to_u64());
    }

    #[inline]
    fn exact_contains(&self, suffix: &str) -> bool {
        self.exact.contains(&hash_domain(suffix).to_u64())
    }

    #[inline]
    fn wildcard_contains(&self, suffix: &str) -> bool {
        self.wildcard.contains(&hash_domain(suffix).to_u64())
    }

    #[inline]
    fn exception_contains(&self, suffix: &str) -> bool {
        self.exception.contains(&hash_domain(suffix).to_u64())
    }
}

/// PSL rules parsed from `publicsuffix.org` list text, compiler-side shape.
#[derive(Debug, Default, Clone)]
pub struct PslRules {
    pub exact: Vec<Hash64>,
    pub wildcard: Vec<Hash64>,
    pub exception: Vec<Hash64>,
}

/// Parses public-suffix list text: one rule per line, `//` comments,
/// `*.` wildcard prefix, `!` exception prefix.
pub fn parse_psl_text(text: &str) -> PslRules {
    let mut rules = PslRules::default();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        // Only ASCII rules participate; IDN rules appear in the list in both
        // Unicode and punycode form, and the punycode form is the one hosts use.
        if !line.is_ascii() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("!") {
            rules.exception.push(hash_domain(rest));
        } else if let Some(rest) = line.strip_prefix("*.") {
            rules.wildcard.push(hash_domain(rest));
        } else {
            rules.exact.push(hash_domain(line));
        }
    }
    rules
}

impl PslRules {
    pub fn into_sets(self) -> PslSets {
        let mut sets = PslSets::new();
        for h in self.exact {
            sets.insert_exact(h);
        }
        for h in self.wildcard {
            sets.insert_wildcard(h);
        }
        for h in self.exception {
            sets.insert_exception(h);
        }
        sets
    }
}

/// Byte offset where the registrable domain (eTLD+1) of `host` begins.
///
/// `host` must already be lowercased with no trailing dot; the engine's
/// context derivation guarantees both. Returns 0 (the whole host) when the
/// host itself is registrable or no deeper suffix matched.
pub fn etld1_start(host: &str, sets: Option<&PslSets>) -> usize {
    let mut starts = [0usize; MAX_LABELS];
    let n = label_starts(host, &mut starts);
    if n <= 1 {
        return 0;
    }

    if let Some(sets) = sets {
        if !sets.is_empty() {
            for i in 0..n - 1 {
                let suffix = &host[starts[i]..];

                // An exception rule cancels a wildcard: the suffix itself is
                // registrable.
                if sets.exception_contains(suffix) {
                    return starts[i];
                }

                if sets.exact_contains(suffix) {
                    return if i > 0 { starts[i - 1] } else { 0 };
                }

                // `*.ck` stored as `ck`: the suffix is public when its parent
                // is a wildcard rule.
                let parent = &host[starts[i + 1]..];
                if sets.wildcard_contains(parent) {
                    return if i > 0 { starts[i - 1] } else { 0 };
                }
            }
            return starts[n - 2];
        }
    }

    fallback_etld1_start(host, &starts[..n])
}

/// Registrable domain of `host` as a borrowed slice.
#[inline]
pub fn etld1_of<'a>(host: &'a str, sets: Option<&PslSets>) -> &'a str {
    &host[etld1_start(host, sets)..]
}

fn fallback_etld1_start(host: &str, starts: &[usize]) -> usize {
    let n = starts.len();
    if n <= 2 {
        return 0;
    }
    let last_two = &host[starts[n - 2]..];
    if COMMON_TWO_PART_TLDS.contains(&last_two) {
        starts[n - 3]
    } else {
        starts[n - 2]
    }
}

/// Fills `starts` with the byte offset of each label and returns the label
/// count. Counts past `MAX_LABELS` collapse into the final slot.
fn label_starts(host: &str, starts: &mut [usize; MAX_LABELS]) -> usize {
    let mut n = 1;
    starts[0] = 0;
    for (i, b) in host.bytes().enumerate() {
        if b == b'.' && i + 1 < host.len() {
            if n == MAX_LABELS {
                break;
            }
            starts[n] = i + 1;
            n += 1;
        }
    }
    n
}

/// Iterator over a host's suffixes from most to least specific, ending at the
/// registrable domain.
///
/// `||example.com^` must match `ads.example.com`, so candidate gathering and
/// domain-constraint checks both hash every suffix this yields.
pub struct SuffixWalk<'a> {
    host: &'a str,
    pos: usize,
    etld1_pos: usize,
    done: bool,
}

impl<'a> SuffixWalk<'a> {
    pub fn new(host: &'a str, etld1_pos: usize) -> Self {
        Self {
            host,
            pos: 0,
            etld1_pos,
            done: host.is_empty(),
        }
    }
}

impl<'a> Iterator for SuffixWalk<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.done {
            return None;
        }
        let out = &self.host[self.pos..];
        if self.pos >= self.etld1_pos {
            self.done = true;
        } else {
            match self.host[self.pos..].find('.') {
                Some(dot) => self.pos += dot + 1,
                None => self.done = true,
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets_from(text: &str) -> PslSets {
        parse_psl_text(text).into_sets()
    }

    #[test]
    fn etld1_with_exact_rules() {
        let sets = sets_from("com\nco.uk\n");
        assert_eq!(etld1_of("example.com", Some(&sets)), "example.com");
        assert_eq!(etld1_of("sub.example.com", Some(&sets)), "example.com");
        assert_eq!(etld1_of("a.b.example.co.uk", Some(&sets)), "example.co.uk");
        assert_eq!(etld1_of("com", Some(&sets)), "com");
    }

    #[test]
    fn etld1_with_wildcard_and_exception() {
        let sets = sets_from("ck\n*.ck\n!www.ck\n");
        // *.ck makes b.ck a public suffix.
        assert_eq!(etld1_of("a.b.ck", Some(&sets)), "a.b.ck");
        // !www.ck cancels the wildcard: www.ck itself is registrable.
        assert_eq!(etld1_of("www.ck", Some(&sets)), "www.ck");
        assert_eq!(etld1_of("foo.www.ck", Some(&sets)), "www.ck");
    }

    #[test]
    fn etld1_fallback_heuristic() {
        assert_eq!(etld1_of("sub.example.com", None), "example.com");
        assert_eq!(etld1_of("sub.example.co.uk", None), "example.co.uk");
        assert_eq!(etld1_of("example.com", None), "example.com");
        assert_eq!(etld1_of("localhost", None), "localhost");
    }

    #[test]
    fn etld1_is_idempotent() {
        let sets = sets_from("com\nco.uk\n*.ck\n!www.ck\n");
        for host in ["a.b.c.example.com", "x.example.co.uk", "a.b.ck", "foo.www.ck"] {
            let once = etld1_of(host, Some(&sets));
            let twice = etld1_of(once, Some(&sets));
            assert_eq!(once, twice, "idempotence for {host}");
        }
    }

    #[test]
    fn suffix_walk_descends_to_etld1() {
        let sets = sets_from("com\n");
        let host = "a.b.example.com";
        let start = etld1_start(host, Some(&sets));
        let walked: Vec<&str> = SuffixWalk::new(host, start).collect();
        assert_eq!(walked, vec!["a.b.example.com", "b.example.com", "example.com"]);
    }

    #[test]
    fn suffix_walk_single_label() {
        let walked: Vec<&str> = SuffixWalk::new("localhost", 0).collect();
        assert_eq!(walked, vec!["localhost"]);
        assert_eq!(SuffixWalk::new("", 0).count(), 0);
    }

    #[test]
    fn psl_text_parsing() {
        let rules = parse_psl_text("// header\ncom\n\n*.ck\n!www.ck\nco.uk\n");
        assert_eq!(rules.exact.len(), 2);
        assert_eq!(rules.wildcard.len(), 1);
        assert_eq!(rules.exception.len(), 1);
    }
}

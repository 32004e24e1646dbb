//! badfilter folding and duplicate elimination over the compiler IR.
//!
//! `$badfilter` rules neutralize the rule they name: the canonical key is the
//! whole rule minus the badfilter marker and minus list provenance, so a
//! badfilter in one list can disarm the same rule in another. Exact
//! duplicates across lists are dropped afterwards with the same key; the
//! first list to state a rule keeps it.

use ahash::AHashSet;

use super::parser::{NetworkRule, ScopedRule};

/// Counters produced by [`fold`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FoldStats {
    pub badfilter_rules: usize,
    pub badfiltered_rules: usize,
    pub deduped: usize,
}

/// Canonical identity of a network rule for folding purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    action: u8,
    flags: u16,
    hostname: Option<String>,
    pattern: Option<String>,
    anchor: u8,
    type_mask: u32,
    party_mask: u8,
    scheme_mask: u8,
    include: Vec<u64>,
    exclude: Vec<u64>,
    redirect: Option<(String, i16)>,
    removeparam: Option<String>,
    csp: Option<String>,
    header: Option<(String, Option<String>, bool)>,
    priority: i16,
}

impl RuleKey {
    fn of(rule: &NetworkRule) -> Self {
        let (include, exclude) = match &rule.constraint {
            Some(c) => (
                c.include.iter().map(|h| h.to_u64()).collect(),
                c.exclude.iter().map(|h| h.to_u64()).collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Self {
            action: rule.action_raw,
            flags: rule.flags.bits(),
            hostname: rule.hostname.clone(),
            pattern: rule.pattern.clone(),
            anchor: rule.anchor as u8,
            type_mask: rule.type_mask,
            party_mask: rule.party_mask,
            scheme_mask: rule.scheme_mask,
            include,
            exclude,
            redirect: rule
                .redirect
                .as_ref()
                .map(|r| (r.token.clone(), r.priority)),
            removeparam: rule.removeparam.clone(),
            csp: rule.csp.clone(),
            header: rule
                .header
                .as_ref()
                .map(|h| (h.name.clone(), h.value.clone(), h.negate)),
            priority: rule.priority,
        }
    }
}

/// Applies badfilter folding and dedupe in place.
pub fn fold(rules: &mut Vec<NetworkRule>) -> FoldStats {
    let mut stats = FoldStats::default();

    let mut badfilter_keys: AHashSet<RuleKey> = AHashSet::new();
    for rule in rules.iter() {
        if rule.badfilter {
            stats.badfilter_rules += 1;
            badfilter_keys.insert(RuleKey::of(rule));
        }
    }

    if badfilter_keys.is_empty() {
        rules.retain(|r| !r.badfilter);
    } else {
        rules.retain(|rule| {
            if rule.badfilter {
                return false;
            }
            if badfilter_keys.contains(&RuleKey::of(rule)) {
                stats.badfiltered_rules += 1;
                return false;
            }
            true
        });
    }

    let mut seen: AHashSet<RuleKey> = AHashSet::with_capacity(rules.len());
    rules.retain(|rule| {
        if seen.insert(RuleKey::of(rule)) {
            true
        } else {
            stats.deduped += 1;
            false
        }
    });

    stats
}

/// Dedupes a scoped-record family (cosmetic / procedural / scriptlet /
/// responseheader), keeping first occurrences. Returns how many were dropped.
pub fn dedupe_scoped(rules: &mut Vec<ScopedRule>) -> usize {
    let mut seen: AHashSet<(Vec<u64>, Vec<u64>, String, bool, bool)> =
        AHashSet::with_capacity(rules.len());
    let before = rules.len();
    rules.retain(|rule| {
        let key = (
            rule.constraint.include.iter().map(|h| h.to_u64()).collect(),
            rule.constraint.exclude.iter().map(|h| h.to_u64()).collect(),
            rule.text.clone(),
            rule.exception,
            rule.generic,
        );
        seen.insert(key)
    });
    before - rules.len()
}

//! Snapshot serialization: bytecode compilation, index construction, and
//! section emission.
//!
//! Determinism is a contract here: identical inputs must produce
//! byte-identical snapshots. Every hash-keyed collection is therefore sorted
//! before emission, strings are interned in first-use order, and nothing
//! iterates a hash map while writing bytes.
//!
//! # Invariants
//! - Rule IDs are dense `[0, N)` in IR order.
//! - Every posting list is sorted ascending before delta encoding.
//! - Hash tables are sized by [`format::table_capacity`] and filled with
//!   linear probing in sorted key order.

use ahash::AHashMap;

use crate::api::{CompileOptions, RuleAction, RuleFlags};
use crate::hash::{crc32, hash_domain, token_hash_folded, Hash64, SEED_HI, SEED_LO};
use crate::psl::PslRules;
use crate::snapshot::format::{
    self, align_up, header, header_flags, section_entry, write_u16, write_u32, MimeKind,
    PatternOp, SectionId, HASH64_HEADER_SIZE, HASHMAP64_ENTRY_SIZE, HASHSET64_ENTRY_SIZE,
    HEADER_SIZE, NO_CONSTRAINT, NO_OPTION, NO_PATTERN, SECTION_ALIGN, SECTION_ENTRY_SIZE,
    TOKEN_DICT_ENTRY_SIZE, TOKEN_DICT_HEADER_SIZE,
};

use super::parser::{AnchorKind, DomainConstraint, NetworkRule, ScopedRule};
use super::CompileError;

/// Everything the builder serializes, post-fold.
#[derive(Debug, Default)]
pub struct CompiledIr {
    pub network: Vec<NetworkRule>,
    pub cosmetic: Vec<ScopedRule>,
    pub procedural: Vec<ScopedRule>,
    pub scriptlet: Vec<ScopedRule>,
    pub responseheader: Vec<ScopedRule>,
    pub psl: PslRules,
}

/// Serializes the IR into a complete UBX image.
pub fn build_snapshot(ir: &CompiledIr, options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
    let mut strings = StringPool::new();

    let mut constraints = ConstraintPool::new();
    let rule_constraints: Vec<u32> = ir
        .network
        .iter()
        .map(|r| constraints.intern(r.constraint.as_ref()))
        .collect();

    let (pattern_section, pattern_ids) = build_pattern_pool(&ir.network, &mut strings)?;

    let placement = place_rules(&ir.network, &pattern_ids);
    let domain_sets_section = build_domain_sets(&placement);
    let (token_dict_section, token_postings_section) = build_token_sections(&placement);
    let fallback_section = build_fallback(&placement);

    let option_ids = build_option_tables(&ir.network, &mut strings);

    let responseheader_section =
        build_scoped_section(&ir.responseheader, &mut constraints, &mut strings);
    let cosmetic_section = build_scoped_section(&ir.cosmetic, &mut constraints, &mut strings);
    let procedural_section = build_scoped_section(&ir.procedural, &mut constraints, &mut strings);
    let scriptlet_section = build_scoped_section(&ir.scriptlet, &mut constraints, &mut strings);

    let rules_section = build_rules_section(
        &ir.network,
        &rule_constraints,
        &pattern_ids,
        &option_ids.merged,
    );
    let psl_section = build_psl_section(&ir.psl);

    let sections: Vec<(SectionId, Vec<u8>)> = vec![
        (SectionId::StrPool, strings.finish()),
        (SectionId::PslSets, psl_section),
        (SectionId::DomainSets, domain_sets_section),
        (SectionId::TokenDict, token_dict_section),
        (SectionId::TokenPostings, token_postings_section),
        (SectionId::PatternPool, pattern_section),
        (SectionId::Rules, rules_section),
        (SectionId::DomainConstraintPool, constraints.finish()),
        (SectionId::RedirectResources, option_ids.redirect_section),
        (SectionId::RemoveparamSpecs, option_ids.removeparam_section),
        (SectionId::CspSpecs, option_ids.csp_section),
        (SectionId::HeaderSpecs, option_ids.header_section),
        (SectionId::ResponseHeaderRules, responseheader_section),
        (SectionId::CosmeticRules, cosmetic_section),
        (SectionId::ProceduralRules, procedural_section),
        (SectionId::ScriptletRules, scriptlet_section),
        (SectionId::FallbackRules, fallback_section),
    ];

    assemble(sections, options)
}

// --------------------------
// String interning
// --------------------------

struct StringPool {
    data: Vec<u8>,
    index: AHashMap<String, u32>,
}

impl StringPool {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            index: AHashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(&offset) = self.index.get(s) {
            return (offset, s.len() as u32);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.index.insert(s.to_string(), offset);
        (offset, s.len() as u32)
    }

    fn finish(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

// --------------------------
// Constraint pool
// --------------------------

struct ConstraintPool {
    data: Vec<u8>,
    index: AHashMap<(Vec<u64>, Vec<u64>), u32>,
}

impl ConstraintPool {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            index: AHashMap::new(),
        }
    }

    /// Appends (or reuses) a constraint record, returning its pool offset.
    fn intern(&mut self, constraint: Option<&DomainConstraint>) -> u32 {
        let constraint = match constraint {
            Some(c) if !c.is_empty() => c,
            _ => return NO_CONSTRAINT,
        };
        let key = (
            constraint.include.iter().map(|h| h.to_u64()).collect::<Vec<_>>(),
            constraint.exclude.iter().map(|h| h.to_u64()).collect::<Vec<_>>(),
        );
        if let Some(&offset) = self.index.get(&key) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data
            .extend_from_slice(&(constraint.include.len() as u16).to_le_bytes());
        self.data
            .extend_from_slice(&(constraint.exclude.len() as u16).to_le_bytes());
        for h in constraint.include.iter().chain(&constraint.exclude) {
            self.data.extend_from_slice(&h.lo.to_le_bytes());
            self.data.extend_from_slice(&h.hi.to_le_bytes());
        }
        self.index.insert(key, offset);
        offset
    }

    fn finish(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

// --------------------------
// Pattern compilation
// --------------------------

fn build_pattern_pool(
    rules: &[NetworkRule],
    strings: &mut StringPool,
) -> Result<(Vec<u8>, Vec<u32>), CompileError> {
    struct Entry {
        prog_offset: u32,
        prog_len: u16,
        anchor: u8,
        flags: u8,
        host_hash: Hash64,
    }

    let mut pattern_ids = Vec::with_capacity(rules.len());
    let mut entries: Vec<Entry> = Vec::new();
    let mut progs: Vec<u8> = Vec::new();

    for rule in rules {
        let text = match &rule.pattern {
            Some(text) => text,
            None => {
                pattern_ids.push(NO_PATTERN);
                continue;
            }
        };

        let (prog, host_hash, anchor) = if rule.anchor == AnchorKind::Regex {
            // Regex programs are the source bytes; the engine compiles them
            // into its side table at install time.
            (text.as_bytes().to_vec(), Hash64::default(), format::PatternAnchor::Regex)
        } else {
            let match_case = rule.flags.contains(RuleFlags::MATCH_CASE);
            let right_anchor = rule.flags.contains(RuleFlags::HAS_RIGHT_ANCHOR);
            let (prog, host_hash) =
                compile_pattern(text, rule.anchor, right_anchor, match_case, strings);
            let anchor = match rule.anchor {
                AnchorKind::Left => format::PatternAnchor::Left,
                AnchorKind::Hostname => format::PatternAnchor::Hostname,
                _ => format::PatternAnchor::None,
            };
            (prog, host_hash, anchor)
        };

        if progs.len() + prog.len() > u32::MAX as usize {
            return Err(CompileError::TooLarge("pattern programs"));
        }
        if prog.len() > u16::MAX as usize {
            return Err(CompileError::TooLarge("pattern program"));
        }

        let id = entries.len() as u32;
        entries.push(Entry {
            prog_offset: progs.len() as u32,
            prog_len: prog.len() as u16,
            anchor: anchor as u8,
            flags: if rule.flags.contains(RuleFlags::MATCH_CASE) {
                format::pattern_flags::MATCH_CASE
            } else {
                0
            },
            host_hash,
        });
        progs.extend_from_slice(&prog);
        pattern_ids.push(id);
    }

    let mut section = Vec::new();
    section.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in &entries {
        section.extend_from_slice(&e.prog_offset.to_le_bytes());
        section.extend_from_slice(&e.prog_len.to_le_bytes());
        section.push(e.anchor);
        section.push(e.flags);
        section.extend_from_slice(&e.host_hash.lo.to_le_bytes());
        section.extend_from_slice(&e.host_hash.hi.to_le_bytes());
        section.extend_from_slice(&[0u8; 8]);
    }
    section.extend_from_slice(&(progs.len() as u32).to_le_bytes());
    section.extend_from_slice(&progs);

    Ok((section, pattern_ids))
}

/// Compiles one ABP pattern into opcodes.
///
/// Literals split at `*` (wildcard) and `^` (separator); consecutive
/// wildcards collapse. For hostname-anchored patterns the anchor host is the
/// text up to the first `/`, `^`, or `*`, hashed for the suffix-walk check.
fn compile_pattern(
    text: &str,
    anchor: AnchorKind,
    right_anchor: bool,
    match_case: bool,
    strings: &mut StringPool,
) -> (Vec<u8>, Hash64) {
    let mut prog = Vec::new();
    let mut host_hash = Hash64::default();

    match anchor {
        AnchorKind::Hostname => {
            prog.push(PatternOp::HostAnchor as u8);
            let host_end = text
                .find(|c| c == '/' || c == '^' || c == '*')
                .unwrap_or(text.len());
            if host_end > 0 {
                host_hash = hash_domain(&text[..host_end]);
            }
        }
        AnchorKind::Left => prog.push(PatternOp::AssertStart as u8),
        _ => {}
    }

    let bytes = text.as_bytes();
    let mut lit_start: Option<usize> = None;
    let mut last_was_skip = false;

    let mut flush = |prog: &mut Vec<u8>, start: usize, end: usize, strings: &mut StringPool| {
        if start >= end {
            return;
        }
        let mut lowered;
        let lit = if match_case {
            &text[start..end]
        } else {
            lowered = text[start..end].to_string();
            lowered.make_ascii_lowercase();
            &lowered
        };
        let (off, len) = strings.intern(lit);
        prog.push(PatternOp::FindLit as u8);
        prog.extend_from_slice(&off.to_le_bytes());
        prog.extend_from_slice(&(len as u16).to_le_bytes());
    };

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'*' => {
                if let Some(start) = lit_start.take() {
                    flush(&mut prog, start, i, strings);
                }
                if !last_was_skip {
                    prog.push(PatternOp::SkipAny as u8);
                }
                last_was_skip = true;
            }
            b'^' => {
                if let Some(start) = lit_start.take() {
                    flush(&mut prog, start, i, strings);
                }
                prog.push(PatternOp::AssertBoundary as u8);
                last_was_skip = false;
            }
            _ => {
                if lit_start.is_none() {
                    lit_start = Some(i);
                }
                last_was_skip = false;
            }
        }
    }
    if let Some(start) = lit_start {
        flush(&mut prog, start, bytes.len(), strings);
    }

    if right_anchor {
        prog.push(PatternOp::AssertEnd as u8);
    }
    prog.push(PatternOp::Done as u8);
    (prog, host_hash)
}

// --------------------------
// Rule placement and token selection
// --------------------------

/// Where each rule landed: the domain index, the token index, or the
/// fallback bucket.
struct Placement {
    /// (suffix hash, rule id) for allow-class host-only rules.
    domain_allow: Vec<(Hash64, u32)>,
    /// (suffix hash, rule id) for block-class host-only rules.
    domain_block: Vec<(Hash64, u32)>,
    /// (index token, rule id).
    tokens: Vec<(u32, u32)>,
    /// Rule ids nothing could index.
    fallback: Vec<u32>,
}

fn place_rules(rules: &[NetworkRule], pattern_ids: &[u32]) -> Placement {
    let mut placement = Placement {
        domain_allow: Vec::new(),
        domain_block: Vec::new(),
        tokens: Vec::new(),
        fallback: Vec::new(),
    };

    // First pass: candidate tokens per rule, with global occurrence counts so
    // the second pass can pick the rarest.
    let mut candidates: Vec<Vec<u32>> = Vec::with_capacity(rules.len());
    let mut freq: AHashMap<u32, u32> = AHashMap::new();
    for rule in rules {
        let c = index_token_candidates(rule);
        for &t in &c {
            *freq.entry(t).or_insert(0) += 1;
        }
        candidates.push(c);
    }

    for (id, rule) in rules.iter().enumerate() {
        let id = id as u32;

        if let Some(host) = &rule.hostname {
            let target = match rule.action() {
                RuleAction::Allow | RuleAction::HeaderMatchAllow => &mut placement.domain_allow,
                _ => &mut placement.domain_block,
            };
            target.push((hash_domain(host), id));
            continue;
        }

        if pattern_ids[id as usize] == NO_PATTERN || rule.anchor == AnchorKind::Regex {
            placement.fallback.push(id);
            continue;
        }

        let best = candidates[id as usize]
            .iter()
            .map(|&t| (freq.get(&t).copied().unwrap_or(0), t))
            .min();
        match best {
            Some((_, token)) => placement.tokens.push((token, id)),
            None => placement.fallback.push(id),
        }
    }

    placement
}

/// Candidate index tokens for a pattern rule: complete alphanumeric runs.
///
/// A run qualifies when the matching URL is guaranteed to contain it as a
/// whole token: it must be bounded by literal non-alphanumeric pattern bytes
/// (never a wildcard), or by an anchor that pins the pattern edge. Hostname
/// anchored rules whose pattern yields nothing fall back to their anchor-host
/// labels, which the suffix-walk check makes complete.
fn index_token_candidates(rule: &NetworkRule) -> Vec<u32> {
    let text = match &rule.pattern {
        Some(t) => t.as_bytes(),
        None => return Vec::new(),
    };
    if rule.anchor == AnchorKind::Regex {
        return Vec::new();
    }
    let right_anchored = rule.flags.contains(RuleFlags::HAS_RIGHT_ANCHOR);
    let left_pinned = rule.anchor != AnchorKind::None;

    let mut out = Vec::new();
    collect_runs(text, left_pinned, right_anchored, &mut out);

    if out.is_empty() && rule.anchor == AnchorKind::Hostname {
        let host_end = text
            .iter()
            .position(|&b| b == b'/' || b == b'^' || b == b'*')
            .unwrap_or(text.len());
        collect_runs(&text[..host_end], true, true, &mut out);
    }
    out
}

fn collect_runs(text: &[u8], left_pinned: bool, right_pinned: bool, out: &mut Vec<u32>) {
    let mut start: Option<usize> = None;
    for i in 0..=text.len() {
        let alnum = i < text.len() && text[i].is_ascii_alphanumeric();
        if alnum {
            if start.is_none() {
                start = Some(i);
            }
            continue;
        }
        if let Some(s) = start.take() {
            if i - s < crate::url::MIN_TOKEN_LEN {
                continue;
            }
            let left_ok = if s == 0 { left_pinned } else { text[s - 1] != b'*' };
            let right_ok = if i == text.len() { right_pinned } else { text[i] != b'*' };
            if left_ok && right_ok {
                out.push(token_hash_folded(&text[s..i]));
            }
        }
    }
}

// --------------------------
// Index sections
// --------------------------

fn build_domain_sets(placement: &Placement) -> Vec<u8> {
    let mut postings = Vec::new();
    let block_entries = grouped_posting_entries(&placement.domain_block, &mut postings);
    let allow_entries = grouped_posting_entries(&placement.domain_allow, &mut postings);

    let block_table = build_hashmap64(&block_entries);
    let allow_table = build_hashmap64(&allow_entries);

    let mut section =
        Vec::with_capacity(block_table.len() + allow_table.len() + postings.len() + 4);
    section.extend_from_slice(&block_table);
    section.extend_from_slice(&allow_table);
    section.extend_from_slice(&(postings.len() as u32).to_le_bytes());
    section.extend_from_slice(&postings);
    section
}

/// Groups `(hash, rule)` pairs into per-hash posting lists, appends each list
/// (count-prefixed) to `postings`, and returns sorted `(hash, offset)` table
/// entries.
fn grouped_posting_entries(pairs: &[(Hash64, u32)], postings: &mut Vec<u8>) -> Vec<(Hash64, u32)> {
    let mut sorted: Vec<(u64, u32)> = pairs.iter().map(|&(h, id)| (h.to_u64(), id)).collect();
    sorted.sort_unstable();

    let mut entries = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let key = sorted[i].0;
        let offset = postings.len() as u32;
        let start = i;
        while i < sorted.len() && sorted[i].0 == key {
            i += 1;
        }
        let ids: Vec<u32> = sorted[start..i].iter().map(|&(_, id)| id).collect();
        postings.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        encode_posting_list(postings, &ids);
        entries.push((Hash64::from_u64(key), offset));
    }
    entries
}

fn build_token_sections(placement: &Placement) -> (Vec<u8>, Vec<u8>) {
    let mut sorted: Vec<(u32, u32)> = placement.tokens.clone();
    sorted.sort_unstable();

    let mut postings = Vec::new();
    let mut dict: Vec<(u32, u32, u32)> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let token = sorted[i].0;
        let offset = postings.len() as u32;
        let start = i;
        while i < sorted.len() && sorted[i].0 == token {
            i += 1;
        }
        let ids: Vec<u32> = sorted[start..i].iter().map(|&(_, id)| id).collect();
        encode_posting_list(&mut postings, &ids);
        dict.push((token, offset, ids.len() as u32));
    }

    let dict_section = build_token_dict(&dict);
    let mut postings_section = Vec::with_capacity(postings.len() + 4);
    postings_section.extend_from_slice(&(postings.len() as u32).to_le_bytes());
    postings_section.extend_from_slice(&postings);
    (dict_section, postings_section)
}

fn build_token_dict(entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let capacity = format::table_capacity(entries.len());
    let mut buf = vec![0u8; TOKEN_DICT_HEADER_SIZE + capacity * TOKEN_DICT_ENTRY_SIZE];
    write_u32(&mut buf, 0, capacity as u32);
    write_u32(&mut buf, 4, entries.len() as u32);
    write_u32(&mut buf, 8, crate::hash::SEED_TOKEN);
    write_u32(&mut buf, 12, 0);
    if capacity == 0 {
        return buf;
    }

    let mask = capacity - 1;
    for &(token, offset, count) in entries {
        let mut idx = token as usize & mask;
        loop {
            let entry = TOKEN_DICT_HEADER_SIZE + idx * TOKEN_DICT_ENTRY_SIZE;
            if format::read_u32(&buf, entry) == 0 {
                write_u32(&mut buf, entry, token);
                write_u32(&mut buf, entry + 4, offset);
                write_u32(&mut buf, entry + 8, count);
                break;
            }
            idx = (idx + 1) & mask;
        }
    }
    buf
}

fn build_hashmap64(entries: &[(Hash64, u32)]) -> Vec<u8> {
    let capacity = format::table_capacity(entries.len());
    let mut buf = vec![0u8; HASH64_HEADER_SIZE + capacity * HASHMAP64_ENTRY_SIZE];
    write_u32(&mut buf, 0, capacity as u32);
    write_u32(&mut buf, 4, entries.len() as u32);
    write_u32(&mut buf, 8, SEED_LO);
    write_u32(&mut buf, 12, SEED_HI);
    write_u32(&mut buf, 16, 0);
    if capacity == 0 {
        return buf;
    }

    let mask = capacity - 1;
    for &(hash, value) in entries {
        let mut idx = hash.lo as usize & mask;
        loop {
            let entry = HASH64_HEADER_SIZE + idx * HASHMAP64_ENTRY_SIZE;
            let lo = format::read_u32(&buf, entry);
            let hi = format::read_u32(&buf, entry + 4);
            if lo == 0 && hi == 0 {
                write_u32(&mut buf, entry, hash.lo);
                write_u32(&mut buf, entry + 4, hash.hi);
                write_u32(&mut buf, entry + 8, value);
                break;
            }
            idx = (idx + 1) & mask;
        }
    }
    buf
}

fn build_fallback(placement: &Placement) -> Vec<u8> {
    let mut ids = placement.fallback.clone();
    ids.sort_unstable();
    let mut section = Vec::new();
    section.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    encode_posting_list(&mut section, &ids);
    section
}

fn encode_posting_list(buf: &mut Vec<u8>, sorted_ids: &[u32]) {
    let mut prev = 0u32;
    for &id in sorted_ids {
        encode_varint(buf, id.wrapping_sub(prev));
        prev = id;
    }
}

fn encode_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

// --------------------------
// Option tables
// --------------------------

struct OptionTables {
    merged: Vec<u32>,
    redirect_section: Vec<u8>,
    removeparam_section: Vec<u8>,
    csp_section: Vec<u8>,
    header_section: Vec<u8>,
}

fn build_option_tables(rules: &[NetworkRule], strings: &mut StringPool) -> OptionTables {
    let mut merged = vec![NO_OPTION; rules.len()];

    // Redirect resources, deduped by token.
    let mut redirect_index: AHashMap<String, u32> = AHashMap::new();
    let mut redirect_entries: Vec<[u32; 5]> = Vec::new();
    // Removeparam / CSP specs, deduped by payload.
    let mut removeparam_index: AHashMap<String, u32> = AHashMap::new();
    let mut removeparam_entries: Vec<[u32; 3]> = Vec::new();
    let mut csp_index: AHashMap<String, u32> = AHashMap::new();
    let mut csp_entries: Vec<[u32; 3]> = Vec::new();
    // Header specs, deduped by the whole spec.
    let mut header_index: AHashMap<(String, Option<String>, bool), u32> = AHashMap::new();
    let mut header_entries: Vec<[u32; 5]> = Vec::new();

    for (id, rule) in rules.iter().enumerate() {
        if let Some(redirect) = &rule.redirect {
            let idx = *redirect_index.entry(redirect.token.clone()).or_insert_with(|| {
                let path = redirect_resource_path(&redirect.token);
                let (name_off, name_len) = strings.intern(&redirect.token);
                let (path_off, path_len) = strings.intern(&path);
                let mime = MimeKind::for_token(&redirect.token) as u32;
                let idx = redirect_entries.len() as u32;
                redirect_entries.push([name_off, name_len, path_off, path_len, mime]);
                idx
            });
            merged[id] = idx;
            continue;
        }
        if let Some(spec) = &rule.removeparam {
            let idx = *removeparam_index.entry(spec.clone()).or_insert_with(|| {
                let (off, len) = strings.intern(spec);
                let idx = removeparam_entries.len() as u32;
                removeparam_entries.push([off, len, 0]);
                idx
            });
            merged[id] = idx;
            continue;
        }
        if let Some(spec) = &rule.csp {
            let idx = *csp_index.entry(spec.clone()).or_insert_with(|| {
                let (off, len) = strings.intern(spec);
                let idx = csp_entries.len() as u32;
                csp_entries.push([off, len, 0]);
                idx
            });
            merged[id] = idx;
            continue;
        }
        if let Some(spec) = &rule.header {
            let key = (spec.name.clone(), spec.value.clone(), spec.negate);
            let idx = *header_index.entry(key).or_insert_with(|| {
                let (name_off, name_len) = strings.intern(&spec.name);
                let (value_off, value_len) = match &spec.value {
                    Some(v) => strings.intern(v),
                    None => (0, 0),
                };
                let flags = if spec.negate { 1 } else { 0 };
                let idx = header_entries.len() as u32;
                header_entries.push([name_off, name_len, value_off, value_len, flags]);
                idx
            });
            merged[id] = idx;
        }
    }

    OptionTables {
        merged,
        redirect_section: serialize_entries(&redirect_entries),
        removeparam_section: serialize_entries(&removeparam_entries),
        csp_section: serialize_entries(&csp_entries),
        header_section: serialize_entries(&header_entries),
    }
}

fn serialize_entries<const N: usize>(entries: &[[u32; N]]) -> Vec<u8> {
    let mut section = Vec::with_capacity(4 + entries.len() * N * 4);
    section.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        for field in entry {
            section.extend_from_slice(&field.to_le_bytes());
        }
    }
    section
}

/// Packaged-resource path for a redirect token. Absolute paths, data URLs,
/// and full URLs pass through.
fn redirect_resource_path(token: &str) -> String {
    if token.starts_with('/') || token.starts_with("data:") || token.contains("://") {
        return token.to_string();
    }
    format!("/web_accessible/{token}")
}

// --------------------------
// Scoped record sections
// --------------------------

fn build_scoped_section(
    rules: &[ScopedRule],
    constraints: &mut ConstraintPool,
    strings: &mut StringPool,
) -> Vec<u8> {
    let mut section = Vec::with_capacity(4 + rules.len() * format::SCOPED_RECORD_ENTRY_SIZE);
    section.extend_from_slice(&(rules.len() as u32).to_le_bytes());
    for rule in rules {
        let constraint = constraints.intern(Some(&rule.constraint));
        let (off, len) = strings.intern(&rule.text);
        let mut flags = 0u16;
        if rule.exception {
            flags |= format::scoped_flags::EXCEPTION;
        }
        if rule.generic {
            flags |= format::scoped_flags::GENERIC;
        }
        section.extend_from_slice(&constraint.to_le_bytes());
        section.extend_from_slice(&off.to_le_bytes());
        section.extend_from_slice(&len.to_le_bytes());
        section.extend_from_slice(&flags.to_le_bytes());
        section.extend_from_slice(&rule.list_id.to_le_bytes());
    }
    section
}

// --------------------------
// Rules section (SoA)
// --------------------------

fn build_rules_section(
    rules: &[NetworkRule],
    constraint_offsets: &[u32],
    pattern_ids: &[u32],
    option_ids: &[u32],
) -> Vec<u8> {
    let count = rules.len();
    let mut buf = Vec::new();
    buf.extend_from_slice(&(count as u32).to_le_bytes());
    if count == 0 {
        return buf;
    }

    for rule in rules {
        buf.push(rule.action_raw);
    }
    pad_to_align(&mut buf, 2);
    for rule in rules {
        buf.extend_from_slice(&rule.flags.bits().to_le_bytes());
    }
    pad_to_align(&mut buf, 4);
    for rule in rules {
        buf.extend_from_slice(&rule.type_mask.to_le_bytes());
    }
    for rule in rules {
        buf.push(rule.party_mask);
    }
    for rule in rules {
        buf.push(rule.scheme_mask);
    }
    pad_to_align(&mut buf, 4);
    for id in pattern_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    for offset in constraint_offsets {
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    for option in option_ids {
        buf.extend_from_slice(&option.to_le_bytes());
    }
    for rule in rules {
        buf.extend_from_slice(&rule.priority.to_le_bytes());
    }
    pad_to_align(&mut buf, 2);
    for rule in rules {
        buf.extend_from_slice(&rule.list_id.to_le_bytes());
    }
    buf
}

fn pad_to_align(buf: &mut Vec<u8>, align: usize) {
    let target = align_up(buf.len(), align);
    buf.resize(target, 0);
}

// --------------------------
// PSL section
// --------------------------

fn build_psl_section(psl: &PslRules) -> Vec<u8> {
    let mut section = Vec::new();
    for set in [&psl.exact, &psl.wildcard, &psl.exception] {
        let mut hashes: Vec<u64> = set.iter().map(|h| h.to_u64()).collect();
        hashes.sort_unstable();
        hashes.dedup();

        let capacity = format::table_capacity(hashes.len());
        let base = section.len();
        section.resize(base + HASH64_HEADER_SIZE + capacity * HASHSET64_ENTRY_SIZE, 0);
        write_u32(&mut section, base, capacity as u32);
        write_u32(&mut section, base + 4, hashes.len() as u32);
        write_u32(&mut section, base + 8, SEED_LO);
        write_u32(&mut section, base + 12, SEED_HI);
        if capacity == 0 {
            continue;
        }

        let mask = capacity - 1;
        for key in hashes {
            let h = Hash64::from_u64(key);
            let mut idx = h.lo as usize & mask;
            loop {
                let entry = base + HASH64_HEADER_SIZE + idx * HASHSET64_ENTRY_SIZE;
                let lo = format::read_u32(&section, entry);
                let hi = format::read_u32(&section, entry + 4);
                if lo == 0 && hi == 0 {
                    write_u32(&mut section, entry, h.lo);
                    write_u32(&mut section, entry + 4, h.hi);
                    break;
                }
                idx = (idx + 1) & mask;
            }
        }
    }
    section
}

// --------------------------
// File assembly
// --------------------------

fn assemble(
    sections: Vec<(SectionId, Vec<u8>)>,
    options: &CompileOptions,
) -> Result<Vec<u8>, CompileError> {
    let dir_offset = HEADER_SIZE;
    let dir_bytes = sections.len() * SECTION_ENTRY_SIZE;

    let mut offsets = Vec::with_capacity(sections.len());
    let mut pos = align_up(dir_offset + dir_bytes, SECTION_ALIGN);
    for (_, data) in &sections {
        offsets.push(pos);
        pos = align_up(pos + data.len(), SECTION_ALIGN);
    }
    if pos > u32::MAX as usize {
        return Err(CompileError::TooLarge("snapshot image"));
    }

    let mut buf = vec![0u8; pos];
    buf[..4].copy_from_slice(&format::MAGIC);
    write_u16(&mut buf, header::VERSION, format::VERSION);
    write_u16(
        &mut buf,
        header::FLAGS,
        if options.crc { header_flags::HAS_CRC32 } else { 0 },
    );
    write_u32(&mut buf, header::HEADER_BYTES, HEADER_SIZE as u32);
    write_u32(&mut buf, header::SECTION_COUNT, sections.len() as u32);
    write_u32(&mut buf, header::SECTION_DIR_OFFSET, dir_offset as u32);
    write_u32(&mut buf, header::SECTION_DIR_BYTES, dir_bytes as u32);
    write_u32(&mut buf, header::BUILD_ID, options.build_id);

    for (i, (id, data)) in sections.iter().enumerate() {
        let entry = dir_offset + i * SECTION_ENTRY_SIZE;
        write_u16(&mut buf, entry + section_entry::ID, *id as u16);
        write_u16(&mut buf, entry + section_entry::FLAGS, 0);
        write_u32(&mut buf, entry + section_entry::OFFSET, offsets[i] as u32);
        write_u32(&mut buf, entry + section_entry::LENGTH, data.len() as u32);
        write_u32(&mut buf, entry + section_entry::UNCOMPRESSED_LENGTH, 0);
        let section_crc = if options.crc { crc32(data) } else { 0 };
        write_u32(&mut buf, entry + section_entry::CRC32, section_crc);
        buf[offsets[i]..offsets[i] + data.len()].copy_from_slice(data);
    }

    if options.crc {
        let crc = crate::hash::crc32_with_hole(&buf, header::SNAPSHOT_CRC32);
        write_u32(&mut buf, header::SNAPSHOT_CRC32, crc);
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_network;
    use crate::snapshot::LoadedSnapshot;

    fn ir_of(lines: &str) -> CompiledIr {
        let mut ir = CompiledIr::default();
        for line in lines.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = parse_network(line, 0).expect("parse");
            ir.network.extend(parsed.rules);
            if let Some(r) = parsed.responseheader {
                ir.responseheader.push(r);
            }
        }
        ir
    }

    fn build(lines: &str) -> Vec<u8> {
        build_snapshot(&ir_of(lines), &CompileOptions::default()).expect("build")
    }

    #[test]
    fn snapshot_round_trips_through_loader() {
        let bytes = build("||doubleclick.net^\n@@||news.example.com^$document\n/banner.gif$image");
        let snap = LoadedSnapshot::load(bytes).expect("load");
        assert_eq!(snap.rule_count(), 3);
        assert!(snap.domain_block_lookup(hash_domain("doubleclick.net")).is_some());
        assert!(snap.domain_allow_lookup(hash_domain("news.example.com")).is_some());
        assert!(snap.domain_block_lookup(hash_domain("unrelated.example")).is_none());
    }

    #[test]
    fn compile_is_deterministic() {
        let lines = "||doubleclick.net^\n||googletagmanager.com/gtm.js$script,redirect=noop.js\n\
                     *$removeparam=gclid\n/banner.gif$domain=example.com|~shop.example.com\n\
                     ||tracker.test^$important";
        let a = build(lines);
        let b = build(lines);
        assert_eq!(a, b);
    }

    #[test]
    fn crc_validates_and_detects_corruption() {
        let bytes = build("||ads.example.com^");
        assert!(LoadedSnapshot::load(bytes.clone()).is_ok());

        let mut corrupted = bytes;
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(LoadedSnapshot::load(corrupted).is_err());
    }

    #[test]
    fn pattern_bytecode_shape() {
        let mut strings = StringPool::new();
        let (prog, host_hash) =
            compile_pattern("example.com/ads/*", AnchorKind::Hostname, false, false, &mut strings);
        assert_eq!(prog[0], PatternOp::HostAnchor as u8);
        assert_eq!(prog[1], PatternOp::FindLit as u8);
        // trailing wildcard then done
        assert_eq!(prog[prog.len() - 2], PatternOp::SkipAny as u8);
        assert_eq!(prog[prog.len() - 1], PatternOp::Done as u8);
        assert_eq!(host_hash, hash_domain("example.com"));
    }

    #[test]
    fn consecutive_wildcards_collapse() {
        let mut strings = StringPool::new();
        let (prog, _) = compile_pattern("a**b", AnchorKind::None, false, false, &mut strings);
        let skips = prog.iter().filter(|&&b| b == PatternOp::SkipAny as u8).count();
        assert_eq!(skips, 1);
    }

    #[test]
    fn right_anchor_emits_assert_end() {
        let mut strings = StringPool::new();
        let (prog, _) = compile_pattern("/banner.gif", AnchorKind::None, true, false, &mut strings);
        assert_eq!(prog[prog.len() - 2], PatternOp::AssertEnd as u8);
    }

    #[test]
    fn token_candidates_respect_wildcards() {
        let parsed = parse_network("||example.com/ads*tracker", 0).unwrap();
        let tokens = index_token_candidates(&parsed.rules[0]);
        // "ads" touches the wildcard on the right, "tracker" ends the
        // pattern without a right anchor; "example" and "com" qualify.
        assert!(tokens.contains(&token_hash_folded(b"example")));
        assert!(tokens.contains(&token_hash_folded(b"com")));
        assert!(!tokens.contains(&token_hash_folded(b"ads")));
        assert!(!tokens.contains(&token_hash_folded(b"tracker")));
    }

    #[test]
    fn unindexable_rules_land_in_fallback() {
        let bytes = build("*$removeparam=gclid");
        let snap = LoadedSnapshot::load(bytes).expect("load");
        assert_eq!(snap.fallback_rule_count(), 1);
        let mut ids = Vec::new();
        snap.decode_fallback_rules(&mut ids);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn redirect_resources_store_packaged_paths() {
        let bytes = build("||googletagmanager.com/gtm.js$script,redirect=noop.js");
        let snap = LoadedSnapshot::load(bytes).expect("load");
        // rule 1 is the directive half.
        let option = snap.rule_option_id(1);
        let resource = snap.redirect_resource(option).expect("resource");
        assert_eq!(resource.name, "noop.js");
        assert_eq!(resource.path, "/web_accessible/noop.js");
        assert_eq!(resource.mime, MimeKind::Script);
    }

    #[test]
    fn psl_section_round_trips() {
        let mut ir = ir_of("||ads.example.com^");
        ir.psl = crate::psl::parse_psl_text("com\nco.uk\n*.ck\n!www.ck\n");
        let bytes = build_snapshot(&ir, &CompileOptions::default()).expect("build");
        let snap = LoadedSnapshot::load(bytes).expect("load");
        let sets = snap.load_psl();
        assert_eq!(crate::psl::etld1_of("a.b.example.co.uk", Some(&sets)), "example.co.uk");
    }
}

//! Network request pipeline: stages A0 through A4.
//!
//! Stage order is fixed: trusted-site bypass, dynamic-filter hook,
//! removeparam, static filtering, redirect resolution. Candidate gathering
//! happens at most once per request and feeds both the removeparam stage and
//! static precedence; the decision cache covers only the static outcome,
//! because removeparam results depend on the loop guard's state.

use crate::api::{
    Decision, DynamicVerdict, MatchVerdict, RequestInfo, RuleAction, RuleFlags, TypeMask,
};
use crate::hash::{hash64, hash_domain};
use crate::psl::SuffixWalk;
use crate::snapshot::format::{NO_OPTION, NO_PATTERN};
use crate::snapshot::LoadedSnapshot;
use crate::url;

use super::context::{derive, RequestContext};
use super::pattern::{self, PatternCtx};
use super::scratch::{Candidate, MatchScratch};
use super::{ActiveSnapshot, CachedDecision, Engine};

/// Flags that make an Allow candidate target something narrower than the
/// request itself; such rules never win the request-level ladder.
const SCOPED_ALLOW: u16 = RuleFlags::REDIRECT_RULE_EXCEPTION.bits()
    | RuleFlags::CSP_EXCEPTION.bits()
    | RuleFlags::ELEMHIDE.bits()
    | RuleFlags::GENERICHIDE.bits();

impl Engine {
    pub(super) fn run_match_request(&mut self, req: &RequestInfo<'_>) -> MatchVerdict {
        let active = match &self.active {
            Some(active) => active.clone(),
            None => return MatchVerdict::default(),
        };
        let ctx = match derive(req, Some(&active.psl), &mut self.etld1_cache) {
            Some(ctx) => ctx,
            None => return MatchVerdict::default(),
        };

        // A0: trusted sites bypass everything.
        if !self.trusted.is_empty() && self.trusted.contains(ctx.doc_etld1) {
            return MatchVerdict::default();
        }

        // A1: host dynamic-filtering hook. Broad dynamic blocks must never
        // cancel a top-level navigation, and the hook cannot tell us rule
        // breadth, so main-frame blocks are ignored wholesale.
        if let Some(hook) = &self.dynamic {
            match hook.evaluate(req, ctx.doc_etld1, ctx.req_etld1) {
                DynamicVerdict::Allow => return MatchVerdict::default(),
                DynamicVerdict::Block if !ctx.type_mask.contains(TypeMask::MAIN_FRAME) => {
                    return MatchVerdict {
                        decision: Decision::Block,
                        ..MatchVerdict::default()
                    };
                }
                _ => {}
            }
        }

        self.scratch.reset();
        let mut gathered = false;

        // A2: URL sanitization, guarded against redirect loops.
        if active.snapshot.removeparam_rule_count() > 0 {
            gather(&active, &ctx, &mut self.scratch);
            gathered = true;
            if let Some(verdict) = self.apply_removeparam(&active, &ctx) {
                return verdict;
            }
        }

        // A3: static filtering, behind the decision cache.
        let key = cache_key(&ctx);
        if let Some(cached) = self.decision_cache.get(&key) {
            return materialize(&active, cached);
        }

        if !gathered {
            gather(&active, &ctx, &mut self.scratch);
        }

        let cached = resolve_static(&active, &self.scratch);
        self.decision_cache.insert(key, cached);
        materialize(&active, &cached)
    }

    /// Stage A2. Returns a verdict when the request must be answered here.
    fn apply_removeparam(
        &mut self,
        active: &ActiveSnapshot,
        ctx: &RequestContext<'_>,
    ) -> Option<MatchVerdict> {
        let snapshot = &active.snapshot;

        // Fallback-bucket removeparam rules apply to every URL, so the A2
        // stage always folds the bucket in.
        scan_fallback(active, ctx, &mut self.scratch);

        let mut disable_all = false;
        let mut exceptions: Vec<u32> = Vec::new();
        for c in &self.scratch.candidates {
            if c.action != RuleAction::Allow || c.flags & SCOPED_ALLOW != 0 {
                continue;
            }
            let option = snapshot.rule_option_id(c.rule_id as usize);
            if option == NO_OPTION {
                continue;
            }
            if let Some(spec) = snapshot.removeparam_spec(option) {
                if spec.is_empty() {
                    disable_all = true;
                } else {
                    exceptions.push(option);
                }
            }
        }
        if disable_all {
            return None;
        }

        let mut strip_all = false;
        let mut remove_keys: Vec<&str> = Vec::new();
        let mut deciding: Option<u32> = None;
        for c in &self.scratch.candidates {
            if c.action != RuleAction::Removeparam {
                continue;
            }
            let option = snapshot.rule_option_id(c.rule_id as usize);
            if option == NO_OPTION || exceptions.contains(&option) {
                continue;
            }
            let spec = match snapshot.removeparam_spec(option) {
                Some(spec) => spec,
                None => continue,
            };
            if spec.is_empty() {
                strip_all = true;
            } else {
                for key in spec.split(|c| c == '|' || c == ',') {
                    let key = key.trim();
                    if !key.is_empty() && !remove_keys.contains(&key) {
                        remove_keys.push(key);
                    }
                }
            }
            if deciding.is_none() {
                deciding = Some(c.rule_id);
            }
        }

        let deciding = deciding?;
        let new_url = if strip_all {
            strip_query(ctx.url)
        } else {
            url::remove_query_params(ctx.url, &remove_keys)
        }?;

        if self
            .guard
            .check_and_arm(ctx.tab_id, ctx.frame_id, hash64(ctx.url.as_bytes()).to_u64())
        {
            // Loop suppression: the same URL was just sanitized here.
            return Some(MatchVerdict::default());
        }

        Some(MatchVerdict {
            decision: Decision::Removeparam,
            rule_id: deciding as i32,
            list_id: snapshot.rule_list_id(deciding as usize),
            redirect_url: Some(new_url),
        })
    }
}

/// Removes the entire query, keeping any fragment.
fn strip_query(url: &str) -> Option<String> {
    let q = url.find('?')?;
    let fragment = url[q + 1..].find('#').map(|rel| &url[q + 1 + rel..]);
    let mut out = String::with_capacity(url.len());
    out.push_str(&url[..q]);
    if let Some(fragment) = fragment {
        out.push_str(fragment);
    }
    Some(out)
}

// --------------------------
// Candidate gathering
// --------------------------

/// Fills `scratch.candidates` from the domain index, the token index, and
/// (only when nothing else fired) the fallback bucket.
pub(super) fn gather(active: &ActiveSnapshot, ctx: &RequestContext<'_>, scratch: &mut MatchScratch) {
    let snapshot = &active.snapshot;
    fill_suffix_hashes(active, ctx, scratch);

    // Host-only rules via the request host's suffix walk.
    let mut postings = std::mem::take(&mut scratch.postings);
    for i in 0..scratch.req_suffixes.len() {
        let hash = scratch.req_suffixes[i];
        for lookup in [
            snapshot.domain_allow_lookup(hash),
            snapshot.domain_block_lookup(hash),
        ] {
            let offset = match lookup {
                Some(offset) => offset,
                None => continue,
            };
            snapshot.decode_domain_postings(offset, &mut postings);
            for &rule_id in &postings {
                if verify_rule(active, rule_id, ctx, scratch, false) {
                    push_candidate(snapshot, rule_id, scratch);
                }
            }
        }
    }

    // Pattern rules via the rarest URL token.
    url::tokenize_into(ctx.url, &mut scratch.tokens);
    let mut best: Option<(usize, usize)> = None;
    for &token in scratch.tokens.as_slice() {
        if let Some((offset, count)) = snapshot.token_lookup(token) {
            if best.map_or(true, |(_, best_count)| count < best_count) {
                best = Some((offset, count));
            }
        }
    }
    if let Some((offset, count)) = best {
        snapshot.decode_token_postings(offset, count, &mut postings);
        for &rule_id in &postings {
            if verify_rule(active, rule_id, ctx, scratch, true) {
                push_candidate(snapshot, rule_id, scratch);
            }
        }
    }
    scratch.postings = postings;

    // Unindexable rules only get a look when nothing else produced one.
    if scratch.candidates.is_empty() {
        scan_fallback(active, ctx, scratch);
    }
}

/// Folds the fallback bucket into the candidates, at most once per request.
pub(super) fn scan_fallback(
    active: &ActiveSnapshot,
    ctx: &RequestContext<'_>,
    scratch: &mut MatchScratch,
) {
    if scratch.fallback_scanned || active.snapshot.fallback_rule_count() == 0 {
        return;
    }
    scratch.fallback_scanned = true;

    let mut postings = std::mem::take(&mut scratch.postings);
    active.snapshot.decode_fallback_rules(&mut postings);
    for &rule_id in &postings {
        if verify_rule(active, rule_id, ctx, scratch, true) {
            push_candidate(&active.snapshot, rule_id, scratch);
        }
    }
    scratch.postings = postings;
}

fn fill_suffix_hashes(_active: &ActiveSnapshot, ctx: &RequestContext<'_>, scratch: &mut MatchScratch) {
    if !scratch.req_suffixes.is_empty() || !scratch.doc_suffixes.is_empty() {
        return;
    }
    let req_start = ctx.req_host.len() - ctx.req_etld1.len();
    for suffix in SuffixWalk::new(ctx.req_host, req_start) {
        scratch.req_suffixes.push(hash_domain(suffix));
    }
    if ctx.doc_host == ctx.req_host {
        scratch.doc_suffixes.extend_from_slice(&scratch.req_suffixes);
    } else {
        let doc_start = ctx.doc_host.len() - ctx.doc_etld1.len();
        for suffix in SuffixWalk::new(ctx.doc_host, doc_start) {
            scratch.doc_suffixes.push(hash_domain(suffix));
        }
    }
}

fn push_candidate(snapshot: &LoadedSnapshot, rule_id: u32, scratch: &mut MatchScratch) {
    let id = rule_id as usize;
    if scratch.candidates.iter().any(|c| c.rule_id == rule_id) {
        return;
    }
    let action = RuleAction::try_from(snapshot.rule_action(id)).unwrap_or(RuleAction::Block);
    scratch.candidates.push(Candidate {
        rule_id,
        action,
        flags: snapshot.rule_flags(id),
        priority: snapshot.rule_priority(id),
    });
}

/// Full per-rule verification: masks, domain constraints, and (for indexed
/// pattern rules) the bytecode walk.
fn verify_rule(
    active: &ActiveSnapshot,
    rule_id: u32,
    ctx: &RequestContext<'_>,
    scratch: &MatchScratch,
    check_pattern: bool,
) -> bool {
    let snapshot = &active.snapshot;
    let id = rule_id as usize;

    let type_mask = snapshot.rule_type_mask(id);
    if type_mask != 0 && type_mask & ctx.type_mask.bits() == 0 {
        return false;
    }
    let party_mask = snapshot.rule_party_mask(id);
    if party_mask != 0 {
        let request_party = if ctx.third_party { 0b10 } else { 0b01 };
        if party_mask & request_party == 0 {
            return false;
        }
    }
    let scheme_mask = snapshot.rule_scheme_mask(id);
    if scheme_mask != 0 && scheme_mask & ctx.scheme.bits() == 0 {
        return false;
    }

    if !check_constraint_offset(snapshot, snapshot.rule_constraint_offset(id), &scratch.doc_suffixes)
    {
        return false;
    }

    if check_pattern {
        let pattern_id = snapshot.rule_pattern_id(id);
        if pattern_id != NO_PATTERN {
            let entry = match snapshot.pattern(pattern_id as usize) {
                Some(entry) => entry,
                None => return false,
            };
            let regex = active
                .regexes
                .get(pattern_id as usize)
                .and_then(|r| r.as_ref());
            let pctx = PatternCtx {
                url: ctx.url.as_bytes(),
                host_start: ctx.host_start,
                host_end: ctx.host_end,
                req_suffix_hashes: &scratch.req_suffixes,
            };
            if !pattern::verify(snapshot, &entry, regex, &pctx) {
                return false;
            }
        }
    }

    true
}

/// `$domain=` check: the document host's suffix walk must contain an include
/// hash (when any exist) and no exclude hash.
pub(super) fn check_constraint_offset(
    snapshot: &LoadedSnapshot,
    offset: u32,
    doc_suffixes: &[crate::hash::Hash64],
) -> bool {
    let (include, exclude) = match snapshot.constraint_lists(offset) {
        Some(lists) => lists,
        None => return true,
    };

    if !include.is_empty() {
        let mut hit = false;
        for h in doc_suffixes {
            if raw_list_contains(include, *h) {
                hit = true;
                break;
            }
        }
        if !hit {
            return false;
        }
    }
    if !exclude.is_empty() {
        for h in doc_suffixes {
            if raw_list_contains(exclude, *h) {
                return false;
            }
        }
    }
    true
}

fn raw_list_contains(list: &[u8], hash: crate::hash::Hash64) -> bool {
    let mut pos = 0;
    while pos + 8 <= list.len() {
        let lo = u32::from_le_bytes([list[pos], list[pos + 1], list[pos + 2], list[pos + 3]]);
        let hi = u32::from_le_bytes([list[pos + 4], list[pos + 5], list[pos + 6], list[pos + 7]]);
        if lo == hash.lo && hi == hash.hi {
            return true;
        }
        pos += 8;
    }
    false
}

// --------------------------
// Precedence and redirects
// --------------------------

/// IMPORTANT BLOCK > ALLOW > BLOCK > default allow, ties by priority then
/// stable rule id. Redirect directives decorate a BLOCK outcome only.
fn resolve_static(active: &ActiveSnapshot, scratch: &MatchScratch) -> CachedDecision {
    let snapshot = &active.snapshot;

    let mut best_important: Option<&Candidate> = None;
    let mut best_allow: Option<&Candidate> = None;
    let mut best_block: Option<&Candidate> = None;

    for c in &scratch.candidates {
        match c.action {
            RuleAction::Block => {
                if c.flags & RuleFlags::IMPORTANT.bits() != 0 {
                    take_better(&mut best_important, c);
                } else {
                    take_better(&mut best_block, c);
                }
            }
            RuleAction::Allow => {
                if c.flags & SCOPED_ALLOW != 0 {
                    continue;
                }
                // Option-targeted exceptions (removeparam and friends) do not
                // allow the request itself.
                if snapshot.rule_option_id(c.rule_id as usize) != NO_OPTION {
                    continue;
                }
                take_better(&mut best_allow, c);
            }
            _ => {}
        }
    }

    let blocked = match (best_important, best_allow, best_block) {
        (Some(important), _, _) => Some(important),
        (None, Some(allow), _) => {
            return CachedDecision {
                decision: Decision::Allow,
                rule_id: allow.rule_id as i32,
                list_id: snapshot.rule_list_id(allow.rule_id as usize),
                redirect_option: NO_OPTION,
            };
        }
        (None, None, Some(block)) => Some(block),
        (None, None, None) => None,
    };

    let block = match blocked {
        Some(block) => block,
        None => return CachedDecision::default(),
    };

    // A4: redirect semantics apply only to a blocked outcome.
    let redirect_option = resolve_redirect(active, scratch);
    CachedDecision {
        decision: if redirect_option != NO_OPTION {
            Decision::Redirect
        } else {
            Decision::Block
        },
        rule_id: block.rule_id as i32,
        list_id: snapshot.rule_list_id(block.rule_id as usize),
        redirect_option,
    }
}

fn take_better<'a>(slot: &mut Option<&'a Candidate>, c: &'a Candidate) {
    let better = match slot {
        None => true,
        Some(cur) => {
            c.priority > cur.priority || (c.priority == cur.priority && c.rule_id < cur.rule_id)
        }
    };
    if better {
        *slot = Some(c);
    }
}

/// Picks the winning redirect directive, honoring `redirect-rule` exceptions
/// per resource. Returns `NO_OPTION` when nothing (usable) matched.
fn resolve_redirect(active: &ActiveSnapshot, scratch: &MatchScratch) -> u32 {
    let snapshot = &active.snapshot;

    let mut excepted: Vec<u32> = Vec::new();
    for c in &scratch.candidates {
        if c.action == RuleAction::Allow
            && c.flags & RuleFlags::REDIRECT_RULE_EXCEPTION.bits() != 0
        {
            let option = snapshot.rule_option_id(c.rule_id as usize);
            if option != NO_OPTION {
                excepted.push(option);
            }
        }
    }

    let mut best: Option<&Candidate> = None;
    for c in &scratch.candidates {
        if c.action != RuleAction::RedirectDirective {
            continue;
        }
        let option = snapshot.rule_option_id(c.rule_id as usize);
        if option == NO_OPTION || excepted.contains(&option) {
            continue;
        }
        take_better(&mut best, c);
    }

    match best {
        Some(c) => {
            let option = snapshot.rule_option_id(c.rule_id as usize);
            // Missing resource: fall back to a plain cancel.
            if snapshot.redirect_resource(option).is_some() {
                option
            } else {
                NO_OPTION
            }
        }
        None => NO_OPTION,
    }
}

// --------------------------
// Decision cache plumbing
// --------------------------

fn cache_key(ctx: &RequestContext<'_>) -> u64 {
    let mut buf = [0u8; 30];
    buf[..8].copy_from_slice(&hash64(ctx.doc_etld1.as_bytes()).to_u64().to_le_bytes());
    buf[8..16].copy_from_slice(&hash64(ctx.req_etld1.as_bytes()).to_u64().to_le_bytes());
    buf[16..20].copy_from_slice(&ctx.type_mask.bits().to_le_bytes());
    buf[20] = ctx.third_party as u8;
    buf[21] = ctx.scheme.bits();
    buf[22..30].copy_from_slice(&hash64(ctx.url.as_bytes()).to_u64().to_le_bytes());
    hash64(&buf).to_u64()
}

fn materialize(active: &ActiveSnapshot, cached: &CachedDecision) -> MatchVerdict {
    let redirect_url = if cached.redirect_option != NO_OPTION {
        active
            .snapshot
            .redirect_resource(cached.redirect_option)
            .map(|r| r.path.to_string())
    } else {
        None
    };
    MatchVerdict {
        decision: cached.decision,
        rule_id: cached.rule_id,
        list_id: cached.list_id,
        redirect_url,
    }
}

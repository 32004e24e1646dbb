//! Response-header pipeline: `$header=` matching, CSP injection, and safe
//! header removal.
//!
//! Only document responses (main frame and subframes) are evaluated; every
//! other resource type returns the empty verdict untouched. Header removal
//! is restricted to a fixed allowlist — Content-Security-Policy is never
//! removable, which also keeps injected CSP directives intact.

use crate::api::{Header, HeaderVerdict, RequestInfo, RuleAction, RuleFlags, TypeMask};
use crate::snapshot::format::{scoped_flags, SectionId};
use crate::snapshot::loader::HeaderSpec;

use super::context::derive;
use super::network::{check_constraint_offset, gather};
use super::scratch::Candidate;
use super::Engine;

/// Headers a filter list may remove from a document response.
fn is_safe_to_remove(name: &str) -> bool {
    name.eq_ignore_ascii_case("location")
        || name.eq_ignore_ascii_case("refresh")
        || name.eq_ignore_ascii_case("report-to")
        || name.eq_ignore_ascii_case("set-cookie")
}

impl Engine {
    pub(super) fn run_match_response_headers(
        &mut self,
        req: &RequestInfo<'_>,
        headers: &[Header<'_>],
    ) -> HeaderVerdict {
        let active = match &self.active {
            Some(active) => active.clone(),
            None => return HeaderVerdict::empty(),
        };
        let ctx = match derive(req, Some(&active.psl), &mut self.etld1_cache) {
            Some(ctx) => ctx,
            None => return HeaderVerdict::empty(),
        };

        // Document gate.
        if !ctx.type_mask.intersects(TypeMask::DOCUMENT) {
            return HeaderVerdict::empty();
        }
        if !self.trusted.is_empty() && self.trusted.contains(ctx.doc_etld1) {
            return HeaderVerdict::empty();
        }

        self.scratch.reset();
        gather(&active, &ctx, &mut self.scratch);

        let snapshot = &active.snapshot;
        let mut verdict = HeaderVerdict::empty();

        // CSP resolution: collect injections and exception scopes.
        let mut csp_disabled = false;
        let mut injections: Vec<&str> = Vec::new();
        let mut csp_exceptions: Vec<&str> = Vec::new();

        // Header-match ladder state.
        let mut best_important: Option<&Candidate> = None;
        let mut best_allow: Option<&Candidate> = None;
        let mut best_block: Option<&Candidate> = None;

        for c in &self.scratch.candidates {
            let option = snapshot.rule_option_id(c.rule_id as usize);
            match c.action {
                RuleAction::CspInject => {
                    if let Some(spec) = snapshot.csp_spec(option) {
                        if !spec.is_empty() && !injections.contains(&spec) {
                            injections.push(spec);
                        }
                    }
                }
                RuleAction::Allow if c.flags & RuleFlags::CSP_EXCEPTION.bits() != 0 => {
                    match snapshot.csp_spec(option) {
                        Some("") | None => csp_disabled = true,
                        Some(spec) => csp_exceptions.push(spec),
                    }
                }
                RuleAction::HeaderMatchBlock | RuleAction::HeaderMatchAllow => {
                    let spec = match snapshot.header_spec(option) {
                        Some(spec) => spec,
                        None => continue,
                    };
                    if !header_matches(&spec, headers) {
                        continue;
                    }
                    if c.action == RuleAction::HeaderMatchAllow {
                        take_better(&mut best_allow, c);
                    } else if c.flags & RuleFlags::IMPORTANT.bits() != 0 {
                        take_better(&mut best_important, c);
                    } else {
                        take_better(&mut best_block, c);
                    }
                }
                _ => {}
            }
        }

        if !csp_disabled {
            for spec in injections {
                if !csp_exceptions.contains(&spec) {
                    verdict.csp.push(spec.to_string());
                }
            }
        }

        // Responseheader removal records, scoped by the document host.
        let mut removals: Vec<&str> = Vec::new();
        let mut removal_exceptions: Vec<&str> = Vec::new();
        for record in snapshot.scoped_records(SectionId::ResponseHeaderRules) {
            if !check_constraint_offset(snapshot, record.constraint_offset, &self.scratch.doc_suffixes)
            {
                continue;
            }
            if !is_safe_to_remove(record.text) {
                continue;
            }
            if record.flags & scoped_flags::EXCEPTION != 0 {
                removal_exceptions.push(record.text);
            } else if !removals.contains(&record.text) {
                removals.push(record.text);
            }
        }
        for name in removals {
            if !removal_exceptions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(name))
            {
                verdict.remove_headers.push(name.to_ascii_lowercase());
            }
        }

        // Cancellation ladder mirrors the request pipeline.
        if let Some(c) = best_important {
            verdict.cancel = true;
            verdict.rule_id = c.rule_id as i32;
            verdict.list_id = snapshot.rule_list_id(c.rule_id as usize);
            return verdict;
        }
        if best_allow.is_some() {
            if let Some(c) = best_allow {
                if best_block.is_some() {
                    verdict.rule_id = c.rule_id as i32;
                    verdict.list_id = snapshot.rule_list_id(c.rule_id as usize);
                }
            }
            return verdict;
        }
        if let Some(c) = best_block {
            verdict.cancel = true;
            verdict.rule_id = c.rule_id as i32;
            verdict.list_id = snapshot.rule_list_id(c.rule_id as usize);
        }
        verdict
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

/// Evaluates a `$header=` spec against the response headers.
///
/// Name matching is case-insensitive; a value spec is a case-insensitive
/// substring test. Negation inverts presence (no value) or the value test.
fn header_matches(spec: &HeaderSpec<'_>, headers: &[Header<'_>]) -> bool {
    let mut found = false;
    let mut value_matched = false;

    for header in headers {
        if !header.name.eq_ignore_ascii_case(spec.name) {
            continue;
        }
        found = true;
        if let Some(wanted) = spec.value {
            if contains_folded(header.value.as_bytes(), wanted.as_bytes()) {
                value_matched = true;
            }
        }
    }

    match spec.value {
        None => found != spec.negate,
        Some(_) => {
            if spec.negate {
                found && !value_matched
            } else {
                value_matched
            }
        }
    }
}

fn contains_folded(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    for start in 0..=haystack.len() - needle.len() {
        if haystack[start..start + needle.len()].eq_ignore_ascii_case(needle) {
            return true;
        }
    }
    false
}

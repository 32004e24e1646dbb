//! Cosmetic resolution: hide selectors, procedural programs, scriptlets.
//!
//! Scope resolution walks the document host's suffixes against the
//! constraint-scoped record tables. Network-level `$elemhide` and
//! `$generichide` exceptions (gathered like any other candidate) switch off
//! all cosmetics or just the generic tier.

use crate::api::{CosmeticVerdict, RequestInfo, RuleAction, RuleFlags, ScriptletCall};
use crate::snapshot::format::{scoped_flags, SectionId};
use crate::snapshot::loader::ScopedRecord;

use super::context::derive;
use super::network::{check_constraint_offset, gather};
use super::Engine;

impl Engine {
    pub(super) fn run_match_cosmetics(&mut self, req: &RequestInfo<'_>) -> CosmeticVerdict {
        let active = match &self.active {
            Some(active) => active.clone(),
            None => return CosmeticVerdict::default(),
        };
        let ctx = match derive(req, Some(&active.psl), &mut self.etld1_cache) {
            Some(ctx) => ctx,
            None => return CosmeticVerdict::default(),
        };
        if !self.trusted.is_empty() && self.trusted.contains(ctx.doc_etld1) {
            return CosmeticVerdict::default();
        }

        self.scratch.reset();
        gather(&active, &ctx, &mut self.scratch);

        let snapshot = &active.snapshot;
        let mut elemhide = false;
        let mut generichide = false;
        for c in &self.scratch.candidates {
            if c.action != RuleAction::Allow {
                continue;
            }
            if c.flags & RuleFlags::ELEMHIDE.bits() != 0 {
                elemhide = true;
            }
            if c.flags & RuleFlags::GENERICHIDE.bits() != 0 {
                generichide = true;
            }
        }

        let mut verdict = CosmeticVerdict {
            enable_generic: !elemhide && !generichide,
            ..CosmeticVerdict::default()
        };

        if !elemhide {
            let selectors =
                self.resolve_scoped(&active.snapshot, SectionId::CosmeticRules, generichide);
            if !selectors.is_empty() {
                verdict.css = format!("{}{{display:none !important;}}", selectors.join(",\n"));
            }

            verdict.procedural = self
                .resolve_scoped(&active.snapshot, SectionId::ProceduralRules, generichide)
                .into_iter()
                .map(|s| s.to_string())
                .collect();
        } else {
            verdict.css = String::new();
        }

        // Scriptlets are site-specific only; a matching empty exception
        // disables injection for the whole document.
        if !elemhide {
            let mut calls: Vec<&str> = Vec::new();
            let mut exceptions: Vec<&str> = Vec::new();
            let mut disable_all = false;
            for record in snapshot.scoped_records(SectionId::ScriptletRules) {
                if !self.record_in_scope(&active.snapshot, &record) {
                    continue;
                }
                let is_exception = record.flags & scoped_flags::EXCEPTION != 0;
                let is_generic = record.flags & scoped_flags::GENERIC != 0;
                if is_exception && record.text.is_empty() {
                    disable_all = true;
                    continue;
                }
                if is_generic {
                    // No generic scriptlets exist; generic non-empty records
                    // are compile leftovers and stay inert.
                    continue;
                }
                if is_exception {
                    exceptions.push(record.text);
                } else if !calls.contains(&record.text) {
                    calls.push(record.text);
                }
            }
            if !disable_all {
                for raw in calls {
                    if exceptions.contains(&raw) {
                        continue;
                    }
                    if let Some(call) = parse_scriptlet_call(raw) {
                        verdict.scriptlets.push(call);
                    }
                }
            }
        }

        verdict
    }

    /// Union of in-scope hide rules minus in-scope exceptions for one record
    /// table, respecting the generic gate. Returned in record order.
    fn resolve_scoped<'a>(
        &self,
        snapshot: &'a crate::snapshot::LoadedSnapshot,
        section: SectionId,
        generichide: bool,
    ) -> Vec<&'a str> {
        let mut kept: Vec<&str> = Vec::new();
        let mut exceptions: Vec<&str> = Vec::new();

        for record in snapshot.scoped_records(section) {
            if !self.record_in_scope(snapshot, &record) {
                continue;
            }
            let is_exception = record.flags & scoped_flags::EXCEPTION != 0;
            let is_generic = record.flags & scoped_flags::GENERIC != 0;
            if is_exception {
                exceptions.push(record.text);
            } else if is_generic && generichide {
                continue;
            } else if !kept.contains(&record.text) {
                kept.push(record.text);
            }
        }

        kept.retain(|s| !exceptions.contains(s));
        kept
    }

    fn record_in_scope(
        &self,
        snapshot: &crate::snapshot::LoadedSnapshot,
        record: &ScopedRecord<'_>,
    ) -> bool {
        check_constraint_offset(snapshot, record.constraint_offset, &self.scratch.doc_suffixes)
    }
}

/// Splits `name, arg1, arg2` into a call. Empty bodies are not calls.
fn parse_scriptlet_call(raw: &str) -> Option<ScriptletCall> {
    let mut parts = raw.split(',').map(str::trim);
    let name = parts.next().filter(|n| !n.is_empty())?;
    Some(ScriptletCall {
        name: name.to_string(),
        args: parts
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scriptlet_call_parsing() {
        let call = parse_scriptlet_call("set-constant, adsEnabled, false").unwrap();
        assert_eq!(call.name, "set-constant");
        assert_eq!(call.args, vec!["adsEnabled", "false"]);

        let bare = parse_scriptlet_call("no-fetch-if").unwrap();
        assert_eq!(bare.name, "no-fetch-if");
        assert!(bare.args.is_empty());

        assert!(parse_scriptlet_call("").is_none());
        assert!(parse_scriptlet_call("  ,x").is_none());
    }
}

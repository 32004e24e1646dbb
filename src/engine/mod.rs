//! The filtering engine: one value owning the active snapshot, the PSL,
//! trusted sites, caches, and scratch state.
//!
//! Lifecycle: `Empty -> Loaded -> Loaded' -> ... -> Empty`. [`Engine::install`]
//! validates a new snapshot off the hot path, swaps the single `Arc`
//! indirection, and clears the decision cache; an in-flight reference keeps
//! the previous image alive until it drops. The empty state answers ALLOW
//! for every query.
//!
//! Every public entry point is fail-open: an internal panic is caught,
//! logged at warning level, and reported as the neutral verdict. The host
//! hot path never sees an error.

mod context;
mod cosmetic;
mod guard;
mod headers;
mod network;
mod pattern;
mod scratch;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use regex::bytes::RegexBuilder;
use tracing::warn;

use crate::api::{
    CosmeticVerdict, Decision, DynamicFilter, EngineConfig, Header, HeaderVerdict, MatchVerdict,
    RequestInfo, SnapshotInfo,
};
use crate::psl::{etld1_of, PslSets};
use crate::snapshot::format::{pattern_flags, PatternAnchor, NO_OPTION};
use crate::snapshot::{LoadedSnapshot, SnapshotError};
use crate::stdx::Lru;

use guard::RemoveparamGuard;
use scratch::MatchScratch;

/// A validated snapshot plus everything derived from it at install time.
pub struct ActiveSnapshot {
    pub(crate) snapshot: LoadedSnapshot,
    pub(crate) psl: PslSets,
    /// Regex side table indexed by pattern id; `None` for non-regex patterns
    /// and for sources that failed to compile.
    pub(crate) regexes: Vec<Option<regex::bytes::Regex>>,
}

/// Cached outcome of the static-filtering stage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CachedDecision {
    pub decision: Decision,
    pub rule_id: i32,
    pub list_id: u16,
    pub redirect_option: u32,
}

impl Default for CachedDecision {
    fn default() -> Self {
        Self {
            decision: Decision::Allow,
            rule_id: -1,
            list_id: 0,
            redirect_option: NO_OPTION,
        }
    }
}

/// The content-filtering engine. Construct one per profile; there is no
/// global state, and tests build their own.
pub struct Engine {
    pub(crate) active: Option<Arc<ActiveSnapshot>>,
    pub(crate) trusted: HashSet<String, ahash::RandomState>,
    pub(crate) dynamic: Option<Box<dyn DynamicFilter>>,
    pub(crate) decision_cache: Lru<u64, CachedDecision>,
    pub(crate) etld1_cache: Lru<u64, u32>,
    pub(crate) guard: RemoveparamGuard,
    pub(crate) scratch: MatchScratch,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            active: None,
            trusted: HashSet::default(),
            dynamic: None,
            decision_cache: Lru::new(config.decision_cache_entries),
            etld1_cache: Lru::new(config.etld1_cache_entries),
            guard: RemoveparamGuard::new(Duration::from_millis(config.removeparam_guard_ttl_ms)),
            scratch: MatchScratch::new(),
        }
    }

    /// Validates and installs a snapshot image, swapping out any previous
    /// one. On failure the previous snapshot stays active.
    pub fn install(&mut self, bytes: Vec<u8>) -> Result<(), SnapshotError> {
        let snapshot = LoadedSnapshot::load(bytes)?;
        let psl = snapshot.load_psl();
        let regexes = compile_regexes(&snapshot);

        self.active = Some(Arc::new(ActiveSnapshot {
            snapshot,
            psl,
            regexes,
        }));
        // A swapped snapshot invalidates both caches: decisions reference
        // rule ids, and the PSL may have changed registrable boundaries.
        self.decision_cache.clear();
        self.etld1_cache.clear();
        Ok(())
    }

    /// [`Engine::install`] under its host-facing name.
    pub fn init(&mut self, bytes: Vec<u8>) -> Result<(), SnapshotError> {
        self.install(bytes)
    }

    /// Returns to the empty state; every query answers ALLOW again.
    pub fn reset(&mut self) {
        self.active = None;
        self.decision_cache.clear();
        self.etld1_cache.clear();
        self.guard.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    pub fn snapshot_info(&self) -> SnapshotInfo {
        match &self.active {
            Some(active) => SnapshotInfo {
                initialized: true,
                size: active.snapshot.size(),
                build_id: active.snapshot.build_id(),
                rule_count: active.snapshot.rule_count() as u32,
            },
            None => SnapshotInfo::default(),
        }
    }

    /// Decides one network request. Never fails; internal errors allow.
    pub fn match_request(&mut self, req: &RequestInfo<'_>) -> MatchVerdict {
        match catch_unwind(AssertUnwindSafe(|| self.run_match_request(req))) {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(url = req.url, request_id = req.request_id, "match_request failed; allowing");
                self.scratch.reset();
                MatchVerdict::default()
            }
        }
    }

    /// Evaluates the response-header pipeline for a document response.
    pub fn match_response_headers(
        &mut self,
        req: &RequestInfo<'_>,
        headers: &[Header<'_>],
    ) -> HeaderVerdict {
        match catch_unwind(AssertUnwindSafe(|| {
            self.run_match_response_headers(req, headers)
        })) {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(url = req.url, "match_response_headers failed; passing through");
                self.scratch.reset();
                HeaderVerdict::empty()
            }
        }
    }

    /// Resolves cosmetics for a document.
    pub fn match_cosmetics(&mut self, req: &RequestInfo<'_>) -> CosmeticVerdict {
        match catch_unwind(AssertUnwindSafe(|| self.run_match_cosmetics(req))) {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(url = req.url, "match_cosmetics failed; returning empty");
                self.scratch.reset();
                CosmeticVerdict::default()
            }
        }
    }

    /// Registrable domain of `host` under the active snapshot's PSL.
    pub fn etld1(&self, host: &str) -> String {
        let lowered = host.trim_end_matches('.').to_ascii_lowercase();
        let psl = self.active.as_ref().map(|a| &a.psl);
        etld1_of(&lowered, psl).to_string()
    }

    /// Adds a site (any host form) to the trusted set by registrable domain.
    pub fn add_trusted_site(&mut self, site: &str) {
        let etld1 = self.etld1(site);
        self.trusted.insert(etld1);
    }

    pub fn remove_trusted_site(&mut self, site: &str) {
        let etld1 = self.etld1(site);
        self.trusted.remove(&etld1);
    }

    /// Installs the host's dynamic-filtering hook (stage A1).
    pub fn set_dynamic_filter(&mut self, hook: Option<Box<dyn DynamicFilter>>) {
        self.dynamic = hook;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Builds the regex side table. A source that fails to compile is logged and
/// left as a hole: the rule simply never matches.
fn compile_regexes(snapshot: &LoadedSnapshot) -> Vec<Option<regex::bytes::Regex>> {
    let count = snapshot.pattern_count();
    let mut regexes = Vec::with_capacity(count);
    for id in 0..count {
        let compiled = snapshot.pattern(id).and_then(|entry| {
            if entry.anchor != PatternAnchor::Regex {
                return None;
            }
            let source = std::str::from_utf8(snapshot.program(&entry)).ok()?;
            let case_insensitive = entry.flags & pattern_flags::MATCH_CASE == 0;
            match RegexBuilder::new(source)
                .case_insensitive(case_insensitive)
                .size_limit(1 << 20)
                .build()
            {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = id, %err, "regex pattern rejected at install");
                    None
                }
            }
        });
        regexes.push(compiled);
    }
    regexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompileOptions;
    use crate::compiler::compile_filter_lists;

    fn engine_with(lists: &[&str]) -> Engine {
        let out = compile_filter_lists(lists, &CompileOptions::default()).expect("compile");
        let mut engine = Engine::default();
        engine.install(out.snapshot_bytes).expect("install");
        engine
    }

    fn request<'a>(url: &'a str, type_name: &'a str, initiator: Option<&'a str>) -> RequestInfo<'a> {
        RequestInfo {
            url,
            type_name,
            initiator,
            tab_id: 1,
            frame_id: 0,
            request_id: 1,
        }
    }

    #[test]
    fn empty_engine_allows_everything() {
        let mut engine = Engine::default();
        assert!(!engine.is_initialized());
        let verdict = engine.match_request(&request("https://ads.test/x.js", "script", None));
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(verdict.rule_id, -1);
    }

    #[test]
    fn install_rejects_garbage_and_keeps_previous() {
        let mut engine = engine_with(&["||blocked.test^"]);
        let before = engine.snapshot_info();
        assert!(engine.install(vec![0u8; 16]).is_err());
        // Previous snapshot still active and still blocking.
        assert_eq!(engine.snapshot_info().size, before.size);
        let verdict = engine.match_request(&request(
            "https://blocked.test/x.js",
            "script",
            Some("https://site.test/"),
        ));
        assert_eq!(verdict.decision, Decision::Block);
    }

    #[test]
    fn swap_clears_decision_cache() {
        let mut engine = engine_with(&["||blocked.test^"]);
        let req = request("https://blocked.test/x.js", "script", Some("https://site.test/"));
        assert_eq!(engine.match_request(&req).decision, Decision::Block);
        // Same request again: served from cache, same answer.
        assert_eq!(engine.match_request(&req).decision, Decision::Block);

        let out =
            compile_filter_lists(&["||other.test^"], &CompileOptions::default()).expect("compile");
        engine.install(out.snapshot_bytes).expect("install");
        assert_eq!(engine.match_request(&req).decision, Decision::Allow);
    }

    #[test]
    fn trusted_site_bypasses_blocking() {
        let mut engine = engine_with(&["||ads.test^"]);
        let req = request("https://ads.test/x.js", "script", Some("https://shop.example.com/"));
        assert_eq!(engine.match_request(&req).decision, Decision::Block);

        engine.add_trusted_site("www.shop.example.com");
        assert_eq!(engine.match_request(&req).decision, Decision::Allow);

        engine.remove_trusted_site("shop.example.com");
        assert_eq!(engine.match_request(&req).decision, Decision::Block);
    }

    #[test]
    fn etld1_is_idempotent_and_stable() {
        let engine = Engine::default();
        let once = engine.etld1("A.B.Example.COM");
        assert_eq!(once, "example.com");
        assert_eq!(engine.etld1(&once), once);
    }

    #[test]
    fn dynamic_filter_short_circuits() {
        struct BlockAll;
        impl DynamicFilter for BlockAll {
            fn evaluate(&self, _: &RequestInfo<'_>, _: &str, _: &str) -> crate::api::DynamicVerdict {
                crate::api::DynamicVerdict::Block
            }
        }

        let mut engine = engine_with(&["||unrelated.test^"]);
        engine.set_dynamic_filter(Some(Box::new(BlockAll)));

        let sub = request("https://fine.test/x.js", "script", Some("https://site.test/"));
        assert_eq!(engine.match_request(&sub).decision, Decision::Block);

        // Broad dynamic blocks never cancel top-level navigations.
        let main = request("https://fine.test/", "main_frame", None);
        assert_eq!(engine.match_request(&main).decision, Decision::Allow);
    }

    #[test]
    fn regex_rules_match_via_side_table() {
        let mut engine = engine_with(&[r"/ads[0-9]+\.js/"]);
        let hit = request("https://cdn.test/ads123.js", "script", Some("https://site.test/"));
        assert_eq!(engine.match_request(&hit).decision, Decision::Block);
        let miss = request("https://cdn.test/ads.js", "script", Some("https://site.test/"));
        assert_eq!(engine.match_request(&miss).decision, Decision::Allow);
    }
}

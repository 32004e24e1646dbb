//! Public API data types for the filtering engine and the list compiler.
//!
//! Purpose: the shared request/verdict/configuration structs used by the
//! engine and its callers. These types are intentionally behavior-free; the
//! engine and compiler perform all validation and enforcement.
//!
//! # Invariants
//! - `Decision` discriminants are the wire encoding (ALLOW=0, BLOCK=1,
//!   REDIRECT=2, REMOVEPARAM=3) and must not be reordered.
//! - Mask bit layouts are shared with the snapshot format; a mask of zero in a
//!   rule means "no restriction".
//! - `MatchVerdict::rule_id` is `-1` when no rule determined the decision.

use bitflags::bitflags;
use serde::Serialize;

// --------------------------
// Rule classification
// --------------------------

/// Action carried by a compiled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuleAction {
    /// Exception rule (`@@`).
    Allow = 0,
    /// Block rule.
    Block = 1,
    /// Redirect directive competing for a blocked request's surrogate.
    RedirectDirective = 2,
    /// Strip query parameters and redirect to the sanitized URL.
    Removeparam = 3,
    /// Append a Content-Security-Policy directive on document responses.
    CspInject = 4,
    /// Block when a response header matches.
    HeaderMatchBlock = 5,
    /// Exception for header-match blocking.
    HeaderMatchAllow = 6,
    /// Remove a response header on document responses.
    ResponseHeaderRemove = 7,
}

impl TryFrom<u8> for RuleAction {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Allow),
            1 => Ok(Self::Block),
            2 => Ok(Self::RedirectDirective),
            3 => Ok(Self::Removeparam),
            4 => Ok(Self::CspInject),
            5 => Ok(Self::HeaderMatchBlock),
            6 => Ok(Self::HeaderMatchAllow),
            7 => Ok(Self::ResponseHeaderRemove),
            _ => Err(()),
        }
    }
}

bitflags! {
    /// Behavior flags stored per rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RuleFlags: u16 {
        /// `$important`: defeats exception rules.
        const IMPORTANT = 1 << 0;
        /// Pattern is a regular expression (`/re/`).
        const IS_REGEX = 1 << 1;
        /// `$match-case`: byte-exact pattern comparison.
        const MATCH_CASE = 1 << 2;
        /// Block half of a `$redirect=` rule.
        const FROM_REDIRECT = 1 << 3;
        /// `@@...$redirect-rule=`: disables a directive without allowing.
        const REDIRECT_RULE_EXCEPTION = 1 << 4;
        /// `@@...$csp`: exception scope for CSP injection.
        const CSP_EXCEPTION = 1 << 5;
        /// `$elemhide` exception scope.
        const ELEMHIDE = 1 << 6;
        /// `$generichide` exception scope.
        const GENERICHIDE = 1 << 7;
        /// Pattern ended with `|`.
        const HAS_RIGHT_ANCHOR = 1 << 8;
        /// Pattern started with `||`.
        const HAS_HOST_ANCHOR = 1 << 9;
        /// Pattern started with `|`.
        const HAS_LEFT_ANCHOR = 1 << 10;
    }
}

bitflags! {
    /// Resource-type mask. A request carries exactly one bit; a rule carries
    /// the union it applies to (zero = all types).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeMask: u32 {
        const OTHER = 1 << 0;
        const SCRIPT = 1 << 1;
        const IMAGE = 1 << 2;
        const STYLESHEET = 1 << 3;
        const OBJECT = 1 << 4;
        const SUBDOCUMENT = 1 << 5;
        const MAIN_FRAME = 1 << 6;
        const XHR = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const FONT = 1 << 9;
        const MEDIA = 1 << 10;
        const PING = 1 << 11;

        const DOCUMENT = Self::MAIN_FRAME.bits() | Self::SUBDOCUMENT.bits();
        const ALL = 0xFFFF;
    }
}

impl TypeMask {
    /// Maps a WebRequest-style type string. Unknown strings are `other`.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "main_frame" => Self::MAIN_FRAME,
            "sub_frame" => Self::SUBDOCUMENT,
            "script" => Self::SCRIPT,
            "stylesheet" => Self::STYLESHEET,
            "image" => Self::IMAGE,
            "font" => Self::FONT,
            "object" => Self::OBJECT,
            "xmlhttprequest" => Self::XHR,
            "ping" => Self::PING,
            "media" => Self::MEDIA,
            "websocket" => Self::WEBSOCKET,
            _ => Self::OTHER,
        }
    }
}

bitflags! {
    /// First-party / third-party mask (zero = both).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PartyMask: u8 {
        const FIRST_PARTY = 1 << 0;
        const THIRD_PARTY = 1 << 1;
        const ALL = Self::FIRST_PARTY.bits() | Self::THIRD_PARTY.bits();
    }
}

bitflags! {
    /// URL scheme mask (zero = any scheme).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SchemeMask: u8 {
        const HTTP = 1 << 0;
        const HTTPS = 1 << 1;
        const WS = 1 << 2;
        const WSS = 1 << 3;
        const DATA = 1 << 4;
        const FTP = 1 << 5;
        const ALL = 0x3F;
    }
}

// --------------------------
// Requests and verdicts
// --------------------------

/// One network request as the host interception layer sees it.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Full request URL.
    pub url: &'a str,
    /// WebRequest resource type name (`script`, `image`, ...). Unknown names
    /// are treated as `other`.
    pub type_name: &'a str,
    /// Initiator/document URL, absent for top-level navigations.
    pub initiator: Option<&'a str>,
    pub tab_id: i32,
    pub frame_id: i32,
    /// Host-assigned id, carried through for logging only.
    pub request_id: u64,
}

/// Final decision for a network request. Discriminants are the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Decision {
    Allow = 0,
    Block = 1,
    Redirect = 2,
    Removeparam = 3,
}

impl Serialize for Decision {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Result of [`Engine::match_request`](crate::engine::Engine::match_request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchVerdict {
    pub decision: Decision,
    /// Rule that determined the decision, `-1` if none.
    pub rule_id: i32,
    /// Provenance of the deciding rule.
    pub list_id: u16,
    /// Present only for `Redirect` and `Removeparam`.
    pub redirect_url: Option<String>,
}

impl Default for MatchVerdict {
    fn default() -> Self {
        Self {
            decision: Decision::Allow,
            rule_id: -1,
            list_id: 0,
            redirect_url: None,
        }
    }
}

/// One response header, name and value as received.
#[derive(Debug, Clone, Copy)]
pub struct Header<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

/// Result of the response-header pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderVerdict {
    /// Cancel the response entirely.
    pub cancel: bool,
    pub rule_id: i32,
    pub list_id: u16,
    /// CSP directives to append to the response.
    pub csp: Vec<String>,
    /// Header names to drop (always from the safe allowlist).
    pub remove_headers: Vec<String>,
}

impl HeaderVerdict {
    pub fn empty() -> Self {
        Self {
            rule_id: -1,
            ..Self::default()
        }
    }
}

/// A scriptlet injection request: name plus positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptletCall {
    pub name: String,
    pub args: Vec<String>,
}

/// Result of cosmetic resolution for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CosmeticVerdict {
    /// Combined stylesheet text hiding all resolved selectors.
    pub css: String,
    /// False when `$generichide` applies to this document.
    pub enable_generic: bool,
    /// Procedural cosmetic programs, passed through verbatim.
    pub procedural: Vec<String>,
    /// Hostname-scoped scriptlet invocations.
    pub scriptlets: Vec<ScriptletCall>,
}

impl Default for CosmeticVerdict {
    fn default() -> Self {
        Self {
            css: String::new(),
            enable_generic: true,
            procedural: Vec::new(),
            scriptlets: Vec::new(),
        }
    }
}

/// Verdict of the host-provided dynamic-filtering matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicVerdict {
    Allow,
    Block,
    /// No opinion; fall through to static filtering.
    Noop,
}

/// Host hook evaluated between the trusted-site check and removeparam.
///
/// A `Block` verdict is ignored for main-frame requests: the hook interface
/// cannot convey rule breadth, and broad dynamic rules must never cancel a
/// top-level navigation.
pub trait DynamicFilter: Send {
    fn evaluate(&self, req: &RequestInfo<'_>, doc_etld1: &str, req_etld1: &str) -> DynamicVerdict;
}

/// Diagnostic summary of the active snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SnapshotInfo {
    pub initialized: bool,
    /// Size of the snapshot image in bytes (0 when empty).
    pub size: usize,
    pub build_id: u32,
    pub rule_count: u32,
}

// --------------------------
// Configuration
// --------------------------

/// Runtime tuning for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Decision-cache entries (cleared on every snapshot swap).
    pub decision_cache_entries: usize,
    /// eTLD+1 cache entries.
    pub etld1_cache_entries: usize,
    /// Removeparam redirect-loop suppression window, in milliseconds.
    pub removeparam_guard_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_cache_entries: 4096,
            etld1_cache_entries: 4096,
            removeparam_guard_ttl_ms: 1500,
        }
    }
}

// --------------------------
// Compile statistics
// --------------------------

/// Why a rule was skipped during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnknownOption,
    EmptyPattern,
    NonAsciiDomain,
    RegexTooLong,
    RegexTooComplex,
    ListTooLarge,
    TooManyRules,
    MalformedCosmetic,
    UnsupportedOption,
}

impl SkipReason {
    pub const COUNT: usize = 9;

    pub const fn index(self) -> usize {
        match self {
            Self::UnknownOption => 0,
            Self::EmptyPattern => 1,
            Self::NonAsciiDomain => 2,
            Self::RegexTooLong => 3,
            Self::RegexTooComplex => 4,
            Self::ListTooLarge => 5,
            Self::TooManyRules => 6,
            Self::MalformedCosmetic => 7,
            Self::UnsupportedOption => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::UnknownOption => "unknown_option",
            Self::EmptyPattern => "empty_pattern",
            Self::NonAsciiDomain => "non_ascii_domain",
            Self::RegexTooLong => "regex_too_long",
            Self::RegexTooComplex => "regex_too_complex",
            Self::ListTooLarge => "list_too_large",
            Self::TooManyRules => "too_many_rules",
            Self::MalformedCosmetic => "malformed_cosmetic",
            Self::UnsupportedOption => "unsupported_option",
        }
    }
}

/// Per-input-list compile counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListStats {
    pub list_id: u16,
    pub total_lines: usize,
    /// Rules recognized before badfilter folding and dedupe.
    pub rules_before: usize,
    /// Rules surviving into the snapshot.
    pub rules_after: usize,
    pub skipped: usize,
}

/// Aggregate compile counters returned alongside the snapshot bytes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileStats {
    pub rules_before: usize,
    pub rules_after: usize,
    pub rules_deduped: usize,
    /// Rules carrying `$badfilter` (dropped by definition).
    pub badfilter_rules: usize,
    /// Rules removed because a badfilter targeted them.
    pub badfiltered_rules: usize,
    /// Skip counts indexed by [`SkipReason::index`].
    pub skipped: [usize; SkipReason::COUNT],
    pub per_list: Vec<ListStats>,
}

impl CompileStats {
    pub fn skipped_total(&self) -> usize {
        self.skipped.iter().sum()
    }
}

/// Compiler output: a complete snapshot image plus statistics.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub snapshot_bytes: Vec<u8>,
    pub stats: CompileStats,
}

/// Ahead-of-time compiler configuration.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Public-suffix-list text (`publicsuffix.org` format). When absent the
    /// runtime falls back to a registrable-domain heuristic.
    pub psl_text: Option<String>,
    /// Emit whole-file and per-section CRC32 checksums.
    pub crc: bool,
    /// Opaque build identifier stored in the header.
    pub build_id: u32,
    /// Hard cap on surviving rules.
    pub max_rules: usize,
    /// Hard cap on bytes per input list.
    pub max_list_bytes: usize,
    /// Hard cap on regex pattern length.
    pub max_regex_len: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            psl_text: None,
            crc: true,
            build_id: 0,
            max_rules: 1 << 20,
            max_list_bytes: 64 << 20,
            max_regex_len: 256,
        }
    }
}

//! Content-filtering decision engine with ahead-of-time compiled rule sets.
//!
//! Filter lists in the ABP/uBO dialect are compiled into a single immutable
//! binary artifact (the UBX snapshot). At runtime the engine loads that
//! artifact behind zero-copy views and answers, per network request, whether
//! to allow, block, redirect to a packaged surrogate, or strip tracking
//! parameters — plus, per document, which selectors to hide and which
//! scriptlets to inject.
//!
//! High-level flow (one request):
//! 1) Derive the request context: hosts, registrable domains, party, masks.
//! 2) Trusted-site bypass, then the host's dynamic-filter hook.
//! 3) removeparam: sanitize the URL, guarded against redirect loops.
//! 4) Static filtering: suffix-walk the domain index, probe the token index
//!    with the rarest URL token, verify candidates (masks, `$domain=`
//!    constraints, pattern bytecode), resolve precedence.
//! 5) Redirect resolution when the outcome is a block.
//!
//! Compile flow: classify lines -> parse IR -> fold badfilters/duplicates ->
//! pick index tokens -> serialize sections -> checksum. Identical inputs
//! produce byte-identical snapshots.

pub mod api;
pub mod compiler;
pub mod engine;
pub mod hash;
pub mod psl;
pub mod snapshot;
pub mod stdx;
pub mod url;

pub use api::{
    CompileOptions, CompileOutput, CompileStats, CosmeticVerdict, Decision, DynamicFilter,
    DynamicVerdict, EngineConfig, Header, HeaderVerdict, MatchVerdict, RequestInfo, ScriptletCall,
    SkipReason, SnapshotInfo,
};
pub use compiler::{compile_filter_lists, CompileError};
pub use engine::Engine;
pub use snapshot::{LoadedSnapshot, SnapshotError};

//! Request context derivation.
//!
//! Turns the host layer's raw strings into the borrowed view the pipelines
//! consume: request/document hosts, registrable domains, party relationship,
//! type and scheme masks. All slices borrow from the incoming `RequestInfo`;
//! the eTLD+1 positions go through the engine's offset cache so repeated
//! hosts never re-walk the PSL.

use crate::api::{RequestInfo, SchemeMask, TypeMask};
use crate::hash::hash64;
use crate::psl::{etld1_start, PslSets};
use crate::stdx::Lru;
use crate::url;

/// Borrowed, derived view of one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub url: &'a str,
    pub req_host: &'a str,
    pub req_etld1: &'a str,
    pub doc_host: &'a str,
    pub doc_etld1: &'a str,
    pub third_party: bool,
    pub type_mask: TypeMask,
    pub scheme: SchemeMask,
    pub host_start: usize,
    pub host_end: usize,
    pub tab_id: i32,
    pub frame_id: i32,
}

/// Derives the context, or `None` when the URL has no usable host.
pub fn derive<'a>(
    req: &RequestInfo<'a>,
    psl: Option<&PslSets>,
    etld1_cache: &mut Lru<u64, u32>,
) -> Option<RequestContext<'a>> {
    let (host_start, host_end) = url::host_range(req.url)?;
    if host_start == host_end {
        return None;
    }
    let req_host = &req.url[host_start..host_end];
    let req_etld1 = cached_etld1(req_host, psl, etld1_cache);

    let type_mask = TypeMask::from_type_name(req.type_name);

    // The document of a top-level navigation is the request itself.
    let (doc_host, doc_etld1) = match req.initiator {
        Some(initiator) if !type_mask.contains(TypeMask::MAIN_FRAME) => {
            match url::host_of(initiator) {
                Some(host) => (host, cached_etld1(host, psl, etld1_cache)),
                None => (req_host, req_etld1),
            }
        }
        _ => (req_host, req_etld1),
    };

    let third_party =
        !req_etld1.is_empty() && !doc_etld1.is_empty() && !req_etld1.eq_ignore_ascii_case(doc_etld1);

    Some(RequestContext {
        url: req.url,
        req_host,
        req_etld1,
        doc_host,
        doc_etld1,
        third_party,
        type_mask,
        scheme: url::scheme_mask(req.url).unwrap_or(SchemeMask::empty()),
        host_start,
        host_end,
        tab_id: req.tab_id,
        frame_id: req.frame_id,
    })
}

/// eTLD+1 of `host` as a suffix slice, via the offset cache.
///
/// The cache is keyed by the 64-bit host hash; a collision would hand back a
/// wrong offset, so out-of-range offsets fall back to a recompute.
pub fn cached_etld1<'a>(
    host: &'a str,
    psl: Option<&PslSets>,
    cache: &mut Lru<u64, u32>,
) -> &'a str {
    let key = hash64(host.as_bytes()).to_u64();
    if let Some(&offset) = cache.get(&key) {
        let offset = offset as usize;
        if offset < host.len().max(1) && (offset == 0 || host.as_bytes()[offset - 1] == b'.') {
            return &host[offset..];
        }
    }
    let start = etld1_start_folded(host, psl);
    cache.insert(key, start as u32);
    &host[start..]
}

/// [`etld1_start`] over a host that may carry uppercase bytes. Hostnames from
/// `host_range` are usually lowercase already; fold lazily only when needed.
fn etld1_start_folded(host: &str, psl: Option<&PslSets>) -> usize {
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        let lowered = host.to_ascii_lowercase();
        etld1_start(&lowered, psl)
    } else {
        etld1_start(host, psl)
    }
}

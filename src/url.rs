//! Hot-path URL slicing.
//!
//! Everything here works on borrowed string slices; the only function that
//! allocates is [`remove_query_params`], which builds the rewritten URL a
//! removeparam decision redirects to. Tokenization writes into a caller-owned
//! fixed buffer so the request pipeline never grows a `Vec`.
//!
//! These are not general URL parsers: they implement exactly the slicing the
//! matcher needs (scheme end, host range, query split) and nothing else.

use crate::api::SchemeMask;
use crate::hash::token_hash;

/// Tokens considered per URL.
pub const MAX_URL_TOKENS: usize = 32;
/// Minimum alphanumeric run length that forms a token.
pub const MIN_TOKEN_LEN: usize = 3;

/// Fixed-capacity token buffer reused across requests.
#[derive(Debug, Clone)]
pub struct TokenBuf {
    hashes: [u32; MAX_URL_TOKENS],
    len: usize,
}

impl TokenBuf {
    pub const fn new() -> Self {
        Self {
            hashes: [0; MAX_URL_TOKENS],
            len: 0,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.hashes[..self.len]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    fn push(&mut self, hash: u32) -> bool {
        if self.len == MAX_URL_TOKENS {
            return false;
        }
        self.hashes[self.len] = hash;
        self.len += 1;
        true
    }
}

impl Default for TokenBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheme of a URL, or `None` when it is not a scheme the engine knows.
#[inline]
pub fn scheme_mask(url: &str) -> Option<SchemeMask> {
    let b = url.as_bytes();
    match b.first()?.to_ascii_lowercase() {
        b'h' => {
            if b.len() >= 8 && b[..8].eq_ignore_ascii_case(b"https://") {
                Some(SchemeMask::HTTPS)
            } else if b.len() >= 7 && b[..7].eq_ignore_ascii_case(b"http://") {
                Some(SchemeMask::HTTP)
            } else {
                None
            }
        }
        b'w' => {
            if b.len() >= 6 && b[..6].eq_ignore_ascii_case(b"wss://") {
                Some(SchemeMask::WSS)
            } else if b.len() >= 5 && b[..5].eq_ignore_ascii_case(b"ws://") {
                Some(SchemeMask::WS)
            } else {
                None
            }
        }
        b'd' => {
            if b.len() >= 5 && b[..5].eq_ignore_ascii_case(b"data:") {
                Some(SchemeMask::DATA)
            } else {
                None
            }
        }
        b'f' => {
            if b.len() >= 6 && b[..6].eq_ignore_ascii_case(b"ftp://") {
                Some(SchemeMask::FTP)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Position just past the scheme separator (`://`, or `:` for data URLs).
#[inline]
pub fn scheme_end(url: &str) -> Option<usize> {
    let b = url.as_bytes();
    let colon = memchr::memchr(b':', b)?;
    if b.len() > colon + 2 && b[colon + 1] == b'/' && b[colon + 2] == b'/' {
        return Some(colon + 3);
    }
    if colon >= 4 && b[..colon].eq_ignore_ascii_case(b"data") {
        return Some(colon + 1);
    }
    None
}

/// Byte range of the hostname inside `url`, skipping any userinfo, stopping
/// at the port, path, query, or fragment.
#[inline]
pub fn host_range(url: &str) -> Option<(usize, usize)> {
    let start = scheme_end(url)?;
    let b = url.as_bytes();

    let mut host_start = start;
    for (i, &c) in b[start..].iter().enumerate() {
        if c == b'@' {
            host_start = start + i + 1;
            break;
        }
        if c == b'/' || c == b'?' || c == b'#' {
            break;
        }
    }

    let mut host_end = b.len();
    for (i, &c) in b[host_start..].iter().enumerate() {
        if c == b'/' || c == b'?' || c == b'#' || c == b':' {
            host_end = host_start + i;
            break;
        }
    }

    Some((host_start, host_end))
}

/// Hostname slice of `url`, if it has one.
#[inline]
pub fn host_of(url: &str) -> Option<&str> {
    let (start, end) = host_range(url)?;
    if start == end {
        return None;
    }
    Some(&url[start..end])
}

/// ABP `^` separator test: end-of-string or any byte that is neither
/// alphanumeric nor `%`.
#[inline]
pub fn is_boundary_byte(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || b == b'%')
}

/// True when `pos` sits on a boundary of `s` in the ABP sense.
#[inline]
pub fn at_boundary(s: &str, pos: usize) -> bool {
    match s.as_bytes().get(pos) {
        None => true,
        Some(&b) => is_boundary_byte(b),
    }
}

/// Hashes the URL's index tokens into `out`: lowercased alphanumeric runs of
/// length >= [`MIN_TOKEN_LEN`], in order of appearance after the scheme,
/// capped at [`MAX_URL_TOKENS`].
pub fn tokenize_into(url: &str, out: &mut TokenBuf) {
    out.clear();
    let b = url.as_bytes();
    let start = scheme_end(url).unwrap_or(0);

    let mut lowered = [0u8; 64];
    let mut run = 0usize;

    for i in start..=b.len() {
        let c = if i < b.len() { b[i] } else { 0 };
        if i < b.len() && c.is_ascii_alphanumeric() {
            if run < lowered.len() {
                lowered[run] = c.to_ascii_lowercase();
            }
            run += 1;
            continue;
        }
        if run >= MIN_TOKEN_LEN && run <= lowered.len() && !out.push(token_hash(&lowered[..run])) {
            return;
        }
        run = 0;
    }
}

/// Splits a URL at its query: `(before '?', query, fragment-with-'#')`.
///
/// Returns `None` when there is no query.
#[inline]
fn split_query(url: &str) -> Option<(&str, &str, &str)> {
    let q = url.find('?')?;
    let after = &url[q + 1..];
    match after.find('#') {
        Some(h) => Some((&url[..q], &after[..h], &after[h..])),
        None => Some((&url[..q], after, "")),
    }
}

/// Rewrites `url` with every query parameter named in `remove` deleted.
///
/// Returns `None` when nothing was removed, so callers can suppress no-op
/// redirects. Removing the last parameter also drops the `?`.
pub fn remove_query_params(url: &str, remove: &[&str]) -> Option<String> {
    let (base, query, fragment) = split_query(url)?;
    if query.is_empty() {
        return None;
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut removed = false;

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let name = match pair.find('=') {
            Some(eq) => &pair[..eq],
            None => pair,
        };
        if remove.iter().any(|k| *k == name) {
            removed = true;
        } else {
            kept.push(pair);
        }
    }

    if !removed {
        return None;
    }

    let mut out = String::with_capacity(url.len());
    out.push_str(base);
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    out.push_str(fragment);
    Some(out)
}

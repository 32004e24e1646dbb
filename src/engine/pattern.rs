//! Pattern bytecode verification.
//!
//! The VM walks a compiled program over the request URL, maintaining a
//! cursor. Comparison is ASCII-case-folded byte-by-byte against the stored
//! (already lowercased) literals — the URL itself is never lowercased. A
//! `match-case` pattern compares exact bytes instead.
//!
//! Anchor discipline beyond the raw opcodes:
//! - After `ASSERT_START` or a consumed `^` separator, the next literal must
//!   match at the cursor exactly (the pattern is "pinned").
//! - `SKIP_ANY` unpins: the following literal may land anywhere ahead.
//! - After `HOST_ANCHOR`, the next literal must start inside the hostname at
//!   a label boundary, which is what `||` means.

use memchr::memmem;
use regex::bytes::Regex;

use crate::hash::Hash64;
use crate::snapshot::format::{pattern_flags, PatternAnchor, PatternOp};
use crate::snapshot::loader::PatternEntry;
use crate::snapshot::LoadedSnapshot;
use crate::url::is_boundary_byte;

/// Per-request inputs the VM needs besides the program itself.
pub struct PatternCtx<'a> {
    pub url: &'a [u8],
    pub host_start: usize,
    pub host_end: usize,
    /// Suffix-walk hashes of the request host, most specific first.
    pub req_suffix_hashes: &'a [Hash64],
}

/// Runs a pattern against the URL. `regex` is the prebuilt side-table entry
/// for regex-anchored patterns.
pub fn verify(
    snapshot: &LoadedSnapshot,
    entry: &PatternEntry,
    regex: Option<&Regex>,
    ctx: &PatternCtx<'_>,
) -> bool {
    if entry.anchor == PatternAnchor::Regex {
        return match regex {
            Some(re) => re.is_match(ctx.url),
            // The source failed to compile at install; treat as non-matching.
            None => false,
        };
    }

    let program = snapshot.program(entry);
    let match_case = entry.flags & pattern_flags::MATCH_CASE != 0;

    let mut cursor = 0usize;
    let mut pos = 0usize;
    // Pinned: the next literal must start exactly at the cursor.
    let mut pinned = false;
    // Host mode: the next literal must start at a hostname label boundary.
    let mut host_mode = false;

    while pos < program.len() {
        let op = match PatternOp::from_u8(program[pos]) {
            Some(op) => op,
            None => return false,
        };
        pos += 1;

        match op {
            PatternOp::FindLit => {
                if pos + 6 > program.len() {
                    return false;
                }
                let str_off = u32::from_le_bytes([
                    program[pos],
                    program[pos + 1],
                    program[pos + 2],
                    program[pos + 3],
                ]) as usize;
                let str_len = u16::from_le_bytes([program[pos + 4], program[pos + 5]]) as usize;
                pos += 6;

                let literal = match snapshot.string(str_off, str_len) {
                    Some(s) => s.as_bytes(),
                    None => return false,
                };

                if host_mode {
                    match find_at_label_boundary(ctx, cursor, literal, match_case) {
                        Some(start) => cursor = start + literal.len(),
                        None => return false,
                    }
                    host_mode = false;
                } else if pinned {
                    if !starts_with(&ctx.url[cursor..], literal, match_case) {
                        return false;
                    }
                    cursor += literal.len();
                    pinned = false;
                } else {
                    match find(&ctx.url[cursor..], literal, match_case) {
                        Some(rel) => cursor += rel + literal.len(),
                        None => return false,
                    }
                }
            }

            PatternOp::AssertStart => {
                if cursor != 0 {
                    return false;
                }
                pinned = true;
            }

            PatternOp::AssertEnd => {
                if cursor != ctx.url.len() {
                    return false;
                }
            }

            PatternOp::AssertBoundary => {
                // `^` matches one separator byte, or the end of the URL.
                if cursor == ctx.url.len() {
                    continue;
                }
                if !is_boundary_byte(ctx.url[cursor]) {
                    return false;
                }
                cursor += 1;
                pinned = true;
            }

            PatternOp::SkipAny => {
                pinned = false;
                host_mode = false;
            }

            PatternOp::HostAnchor => {
                if ctx.host_start >= ctx.host_end {
                    return false;
                }
                if !entry.host_hash.is_sentinel()
                    && !ctx.req_suffix_hashes.contains(&entry.host_hash)
                {
                    return false;
                }
                cursor = ctx.host_start;
                host_mode = true;
            }

            PatternOp::Done => return true,
        }
    }

    true
}

/// Forward search for `needle` in `haystack`.
#[inline]
fn find(haystack: &[u8], needle: &[u8], match_case: bool) -> Option<usize> {
    if match_case {
        return memmem::find(haystack, needle);
    }
    find_folded(haystack, needle)
}

/// Case-folded forward search. `needle` is lowercase; candidate positions
/// come from a two-byte memchr over both cases of its first byte.
fn find_folded(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let first = match needle.first() {
        Some(&b) => b,
        None => return Some(0),
    };
    if needle.len() > haystack.len() {
        return None;
    }
    let upper = first.to_ascii_uppercase();
    let last = haystack.len() - needle.len();

    let mut base = 0usize;
    while base <= last {
        let rel = memchr::memchr2(first, upper, &haystack[base..])?;
        let at = base + rel;
        if at > last {
            return None;
        }
        if haystack[at..at + needle.len()].eq_ignore_ascii_case(needle) {
            return Some(at);
        }
        base = at + 1;
    }
    None
}

#[inline]
fn starts_with(haystack: &[u8], needle: &[u8], match_case: bool) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    if match_case {
        haystack[..needle.len()] == *needle
    } else {
        haystack[..needle.len()].eq_ignore_ascii_case(needle)
    }
}

/// Finds `literal` starting inside the hostname at a label boundary: either
/// the first host byte, or immediately after a `.`.
fn find_at_label_boundary(
    ctx: &PatternCtx<'_>,
    from: usize,
    literal: &[u8],
    match_case: bool,
) -> Option<usize> {
    let mut search = from;
    loop {
        let rel = find(&ctx.url[search..], literal, match_case)?;
        let start = search + rel;
        if start > ctx.host_end {
            return None;
        }
        let at_boundary =
            start == ctx.host_start || (start > 0 && ctx.url[start - 1] == b'.');
        if at_boundary {
            return Some(start);
        }
        search = start + 1;
    }
}

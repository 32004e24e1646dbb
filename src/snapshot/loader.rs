//! Snapshot validation and zero-copy structural views.
//!
//! [`LoadedSnapshot::load`] takes ownership of the raw image, validates it
//! once (bounds, checksums, string-pool UTF-8, per-rule references), and
//! precomputes the byte offsets every accessor needs. After a successful
//! load the views trust those offsets; nothing is deserialized into mirror
//! structures, and the only allocations the matcher pays later are posting
//! list decodes into caller-owned scratch.
//!
//! # Invariants
//! - Every offset stored in the layout structs was bounds-checked at load.
//! - A snapshot that fails any check is rejected wholesale; `load` never
//!   returns a partially usable value.
//! - Accessors on out-of-range ids return `None`/defaults instead of
//!   panicking, so a logic error upstream degrades to a non-match.

use std::fmt;

use crate::hash::{crc32, crc32_with_hole, Hash64};
use crate::psl::PslSets;

use super::format::{
    self, header, header_flags, pattern_entry, section_entry, PatternAnchor, PatternOp, SectionId,
    HASH64_HEADER_SIZE, HASHMAP64_ENTRY_SIZE, HASHSET64_ENTRY_SIZE, HEADER_SIZE, NO_CONSTRAINT,
    NO_PATTERN, PATTERN_ENTRY_SIZE, SECTION_ENTRY_SIZE, TOKEN_DICT_ENTRY_SIZE,
    TOKEN_DICT_HEADER_SIZE,
};
use format::{read_i16, read_u16, read_u32};

// --------------------------
// Errors
// --------------------------

/// Reasons a snapshot image is rejected.
#[derive(Debug)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Shorter than the fixed header.
    TooShort,
    /// Magic bytes are not `UBX1`.
    BadMagic,
    /// Version this build does not understand.
    UnsupportedVersion(u16),
    /// Whole-file checksum mismatch.
    CrcMismatch { stored: u32, computed: u32 },
    /// A section's checksum mismatch.
    SectionCrcMismatch { id: u16 },
    /// A section or directory range falls outside the file.
    OutOfBounds { what: &'static str },
    /// The string pool is not valid UTF-8.
    PoolNotUtf8,
    /// A structural invariant does not hold.
    Corrupt { what: &'static str },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "snapshot shorter than header"),
            Self::BadMagic => write!(f, "bad magic bytes"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {v}"),
            Self::CrcMismatch { stored, computed } => {
                write!(f, "crc32 mismatch: stored {stored:#010x}, computed {computed:#010x}")
            }
            Self::SectionCrcMismatch { id } => write!(f, "crc32 mismatch in section {id:#06x}"),
            Self::OutOfBounds { what } => write!(f, "range out of bounds: {what}"),
            Self::PoolNotUtf8 => write!(f, "string pool is not valid UTF-8"),
            Self::Corrupt { what } => write!(f, "corrupt snapshot: {what}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

// --------------------------
// Layout records
// --------------------------

/// Absolute byte span inside the snapshot image.
#[derive(Debug, Clone, Copy, Default)]
struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    fn slice<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.offset..self.offset + self.len]
    }
}

/// An open-addressed Hash64 table: absolute entry base plus capacity.
#[derive(Debug, Clone, Copy, Default)]
struct TableSpan {
    entries: usize,
    capacity: usize,
}

/// Precomputed SoA offsets for the rules section, all absolute.
#[derive(Debug, Clone, Copy, Default)]
struct RulesLayout {
    count: usize,
    action: usize,
    flags: usize,
    type_mask: usize,
    party_mask: usize,
    scheme_mask: usize,
    pattern_id: usize,
    constraint_off: usize,
    option_id: usize,
    priority: usize,
    list_id: usize,
}

/// A pattern-pool index entry.
#[derive(Debug, Clone, Copy)]
pub struct PatternEntry {
    pub prog_offset: usize,
    pub prog_len: usize,
    pub anchor: PatternAnchor,
    pub flags: u8,
    pub host_hash: Hash64,
}

/// A constraint-scoped record (cosmetic / procedural / scriptlet /
/// responseheader).
#[derive(Debug, Clone, Copy)]
pub struct ScopedRecord<'a> {
    pub constraint_offset: u32,
    pub text: &'a str,
    pub flags: u16,
    pub list_id: u16,
}

/// A redirect surrogate resource.
#[derive(Debug, Clone, Copy)]
pub struct RedirectResource<'a> {
    pub name: &'a str,
    pub path: &'a str,
    pub mime: format::MimeKind,
}

/// A `$header=` match spec.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSpec<'a> {
    pub name: &'a str,
    pub value: Option<&'a str>,
    pub negate: bool,
}

// --------------------------
// Loaded snapshot
// --------------------------

/// A validated snapshot image plus the offsets its views need.
pub struct LoadedSnapshot {
    bytes: Vec<u8>,
    build_id: u32,
    sections: [Option<Span>; SectionId::COUNT],
    rules: RulesLayout,
    token_dict: TableSpan,
    token_postings: Span,
    domain_block: TableSpan,
    domain_allow: TableSpan,
    domain_postings: Span,
    pattern_count: usize,
    pattern_index: usize,
    prog_bytes: Span,
    constraints: Span,
    strpool: Span,
    fallback_count: usize,
    fallback_data: Span,
    removeparam_rules: u32,
}

impl LoadedSnapshot {
    /// Validates `bytes` and builds the structural views.
    pub fn load(bytes: Vec<u8>) -> Result<Self, SnapshotError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SnapshotError::TooShort);
        }
        if bytes[..4] != format::MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = read_u16(&bytes, header::VERSION);
        if version != format::VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        if read_u32(&bytes, header::HEADER_BYTES) as usize != HEADER_SIZE {
            return Err(SnapshotError::Corrupt { what: "header size" });
        }

        let flags = read_u16(&bytes, header::FLAGS);
        let has_crc = flags & header_flags::HAS_CRC32 != 0;
        if has_crc {
            let stored = read_u32(&bytes, header::SNAPSHOT_CRC32);
            let computed = crc32_with_hole(&bytes, header::SNAPSHOT_CRC32);
            if stored != computed {
                return Err(SnapshotError::CrcMismatch { stored, computed });
            }
        }

        let section_count = read_u32(&bytes, header::SECTION_COUNT) as usize;
        let dir_offset = read_u32(&bytes, header::SECTION_DIR_OFFSET) as usize;
        let dir_bytes = read_u32(&bytes, header::SECTION_DIR_BYTES) as usize;
        if section_count > 4096 {
            return Err(SnapshotError::Corrupt { what: "section count" });
        }
        let dir_end = dir_offset
            .checked_add(dir_bytes)
            .ok_or(SnapshotError::OutOfBounds { what: "section directory" })?;
        if dir_end > bytes.len() || dir_bytes < section_count * SECTION_ENTRY_SIZE {
            return Err(SnapshotError::OutOfBounds { what: "section directory" });
        }

        let mut sections: [Option<Span>; SectionId::COUNT] = [None; SectionId::COUNT];
        for i in 0..section_count {
            let entry = dir_offset + i * SECTION_ENTRY_SIZE;
            let raw_id = read_u16(&bytes, entry + section_entry::ID);
            let id = match SectionId::from_u16(raw_id) {
                Some(id) => id,
                // Forward compatibility: later versions may add sections.
                None => continue,
            };
            let offset = read_u32(&bytes, entry + section_entry::OFFSET) as usize;
            let len = read_u32(&bytes, entry + section_entry::LENGTH) as usize;
            let end = offset
                .checked_add(len)
                .ok_or(SnapshotError::OutOfBounds { what: "section payload" })?;
            if end > bytes.len() {
                return Err(SnapshotError::OutOfBounds { what: "section payload" });
            }
            if sections[id.index()].is_some() {
                return Err(SnapshotError::Corrupt { what: "duplicate section" });
            }
            let section_crc = read_u32(&bytes, entry + section_entry::CRC32);
            if has_crc && section_crc != 0 && crc32(&bytes[offset..end]) != section_crc {
                return Err(SnapshotError::SectionCrcMismatch { id: raw_id });
            }
            sections[id.index()] = Some(Span { offset, len });
        }

        let build_id = read_u32(&bytes, header::BUILD_ID);

        let mut snap = Self {
            bytes,
            build_id,
            sections,
            rules: RulesLayout::default(),
            token_dict: TableSpan::default(),
            token_postings: Span::default(),
            domain_block: TableSpan::default(),
            domain_allow: TableSpan::default(),
            domain_postings: Span::default(),
            pattern_count: 0,
            pattern_index: 0,
            prog_bytes: Span::default(),
            constraints: Span::default(),
            strpool: Span::default(),
            fallback_count: 0,
            fallback_data: Span::default(),
            removeparam_rules: 0,
        };

        snap.index_strpool()?;
        snap.index_rules()?;
        snap.index_token_sections()?;
        snap.index_domain_sets()?;
        snap.index_pattern_pool()?;
        snap.index_constraints()?;
        snap.index_fallback()?;
        snap.check_rules()?;

        Ok(snap)
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn build_id(&self) -> u32 {
        self.build_id
    }

    pub fn rule_count(&self) -> usize {
        self.rules.count
    }

    /// Number of rules carrying the removeparam action; lets the request
    /// pipeline skip stage A2 entirely on snapshots without any.
    pub fn removeparam_rule_count(&self) -> u32 {
        self.removeparam_rules
    }

    fn section(&self, id: SectionId) -> Option<&[u8]> {
        self.sections[id.index()].map(|s| s.slice(&self.bytes))
    }

    // --------------------------
    // Index passes (load time)
    // --------------------------

    fn index_strpool(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::StrPool.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);
        if data.len() < 4 {
            return Err(SnapshotError::Corrupt { what: "string pool header" });
        }
        let pool_len = read_u32(data, 0) as usize;
        if pool_len > data.len() - 4 {
            return Err(SnapshotError::OutOfBounds { what: "string pool" });
        }
        std::str::from_utf8(&data[4..4 + pool_len]).map_err(|_| SnapshotError::PoolNotUtf8)?;
        self.strpool = Span {
            offset: span.offset + 4,
            len: pool_len,
        };
        Ok(())
    }

    fn index_rules(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::Rules.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);
        if data.len() < 4 {
            return Err(SnapshotError::Corrupt { what: "rules header" });
        }
        let count = read_u32(data, 0) as usize;
        if count > u32::MAX as usize / 8 {
            return Err(SnapshotError::Corrupt { what: "rule count" });
        }

        // SoA layout, each array aligned to its element size.
        let mut pos = 4usize;
        let action = pos;
        pos = format::align_up(pos + count, 2);
        let flags = pos;
        pos = format::align_up(pos + count * 2, 4);
        let type_mask = pos;
        pos += count * 4;
        let party_mask = pos;
        pos += count;
        let scheme_mask = pos;
        pos = format::align_up(pos + count, 4);
        let pattern_id = pos;
        pos += count * 4;
        let constraint_off = pos;
        pos += count * 4;
        let option_id = pos;
        pos += count * 4;
        let priority = pos;
        pos += count * 2;
        let list_id = format::align_up(pos, 2);
        let end = list_id + count * 2;

        if end > data.len() {
            return Err(SnapshotError::OutOfBounds { what: "rules arrays" });
        }

        let base = span.offset;
        self.rules = RulesLayout {
            count,
            action: base + action,
            flags: base + flags,
            type_mask: base + type_mask,
            party_mask: base + party_mask,
            scheme_mask: base + scheme_mask,
            pattern_id: base + pattern_id,
            constraint_off: base + constraint_off,
            option_id: base + option_id,
            priority: base + priority,
            list_id: base + list_id,
        };
        Ok(())
    }

    fn index_token_sections(&mut self) -> Result<(), SnapshotError> {
        if let Some(span) = self.sections[SectionId::TokenDict.index()] {
            let data = span.slice(&self.bytes);
            if data.len() < TOKEN_DICT_HEADER_SIZE {
                return Err(SnapshotError::Corrupt { what: "token dict header" });
            }
            let capacity = read_u32(data, 0) as usize;
            if capacity != 0 && !capacity.is_power_of_two() {
                return Err(SnapshotError::Corrupt { what: "token dict capacity" });
            }
            if TOKEN_DICT_HEADER_SIZE + capacity * TOKEN_DICT_ENTRY_SIZE > data.len() {
                return Err(SnapshotError::OutOfBounds { what: "token dict entries" });
            }
            self.token_dict = TableSpan {
                entries: span.offset + TOKEN_DICT_HEADER_SIZE,
                capacity,
            };
        }

        if let Some(span) = self.sections[SectionId::TokenPostings.index()] {
            let data = span.slice(&self.bytes);
            if data.len() < 4 {
                return Err(SnapshotError::Corrupt { what: "token postings header" });
            }
            let len = read_u32(data, 0) as usize;
            if len > data.len() - 4 {
                return Err(SnapshotError::OutOfBounds { what: "token postings" });
            }
            self.token_postings = Span {
                offset: span.offset + 4,
                len,
            };
        }
        Ok(())
    }

    fn index_domain_sets(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::DomainSets.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);

        let mut pos = 0usize;
        let mut tables = [TableSpan::default(); 2];
        for table in &mut tables {
            if pos + HASH64_HEADER_SIZE > data.len() {
                return Err(SnapshotError::Corrupt { what: "domain set header" });
            }
            let capacity = read_u32(data, pos) as usize;
            if capacity != 0 && !capacity.is_power_of_two() {
                return Err(SnapshotError::Corrupt { what: "domain set capacity" });
            }
            let entries = pos + HASH64_HEADER_SIZE;
            if entries + capacity * HASHMAP64_ENTRY_SIZE > data.len() {
                return Err(SnapshotError::OutOfBounds { what: "domain set entries" });
            }
            *table = TableSpan {
                entries: span.offset + entries,
                capacity,
            };
            pos = entries + capacity * HASHMAP64_ENTRY_SIZE;
        }
        let [block, allow] = tables;
        self.domain_block = block;
        self.domain_allow = allow;

        if pos + 4 > data.len() {
            return Err(SnapshotError::Corrupt { what: "domain postings header" });
        }
        let len = read_u32(data, pos) as usize;
        if len > data.len() - pos - 4 {
            return Err(SnapshotError::OutOfBounds { what: "domain postings" });
        }
        self.domain_postings = Span {
            offset: span.offset + pos + 4,
            len,
        };
        Ok(())
    }

    fn index_pattern_pool(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::PatternPool.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);
        if data.len() < 4 {
            return Err(SnapshotError::Corrupt { what: "pattern pool header" });
        }
        let count = read_u32(data, 0) as usize;
        let index_end = 4 + count * PATTERN_ENTRY_SIZE;
        if index_end + 4 > data.len() {
            return Err(SnapshotError::OutOfBounds { what: "pattern index" });
        }
        let prog_len = read_u32(data, index_end) as usize;
        if prog_len > data.len() - index_end - 4 {
            return Err(SnapshotError::OutOfBounds { what: "pattern programs" });
        }

        self.pattern_count = count;
        self.pattern_index = span.offset + 4;
        self.prog_bytes = Span {
            offset: span.offset + index_end + 4,
            len: prog_len,
        };

        // Per-pattern structural checks; after this pass the VM trusts the
        // program bytes.
        for id in 0..count {
            let entry = self.pattern(id).ok_or(SnapshotError::Corrupt { what: "pattern entry" })?;
            if entry.prog_offset + entry.prog_len > prog_len {
                return Err(SnapshotError::OutOfBounds { what: "pattern program" });
            }
            match entry.anchor {
                PatternAnchor::Regex => {
                    std::str::from_utf8(self.program(&entry))
                        .map_err(|_| SnapshotError::Corrupt { what: "regex source" })?;
                }
                anchor => {
                    if anchor == PatternAnchor::Hostname && entry.host_hash.is_sentinel() {
                        return Err(SnapshotError::Corrupt { what: "host anchor hash" });
                    }
                    self.check_program(self.program(&entry))?;
                }
            }
        }
        Ok(())
    }

    fn check_program(&self, program: &[u8]) -> Result<(), SnapshotError> {
        let mut pos = 0usize;
        while pos < program.len() {
            let op = PatternOp::from_u8(program[pos])
                .ok_or(SnapshotError::Corrupt { what: "pattern opcode" })?;
            pos += 1;
            if op == PatternOp::FindLit {
                if pos + 6 > program.len() {
                    return Err(SnapshotError::Corrupt { what: "find-lit operands" });
                }
                let str_off = read_u32(program, pos) as usize;
                let str_len = read_u16(program, pos + 4) as usize;
                pos += 6;
                if str_off + str_len > self.strpool.len {
                    return Err(SnapshotError::OutOfBounds { what: "find-lit literal" });
                }
            }
        }
        Ok(())
    }

    fn index_constraints(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::DomainConstraintPool.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);
        if data.len() < 4 {
            return Err(SnapshotError::Corrupt { what: "constraint pool header" });
        }
        let len = read_u32(data, 0) as usize;
        if len > data.len() - 4 {
            return Err(SnapshotError::OutOfBounds { what: "constraint pool" });
        }
        self.constraints = Span {
            offset: span.offset + 4,
            len,
        };
        Ok(())
    }

    fn index_fallback(&mut self) -> Result<(), SnapshotError> {
        let span = match self.sections[SectionId::FallbackRules.index()] {
            Some(s) => s,
            None => return Ok(()),
        };
        let data = span.slice(&self.bytes);
        if data.len() < 4 {
            return Err(SnapshotError::Corrupt { what: "fallback header" });
        }
        self.fallback_count = read_u32(data, 0) as usize;
        if self.fallback_count > self.rules.count {
            return Err(SnapshotError::Corrupt { what: "fallback count" });
        }
        self.fallback_data = Span {
            offset: span.offset + 4,
            len: data.len() - 4,
        };
        Ok(())
    }

    /// Per-rule reference checks, plus the removeparam census.
    fn check_rules(&mut self) -> Result<(), SnapshotError> {
        let mut removeparam = 0u32;
        for id in 0..self.rules.count {
            if crate::api::RuleAction::try_from(self.rule_action(id)).is_err() {
                return Err(SnapshotError::Corrupt { what: "rule action" });
            }
            let pattern_id = self.rule_pattern_id(id);
            if pattern_id != NO_PATTERN && pattern_id as usize >= self.pattern_count {
                return Err(SnapshotError::OutOfBounds { what: "rule pattern id" });
            }
            let constraint = self.rule_constraint_offset(id);
            if constraint != NO_CONSTRAINT && !self.constraint_in_bounds(constraint) {
                return Err(SnapshotError::OutOfBounds { what: "rule constraint" });
            }
            if self.rule_action(id) == crate::api::RuleAction::Removeparam as u8 {
                removeparam += 1;
            }
        }
        self.removeparam_rules = removeparam;
        Ok(())
    }

    fn constraint_in_bounds(&self, offset: u32) -> bool {
        let offset = offset as usize;
        let data = self.constraints.slice(&self.bytes);
        if offset + 4 > data.len() {
            return false;
        }
        let include = read_u16(data, offset) as usize;
        let exclude = read_u16(data, offset + 2) as usize;
        offset + 4 + (include + exclude) * 8 <= data.len()
    }

    // --------------------------
    // Rule accessors
    // --------------------------

    #[inline]
    pub fn rule_action(&self, id: usize) -> u8 {
        if id >= self.rules.count {
            return 0;
        }
        self.bytes[self.rules.action + id]
    }

    #[inline]
    pub fn rule_flags(&self, id: usize) -> u16 {
        if id >= self.rules.count {
            return 0;
        }
        read_u16(&self.bytes, self.rules.flags + id * 2)
    }

    #[inline]
    pub fn rule_type_mask(&self, id: usize) -> u32 {
        if id >= self.rules.count {
            return 0;
        }
        read_u32(&self.bytes, self.rules.type_mask + id * 4)
    }

    #[inline]
    pub fn rule_party_mask(&self, id: usize) -> u8 {
        if id >= self.rules.count {
            return 0;
        }
        self.bytes[self.rules.party_mask + id]
    }

    #[inline]
    pub fn rule_scheme_mask(&self, id: usize) -> u8 {
        if id >= self.rules.count {
            return 0;
        }
        self.bytes[self.rules.scheme_mask + id]
    }

    #[inline]
    pub fn rule_pattern_id(&self, id: usize) -> u32 {
        if id >= self.rules.count {
            return NO_PATTERN;
        }
        read_u32(&self.bytes, self.rules.pattern_id + id * 4)
    }

    #[inline]
    pub fn rule_constraint_offset(&self, id: usize) -> u32 {
        if id >= self.rules.count {
            return NO_CONSTRAINT;
        }
        read_u32(&self.bytes, self.rules.constraint_off + id * 4)
    }

    #[inline]
    pub fn rule_option_id(&self, id: usize) -> u32 {
        if id >= self.rules.count {
            return format::NO_OPTION;
        }
        read_u32(&self.bytes, self.rules.option_id + id * 4)
    }

    #[inline]
    pub fn rule_priority(&self, id: usize) -> i16 {
        if id >= self.rules.count {
            return 0;
        }
        read_i16(&self.bytes, self.rules.priority + id * 2)
    }

    #[inline]
    pub fn rule_list_id(&self, id: usize) -> u16 {
        if id >= self.rules.count {
            return 0;
        }
        read_u16(&self.bytes, self.rules.list_id + id * 2)
    }

    // --------------------------
    // Index lookups
    // --------------------------

    /// Token dictionary probe: `(postings offset, rule count)`.
    pub fn token_lookup(&self, token: u32) -> Option<(usize, usize)> {
        let table = self.token_dict;
        if table.capacity == 0 {
            return None;
        }
        let mask = table.capacity - 1;
        let mut idx = token as usize & mask;
        for _ in 0..table.capacity {
            let entry = table.entries + idx * TOKEN_DICT_ENTRY_SIZE;
            let stored = read_u32(&self.bytes, entry);
            if stored == 0 {
                return None;
            }
            if stored == token {
                let offset = read_u32(&self.bytes, entry + 4) as usize;
                let count = read_u32(&self.bytes, entry + 8) as usize;
                return Some((offset, count));
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn domain_lookup(&self, table: TableSpan, hash: Hash64) -> Option<u32> {
        if table.capacity == 0 {
            return None;
        }
        let mask = table.capacity - 1;
        let mut idx = hash.lo as usize & mask;
        for _ in 0..table.capacity {
            let entry = table.entries + idx * HASHMAP64_ENTRY_SIZE;
            let lo = read_u32(&self.bytes, entry);
            let hi = read_u32(&self.bytes, entry + 4);
            if lo == 0 && hi == 0 {
                return None;
            }
            if lo == hash.lo && hi == hash.hi {
                return Some(read_u32(&self.bytes, entry + 8));
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    /// Block-class host-only rules keyed by a host-suffix hash. The value is
    /// an offset into the domain postings blob.
    pub fn domain_block_lookup(&self, hash: Hash64) -> Option<u32> {
        self.domain_lookup(self.domain_block, hash)
    }

    /// Allow-class twin of [`Self::domain_block_lookup`].
    pub fn domain_allow_lookup(&self, hash: Hash64) -> Option<u32> {
        self.domain_lookup(self.domain_allow, hash)
    }

    /// Decodes a count-prefixed posting list from the domain postings blob.
    pub fn decode_domain_postings(&self, offset: u32, out: &mut Vec<u32>) {
        let data = self.domain_postings.slice(&self.bytes);
        let offset = offset as usize;
        out.clear();
        if offset + 4 > data.len() {
            return;
        }
        let count = read_u32(data, offset) as usize;
        decode_posting_list_into(data, offset + 4, count, out);
    }

    /// Decodes a token posting list (count known from the dictionary).
    pub fn decode_token_postings(&self, offset: usize, count: usize, out: &mut Vec<u32>) {
        let data = self.token_postings.slice(&self.bytes);
        out.clear();
        decode_posting_list_into(data, offset, count, out);
    }

    /// Decodes the fallback-bucket rule ids.
    pub fn decode_fallback_rules(&self, out: &mut Vec<u32>) {
        let data = self.fallback_data.slice(&self.bytes);
        out.clear();
        decode_posting_list_into(data, 0, self.fallback_count, out);
    }

    pub fn fallback_rule_count(&self) -> usize {
        self.fallback_count
    }

    // --------------------------
    // Pattern pool
    // --------------------------

    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    pub fn pattern(&self, id: usize) -> Option<PatternEntry> {
        if id >= self.pattern_count {
            return None;
        }
        let entry = self.pattern_index + id * PATTERN_ENTRY_SIZE;
        let anchor = PatternAnchor::from_u8(self.bytes[entry + pattern_entry::ANCHOR])?;
        Some(PatternEntry {
            prog_offset: read_u32(&self.bytes, entry + pattern_entry::PROG_OFF) as usize,
            prog_len: read_u16(&self.bytes, entry + pattern_entry::PROG_LEN) as usize,
            anchor,
            flags: self.bytes[entry + pattern_entry::FLAGS],
            host_hash: Hash64::new(
                read_u32(&self.bytes, entry + pattern_entry::HOST_HASH_LO),
                read_u32(&self.bytes, entry + pattern_entry::HOST_HASH_HI),
            ),
        })
    }

    pub fn program(&self, entry: &PatternEntry) -> &[u8] {
        let data = self.prog_bytes.slice(&self.bytes);
        &data[entry.prog_offset..entry.prog_offset + entry.prog_len]
    }

    // --------------------------
    // Strings and constraints
    // --------------------------

    /// Interned string at `(offset, len)`; bounds were proven at load for
    /// every stored reference.
    pub fn string(&self, offset: usize, len: usize) -> Option<&str> {
        let data = self.strpool.slice(&self.bytes);
        if offset + len > data.len() {
            return None;
        }
        std::str::from_utf8(&data[offset..offset + len]).ok()
    }

    /// Raw constraint record at `offset`: `(include, exclude)` hash slices as
    /// raw little-endian bytes.
    pub fn constraint_lists(&self, offset: u32) -> Option<(&[u8], &[u8])> {
        if offset == NO_CONSTRAINT {
            return None;
        }
        let data = self.constraints.slice(&self.bytes);
        let offset = offset as usize;
        if offset + 4 > data.len() {
            return None;
        }
        let include = read_u16(data, offset) as usize;
        let exclude = read_u16(data, offset + 2) as usize;
        let inc_start = offset + 4;
        let inc_end = inc_start + include * 8;
        let exc_end = inc_end + exclude * 8;
        if exc_end > data.len() {
            return None;
        }
        Some((&data[inc_start..inc_end], &data[inc_end..exc_end]))
    }

    // --------------------------
    // Option tables
    // --------------------------

    fn table_entry(&self, id: SectionId, option_id: u32, entry_size: usize) -> Option<(&[u8], usize)> {
        if option_id == format::NO_OPTION {
            return None;
        }
        let data = self.section(id)?;
        if data.len() < 4 {
            return None;
        }
        let count = read_u32(data, 0) as usize;
        let idx = option_id as usize;
        if idx >= count {
            return None;
        }
        let offset = 4 + idx * entry_size;
        if offset + entry_size > data.len() {
            return None;
        }
        Some((data, offset))
    }

    pub fn redirect_resource(&self, option_id: u32) -> Option<RedirectResource<'_>> {
        let (data, off) =
            self.table_entry(SectionId::RedirectResources, option_id, format::REDIRECT_RESOURCE_ENTRY_SIZE)?;
        let name = self.string(read_u32(data, off) as usize, read_u32(data, off + 4) as usize)?;
        let path = self.string(read_u32(data, off + 8) as usize, read_u32(data, off + 12) as usize)?;
        let mime = format::MimeKind::from_u8(read_u32(data, off + 16) as u8);
        Some(RedirectResource { name, path, mime })
    }

    pub fn removeparam_spec(&self, option_id: u32) -> Option<&str> {
        let (data, off) = self.table_entry(SectionId::RemoveparamSpecs, option_id, format::SPEC_ENTRY_SIZE)?;
        self.string(read_u32(data, off) as usize, read_u32(data, off + 4) as usize)
    }

    pub fn csp_spec(&self, option_id: u32) -> Option<&str> {
        let (data, off) = self.table_entry(SectionId::CspSpecs, option_id, format::SPEC_ENTRY_SIZE)?;
        self.string(read_u32(data, off) as usize, read_u32(data, off + 4) as usize)
    }

    pub fn header_spec(&self, option_id: u32) -> Option<HeaderSpec<'_>> {
        let (data, off) = self.table_entry(SectionId::HeaderSpecs, option_id, format::HEADER_SPEC_ENTRY_SIZE)?;
        let name = self.string(read_u32(data, off) as usize, read_u32(data, off + 4) as usize)?;
        let value_len = read_u32(data, off + 12) as usize;
        let value = if value_len > 0 {
            self.string(read_u32(data, off + 8) as usize, value_len)
        } else {
            None
        };
        let flags = read_u32(data, off + 16);
        Some(HeaderSpec {
            name,
            value,
            negate: flags & 1 != 0,
        })
    }

    /// Iterates a constraint-scoped record table (cosmetic, procedural,
    /// scriptlet, responseheader).
    pub fn scoped_records(&self, id: SectionId) -> ScopedRecordIter<'_> {
        let (data, count) = match self.section(id) {
            Some(data) if data.len() >= 4 => {
                let count = read_u32(data, 0) as usize;
                let fit = (data.len() - 4) / format::SCOPED_RECORD_ENTRY_SIZE;
                (data, count.min(fit))
            }
            _ => (&[][..], 0),
        };
        ScopedRecordIter {
            snapshot: self,
            data,
            count,
            next: 0,
        }
    }

    /// Serialized PSL sets, parsed into runtime form.
    pub fn load_psl(&self) -> PslSets {
        let mut sets = PslSets::new();
        let data = match self.section(SectionId::PslSets) {
            Some(d) => d,
            None => return sets,
        };

        let mut pos = 0usize;
        for kind in 0..3u8 {
            if pos + HASH64_HEADER_SIZE > data.len() {
                break;
            }
            let capacity = read_u32(data, pos) as usize;
            pos += HASH64_HEADER_SIZE;
            for _ in 0..capacity {
                if pos + HASHSET64_ENTRY_SIZE > data.len() {
                    break;
                }
                let h = Hash64::new(read_u32(data, pos), read_u32(data, pos + 4));
                pos += HASHSET64_ENTRY_SIZE;
                if h.is_sentinel() {
                    continue;
                }
                match kind {
                    0 => sets.insert_exact(h),
                    1 => sets.insert_wildcard(h),
                    _ => sets.insert_exception(h),
                }
            }
        }
        sets
    }
}

/// Iterator produced by [`LoadedSnapshot::scoped_records`].
pub struct ScopedRecordIter<'a> {
    snapshot: &'a LoadedSnapshot,
    data: &'a [u8],
    count: usize,
    next: usize,
}

impl<'a> Iterator for ScopedRecordIter<'a> {
    type Item = ScopedRecord<'a>;

    fn next(&mut self) -> Option<ScopedRecord<'a>> {
        while self.next < self.count {
            let off = 4 + self.next * format::SCOPED_RECORD_ENTRY_SIZE;
            self.next += 1;
            let constraint_offset = read_u32(self.data, off);
            let text_off = read_u32(self.data, off + 4) as usize;
            let text_len = read_u32(self.data, off + 8) as usize;
            let flags = read_u16(self.data, off + 12);
            let list_id = read_u16(self.data, off + 14);
            // A dangling string reference skips the record rather than the table.
            if let Some(text) = self.snapshot.string(text_off, text_len) {
                return Some(ScopedRecord {
                    constraint_offset,
                    text,
                    flags,
                    list_id,
                });
            }
        }
        None
    }
}

// --------------------------
// Varint / posting list decode
// --------------------------

/// Decodes one unsigned LEB128 value; returns `(value, bytes_read)`.
pub fn decode_varint(data: &[u8], offset: usize) -> (u32, usize) {
    let mut value = 0u32;
    let mut shift = 0u32;
    let mut read = 0usize;
    while offset + read < data.len() {
        let byte = data[offset + read];
        read += 1;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            break;
        }
    }
    (value, read)
}

/// Decodes `count` delta-encoded rule ids starting at `offset` into `out`.
pub fn decode_posting_list_into(data: &[u8], offset: usize, count: usize, out: &mut Vec<u32>) {
    let mut pos = offset;
    let mut prev = 0u32;
    for _ in 0..count {
        if pos >= data.len() {
            break;
        }
        let (delta, read) = decode_varint(data, pos);
        pos += read;
        prev = prev.wrapping_add(delta);
        out.push(prev);
    }
}

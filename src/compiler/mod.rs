//! Ahead-of-time filter-list compiler.
//!
//! Pipeline: classify lines, parse into IR, validate regexes against the
//! safety predicate, fold badfilters and duplicates, then serialize a UBX
//! snapshot. Per-rule problems never fail the compile; they become skip
//! counters. The compile fails only when nothing survives or an image limit
//! is exceeded.

pub mod builder;
pub mod lexer;
pub mod optimizer;
pub mod parser;

use std::fmt;

use crate::api::{CompileOptions, CompileOutput, CompileStats, ListStats, RuleFlags, SkipReason};
use crate::psl::parse_psl_text;

use builder::CompiledIr;
use lexer::LineKind;
use parser::{parse_hosts_entry, parse_network, parse_scope_hosts, ScopedRule};

/// Compile-level failures. Rule-level problems are skip counters instead.
#[derive(Debug)]
#[non_exhaustive]
pub enum CompileError {
    /// No rule survived parsing and folding.
    Empty,
    /// An image limit would overflow the format's u32 offsets.
    TooLarge(&'static str),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "no rules survived compilation"),
            Self::TooLarge(what) => write!(f, "snapshot limit exceeded: {what}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Compiles filter-list texts into a snapshot image plus statistics.
///
/// Deterministic: the same `texts` in the same order with the same `options`
/// produce byte-identical snapshots.
pub fn compile_filter_lists(
    texts: &[&str],
    options: &CompileOptions,
) -> Result<CompileOutput, CompileError> {
    let mut ir = CompiledIr::default();
    let mut stats = CompileStats::default();

    for (index, text) in texts.iter().enumerate() {
        let list_id = index as u16;
        let mut list = ListStats {
            list_id,
            ..ListStats::default()
        };

        if text.len() > options.max_list_bytes {
            skip(&mut stats, &mut list, SkipReason::ListTooLarge);
            stats.per_list.push(list);
            continue;
        }

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            list.total_lines += 1;
            compile_line(line, list_id, options, &mut ir, &mut stats, &mut list);
        }
        stats.per_list.push(list);
    }

    stats.rules_before = ir.network.len();

    let fold_stats = optimizer::fold(&mut ir.network);
    stats.badfilter_rules = fold_stats.badfilter_rules;
    stats.badfiltered_rules = fold_stats.badfiltered_rules;
    stats.rules_deduped = fold_stats.deduped
        + optimizer::dedupe_scoped(&mut ir.cosmetic)
        + optimizer::dedupe_scoped(&mut ir.procedural)
        + optimizer::dedupe_scoped(&mut ir.scriptlet)
        + optimizer::dedupe_scoped(&mut ir.responseheader);

    if ir.network.len() > options.max_rules {
        let excess = ir.network.len() - options.max_rules;
        ir.network.truncate(options.max_rules);
        stats.skipped[SkipReason::TooManyRules.index()] += excess;
    }

    stats.rules_after = ir.network.len();
    for rule in &ir.network {
        if let Some(list) = stats.per_list.get_mut(rule.list_id as usize) {
            list.rules_after += 1;
        }
    }

    if ir.network.is_empty()
        && ir.cosmetic.is_empty()
        && ir.procedural.is_empty()
        && ir.scriptlet.is_empty()
        && ir.responseheader.is_empty()
    {
        return Err(CompileError::Empty);
    }

    if let Some(psl_text) = &options.psl_text {
        ir.psl = parse_psl_text(psl_text);
    }

    let snapshot_bytes = builder::build_snapshot(&ir, options)?;
    Ok(CompileOutput {
        snapshot_bytes,
        stats,
    })
}

fn compile_line(
    line: &str,
    list_id: u16,
    options: &CompileOptions,
    ir: &mut CompiledIr,
    stats: &mut CompileStats,
    list: &mut ListStats,
) {
    match lexer::classify(line) {
        LineKind::Comment => {}
        LineKind::Malformed => skip(stats, list, SkipReason::MalformedCosmetic),
        LineKind::Network(body) => match parse_network(body, list_id) {
            Ok(parsed) => {
                for rule in &parsed.rules {
                    if let Err(reason) = validate_regex(rule, options) {
                        skip(stats, list, reason);
                        return;
                    }
                }
                list.rules_before += parsed.rules.len();
                ir.network.extend(parsed.rules);
                if let Some(record) = parsed.responseheader {
                    list.rules_before += 1;
                    ir.responseheader.push(record);
                }
            }
            Err(reason) => skip(stats, list, reason),
        },
        LineKind::HostsEntry(host) => match parse_hosts_entry(host, list_id) {
            Ok(rule) => {
                list.rules_before += 1;
                ir.network.push(rule);
            }
            Err(reason) => skip(stats, list, reason),
        },
        LineKind::Cosmetic { hosts, body } => {
            scoped(hosts, body, false, list_id, &mut ir.cosmetic, stats, list)
        }
        LineKind::CosmeticException { hosts, body } => {
            // `site#@#generichide` / `site#@#elemhide` are scope switches,
            // not selector exceptions.
            match body.trim() {
                "generichide" => scope_disable(hosts, RuleFlags::GENERICHIDE, list_id, ir, stats, list),
                "elemhide" => scope_disable(hosts, RuleFlags::ELEMHIDE, list_id, ir, stats, list),
                _ => scoped(hosts, body, true, list_id, &mut ir.cosmetic, stats, list),
            }
        }
        LineKind::Procedural { hosts, body } => {
            scoped(hosts, body, false, list_id, &mut ir.procedural, stats, list)
        }
        LineKind::Scriptlet { hosts, body } => {
            if hosts.trim().is_empty() {
                // There are no generic scriptlets; injection is per-site.
                skip(stats, list, SkipReason::UnsupportedOption);
                return;
            }
            scoped(hosts, body, false, list_id, &mut ir.scriptlet, stats, list)
        }
        LineKind::ScriptletException { hosts, body } => {
            scoped(hosts, body, true, list_id, &mut ir.scriptlet, stats, list)
        }
        LineKind::ResponseHeader { hosts, name } => {
            scoped(hosts, name, false, list_id, &mut ir.responseheader, stats, list)
        }
        LineKind::ResponseHeaderException { hosts, name } => {
            scoped(hosts, name, true, list_id, &mut ir.responseheader, stats, list)
        }
    }
}

fn scoped(
    hosts: &str,
    body: &str,
    exception: bool,
    list_id: u16,
    out: &mut Vec<ScopedRule>,
    stats: &mut CompileStats,
    list: &mut ListStats,
) {
    match parse_scope_hosts(hosts) {
        Ok(constraint) => {
            let generic = constraint.include.is_empty();
            list.rules_before += 1;
            out.push(ScopedRule {
                constraint,
                text: body.trim().to_string(),
                exception,
                generic,
                list_id,
            });
        }
        Err(reason) => skip(stats, list, reason),
    }
}

/// Compiles a cosmetic-scope switch into Allow rules carrying the flag: one
/// host-only rule per include host (found via the domain index), or a
/// fallback-bucket rule when the switch is global.
fn scope_disable(
    hosts: &str,
    flag: RuleFlags,
    list_id: u16,
    ir: &mut CompiledIr,
    stats: &mut CompileStats,
    list: &mut ListStats,
) {
    let constraint = match parse_scope_hosts(hosts) {
        Ok(c) => c,
        Err(reason) => return skip(stats, list, reason),
    };

    let mut base = parser::NetworkRule {
        action_raw: crate::api::RuleAction::Allow as u8,
        flags: flag,
        list_id,
        ..parser::NetworkRule::default()
    };

    if constraint.include.is_empty() {
        if !constraint.exclude.is_empty() {
            base.constraint = Some(constraint);
        }
        list.rules_before += 1;
        ir.network.push(base);
        return;
    }

    // Re-split the prefix so each include host becomes its own host-only
    // rule; excludes travel as a shared constraint.
    for raw in hosts.split(',') {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('~') {
            continue;
        }
        let hostname = match parser::normalize_domain(raw) {
            Some(h) => h,
            None => continue,
        };
        let mut rule = base.clone();
        rule.hostname = Some(hostname);
        rule.anchor = parser::AnchorKind::Hostname;
        rule.flags |= RuleFlags::HAS_HOST_ANCHOR;
        if !constraint.exclude.is_empty() {
            rule.constraint = Some(parser::DomainConstraint {
                include: Vec::new(),
                exclude: constraint.exclude.clone(),
            });
        }
        list.rules_before += 1;
        ir.network.push(rule);
    }
}

fn validate_regex(rule: &parser::NetworkRule, options: &CompileOptions) -> Result<(), SkipReason> {
    if rule.anchor != parser::AnchorKind::Regex {
        return Ok(());
    }
    let source = rule.pattern.as_deref().unwrap_or("");
    if source.len() > options.max_regex_len {
        return Err(SkipReason::RegexTooLong);
    }
    check_safe_regex(source)
}

/// Safe-regex predicate: bounded repetition counts, bounded nesting and
/// alternation depth, no backreferences. The goal is rejecting patterns that
/// could make install-time compilation or matching expensive, not full
/// validation; `regex` itself rejects anything unparsable at install.
fn check_safe_regex(source: &str) -> Result<(), SkipReason> {
    const MAX_DEPTH: usize = 8;
    const MAX_ALTERNATIONS: usize = 16;
    const MAX_REPEAT: u32 = 64;

    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut alternations = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                    return Err(SkipReason::RegexTooComplex);
                }
                i += 1;
            }
            b'(' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(SkipReason::RegexTooComplex);
                }
            }
            b')' => depth = depth.saturating_sub(1),
            b'|' => {
                alternations += 1;
                if alternations > MAX_ALTERNATIONS {
                    return Err(SkipReason::RegexTooComplex);
                }
            }
            b'{' => {
                // Parse {m}, {m,}, {m,n}; reject counts past the bound.
                let end = match bytes[i + 1..].iter().position(|&b| b == b'}') {
                    Some(rel) => i + 1 + rel,
                    None => {
                        i += 1;
                        continue;
                    }
                };
                for part in source[i + 1..end].split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    match part.parse::<u32>() {
                        Ok(n) if n <= MAX_REPEAT => {}
                        _ => return Err(SkipReason::RegexTooComplex),
                    }
                }
                i = end;
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

fn skip(stats: &mut CompileStats, list: &mut ListStats, reason: SkipReason) {
    stats.skipped[reason.index()] += 1;
    list.skipped += 1;
}

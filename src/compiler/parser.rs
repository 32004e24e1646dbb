//! Network-rule parsing: anchors, pattern text, and `$` options.
//!
//! Output is the compiler IR ([`NetworkRule`], [`ScopedRule`]), not the
//! serialized form; the builder owns bytecode and section emission. A single
//! source line can expand to more than one IR rule: `$redirect=` produces the
//! block half and the directive half, matching how precedence treats them at
//! run time.
//!
//! Anything unrecognized is a skip with a reason, never an error: filter
//! lists in the wild always carry options from newer dialects.

use crate::api::{PartyMask, RuleAction, RuleFlags, SchemeMask, SkipReason, TypeMask};
use crate::hash::{hash_domain, Hash64};

// --------------------------
// Compiler IR
// --------------------------

/// `$domain=` scoping, hashed over the domains as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainConstraint {
    pub include: Vec<Hash64>,
    pub exclude: Vec<Hash64>,
}

impl DomainConstraint {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Sorts and dedupes both sides; parse order is not meaningful.
    pub fn normalize(&mut self) {
        self.include.sort_unstable_by_key(|h| h.to_u64());
        self.include.dedup();
        self.exclude.sort_unstable_by_key(|h| h.to_u64());
        self.exclude.dedup();
    }
}

/// How the pattern is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnchorKind {
    #[default]
    None,
    Left,
    Hostname,
    Regex,
}

/// `$header=` match specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderMatch {
    pub name: String,
    pub value: Option<String>,
    pub negate: bool,
}

/// `$redirect=` / `$redirect-rule=` directive payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRef {
    pub token: String,
    pub priority: i16,
}

/// One network rule in compiler IR form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkRule {
    pub action_raw: u8,
    pub flags: RuleFlags,
    /// Set for host-only rules; these go to the domain index, not the
    /// pattern pool.
    pub hostname: Option<String>,
    /// Pattern text with anchors stripped. Lowercased unless `MATCH_CASE`.
    pub pattern: Option<String>,
    pub anchor: AnchorKind,
    pub type_mask: u32,
    pub party_mask: u8,
    pub scheme_mask: u8,
    pub constraint: Option<DomainConstraint>,
    pub redirect: Option<RedirectRef>,
    pub removeparam: Option<String>,
    pub csp: Option<String>,
    pub header: Option<HeaderMatch>,
    pub badfilter: bool,
    pub priority: i16,
    pub list_id: u16,
}

impl NetworkRule {
    pub fn action(&self) -> RuleAction {
        RuleAction::try_from(self.action_raw).unwrap_or(RuleAction::Block)
    }
}

/// A hostname-scoped record: cosmetic, procedural, scriptlet, or
/// responseheader payload text plus scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRule {
    pub constraint: DomainConstraint,
    pub text: String,
    pub exception: bool,
    /// True when the rule has no include scope (applies everywhere).
    pub generic: bool,
    pub list_id: u16,
}

/// Parse result for one network line: most lines produce one rule,
/// `$redirect=` produces two, `$responseheader=` produces a scoped record.
#[derive(Debug, Default)]
pub struct ParsedNetwork {
    pub rules: Vec<NetworkRule>,
    pub responseheader: Option<ScopedRule>,
}

// --------------------------
// Entry points
// --------------------------

/// Parses one network filter line into IR.
pub fn parse_network(line: &str, list_id: u16) -> Result<ParsedNetwork, SkipReason> {
    let mut rest = line.trim();
    let mut action = RuleAction::Block;
    if let Some(stripped) = rest.strip_prefix("@@") {
        action = RuleAction::Allow;
        rest = stripped.trim_start();
    }

    let (pattern_part, options_part) = split_options(rest);
    let pattern_part = pattern_part.trim();
    if pattern_part.is_empty() && options_part.is_none() {
        return Err(SkipReason::EmptyPattern);
    }
    if pattern_part.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(SkipReason::EmptyPattern);
    }

    let mut opts = match options_part {
        Some(text) => parse_options(text, action)?,
        None => Options::default(),
    };
    if let Some(c) = opts.constraint.as_mut() {
        c.normalize();
    }

    // `$responseheader=` scopes by hostname or $domain=, and compiles to a
    // scoped record rather than a RULES row.
    if let Some(name) = opts.responseheader.take() {
        let constraint = responseheader_scope(pattern_part, opts.constraint.take())?;
        let generic = constraint.include.is_empty();
        return Ok(ParsedNetwork {
            rules: Vec::new(),
            responseheader: Some(ScopedRule {
                constraint,
                text: name,
                exception: action == RuleAction::Allow,
                generic,
                list_id,
            }),
        });
    }

    let mut rule = NetworkRule {
        action_raw: action as u8,
        flags: opts.flags,
        type_mask: opts.type_mask,
        party_mask: opts.party_mask,
        scheme_mask: opts.scheme_mask,
        constraint: opts.constraint.take(),
        removeparam: opts.removeparam.take(),
        csp: opts.csp.take(),
        header: opts.header.take(),
        badfilter: opts.badfilter,
        list_id,
        ..NetworkRule::default()
    };

    // Option-implied actions. Order matters: removeparam/csp/header change
    // the action of block-class rules; on exceptions they stay Allow and the
    // option payload marks what the exception targets.
    if action == RuleAction::Block {
        if rule.removeparam.is_some() {
            rule.action_raw = RuleAction::Removeparam as u8;
        } else if rule.csp.is_some() {
            rule.action_raw = RuleAction::CspInject as u8;
        } else if rule.header.is_some() {
            rule.action_raw = RuleAction::HeaderMatchBlock as u8;
        }
    } else if rule.header.is_some() {
        rule.action_raw = RuleAction::HeaderMatchAllow as u8;
    } else if rule.csp.is_some() {
        rule.flags |= RuleFlags::CSP_EXCEPTION;
    }

    parse_pattern_into(pattern_part, &mut rule)?;

    let mut out = ParsedNetwork::default();

    match opts.redirect.take() {
        Some(directive) if action == RuleAction::Block && rule.action_raw == RuleAction::Block as u8 => {
            if opts.redirect_rule_only {
                // `$redirect-rule=`: directive only, no block half.
                let mut directive_rule = rule.clone();
                directive_rule.action_raw = RuleAction::RedirectDirective as u8;
                directive_rule.priority = directive.priority;
                directive_rule.redirect = Some(directive);
                out.rules.push(directive_rule);
            } else {
                let mut block_half = rule.clone();
                block_half.flags |= RuleFlags::FROM_REDIRECT;
                out.rules.push(block_half);

                let mut directive_rule = rule;
                directive_rule.action_raw = RuleAction::RedirectDirective as u8;
                directive_rule.priority = directive.priority;
                directive_rule.redirect = Some(directive);
                out.rules.push(directive_rule);
            }
        }
        Some(directive) if action == RuleAction::Allow => {
            // `@@...$redirect-rule=x` disables directives for resource x.
            rule.flags |= RuleFlags::REDIRECT_RULE_EXCEPTION;
            rule.redirect = Some(directive);
            out.rules.push(rule);
        }
        Some(_) => {
            // redirect combined with removeparam/csp/header makes no sense.
            return Err(SkipReason::UnsupportedOption);
        }
        None => out.rules.push(rule),
    }

    Ok(out)
}

/// Parses a hosts-file target into a host-only block rule.
pub fn parse_hosts_entry(host: &str, list_id: u16) -> Result<NetworkRule, SkipReason> {
    let hostname = normalize_domain(host).ok_or(SkipReason::NonAsciiDomain)?;
    Ok(NetworkRule {
        action_raw: RuleAction::Block as u8,
        flags: RuleFlags::HAS_HOST_ANCHOR,
        hostname: Some(hostname),
        anchor: AnchorKind::Hostname,
        list_id,
        ..NetworkRule::default()
    })
}

/// Builds the scope constraint for a cosmetic-family hostname prefix.
///
/// `example.com,~shop.example.com` becomes one include and one exclude hash.
pub fn parse_scope_hosts(hosts: &str) -> Result<DomainConstraint, SkipReason> {
    let mut constraint = DomainConstraint::default();
    for raw in hosts.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (exclude, host) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let host = normalize_domain(host).ok_or(SkipReason::NonAsciiDomain)?;
        let hash = hash_domain(&host);
        if exclude {
            constraint.exclude.push(hash);
        } else {
            constraint.include.push(hash);
        }
    }
    constraint.normalize();
    Ok(constraint)
}

// --------------------------
// Options
// --------------------------

#[derive(Debug, Default)]
struct Options {
    flags: RuleFlags,
    type_mask: u32,
    party_mask: u8,
    scheme_mask: u8,
    constraint: Option<DomainConstraint>,
    redirect: Option<RedirectRef>,
    redirect_rule_only: bool,
    removeparam: Option<String>,
    csp: Option<String>,
    header: Option<HeaderMatch>,
    responseheader: Option<String>,
    badfilter: bool,
}

fn split_options(line: &str) -> (&str, Option<&str>) {
    // A whole-line regex keeps its '$' anchors; options after a regex arrive
    // as /re/$opts and are caught by the rfind below.
    if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
        return (line, None);
    }
    match line.rfind('$') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    }
}

/// Case-insensitive option prefix match that hands back the value with its
/// original casing (removeparam names and header values are case-relevant).
fn option_value<'a>(raw: &'a str, lower: &str, prefix: &str) -> Option<&'a str> {
    if lower.starts_with(prefix) {
        Some(&raw[prefix.len()..])
    } else {
        None
    }
}

fn parse_options(text: &str, action: RuleAction) -> Result<Options, SkipReason> {
    let mut opts = Options::default();
    let mut type_include = 0u32;
    let mut type_exclude = 0u32;
    let mut party_include = 0u8;
    let mut party_exclude = 0u8;
    let mut scheme_include = 0u8;
    let mut scheme_exclude = 0u8;

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let lower = raw.to_ascii_lowercase();

        if let Some(value) = option_value(raw, &lower, "domain=") {
            let parsed = parse_domain_option(value)?;
            let entry = opts.constraint.get_or_insert_with(DomainConstraint::default);
            entry.include.extend(parsed.include);
            entry.exclude.extend(parsed.exclude);
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "redirect=") {
            opts.redirect = Some(parse_redirect_ref(value)?);
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "redirect-rule=") {
            opts.redirect = Some(parse_redirect_ref(value)?);
            opts.redirect_rule_only = action == RuleAction::Block;
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "removeparam=") {
            opts.removeparam = Some(value.to_string());
            continue;
        }
        if lower == "removeparam" {
            // Bare removeparam strips the entire query.
            opts.removeparam = Some(String::new());
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "csp=") {
            opts.csp = Some(value.to_string());
            continue;
        }
        if lower == "csp" {
            if action != RuleAction::Allow {
                return Err(SkipReason::UnsupportedOption);
            }
            opts.csp = Some(String::new());
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "header=") {
            opts.header = Some(parse_header_option(value)?);
            continue;
        }
        if let Some(value) = option_value(raw, &lower, "responseheader=") {
            if value.is_empty() {
                return Err(SkipReason::UnknownOption);
            }
            opts.responseheader = Some(value.to_ascii_lowercase());
            continue;
        }

        match lower.as_str() {
            "important" => {
                opts.flags |= RuleFlags::IMPORTANT;
                continue;
            }
            "match-case" => {
                opts.flags |= RuleFlags::MATCH_CASE;
                continue;
            }
            "badfilter" => {
                opts.badfilter = true;
                continue;
            }
            "elemhide" | "ehide" => {
                if action != RuleAction::Allow {
                    return Err(SkipReason::UnsupportedOption);
                }
                opts.flags |= RuleFlags::ELEMHIDE;
                continue;
            }
            "generichide" | "ghide" => {
                if action != RuleAction::Allow {
                    return Err(SkipReason::UnsupportedOption);
                }
                opts.flags |= RuleFlags::GENERICHIDE;
                continue;
            }
            _ => {}
        }

        let (negated, name) = match lower.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, lower.as_str()),
        };
        if name.is_empty() || name.contains('=') {
            return Err(SkipReason::UnknownOption);
        }

        if let Some(mask) = type_option(name) {
            if negated {
                type_exclude |= mask;
            } else {
                type_include |= mask;
            }
            continue;
        }
        if let Some(mask) = party_option(name) {
            if negated {
                party_exclude |= mask;
            } else {
                party_include |= mask;
            }
            continue;
        }
        if let Some(mask) = scheme_option(name) {
            if negated {
                scheme_exclude |= mask;
            } else {
                scheme_include |= mask;
            }
            continue;
        }

        return Err(SkipReason::UnknownOption);
    }

    opts.type_mask = finalize_mask(type_include, type_exclude, TypeMask::ALL.bits())
        .ok_or(SkipReason::UnsupportedOption)?;
    opts.party_mask = finalize_mask(
        party_include as u32,
        party_exclude as u32,
        PartyMask::ALL.bits() as u32,
    )
    .ok_or(SkipReason::UnsupportedOption)? as u8;
    opts.scheme_mask = finalize_mask(
        scheme_include as u32,
        scheme_exclude as u32,
        SchemeMask::ALL.bits() as u32,
    )
    .ok_or(SkipReason::UnsupportedOption)? as u8;

    Ok(opts)
}

/// Collapses include/exclude sets into one stored mask. A mask equal to the
/// full set is stored as zero ("no restriction"); an empty result kills the
/// rule.
fn finalize_mask(include: u32, exclude: u32, all: u32) -> Option<u32> {
    let include = include & all;
    let exclude = exclude & all;
    let mask = if include != 0 {
        include & !exclude
    } else {
        all & !exclude
    };
    if mask == 0 {
        return None;
    }
    Some(if mask == all { 0 } else { mask })
}

fn type_option(name: &str) -> Option<u32> {
    let mask = match name {
        "script" => TypeMask::SCRIPT,
        "image" | "background" => TypeMask::IMAGE,
        "stylesheet" | "css" => TypeMask::STYLESHEET,
        "object" => TypeMask::OBJECT,
        "subdocument" | "frame" => TypeMask::SUBDOCUMENT,
        "main_frame" => TypeMask::MAIN_FRAME,
        "document" | "doc" => TypeMask::DOCUMENT,
        "xmlhttprequest" | "xhr" => TypeMask::XHR,
        "websocket" => TypeMask::WEBSOCKET,
        "font" => TypeMask::FONT,
        "media" => TypeMask::MEDIA,
        "ping" | "beacon" => TypeMask::PING,
        "other" => TypeMask::OTHER,
        _ => return None,
    };
    Some(mask.bits())
}

fn party_option(name: &str) -> Option<u8> {
    let mask = match name {
        "third-party" | "3p" => PartyMask::THIRD_PARTY,
        "first-party" | "1p" => PartyMask::FIRST_PARTY,
        _ => return None,
    };
    Some(mask.bits())
}

fn scheme_option(name: &str) -> Option<u8> {
    let mask = match name {
        "http" => SchemeMask::HTTP,
        "https" => SchemeMask::HTTPS,
        "ws" => SchemeMask::WS,
        "wss" => SchemeMask::WSS,
        "data" => SchemeMask::DATA,
        "ftp" => SchemeMask::FTP,
        _ => return None,
    };
    Some(mask.bits())
}

fn parse_domain_option(value: &str) -> Result<DomainConstraint, SkipReason> {
    let mut constraint = DomainConstraint::default();
    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (exclude, domain) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let domain = normalize_domain(domain).ok_or(SkipReason::NonAsciiDomain)?;
        let hash = hash_domain(&domain);
        if exclude {
            constraint.exclude.push(hash);
        } else {
            constraint.include.push(hash);
        }
    }
    if constraint.is_empty() {
        return Err(SkipReason::UnknownOption);
    }
    Ok(constraint)
}

fn parse_redirect_ref(value: &str) -> Result<RedirectRef, SkipReason> {
    if value.is_empty() {
        return Err(SkipReason::UnknownOption);
    }
    // uBO ranks competing directives with `token:priority`.
    if let Some((token, prio)) = value.rsplit_once(':') {
        if let Ok(priority) = prio.parse::<i16>() {
            if token.is_empty() {
                return Err(SkipReason::UnknownOption);
            }
            return Ok(RedirectRef {
                token: token.to_string(),
                priority,
            });
        }
    }
    Ok(RedirectRef {
        token: value.to_string(),
        priority: 0,
    })
}

fn parse_header_option(value: &str) -> Result<HeaderMatch, SkipReason> {
    if value.is_empty() {
        return Err(SkipReason::UnknownOption);
    }
    let (name, raw_value) = match value.split_once(':') {
        Some((n, v)) => (n, Some(v)),
        None => (value, None),
    };
    // Negation sits on the name for presence tests and on the value for
    // substring tests.
    let (mut negate, name) = match name.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let raw_value = raw_value.map(|v| match v.strip_prefix('~') {
        Some(rest) => {
            negate = true;
            rest
        }
        None => v,
    });
    if name.is_empty() {
        return Err(SkipReason::UnknownOption);
    }
    Ok(HeaderMatch {
        name: name.to_string(),
        value: raw_value.filter(|v| !v.is_empty()).map(|v| v.to_string()),
        negate,
    })
}

fn responseheader_scope(
    pattern: &str,
    constraint: Option<DomainConstraint>,
) -> Result<DomainConstraint, SkipReason> {
    if let Some(c) = constraint {
        return Ok(c);
    }
    let body = pattern.strip_prefix("||").unwrap_or(pattern);
    if let Some(host) = host_only_target(body) {
        let mut c = DomainConstraint::default();
        c.include.push(hash_domain(&host));
        return Ok(c);
    }
    if pattern.is_empty() || pattern == "*" {
        return Ok(DomainConstraint::default());
    }
    Err(SkipReason::UnsupportedOption)
}

// --------------------------
// Pattern forms
// --------------------------

fn parse_pattern_into(pattern: &str, rule: &mut NetworkRule) -> Result<(), SkipReason> {
    // Regex form: /.../  (a bare "/" path prefix is not a regex).
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let source = &pattern[1..pattern.len() - 1];
        rule.anchor = AnchorKind::Regex;
        rule.flags |= RuleFlags::IS_REGEX;
        rule.pattern = Some(source.to_string());
        return Ok(());
    }

    let (mut anchor, mut rest) = if let Some(stripped) = pattern.strip_prefix("||") {
        (AnchorKind::Hostname, stripped)
    } else if let Some(stripped) = pattern.strip_prefix('|') {
        (AnchorKind::Left, stripped)
    } else {
        (AnchorKind::None, pattern)
    };

    let mut right_anchor = false;
    if let Some(stripped) = rest.strip_suffix('|') {
        right_anchor = true;
        rest = stripped;
    }

    // `||` must anchor to at least one host label; `||*x` and friends have
    // none and degrade to unanchored patterns.
    if anchor == AnchorKind::Hostname {
        let host_len = rest
            .find(|c| c == '/' || c == '^' || c == '*')
            .unwrap_or(rest.len());
        if host_len == 0 {
            anchor = AnchorKind::None;
        }
    }

    if rest.is_empty() && anchor == AnchorKind::None && !right_anchor {
        // Pure-option rules ("*$removeparam=x" arrives as "*") keep a
        // wildcard pattern; a genuinely empty body is only valid with
        // options that imply one.
        if rule.removeparam.is_none() && rule.csp.is_none() && rule.header.is_none() {
            return Err(SkipReason::EmptyPattern);
        }
        rule.anchor = AnchorKind::None;
        rule.pattern = None;
        return Ok(());
    }

    if !rest.is_ascii() {
        return Err(SkipReason::NonAsciiDomain);
    }

    rule.anchor = anchor;
    match anchor {
        AnchorKind::Hostname => {
            rule.flags |= RuleFlags::HAS_HOST_ANCHOR;
            if let Some(host) = host_only_target(rest) {
                // `||example.com^` and friends: pure hostname rule.
                rule.hostname = Some(host);
                if right_anchor {
                    rule.flags |= RuleFlags::HAS_RIGHT_ANCHOR;
                }
                return Ok(());
            }
        }
        AnchorKind::Left => rule.flags |= RuleFlags::HAS_LEFT_ANCHOR,
        _ => {}
    }
    if right_anchor {
        rule.flags |= RuleFlags::HAS_RIGHT_ANCHOR;
    }

    // `*` alone is no pattern at all.
    if rest.chars().all(|c| c == '*') && anchor == AnchorKind::None && !right_anchor {
        rule.pattern = None;
        return Ok(());
    }

    let text = if rule.flags.contains(RuleFlags::MATCH_CASE) {
        rest.to_string()
    } else {
        rest.to_ascii_lowercase()
    };
    rule.pattern = Some(text);
    Ok(())
}

/// `||host^`-reducible check: the body is a bare hostname, optionally with a
/// trailing `^`. Returns the normalized hostname.
fn host_only_target(body: &str) -> Option<String> {
    let body = body.strip_prefix('.').unwrap_or(body);
    let body = body.strip_suffix('^').unwrap_or(body);
    if body.is_empty() {
        return None;
    }
    normalize_domain(body)
}

/// Lowercases and validates a hostname: ASCII letters, digits, `.`, `-`, `_`.
pub fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
    {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(line: &str) -> NetworkRule {
        let parsed = parse_network(line, 0).expect("parse");
        assert_eq!(parsed.rules.len(), 1, "{line}");
        parsed.rules.into_iter().next().unwrap()
    }

    #[test]
    fn host_only_rules() {
        let rule = one("||doubleclick.net^");
        assert_eq!(rule.action(), RuleAction::Block);
        assert_eq!(rule.hostname.as_deref(), Some("doubleclick.net"));
        assert_eq!(rule.pattern, None);
        assert_eq!(rule.anchor, AnchorKind::Hostname);

        let rule = one("@@||news.example.com^$document");
        assert_eq!(rule.action(), RuleAction::Allow);
        assert_eq!(rule.hostname.as_deref(), Some("news.example.com"));
        assert_eq!(rule.type_mask, TypeMask::DOCUMENT.bits());
    }

    #[test]
    fn pattern_rules_keep_anchors() {
        let rule = one("||googletagmanager.com/gtm.js$script");
        assert_eq!(rule.hostname, None);
        assert_eq!(rule.pattern.as_deref(), Some("googletagmanager.com/gtm.js"));
        assert_eq!(rule.anchor, AnchorKind::Hostname);
        assert_eq!(rule.type_mask, TypeMask::SCRIPT.bits());

        let rule = one("|https://cdn.example.com/app");
        assert_eq!(rule.anchor, AnchorKind::Left);
        assert!(rule.flags.contains(RuleFlags::HAS_LEFT_ANCHOR));

        let rule = one("/banner.gif|");
        assert!(rule.flags.contains(RuleFlags::HAS_RIGHT_ANCHOR));
        assert_eq!(rule.pattern.as_deref(), Some("/banner.gif"));
    }

    #[test]
    fn options_masks() {
        let rule = one("||ads.example.com/x$script,third-party");
        assert_eq!(rule.type_mask, TypeMask::SCRIPT.bits());
        assert_eq!(rule.party_mask, PartyMask::THIRD_PARTY.bits());

        let rule = one("||ads.example.com/x$~script");
        assert_eq!(rule.type_mask, TypeMask::ALL.bits() & !TypeMask::SCRIPT.bits());

        // All-types include collapses to "no restriction".
        let rule = one("||ads.example.com/x$important");
        assert_eq!(rule.type_mask, 0);
        assert!(rule.flags.contains(RuleFlags::IMPORTANT));
    }

    #[test]
    fn unknown_option_skips() {
        assert_eq!(
            parse_network("||x.com/y$unknownopt", 0).unwrap_err(),
            SkipReason::UnknownOption
        );
        assert_eq!(
            parse_network("||x.com/y$popup=3", 0).unwrap_err(),
            SkipReason::UnknownOption
        );
    }

    #[test]
    fn domain_constraint_hashes_domains_as_written() {
        let rule = one("/banner.gif$domain=example.com|~shop.example.com");
        let c = rule.constraint.expect("constraint");
        assert_eq!(c.include, vec![hash_domain("example.com")]);
        assert_eq!(c.exclude, vec![hash_domain("shop.example.com")]);
    }

    #[test]
    fn redirect_splits_into_block_and_directive() {
        let parsed = parse_network("||googletagmanager.com/gtm.js$script,redirect=noop.js", 0).unwrap();
        assert_eq!(parsed.rules.len(), 2);
        let block = &parsed.rules[0];
        let directive = &parsed.rules[1];
        assert_eq!(block.action(), RuleAction::Block);
        assert!(block.flags.contains(RuleFlags::FROM_REDIRECT));
        assert_eq!(directive.action(), RuleAction::RedirectDirective);
        assert_eq!(directive.redirect.as_ref().unwrap().token, "noop.js");
    }

    #[test]
    fn redirect_rule_emits_directive_only() {
        let parsed = parse_network("||x.com/ads$redirect-rule=noop.js:10", 0).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        let directive = &parsed.rules[0];
        assert_eq!(directive.action(), RuleAction::RedirectDirective);
        assert_eq!(directive.priority, 10);
    }

    #[test]
    fn redirect_rule_exception() {
        let rule = one("@@||x.com/ads$redirect-rule=noop.js");
        assert_eq!(rule.action(), RuleAction::Allow);
        assert!(rule.flags.contains(RuleFlags::REDIRECT_RULE_EXCEPTION));
        assert_eq!(rule.redirect.as_ref().unwrap().token, "noop.js");
    }

    #[test]
    fn removeparam_forms() {
        let rule = one("*$removeparam=gclid");
        assert_eq!(rule.action(), RuleAction::Removeparam);
        assert_eq!(rule.removeparam.as_deref(), Some("gclid"));
        assert_eq!(rule.pattern, None);

        let rule = one("||shop.example.com^$removeparam");
        assert_eq!(rule.removeparam.as_deref(), Some(""));

        let rule = one("@@||shop.example.com^$removeparam=gclid");
        assert_eq!(rule.action(), RuleAction::Allow);
    }

    #[test]
    fn csp_forms() {
        let rule = one("||example.com^$csp=script-src 'none'");
        assert_eq!(rule.action(), RuleAction::CspInject);
        assert_eq!(rule.csp.as_deref(), Some("script-src 'none'"));

        let rule = one("@@||example.com^$csp");
        assert_eq!(rule.action(), RuleAction::Allow);
        assert!(rule.flags.contains(RuleFlags::CSP_EXCEPTION));
        assert_eq!(rule.csp.as_deref(), Some(""));
    }

    #[test]
    fn header_forms() {
        let rule = one("||example.com^$header=server:cloudflare");
        assert_eq!(rule.action(), RuleAction::HeaderMatchBlock);
        let spec = rule.header.unwrap();
        assert_eq!(spec.name, "server");
        assert_eq!(spec.value.as_deref(), Some("cloudflare"));
        assert!(!spec.negate);

        let rule = one("@@||example.com^$header=server:cloudflare");
        assert_eq!(rule.action(), RuleAction::HeaderMatchAllow);
    }

    #[test]
    fn responseheader_option_becomes_scoped_record() {
        let parsed = parse_network("||example.com^$responseheader=set-cookie", 0).unwrap();
        assert!(parsed.rules.is_empty());
        let record = parsed.responseheader.unwrap();
        assert_eq!(record.text, "set-cookie");
        assert!(!record.exception);
        assert_eq!(record.constraint.include, vec![hash_domain("example.com")]);
    }

    #[test]
    fn regex_form() {
        let rule = one(r"/ads[0-9]+\.js/");
        assert_eq!(rule.anchor, AnchorKind::Regex);
        assert!(rule.flags.contains(RuleFlags::IS_REGEX));
        assert_eq!(rule.pattern.as_deref(), Some(r"ads[0-9]+\.js"));
    }

    #[test]
    fn badfilter_flag_survives() {
        let rule = one("||ads.example.com^$badfilter");
        assert!(rule.badfilter);
        assert_eq!(rule.hostname.as_deref(), Some("ads.example.com"));
    }

    #[test]
    fn elemhide_only_on_exceptions() {
        let rule = one("@@||example.com^$generichide");
        assert!(rule.flags.contains(RuleFlags::GENERICHIDE));
        assert_eq!(
            parse_network("||example.com^$generichide", 0).unwrap_err(),
            SkipReason::UnsupportedOption
        );
    }

    #[test]
    fn match_case_preserves_pattern_bytes() {
        let rule = one("||example.com/TrackPixel$match-case");
        assert_eq!(rule.pattern.as_deref(), Some("example.com/TrackPixel"));
        let rule = one("||example.com/TrackPixel");
        assert_eq!(rule.pattern.as_deref(), Some("example.com/trackpixel"));
    }

    #[test]
    fn scope_hosts_parse() {
        let c = parse_scope_hosts("example.com,~shop.example.com").unwrap();
        assert_eq!(c.include.len(), 1);
        assert_eq!(c.exclude.len(), 1);
        let c = parse_scope_hosts("").unwrap();
        assert!(c.is_empty());
    }
}

//! Filter-list line classification.
//!
//! The first compile stage: decide what each raw line is before any real
//! parsing happens. Network rules are handed to the parser as-is; cosmetic
//! family lines are split into their hostname prefix and body here, because
//! the `##`/`#@#`/`#?#` separator is what distinguishes them.

use std::net::IpAddr;

/// What one trimmed, non-empty line turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// `!` comments and `[Adblock Plus 2.0]`-style section headers.
    Comment,
    /// A network filter, body passed through verbatim.
    Network(&'a str),
    /// `hosts(5)` entry mapping a blocked hostname.
    HostsEntry(&'a str),
    /// `prefix##selector`
    Cosmetic { hosts: &'a str, body: &'a str },
    /// `prefix#@#selector`
    CosmeticException { hosts: &'a str, body: &'a str },
    /// `prefix#?#program`
    Procedural { hosts: &'a str, body: &'a str },
    /// `prefix#@#+js(...)` — carved out of the exception family.
    ScriptletException { hosts: &'a str, body: &'a str },
    /// `prefix##+js(...)`
    Scriptlet { hosts: &'a str, body: &'a str },
    /// `prefix##^responseheader(name)`
    ResponseHeader { hosts: &'a str, name: &'a str },
    /// `prefix#@#^responseheader(name)`
    ResponseHeaderException { hosts: &'a str, name: &'a str },
    /// A cosmetic-family line whose body could not be carved up.
    Malformed,
}

/// Classifies one line. The caller is expected to have skipped blank lines.
pub fn classify(line: &str) -> LineKind<'_> {
    debug_assert!(!line.is_empty());

    if line.starts_with('!') || line.starts_with('[') {
        return LineKind::Comment;
    }

    // Exception separator first: "#@#" also contains "##".
    if let Some(pos) = line.find("#@#") {
        let (hosts, body) = (&line[..pos], &line[pos + 3..]);
        return classify_cosmetic_body(hosts, body, true);
    }
    if let Some(pos) = line.find("#?#") {
        let (hosts, body) = (&line[..pos], &line[pos + 3..]);
        if body.is_empty() {
            return LineKind::Malformed;
        }
        return LineKind::Procedural { hosts, body };
    }
    if let Some(pos) = line.find("##") {
        let (hosts, body) = (&line[..pos], &line[pos + 2..]);
        return classify_cosmetic_body(hosts, body, false);
    }

    match hosts_file_target(line) {
        HostsLine::Entry(host) => return LineKind::HostsEntry(host),
        HostsLine::SelfMapping => return LineKind::Comment,
        HostsLine::No => {}
    }

    LineKind::Network(line)
}

fn classify_cosmetic_body<'a>(hosts: &'a str, body: &'a str, exception: bool) -> LineKind<'a> {
    if let Some(call) = body.strip_prefix("+js(") {
        let inner = match call.strip_suffix(')') {
            Some(inner) => inner,
            None => return LineKind::Malformed,
        };
        return if exception {
            LineKind::ScriptletException { hosts, body: inner }
        } else {
            LineKind::Scriptlet { hosts, body: inner }
        };
    }

    if let Some(call) = body.strip_prefix("^responseheader(") {
        let name = match call.strip_suffix(')') {
            Some(name) if !name.is_empty() => name,
            _ => return LineKind::Malformed,
        };
        return if exception {
            LineKind::ResponseHeaderException { hosts, name }
        } else {
            LineKind::ResponseHeader { hosts, name }
        };
    }

    // Other `##^...` HTML-filter forms are not supported.
    if body.starts_with('^') {
        return LineKind::Malformed;
    }

    if body.is_empty() {
        return LineKind::Malformed;
    }

    if exception {
        LineKind::CosmeticException { hosts, body }
    } else {
        LineKind::Cosmetic { hosts, body }
    }
}

enum HostsLine<'a> {
    Entry(&'a str),
    /// `127.0.0.1 localhost` and friends: ignored, not block rules.
    SelfMapping,
    No,
}

/// `0.0.0.0 ads.example.com` style lines: an IP followed by a hostname.
fn hosts_file_target(line: &str) -> HostsLine<'_> {
    let mut parts = line.split_whitespace();
    let (first, second) = match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => return HostsLine::No,
    };
    if first.parse::<IpAddr>().is_err() {
        return HostsLine::No;
    }
    if second == "localhost" || second == "localhost.localdomain" || second == "broadcasthost" {
        return HostsLine::SelfMapping;
    }
    HostsLine::Entry(second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_headers() {
        assert_eq!(classify("! a comment"), LineKind::Comment);
        assert_eq!(classify("[Adblock Plus 2.0]"), LineKind::Comment);
    }

    #[test]
    fn network_lines_pass_through() {
        assert_eq!(classify("||ads.example.com^"), LineKind::Network("||ads.example.com^"));
        assert_eq!(classify("@@||cdn.example.com^$script"), LineKind::Network("@@||cdn.example.com^$script"));
        assert_eq!(classify("/banner.gif$image"), LineKind::Network("/banner.gif$image"));
    }

    #[test]
    fn hosts_entries() {
        assert_eq!(classify("0.0.0.0 ads.example.com"), LineKind::HostsEntry("ads.example.com"));
        assert_eq!(classify("127.0.0.1 tracker.test"), LineKind::HostsEntry("tracker.test"));
        assert_eq!(classify("::1 blocked.test"), LineKind::HostsEntry("blocked.test"));
        // Stock self-mappings are ignored outright.
        assert_eq!(classify("127.0.0.1 localhost"), LineKind::Comment);
    }

    #[test]
    fn cosmetic_family() {
        assert_eq!(
            classify("example.com##.ad"),
            LineKind::Cosmetic { hosts: "example.com", body: ".ad" }
        );
        assert_eq!(classify("##.ad"), LineKind::Cosmetic { hosts: "", body: ".ad" });
        assert_eq!(
            classify("example.com#@#.ad"),
            LineKind::CosmeticException { hosts: "example.com", body: ".ad" }
        );
        assert_eq!(
            classify("example.com#?#div:has(.sponsor)"),
            LineKind::Procedural { hosts: "example.com", body: "div:has(.sponsor)" }
        );
    }

    #[test]
    fn scriptlets() {
        assert_eq!(
            classify("example.com##+js(set-constant, a, b)"),
            LineKind::Scriptlet { hosts: "example.com", body: "set-constant, a, b" }
        );
        assert_eq!(
            classify("example.com#@#+js()"),
            LineKind::ScriptletException { hosts: "example.com", body: "" }
        );
        assert_eq!(
            classify("#@#+js()"),
            LineKind::ScriptletException { hosts: "", body: "" }
        );
    }

    #[test]
    fn responseheaders() {
        assert_eq!(
            classify("example.com##^responseheader(set-cookie)"),
            LineKind::ResponseHeader { hosts: "example.com", name: "set-cookie" }
        );
        assert_eq!(
            classify("example.com#@#^responseheader(set-cookie)"),
            LineKind::ResponseHeaderException { hosts: "example.com", name: "set-cookie" }
        );
    }

    #[test]
    fn malformed_cosmetics() {
        assert_eq!(classify("example.com##"), LineKind::Malformed);
        assert_eq!(classify("example.com##+js(broken"), LineKind::Malformed);
        assert_eq!(classify("example.com##^other(x)"), LineKind::Malformed);
    }
}

//! End-to-end scenarios: compile real filter text, install the snapshot,
//! drive the public entry points.

use ubx_engine::{
    compile_filter_lists, CompileOptions, Decision, Engine, EngineConfig, Header, RequestInfo,
};

fn engine_with(lists: &[&str]) -> Engine {
    let out = compile_filter_lists(lists, &CompileOptions::default()).expect("compile");
    let mut engine = Engine::new(EngineConfig::default());
    engine.install(out.snapshot_bytes).expect("install");
    engine
}

fn request<'a>(
    url: &'a str,
    type_name: &'a str,
    initiator: Option<&'a str>,
    tab_id: i32,
) -> RequestInfo<'a> {
    RequestInfo {
        url,
        type_name,
        initiator,
        tab_id,
        frame_id: 0,
        request_id: 7,
    }
}

#[test]
fn pure_block_on_hostname() {
    let mut engine = engine_with(&["||doubleclick.net^"]);
    let verdict = engine.match_request(&request(
        "https://ads.doubleclick.net/pixel.gif",
        "image",
        Some("https://news.example.com/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Block);
    assert!(verdict.rule_id >= 0);
}

#[test]
fn exception_beats_block() {
    let mut engine = engine_with(&["||doubleclick.net^\n@@||news.example.com^$document"]);
    let verdict = engine.match_request(&request(
        "https://news.example.com/",
        "main_frame",
        None,
        1,
    ));
    assert_eq!(verdict.decision, Decision::Allow);
}

#[test]
fn important_defeats_exception() {
    let mut engine = engine_with(&["@@||tracker.test^\n||tracker.test^$important"]);
    let verdict = engine.match_request(&request(
        "https://tracker.test/beacon",
        "ping",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Block);
}

#[test]
fn redirect_surrogate() {
    let mut engine = engine_with(&["||googletagmanager.com/gtm.js$script,redirect=noop.js"]);
    let verdict = engine.match_request(&request(
        "https://www.googletagmanager.com/gtm.js?id=GTM-XXXX",
        "script",
        Some("https://shop.example.com/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Redirect);
    assert_eq!(verdict.redirect_url.as_deref(), Some("/web_accessible/noop.js"));
}

#[test]
fn removeparam_sanitizes_then_suppresses_loop() {
    let mut engine = engine_with(&["*$removeparam=gclid"]);
    let req = request(
        "https://shop.example.com/p?gclid=abc&x=1",
        "main_frame",
        None,
        7,
    );

    let first = engine.match_request(&req);
    assert_eq!(first.decision, Decision::Removeparam);
    assert_eq!(
        first.redirect_url.as_deref(),
        Some("https://shop.example.com/p?x=1")
    );

    // Same original URL, same (tab, frame), inside the TTL: loop suppressed.
    let second = engine.match_request(&req);
    assert_eq!(second.decision, Decision::Allow);

    // The sanitized URL itself passes straight through.
    let sanitized = engine.match_request(&request(
        "https://shop.example.com/p?x=1",
        "main_frame",
        None,
        7,
    ));
    assert_eq!(sanitized.decision, Decision::Allow);
}

#[test]
fn domain_scoped_rule() {
    let mut engine = engine_with(&["/banner.gif$domain=example.com|~shop.example.com"]);

    let on_example = engine.match_request(&request(
        "https://cdn.test/banner.gif",
        "image",
        Some("https://example.com/"),
        1,
    ));
    assert_eq!(on_example.decision, Decision::Block);

    let on_shop = engine.match_request(&request(
        "https://cdn.test/banner.gif",
        "image",
        Some("https://shop.example.com/"),
        1,
    ));
    assert_eq!(on_shop.decision, Decision::Allow);
}

#[test]
fn cosmetic_with_generichide() {
    let mut engine = engine_with(&["##.ad\nexample.com#@#generichide\nexample.com##.site-ad"]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));

    assert!(verdict.css.contains(".site-ad"));
    assert!(!verdict.css.contains(".ad,"));
    assert!(!verdict.css.starts_with(".ad"));
    assert!(!verdict.enable_generic);
}

// --------------------------
// Supplemental coverage
// --------------------------

#[test]
fn redirect_rule_exception_cancels_redirect_but_still_blocks() {
    let mut engine = engine_with(&[
        "||googletagmanager.com/gtm.js$script,redirect=noop.js\n@@||googletagmanager.com/gtm.js$redirect-rule=noop.js",
    ]);
    let verdict = engine.match_request(&request(
        "https://www.googletagmanager.com/gtm.js",
        "script",
        Some("https://shop.example.com/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(verdict.redirect_url, None);
}

#[test]
fn redirect_priority_picks_highest() {
    let mut engine = engine_with(&[
        "||ads.test/lib.js$script,redirect=noop.js:1\n||ads.test/lib.js$script,redirect=noop.txt:9",
    ]);
    let verdict = engine.match_request(&request(
        "https://ads.test/lib.js",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Redirect);
    assert_eq!(verdict.redirect_url.as_deref(), Some("/web_accessible/noop.txt"));
}

#[test]
fn third_party_option_is_enforced() {
    let mut engine = engine_with(&["||cdn.widgets.test^$script,third-party"]);

    let third = engine.match_request(&request(
        "https://cdn.widgets.test/w.js",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(third.decision, Decision::Block);

    let first = engine.match_request(&request(
        "https://cdn.widgets.test/w.js",
        "script",
        Some("https://www.widgets.test/"),
        1,
    ));
    assert_eq!(first.decision, Decision::Allow);
}

#[test]
fn type_mask_selects_resource_kinds() {
    let mut engine = engine_with(&["||media.test^$image,media"]);
    let img = engine.match_request(&request(
        "https://media.test/a.png",
        "image",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(img.decision, Decision::Block);

    let script = engine.match_request(&request(
        "https://media.test/a.js",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(script.decision, Decision::Allow);
}

#[test]
fn left_anchor_requires_prefix() {
    let mut engine = engine_with(&["|https://exact.test/app"]);
    let hit = engine.match_request(&request(
        "https://exact.test/app.js",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(hit.decision, Decision::Block);

    // The literal appears mid-URL only; the anchor must reject it.
    let miss = engine.match_request(&request(
        "https://proxy.test/?u=https://exact.test/app",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(miss.decision, Decision::Allow);
}

#[test]
fn match_case_patterns_compare_bytes() {
    let mut engine = engine_with(&["||pixel.test/TrackPixel$match-case"]);
    let exact = engine.match_request(&request(
        "https://pixel.test/TrackPixel",
        "image",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(exact.decision, Decision::Block);

    let folded = engine.match_request(&request(
        "https://pixel.test/trackpixel",
        "image",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(folded.decision, Decision::Allow);
}

#[test]
fn hosts_file_entries_block() {
    let mut engine = engine_with(&["0.0.0.0 nasty.tracker.test\n127.0.0.1 localhost"]);
    let verdict = engine.match_request(&request(
        "https://nasty.tracker.test/x",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Block);
}

#[test]
fn subdomains_match_hostname_rules() {
    let mut engine = engine_with(&["||tracker.test^"]);
    for host in ["tracker.test", "a.tracker.test", "a.b.c.tracker.test"] {
        let url = format!("https://{host}/x.js");
        let verdict = engine.match_request(&request(&url, "script", Some("https://site.test/"), 1));
        assert_eq!(verdict.decision, Decision::Block, "{host}");
    }
    let cousin = engine.match_request(&request(
        "https://nottracker.test/x.js",
        "script",
        Some("https://site.test/"),
        1,
    ));
    assert_eq!(cousin.decision, Decision::Allow);
}

#[test]
fn csp_injection_and_exceptions() {
    let mut engine = engine_with(&["||example.com^$csp=script-src 'none'"]);
    let req = request("https://example.com/", "main_frame", None, 1);
    let headers = [Header { name: "Content-Type", value: "text/html" }];

    let verdict = engine.match_response_headers(&req, &headers);
    assert!(!verdict.cancel);
    assert_eq!(verdict.csp, vec!["script-src 'none'".to_string()]);

    // An empty $csp exception kills all injections for the scope.
    let mut engine = engine_with(&["||example.com^$csp=script-src 'none'\n@@||example.com^$csp"]);
    let verdict = engine.match_response_headers(&req, &headers);
    assert!(verdict.csp.is_empty());

    // A specific exception kills only the matching directive.
    let mut engine = engine_with(&[
        "||example.com^$csp=script-src 'none'\n||example.com^$csp=worker-src 'none'\n@@||example.com^$csp=script-src 'none'",
    ]);
    let verdict = engine.match_response_headers(&req, &headers);
    assert_eq!(verdict.csp, vec!["worker-src 'none'".to_string()]);
}

#[test]
fn header_match_block_and_exception() {
    let mut engine = engine_with(&["||example.com^$header=server:cloudflare"]);
    let req = request("https://example.com/", "main_frame", None, 1);

    let matching = [Header { name: "Server", value: "cloudflare" }];
    assert!(engine.match_response_headers(&req, &matching).cancel);

    let other = [Header { name: "Server", value: "nginx" }];
    assert!(!engine.match_response_headers(&req, &other).cancel);

    let mut engine = engine_with(&[
        "||example.com^$header=server:cloudflare\n@@||example.com^$header=server:cloudflare",
    ]);
    assert!(!engine.match_response_headers(&req, &matching).cancel);
}

#[test]
fn header_pipeline_gated_to_documents() {
    let mut engine = engine_with(&["||example.com^$header=server:cloudflare"]);
    let req = request("https://example.com/a.js", "script", Some("https://example.com/"), 1);
    let headers = [Header { name: "Server", value: "cloudflare" }];
    let verdict = engine.match_response_headers(&req, &headers);
    assert!(!verdict.cancel);
    assert!(verdict.csp.is_empty());
}

#[test]
fn responseheader_removal_safe_list_and_exception() {
    let mut engine = engine_with(&["example.com##^responseheader(set-cookie)"]);
    let req = request("https://example.com/", "main_frame", None, 1);
    let verdict = engine.match_response_headers(&req, &[]);
    assert_eq!(verdict.remove_headers, vec!["set-cookie".to_string()]);

    // Content-Security-Policy is never removable.
    let mut engine = engine_with(&[
        "example.com##^responseheader(content-security-policy)\nexample.com##^responseheader(location)",
    ]);
    let verdict = engine.match_response_headers(&req, &[]);
    assert_eq!(verdict.remove_headers, vec!["location".to_string()]);

    let mut engine = engine_with(&[
        "example.com##^responseheader(set-cookie)\nexample.com#@#^responseheader(set-cookie)",
    ]);
    let verdict = engine.match_response_headers(&req, &[]);
    assert!(verdict.remove_headers.is_empty());
}

#[test]
fn cosmetic_exception_subtracts_selector() {
    let mut engine = engine_with(&["example.com##.ad\nexample.com#@#.ad\nexample.com##.promo"]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert!(verdict.css.contains(".promo"));
    assert!(!verdict.css.contains(".ad,"));
    assert!(verdict.enable_generic);
}

#[test]
fn elemhide_disables_all_cosmetics() {
    let mut engine = engine_with(&[
        "##.ad\nexample.com##.site-ad\n@@||example.com^$elemhide\nexample.com#?#div:has(.sponsor)",
    ]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert!(verdict.css.is_empty());
    assert!(verdict.procedural.is_empty());
    assert!(!verdict.enable_generic);
}

#[test]
fn cosmetic_scope_honors_host_prefix() {
    let mut engine = engine_with(&["example.com,~shop.example.com##.banner"]);

    let on_example =
        engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert!(on_example.css.contains(".banner"));

    let on_sub =
        engine.match_cosmetics(&request("https://wiki.example.com/", "main_frame", None, 1));
    assert!(on_sub.css.contains(".banner"));

    let on_shop =
        engine.match_cosmetics(&request("https://shop.example.com/", "main_frame", None, 1));
    assert!(on_shop.css.is_empty());
}

#[test]
fn scriptlets_resolve_per_site() {
    let mut engine = engine_with(&[
        "example.com##+js(set-constant, adsEnabled, false)\nother.test##+js(no-fetch-if, beacon)",
    ]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert_eq!(verdict.scriptlets.len(), 1);
    assert_eq!(verdict.scriptlets[0].name, "set-constant");
    assert_eq!(verdict.scriptlets[0].args, vec!["adsEnabled", "false"]);
}

#[test]
fn scriptlet_disable_forms() {
    // Site-scoped empty exception disables that site's injections.
    let mut engine = engine_with(&[
        "example.com##+js(set-constant, adsEnabled, false)\nexample.com#@#+js()",
    ]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert!(verdict.scriptlets.is_empty());

    // Global empty exception disables everywhere.
    let mut engine = engine_with(&[
        "example.com##+js(set-constant, adsEnabled, false)\n#@#+js()",
    ]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert!(verdict.scriptlets.is_empty());
}

#[test]
fn procedural_programs_pass_through() {
    let mut engine = engine_with(&["example.com#?#div:has(> .sponsored)"]);
    let verdict = engine.match_cosmetics(&request("https://example.com/", "main_frame", None, 1));
    assert_eq!(verdict.procedural, vec!["div:has(> .sponsored)".to_string()]);
}

#[test]
fn decisions_are_repeatable() {
    let mut engine = engine_with(&["||doubleclick.net^\n@@||news.example.com^$document\n*$removeparam=utm_source"]);
    let req = request(
        "https://ads.doubleclick.net/pixel.gif",
        "image",
        Some("https://news.example.com/"),
        3,
    );
    let first = engine.match_request(&req);
    for _ in 0..5 {
        let again = engine.match_request(&req);
        assert_eq!(again.decision, first.decision);
        assert_eq!(again.rule_id, first.rule_id);
    }
}

#[test]
fn snapshot_survives_a_disk_round_trip() {
    let out = compile_filter_lists(
        &["||doubleclick.net^\n*$removeparam=gclid\nexample.com##.ad"],
        &CompileOptions::default(),
    )
    .expect("compile");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.ubx");
    std::fs::write(&path, &out.snapshot_bytes).expect("write");

    let bytes = std::fs::read(&path).expect("read");
    assert_eq!(bytes, out.snapshot_bytes);

    let mut engine = Engine::new(EngineConfig::default());
    engine.install(bytes).expect("install");
    let info = engine.snapshot_info();
    assert!(info.initialized);
    assert_eq!(info.size, out.snapshot_bytes.len());
    assert!(info.rule_count > 0);

    let verdict = engine.match_request(&request(
        "https://ads.doubleclick.net/pixel.gif",
        "image",
        Some("https://news.example.com/"),
        1,
    ));
    assert_eq!(verdict.decision, Decision::Block);
}

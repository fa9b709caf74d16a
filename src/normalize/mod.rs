//! Deterministic, network-free URL normalization.
//!
//! Two URLs that differ only in host case, a trailing `/index.html`,
//! fragment, tracking-parameter noise, or query-parameter order must
//! normalize to the same string.

use url::Url;

/// Query keys stripped unconditionally, regardless of value.
const TRACKING_KEYS: &[&str] = &["gclid", "fbclid", "mc_cid", "mc_eid"];

/// Normalize a URL string into its canonical form.
///
/// Malformed input is returned unchanged rather than erroring: normalization
/// runs on adapter-supplied strings that should always parse, but a caller
/// should never panic or lose data over a single bad link.
pub fn normalize_url(input: &str) -> String {
    let Ok(mut parsed) = Url::parse(input) else {
        return input.to_string();
    };

    let lowered_host = parsed.host_str().map(str::to_lowercase);
    if let Some(host) = &lowered_host {
        let _ = parsed.set_host(Some(host));
    }

    parsed.set_fragment(None);

    let path = parsed.path();
    if path.ends_with("/index.html") {
        let trimmed = path[..path.len() - "index.html".len()].to_string();
        parsed.set_path(&trimmed);
    }

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_KEYS.contains(&k.as_str()))
        .collect();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let mut sorted = pairs;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &sorted {
            query.append_pair(k, v);
        }
        parsed.set_query(Some(&query.finish()));
    }

    parsed.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_params_and_sorts() {
        assert_eq!(
            normalize_url("https://Example.com/Path/?b=2&utm_source=x&a=1&gclid=zzz"),
            "https://example.com/Path/?a=1&b=2"
        );
    }

    #[test]
    fn collapses_index_html_and_drops_fragment() {
        assert_eq!(
            normalize_url("https://example.com/a/index.html#frag"),
            "https://example.com/a/"
        );
    }

    #[test]
    fn is_idempotent() {
        let cases = [
            "https://Example.com/Path/?b=2&utm_source=x&a=1",
            "https://example.com/a/index.html#frag",
            "http://host.test/a/b?z=1&y=2&utm_campaign=foo",
        ];
        for c in cases {
            let once = normalize_url(c);
            let twice = normalize_url(&once);
            assert_eq!(once, twice, "not idempotent for {c}");
        }
    }

    #[test]
    fn preserves_blank_values() {
        assert_eq!(
            normalize_url("https://example.com/a?flag=&b=1"),
            "https://example.com/a?b=1&flag="
        );
    }

    #[test]
    fn leaves_malformed_input_untouched() {
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    proptest::proptest! {
        #[test]
        fn normalize_is_idempotent_for_arbitrary_paths_and_queries(
            path in "[a-zA-Z0-9/_-]{0,16}",
            query in "[a-zA-Z0-9=&_-]{0,24}",
        ) {
            let input = format!("https://example.com/{path}?{query}");
            let once = normalize_url(&input);
            let twice = normalize_url(&once);
            proptest::prop_assert_eq!(once, twice);
        }
    }
}

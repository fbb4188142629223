use crate::target::Target;
use regex::bytes::Regex;
use std::borrow::Cow;

/// A stateless body-text transform. Rules run in a fixed order over spans of
/// the response body and must leave unmatched input untouched.
///
/// Rules operate on raw bytes so that spans the rule does not rewrite are
/// relayed byte-for-byte, whatever their encoding.
pub trait RewriteRule: Send + Sync {
    /// Returns the rewritten span, or `None` when nothing matched.
    fn apply(&self, input: &[u8]) -> Option<Vec<u8>>;
}

/// The built-in link rewriter: absolute URLs, protocol-relative URLs, and
/// quoted bare host references that mention the upstream host are retargeted
/// at the proxy identity. Path, query, and fragment bytes are preserved.
///
/// Once rewritten, a span no longer mentions the upstream host, so applying
/// the rule again is a no-op.
pub struct LinkRewrite {
    pattern: Regex,
    replacement: Vec<u8>,
}

impl LinkRewrite {
    pub fn new(target: &Target, proxy_host_port: &str) -> Self {
        let host = regex::escape(&target.host);
        let port = target.port;
        // A reference is recognized when the upstream host follows a scheme,
        // protocol-relative slashes, or an opening quote, and is terminated
        // by a character that cannot appear in a hostname. URLs cannot
        // contain quotes, whitespace, or angle brackets, which is also what
        // makes the streaming span boundaries safe (see rewrite.rs).
        let pattern = format!(
            r#"(?i)(?P<pre>https?://|//|["']){host}(?::{port})?(?P<post>[/"'\s<>?#&]|$)"#
        );
        let pattern = Regex::new(&pattern).expect("link rewrite pattern is statically valid");
        let replacement = format!("${{pre}}{}${{post}}", proxy_host_port).into_bytes();
        Self {
            pattern,
            replacement,
        }
    }
}

impl RewriteRule for LinkRewrite {
    fn apply(&self, input: &[u8]) -> Option<Vec<u8>> {
        if !self.pattern.is_match(input) {
            return None;
        }
        Some(
            self.pattern
                .replace_all(input, self.replacement.as_slice())
                .into_owned(),
        )
    }
}

/// Ordered rule sequence, built once per proxy instance and shared read-only
/// across all exchanges. The built-in link rewriter always runs first;
/// caller-supplied rules follow in the order they were given and may rely on
/// host references already pointing at the proxy.
pub struct RuleSet {
    rules: Vec<Box<dyn RewriteRule>>,
}

impl RuleSet {
    pub fn build(
        target: &Target,
        proxy_host_port: &str,
        additional: Vec<Box<dyn RewriteRule>>,
    ) -> Self {
        let mut rules: Vec<Box<dyn RewriteRule>> =
            vec![Box::new(LinkRewrite::new(target, proxy_host_port))];
        rules.extend(additional);
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        let mut out = Cow::Borrowed(input);
        for rule in &self.rules {
            if let Some(next) = rule.apply(&out) {
                out = Cow::Owned(next);
            }
        }
        out
    }

    /// Like [`apply`](Self::apply) but reuses the input allocation when no
    /// rule matched.
    pub fn apply_owned(&self, input: Vec<u8>) -> Vec<u8> {
        let rewritten = match self.apply(&input) {
            Cow::Owned(v) => Some(v),
            Cow::Borrowed(_) => None,
        };
        rewritten.unwrap_or(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_set(target: &str) -> RuleSet {
        let target = Target::resolve(target).unwrap();
        RuleSet::build(&target, "localhost:8080", Vec::new())
    }

    #[test]
    fn test_absolute_url_rewritten() {
        let rules = rule_set("http://example.com");
        let out = rules.apply(br#"<a href="http://example.com/foo">x</a>"#);
        assert_eq!(&*out, br#"<a href="http://localhost:8080/foo">x</a>"#);
    }

    #[test]
    fn test_path_query_fragment_preserved() {
        let rules = rule_set("http://example.com");
        let out = rules.apply(br#"<a href="https://example.com/a/b?q=1&r=2#frag">x</a>"#);
        assert_eq!(
            &*out,
            br#"<a href="https://localhost:8080/a/b?q=1&r=2#frag">x</a>"#
        );
    }

    #[test]
    fn test_protocol_relative_url_rewritten() {
        let rules = rule_set("http://example.com");
        let out = rules.apply(br#"<script src="//example.com/app.js"></script>"#);
        assert_eq!(
            &*out,
            br#"<script src="//localhost:8080/app.js"></script>"#
        );
    }

    #[test]
    fn test_quoted_bare_host_rewritten() {
        let rules = rule_set("http://example.com");
        let out = rules.apply(br#"var host = 'example.com';"#);
        assert_eq!(&*out, br#"var host = 'localhost:8080';"#);
    }

    #[test]
    fn test_explicit_target_port_matched_and_folded() {
        let rules = rule_set("http://example.com:3000");
        let out = rules.apply(br#"<a href="http://example.com:3000/foo">x</a>"#);
        assert_eq!(&*out, br#"<a href="http://localhost:8080/foo">x</a>"#);
    }

    #[test]
    fn test_other_hosts_untouched() {
        let rules = rule_set("http://example.com");
        let body: &[u8] = br#"<a href="http://other.org/x">y</a> "sub.example.com" "example.company""#;
        let out = rules.apply(body);
        assert_eq!(&*out, body);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let rules = rule_set("http://example.com");
        let once = rules.apply_owned(br#"<a href="http://example.com/foo">x</a>"#.to_vec());
        let twice = rules.apply_owned(once.clone());
        assert_eq!(once, twice);
    }

    struct MarkRewritten;

    impl RewriteRule for MarkRewritten {
        fn apply(&self, input: &[u8]) -> Option<Vec<u8>> {
            let text = std::str::from_utf8(input).ok()?;
            if !text.contains("localhost:8080") {
                return None;
            }
            Some(text.replace("localhost:8080", "MIRROR").into_bytes())
        }
    }

    #[test]
    fn test_additional_rules_run_after_builtin() {
        let target = Target::resolve("http://example.com").unwrap();
        let rules = RuleSet::build(&target, "localhost:8080", vec![Box::new(MarkRewritten)]);
        assert_eq!(rules.len(), 2);

        // The second rule only matches output of the first, proving order.
        let out = rules.apply(br#"<a href="http://example.com/foo">x</a>"#);
        assert_eq!(&*out, br#"<a href="http://MIRROR/foo">x</a>"#);
    }

    #[test]
    fn test_unmatched_input_borrows() {
        let rules = rule_set("http://example.com");
        let body: &[u8] = b"plain text with no links at all";
        assert!(matches!(rules.apply(body), Cow::Borrowed(_)));
    }
}

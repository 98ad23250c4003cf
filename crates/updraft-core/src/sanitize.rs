//! Cleaning of untrusted text and URLs from server metadata.

use std::collections::HashSet;

const FORMATTING_TAGS: &[&str] = &[
    "a", "abbr", "b", "blockquote", "br", "code", "em", "h1", "h2", "h3", "h4", "h5", "h6", "hr",
    "i", "li", "ol", "p", "pre", "strong", "ul",
];

/// Elements removed together with everything inside them.
const DROPPED_ELEMENTS: &[&str] = &["script", "style", "iframe", "object", "embed", "noscript"];

const URL_SCHEMES: &[&str] = &["http", "https"];

/// Keep an http(s) URL, normalized; reject everything else.
#[must_use]
pub fn sanitize_url(raw: &str) -> Option<String> {
    let url = reqwest::Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url.to_string()),
        _ => None,
    }
}

/// Plain text: every tag removed, whitespace collapsed. The result stays
/// HTML-escaped so hosts can embed it in markup as is.
#[must_use]
pub fn sanitize_text(raw: &str) -> String {
    cleaner(&[])
        .clean(raw)
        .to_string()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rich text: a small set of formatting tags survives without attributes
/// (links keep an absolute http(s) `href` and a `title`).
#[must_use]
pub fn sanitize_html(raw: &str) -> String {
    cleaner(FORMATTING_TAGS).clean(raw).to_string().trim().to_string()
}

fn cleaner(tags: &'static [&'static str]) -> ammonia::Builder<'static> {
    let mut builder = ammonia::Builder::empty();
    builder
        .add_tags(tags)
        .clean_content_tags(DROPPED_ELEMENTS.iter().copied().collect::<HashSet<_>>())
        .url_schemes(URL_SCHEMES.iter().copied().collect::<HashSet<_>>())
        .url_relative(ammonia::UrlRelative::Deny)
        .link_rel(None)
        .strip_comments(true);
    if tags.contains(&"a") {
        builder.add_tag_attributes("a", &["href", "title"]);
    }
    if tags.contains(&"abbr") {
        builder.add_tag_attributes("abbr", &["title"]);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::{sanitize_html, sanitize_text, sanitize_url};

    #[test]
    fn script_blocks_are_removed_with_content() {
        let cleaned = sanitize_html(
            "<p>Fixes</p><script type=\"text/javascript\">alert('x')</script><SCRIPT>steal()</SCRIPT>done",
        );
        assert_eq!(cleaned, "<p>Fixes</p>done");
    }

    #[test]
    fn event_handlers_and_unknown_tags_are_stripped() {
        let cleaned = sanitize_html(
            "<p onclick=\"evil()\" class=\"x\">Hello <span style=\"color:red\">world</span></p>",
        );
        assert_eq!(cleaned, "<p>Hello world</p>");
    }

    #[test]
    fn links_keep_only_safe_href() {
        assert_eq!(
            sanitize_html("<a href=\"https://example.com/docs\" onmouseover=\"x()\">docs</a>"),
            "<a href=\"https://example.com/docs\">docs</a>"
        );
        assert_eq!(
            sanitize_html("<a href='javascript:alert(1)'>click</a>"),
            "<a>click</a>"
        );
        assert_eq!(sanitize_html("<a href=\"/relative\">docs</a>"), "<a>docs</a>");
    }

    #[test]
    fn stray_angle_brackets_are_escaped() {
        assert_eq!(sanitize_html("1 < 2 & 3 > 2"), "1 &lt; 2 &amp; 3 &gt; 2");
    }

    #[test]
    fn embedded_content_is_dropped() {
        assert_eq!(
            sanitize_html("<p>Intro</p><iframe src=\"https://evil.example\">fallback</iframe><style>p{}</style>"),
            "<p>Intro</p>"
        );
    }

    #[test]
    fn text_fields_lose_all_markup() {
        assert_eq!(
            sanitize_text("  <b>Acme</b>\n  <i>Widget</i><script>x</script> "),
            "Acme Widget"
        );
    }

    #[test]
    fn url_validation_requires_http_scheme_and_host() {
        assert_eq!(
            sanitize_url(" https://updates.example.com/download/acme "),
            Some("https://updates.example.com/download/acme".to_string())
        );
        assert!(sanitize_url("javascript:alert(1)").is_none());
        assert!(sanitize_url("file:///etc/passwd").is_none());
        assert!(sanitize_url("not a url").is_none());
    }
}

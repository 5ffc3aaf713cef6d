use std::env;
use std::sync::OnceLock;

static REWRITE_STRICT: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Default for [`RewriterContext::strict`](crate::context::RewriterContext::strict).
pub(crate) fn strict_enabled() -> bool {
    *REWRITE_STRICT.get_or_init(|| match env::var("REWRITE_STRICT") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

use std::env;
use std::sync::OnceLock;

static SYMBIND_VALIDATE_BINDINGS: OnceLock<bool> = OnceLock::new();
static SYMBIND_DUMP_EVAL: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    }
}

/// Re-evaluation checks on `bind`; on unless `SYMBIND_VALIDATE_BINDINGS` disables them.
pub(crate) fn validate_bindings_enabled() -> bool {
    *SYMBIND_VALIDATE_BINDINGS.get_or_init(|| flag("SYMBIND_VALIDATE_BINDINGS", true))
}

pub(crate) fn dump_eval_enabled() -> bool {
    *SYMBIND_DUMP_EVAL.get_or_init(|| flag("SYMBIND_DUMP_EVAL", false))
}

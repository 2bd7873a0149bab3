use std::env;
use std::sync::OnceLock;

static XGRAPH_VERIFY_GRAPHS: OnceLock<bool> = OnceLock::new();
static XGRAPH_OP_TIMING: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, key: &str, default: bool) -> bool {
    *cell.get_or_init(|| match env::var(key) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    })
}

/// Whether graph passes validate their input and output graphs.
pub(crate) fn verify_graphs_enabled() -> bool {
    flag(&XGRAPH_VERIFY_GRAPHS, "XGRAPH_VERIFY_GRAPHS", true)
}

/// Whether the execution engine times every operation it runs.
pub(crate) fn op_timing_enabled() -> bool {
    flag(&XGRAPH_OP_TIMING, "XGRAPH_OP_TIMING", false)
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_truthy_values() {
        for value in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should be falsy");
        }
    }
}

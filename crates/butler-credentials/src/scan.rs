use serde_json::Value;

/// A config value that looks like an inlined secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretWarning {
    /// Dotted path into the config document, e.g. `modules.gmail.api_key`.
    pub path: String,
    pub reason: &'static str,
}

const KNOWN_PREFIXES: &[&str] = &["sk-", "ghp_", "gho_", "github_pat_"];
const SLACK_PREFIXES: &[&str] = &["xoxb-", "xoxa-", "xoxp-", "xoxs-"];
const KEYISH_NAMES: &[&str] = &["password", "secret", "token", "api_key", "key"];

/// Walk a config document and flag values that look like secret literals.
/// Findings are startup warnings only — config is never rejected for them.
pub fn scan_config_for_secrets(config: &Value) -> Vec<SecretWarning> {
    let mut warnings = Vec::new();
    walk(config, String::new(), &mut warnings);
    warnings
}

fn walk(value: &Value, path: String, out: &mut Vec<SecretWarning>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if let Value::String(s) = child {
                    if let Some(reason) = classify(key, s) {
                        out.push(SecretWarning {
                            path: child_path.clone(),
                            reason,
                        });
                    }
                }
                walk(child, child_path, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(child, format!("{path}[{i}]"), out);
            }
        }
        _ => {}
    }
}

fn classify(key: &str, value: &str) -> Option<&'static str> {
    // URLs and file paths are configuration, not secrets.
    if value.starts_with("http://")
        || value.starts_with("https://")
        || value.starts_with('/')
        || value.starts_with("~/")
        || value.starts_with("./")
    {
        return None;
    }

    if KNOWN_PREFIXES.iter().any(|p| value.starts_with(p)) {
        return Some("value carries a well-known secret prefix");
    }
    if SLACK_PREFIXES.iter().any(|p| value.starts_with(p)) {
        return Some("value looks like a Slack token");
    }
    if value.len() >= 40 && is_base64ish(value) {
        return Some("long base64-like literal");
    }

    let key_lower = key.to_ascii_lowercase();
    if KEYISH_NAMES.iter().any(|n| key_lower.contains(n)) && value.len() >= 16 {
        return Some("secret-named field with a long literal value");
    }
    None
}

fn is_base64ish(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=' || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_known_prefixes() {
        let config = json!({"modules": {"llm": {"model_key": "sk-abcdef1234567890"}}});
        let warnings = scan_config_for_secrets(&config);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].path, "modules.llm.model_key");
    }

    #[test]
    fn flags_secret_named_fields_with_long_values() {
        let config = json!({"database": {"password": "correct-horse-battery"}});
        assert_eq!(scan_config_for_secrets(&config).len(), 1);
    }

    #[test]
    fn short_values_and_urls_and_paths_are_ignored() {
        let config = json!({
            "password_hint": "short",
            "api_key": "https://example.com/key-endpoint",
            "token_path": "/var/run/secrets/token",
            "name": "relationship"
        });
        assert!(scan_config_for_secrets(&config).is_empty());
    }

    #[test]
    fn flags_long_base64_blobs() {
        let blob = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWZnaGk=";
        let config = json!({"blob": blob});
        assert_eq!(scan_config_for_secrets(&config).len(), 1);
    }
}

//! Pure function mapping a model identifier to an estimated B-parameter size.
//!
//! Six-step precedence, ported verbatim from the original gateway's
//! `get_model_size_b`: a tag-embedded size wins over everything, then an
//! exact name mapping, then the longest-matching configured substring
//! pattern, then a size embedded anywhere in the base name, then a default.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ModelSizeRules;

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s*[-_]?\s*b\b").expect("static pattern"))
}

fn extract_size(haystack: &str) -> Option<u64> {
    size_pattern()
        .captures(&haystack.to_lowercase())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `base_name` is the part before any `:tag` suffix; `full_model_name` is
/// the identifier as given by the client, tag included (e.g. `"llama3:70b"`).
pub fn resolve_size(base_name: &str, full_model_name: Option<&str>, rules: &ModelSizeRules) -> u64 {
    // Step 1: a size embedded in the tag, e.g. "llama3:70b".
    if let Some(full) = full_model_name {
        if let Some((_, tag)) = full.rsplit_once(':') {
            if let Some(size) = extract_size(tag) {
                return size;
            }
        }
        // Step 2: a size embedded anywhere in the full identifier.
        if let Some(size) = extract_size(full) {
            return size;
        }
    }

    // Step 3: exact mapping, base name first then full name.
    if let Some(size) = rules.mapping.get(base_name) {
        return *size;
    }
    if let Some(full) = full_model_name {
        if let Some(size) = rules.mapping.get(full) {
            return *size;
        }
    }

    // Step 4: substring patterns, largest size wins (caller sorts descending).
    let lower_base = base_name.to_lowercase();
    for (pattern, size) in &rules.patterns {
        if lower_base.contains(&pattern.to_lowercase()) {
            return *size;
        }
    }

    // Step 5: a size embedded in the base name itself.
    if let Some(size) = extract_size(base_name) {
        return size;
    }

    // Step 6: fall back to the configured default.
    rules.default_size_b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rules() -> ModelSizeRules {
        ModelSizeRules {
            patterns: vec![("qwen2.5".into(), 7), ("llama".into(), 8)],
            mapping: HashMap::from([("custom-model".to_string(), 13)]),
            default_size_b: 7,
        }
    }

    #[test]
    fn tag_embedded_size_wins() {
        assert_eq!(resolve_size("llama3", Some("llama3:70b"), &rules()), 70);
    }

    #[test]
    fn tag_size_beats_exact_mapping() {
        // "custom-model:13b" — tag parse should win over mapping, even
        // though the mapping also says 13 here it's a coincidence; use a
        // mismatched mapping to prove precedence.
        let mut r = rules();
        r.mapping.insert("custom-model".into(), 99);
        assert_eq!(resolve_size("custom-model", Some("custom-model:13b"), &r), 13);
    }

    #[test]
    fn exact_mapping_used_when_no_tag_size() {
        assert_eq!(resolve_size("custom-model", Some("custom-model:latest"), &rules()), 13);
    }

    #[test]
    fn pattern_substring_match() {
        assert_eq!(resolve_size("llama3", None, &rules()), 8);
    }

    #[test]
    fn size_embedded_in_base_name() {
        assert_eq!(resolve_size("mystery-34b-model", None, &rules()), 34);
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(resolve_size("unknown-model", None, &rules()), 7);
    }

    #[test]
    fn deterministic_for_repeated_calls() {
        let r = rules();
        let first = resolve_size("llama3", Some("llama3:70b"), &r);
        let second = resolve_size("llama3", Some("llama3:70b"), &r);
        assert_eq!(first, second);
    }
}

//! Env-Filter (C5): decide which environment variables of the old
//! container survive onto the new one. See SPEC_FULL.md §4.5.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One glob-style rule set (`*`, `?`, `[...]`), applied either globally or
/// scoped to a container-name substring match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvFilterConfig {
    pub enabled: bool,
    pub exclude_patterns: Vec<String>,
    pub preserve_patterns: Vec<String>,
    /// Keyed by a case-insensitive substring of the container name; values
    /// override (not merge with) the global pattern sets for a match.
    pub container_specific_rules: BTreeMap<String, ContainerEnvRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerEnvRule {
    pub exclude_patterns: Vec<String>,
    pub preserve_patterns: Vec<String>,
}

/// Translate a shell-style glob into an anchored regex: `*` -> `.*`,
/// `?` -> `.`, `[...]` passed through as a character class, everything else
/// escaped literally.
pub(crate) fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() * 2);
    pattern.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                pattern.push('[');
                for next in chars.by_ref() {
                    pattern.push(next);
                    if next == ']' {
                        break;
                    }
                }
            }
            _ => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).ok()
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .filter_map(|p| glob_to_regex(p))
        .any(|re| re.is_match(name))
}

/// Look up the container-specific rule set for `container_name`, matching
/// by case-insensitive substring (§4.5).
fn container_rule<'a>(
    config: &'a EnvFilterConfig,
    container_name: &str,
) -> Option<&'a ContainerEnvRule> {
    let lower_name = container_name.to_lowercase();
    config
        .container_specific_rules
        .iter()
        .find(|(key, _)| lower_name.contains(&key.to_lowercase()))
        .map(|(_, rule)| rule)
}

/// Compute the final env map for the new container.
///
/// - Variables in `old_env` absent from `image_env` are preserved verbatim.
/// - Variables present in both are preserved from `old_env` (user overrides
///   win over image defaults).
/// - `exclude` drops a name unless `preserve` also matches it (preserve wins
///   on conflict).
/// - Container-specific rules, when the container name matches, replace the
///   global exclude/preserve sets entirely rather than merging with them.
pub fn filter_env(
    container_name: &str,
    old_env: &BTreeMap<String, String>,
    image_env: &BTreeMap<String, String>,
    config: &EnvFilterConfig,
) -> BTreeMap<String, String> {
    if !config.enabled {
        return image_env.clone().into_iter().chain(old_env.clone()).collect();
    }

    let (exclude, preserve) = match container_rule(config, container_name) {
        Some(rule) => (&rule.exclude_patterns, &rule.preserve_patterns),
        None => (&config.exclude_patterns, &config.preserve_patterns),
    };

    let mut result: BTreeMap<String, String> = image_env.clone();

    for (name, value) in old_env {
        let excluded = matches_any(name, exclude);
        let preserved = matches_any(name, preserve);

        if excluded && !preserved {
            result.remove(name);
            continue;
        }

        result.insert(name.clone(), value.clone());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn preserves_old_only_vars() {
        let old = env(&[("FOO", "bar")]);
        let image = env(&[]);
        let config = EnvFilterConfig {
            enabled: true,
            ..Default::default()
        };

        let result = filter_env("app", &old, &image, &config);
        assert_eq!(result.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn user_value_wins_over_image_default() {
        let old = env(&[("FOO", "user-value")]);
        let image = env(&[("FOO", "image-default")]);
        let config = EnvFilterConfig {
            enabled: true,
            ..Default::default()
        };

        let result = filter_env("app", &old, &image, &config);
        assert_eq!(result.get("FOO"), Some(&"user-value".to_string()));
    }

    #[test]
    fn exclude_pattern_drops_matching_var() {
        let old = env(&[("SECRET_TOKEN", "xyz"), ("PORT", "8080")]);
        let image = env(&[]);
        let config = EnvFilterConfig {
            enabled: true,
            exclude_patterns: vec!["SECRET_*".to_string()],
            ..Default::default()
        };

        let result = filter_env("app", &old, &image, &config);
        assert!(!result.contains_key("SECRET_TOKEN"));
        assert!(result.contains_key("PORT"));
    }

    #[test]
    fn preserve_wins_over_exclude_on_conflict() {
        let old = env(&[("SECRET_TOKEN", "xyz")]);
        let image = env(&[]);
        let config = EnvFilterConfig {
            enabled: true,
            exclude_patterns: vec!["SECRET_*".to_string()],
            preserve_patterns: vec!["SECRET_TOKEN".to_string()],
            ..Default::default()
        };

        let result = filter_env("app", &old, &image, &config);
        assert_eq!(result.get("SECRET_TOKEN"), Some(&"xyz".to_string()));
    }

    #[test]
    fn container_specific_rule_overrides_global_by_name_substring() {
        let old = env(&[("DEBUG", "1")]);
        let image = env(&[]);
        let mut config = EnvFilterConfig {
            enabled: true,
            exclude_patterns: vec!["DEBUG".to_string()],
            ..Default::default()
        };
        config.container_specific_rules.insert(
            "worker".to_string(),
            ContainerEnvRule {
                exclude_patterns: vec![],
                preserve_patterns: vec!["DEBUG".to_string()],
            },
        );

        let result = filter_env("my-Worker-1", &old, &image, &config);
        assert_eq!(result.get("DEBUG"), Some(&"1".to_string()));
    }

    #[test]
    fn disabled_filter_passes_everything_through() {
        let old = env(&[("A", "1")]);
        let image = env(&[("B", "2")]);
        let config = EnvFilterConfig::default();

        let result = filter_env("app", &old, &image, &config);
        assert_eq!(result.get("A"), Some(&"1".to_string()));
        assert_eq!(result.get("B"), Some(&"2".to_string()));
    }

    #[test]
    fn glob_question_mark_and_bracket_classes() {
        let re = glob_to_regex("v?r[sS]ion").unwrap();
        assert!(re.is_match("version"));
        assert!(re.is_match("verSion"));
        assert!(!re.is_match("verxsion"));
    }
}

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::env;
use tracing::{debug, warn};

const ENV_VAR_PATTERN: &str = r"\$\{(\w+)\}|\$(\w+)";

fn env_var_regex() -> Result<Regex> {
    Regex::new(ENV_VAR_PATTERN).context("Invalid environment variable pattern")
}

/// Substitute environment variables in the format ${VAR_NAME} or $VAR_NAME
///
/// Unset variables keep their placeholder so the validator can report them.
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = env_var_regex()?;
    let mut missing_vars = Vec::new();

    let result = re.replace_all(content, |caps: &Captures| {
        let placeholder = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let Some(var_name) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
            return placeholder.to_string();
        };

        match env::var(var_name) {
            Ok(value) => {
                debug!("Substituting environment variable: {}", var_name);
                value
            }
            Err(_) => {
                warn!("Environment variable '{}' not set", var_name);
                missing_vars.push(var_name.to_string());
                placeholder.to_string()
            }
        }
    });

    if !missing_vars.is_empty() {
        debug!(
            "Environment variables not set (may use defaults or fail validation): {:?}",
            missing_vars
        );
    }

    Ok(result.into_owned())
}

/// Get environment variable with a default value
pub fn get_env_or_default(var_name: &str, default: &str) -> String {
    match env::var(var_name) {
        Ok(value) => {
            debug!("Using environment variable: {}", var_name);
            value
        }
        Err(_) => {
            warn!(
                "Environment variable '{}' not set, using default: \"{}\"",
                var_name, default
            );
            default.to_string()
        }
    }
}

/// Check if a string contains unresolved environment variable placeholders
pub fn has_unresolved_env_vars(content: &str) -> bool {
    env_var_regex().map(|re| re.is_match(content)).unwrap_or(false)
}

/// Name of the first unresolved placeholder in `content`, if any
pub fn first_unresolved_env_var(content: &str) -> Option<String> {
    let re = env_var_regex().ok()?;
    let caps = re.captures(content)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_set_and_unset() {
        env::set_var("ORDERLEDGER_TEST_DB_HOST", "db.internal");

        let content = "url: postgres://${ORDERLEDGER_TEST_DB_HOST}/ledger\nkey: $ORDERLEDGER_TEST_UNSET";
        let result = substitute_env_vars(content).unwrap();

        assert!(result.contains("postgres://db.internal/ledger"));
        assert!(result.contains("$ORDERLEDGER_TEST_UNSET"));
        assert!(has_unresolved_env_vars(&result));
        assert_eq!(
            first_unresolved_env_var(&result).as_deref(),
            Some("ORDERLEDGER_TEST_UNSET")
        );
    }

    #[test]
    fn test_longer_name_not_clobbered() {
        env::set_var("ORDERLEDGER_TEST_A", "short");
        env::remove_var("ORDERLEDGER_TEST_AB");

        let result = substitute_env_vars("$ORDERLEDGER_TEST_AB and $ORDERLEDGER_TEST_A").unwrap();

        assert_eq!(result, "$ORDERLEDGER_TEST_AB and short");
    }

    #[test]
    fn test_get_env_or_default() {
        env::remove_var("ORDERLEDGER_TEST_MISSING");
        assert_eq!(get_env_or_default("ORDERLEDGER_TEST_MISSING", "fallback"), "fallback");
    }
}

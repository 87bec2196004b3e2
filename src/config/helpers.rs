//! Shared environment-variable parsing for the config sections.

use crate::error::ConfigError;

/// Env vars are process-global, so tests that mutate them hold this lock.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Read an env var, treating empty strings as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("must be 'true' or 'false', got '{raw}'"),
            }),
        },
    }
}

/// Comma-separated list, trimmed, empty entries dropped. `None` when unset.
pub(crate) fn parse_list_env(key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    Ok(optional_env(key)?.map(|s| {
        s.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_env_returns_none_for_missing_var() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe { std::env::remove_var("_TEST_HUB_MISSING_42") };
        assert!(optional_env("_TEST_HUB_MISSING_42").unwrap().is_none());
    }

    #[test]
    fn optional_env_returns_none_for_empty_string() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        unsafe { std::env::set_var("_TEST_HUB_EMPTY_42", "") };
        assert!(optional_env("_TEST_HUB_EMPTY_42").unwrap().is_none());
        unsafe { std::env::remove_var("_TEST_HUB_EMPTY_42") };
    }

    #[test]
    fn parse_optional_env_parses_value() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        unsafe { std::env::set_var("_TEST_HUB_PARSE_42", "42") };
        let result: u64 = parse_optional_env("_TEST_HUB_PARSE_42", 0).unwrap();
        assert_eq!(result, 42);
        unsafe { std::env::remove_var("_TEST_HUB_PARSE_42") };
    }

    #[test]
    fn parse_optional_env_returns_error_for_invalid_value() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        unsafe { std::env::set_var("_TEST_HUB_PARSE_BAD_42", "not_a_number") };
        let result: Result<u64, _> = parse_optional_env("_TEST_HUB_PARSE_BAD_42", 0);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("_TEST_HUB_PARSE_BAD_42") };
    }

    #[test]
    fn parse_bool_env_variants() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        unsafe { std::env::set_var("_TEST_HUB_BOOL_42", "off") };
        assert!(!parse_bool_env("_TEST_HUB_BOOL_42", true).unwrap());
        unsafe { std::env::set_var("_TEST_HUB_BOOL_42", "maybe") };
        assert!(parse_bool_env("_TEST_HUB_BOOL_42", true).is_err());
        unsafe { std::env::remove_var("_TEST_HUB_BOOL_42") };
        assert!(parse_bool_env("_TEST_HUB_BOOL_42", true).unwrap());
    }

    #[test]
    fn parse_list_env_trims_and_drops_empty() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        unsafe { std::env::set_var("_TEST_HUB_LIST_42", " a, b ,,c ") };
        assert_eq!(
            parse_list_env("_TEST_HUB_LIST_42").unwrap(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        unsafe { std::env::remove_var("_TEST_HUB_LIST_42") };
    }
}

//! Configuration value resolution helpers
//!
//! Resolves single settings from several layers with a fixed priority:
//! CLI > ENV > config file > default.

use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Cli,
    Env,
    File,
    Default,
}

/// Resolve a setting with priority: CLI > ENV > file > default
///
/// # Arguments
/// * `cli_value` - Value passed on the command line
/// * `env_var` - Environment variable name to check
/// * `file_value` - Value from the configuration file
/// * `default` - Fallback value
///
/// An environment value that fails to parse is logged and skipped.
pub fn resolve<T>(
    cli_value: Option<T>,
    env_var: &str,
    file_value: Option<T>,
    default: T,
) -> (T, ValueSource)
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(val) = cli_value {
        debug!("Using {} from command line", env_var);
        return (val, ValueSource::Cli);
    }

    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(val) => {
                debug!("Using {} from environment: {}", env_var, env_str);
                return (val, ValueSource::Env);
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    if let Some(val) = file_value {
        debug!("Using {} from config file", env_var);
        return (val, ValueSource::File);
    }

    debug!("Using default value for {}", env_var);
    (default, ValueSource::Default)
}

/// String variant of [`resolve`] that treats empty strings as unset
pub fn resolve_string(
    cli_value: Option<String>,
    env_var: &str,
    file_value: Option<String>,
    default: &str,
) -> (String, ValueSource) {
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let env_value = std::env::var(env_var).ok().filter(|s| !s.is_empty());

    if let Some(val) = non_empty(cli_value) {
        (val, ValueSource::Cli)
    } else if let Some(val) = env_value {
        (val, ValueSource::Env)
    } else if let Some(val) = non_empty(file_value) {
        (val, ValueSource::File)
    } else {
        (default.to_string(), ValueSource::Default)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_cli_wins_over_everything() {
        std::env::set_var("COMMON_TEST_CLI_WINS", "7");
        let (value, source) = resolve(Some(1u32), "COMMON_TEST_CLI_WINS", Some(2), 3);
        assert_eq!(value, 1);
        assert_eq!(source, ValueSource::Cli);
        std::env::remove_var("COMMON_TEST_CLI_WINS");
    }

    #[test]
    fn test_env_wins_over_file() {
        std::env::set_var("COMMON_TEST_ENV_WINS", "7");
        let (value, source) = resolve(None, "COMMON_TEST_ENV_WINS", Some(2u32), 3);
        assert_eq!(value, 7);
        assert_eq!(source, ValueSource::Env);
        std::env::remove_var("COMMON_TEST_ENV_WINS");
    }

    #[test]
    fn test_unparsable_env_falls_through() {
        std::env::set_var("COMMON_TEST_BAD_ENV", "not-a-number");
        let (value, source) = resolve(None, "COMMON_TEST_BAD_ENV", Some(2u32), 3);
        assert_eq!(value, 2);
        assert_eq!(source, ValueSource::File);
        std::env::remove_var("COMMON_TEST_BAD_ENV");
    }

    #[test]
    fn test_default_when_nothing_set() {
        let (value, source) = resolve::<u32>(None, "COMMON_TEST_NOTHING_SET", None, 3);
        assert_eq!(value, 3);
        assert_eq!(source, ValueSource::Default);
    }

    #[test]
    fn test_empty_strings_are_unset() {
        let (value, source) = resolve_string(
            Some(String::new()),
            "COMMON_TEST_EMPTY_STRING",
            Some("file".to_string()),
            "default",
        );
        assert_eq!(value, "file");
        assert_eq!(source, ValueSource::File);
    }
}

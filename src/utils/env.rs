/// Read an environment variable, preferring the `CAREPAY_`-prefixed form.
///
/// `CAREPAY_{key}` wins over `{key}` so a deployment can override shared
/// platform variables (like `PORT`) without touching them.
///
/// ```rust,ignore
/// use carepay::utils::get_env_with_prefix;
///
/// // CAREPAY_CHECKSUM_MERCHANT_ID, then CHECKSUM_MERCHANT_ID
/// let merchant = get_env_with_prefix("CHECKSUM_MERCHANT_ID");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("CAREPAY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Like [`get_env_with_prefix`], parsed into `T`. Unparseable values are
/// reported and treated as absent.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_variable_wins_over_plain() {
        unsafe {
            std::env::set_var("CAREPAY_ENV_TEST_BOTH", "prefixed");
            std::env::set_var("ENV_TEST_BOTH", "plain");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_BOTH"), Some("prefixed".to_string()));
        unsafe {
            std::env::remove_var("CAREPAY_ENV_TEST_BOTH");
            std::env::remove_var("ENV_TEST_BOTH");
        }
    }

    #[test]
    fn falls_back_to_plain_variable() {
        unsafe {
            std::env::set_var("ENV_TEST_FALLBACK", "plain");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_FALLBACK"), Some("plain".to_string()));
        unsafe {
            std::env::remove_var("ENV_TEST_FALLBACK");
        }

        assert_eq!(get_env_with_prefix("ENV_TEST_MISSING"), None);
    }

    #[test]
    fn blank_values_are_absent() {
        unsafe {
            std::env::set_var("CAREPAY_ENV_TEST_BLANK", "  ");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_BLANK"), None);
        unsafe {
            std::env::remove_var("CAREPAY_ENV_TEST_BLANK");
        }
    }

    #[test]
    fn parse_ignores_garbage() {
        unsafe {
            std::env::set_var("CAREPAY_ENV_TEST_NUMBER", "fifteen");
        }
        assert_eq!(parse_env_with_prefix::<u64>("ENV_TEST_NUMBER"), None);
        unsafe {
            std::env::set_var("CAREPAY_ENV_TEST_NUMBER", "15");
        }
        assert_eq!(parse_env_with_prefix::<u64>("ENV_TEST_NUMBER"), Some(15));
        unsafe {
            std::env::remove_var("CAREPAY_ENV_TEST_NUMBER");
        }
    }
}

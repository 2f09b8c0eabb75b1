use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub fetch_timeout_ms: u64,
    pub transaction_timeout_ms: u64,
    pub transaction_max_attempts: u32,
    pub suggestion_debounce_ms: u64,
    pub search_debounce_ms: u64,
    pub suggestion_min_chars: usize,
    pub comment_max_depth: usize,
    pub log_level: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 10,
            cache_ttl_secs: 300,
            cache_capacity: 50,
            fetch_timeout_ms: 10_000,
            transaction_timeout_ms: 10_000,
            transaction_max_attempts: 25,
            suggestion_debounce_ms: 300,
            search_debounce_ms: 500,
            suggestion_min_chars: 2,
            comment_max_depth: 3,
            log_level: "info".to_string(),
        }
    }
}

impl SyncSettings {
    /// Читает `.env`, если он есть, затем переменные окружения.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let log_level = lookup("LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .map(|level| level.trim().to_string())
            .filter(|level| !level.is_empty())
            .unwrap_or(defaults.log_level);

        Ok(Self {
            page_size: parse_positive(&lookup, "FEED_PAGE_SIZE", defaults.page_size)?,
            cache_ttl_secs: parse_positive(&lookup, "FEED_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            cache_capacity: parse_positive(&lookup, "FEED_CACHE_CAPACITY", defaults.cache_capacity)?,
            fetch_timeout_ms: parse_positive(
                &lookup,
                "STORE_FETCH_TIMEOUT_MS",
                defaults.fetch_timeout_ms,
            )?,
            transaction_timeout_ms: parse_positive(
                &lookup,
                "STORE_TRANSACTION_TIMEOUT_MS",
                defaults.transaction_timeout_ms,
            )?,
            transaction_max_attempts: parse_positive(
                &lookup,
                "TRANSACTION_MAX_ATTEMPTS",
                defaults.transaction_max_attempts,
            )?,
            suggestion_debounce_ms: parse_positive(
                &lookup,
                "SUGGESTION_DEBOUNCE_MS",
                defaults.suggestion_debounce_ms,
            )?,
            search_debounce_ms: parse_positive(
                &lookup,
                "SEARCH_DEBOUNCE_MS",
                defaults.search_debounce_ms,
            )?,
            suggestion_min_chars: parse_positive(
                &lookup,
                "SUGGESTION_MIN_CHARS",
                defaults.suggestion_min_chars,
            )?,
            comment_max_depth: parse_positive(
                &lookup,
                "COMMENT_MAX_DEPTH",
                defaults.comment_max_depth,
            )?,
            log_level,
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn suggestion_debounce(&self) -> Duration {
        Duration::from_millis(self.suggestion_debounce_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialEq + Default + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = lookup(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse::<T>()
        .with_context(|| format!("Failed to parse {key}, expecting positive integer"))?;

    if value == T::default() {
        return Err(anyhow!("{key} must be > 0"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::SyncSettings;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let settings = SyncSettings::from_lookup(lookup(&[])).expect("defaults must parse");

        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.cache_ttl(), Duration::from_secs(300));
        assert_eq!(settings.search_debounce(), Duration::from_millis(500));
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = SyncSettings::from_lookup(lookup(&[
            ("FEED_PAGE_SIZE", "25"),
            ("TRANSACTION_MAX_ATTEMPTS", " 5 "),
            ("RUST_LOG", "feed_sync=debug"),
        ]))
        .expect("overrides must parse");

        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.transaction_max_attempts, 5);
        assert_eq!(settings.log_level, "feed_sync=debug");
    }

    #[test]
    fn log_level_takes_precedence_over_rust_log() {
        let settings = SyncSettings::from_lookup(lookup(&[
            ("LOG_LEVEL", "warn"),
            ("RUST_LOG", "debug"),
        ]))
        .expect("must parse");

        assert_eq!(settings.log_level, "warn");
    }

    #[test]
    fn zero_and_garbage_values_are_rejected() {
        let err = SyncSettings::from_lookup(lookup(&[("FEED_CACHE_CAPACITY", "0")]))
            .expect_err("zero must be rejected");
        assert!(err.to_string().contains("FEED_CACHE_CAPACITY must be > 0"));

        let err = SyncSettings::from_lookup(lookup(&[("FEED_PAGE_SIZE", "ten")]))
            .expect_err("garbage must be rejected");
        assert!(err.to_string().contains("Failed to parse FEED_PAGE_SIZE"));
    }
}

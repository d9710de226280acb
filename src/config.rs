use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};
use crate::query::{Direction, PageRequest, Sort};

/// When pending changes are written without an explicit `flush`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Before every query or bulk statement sent to the store.
    #[default]
    Auto,
    /// Only on `flush` and `commit`.
    Manual,
}

/// Paging defaults applied when a caller does not pass its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub default_page_size: usize,
    /// Larger requests are clamped to this size.
    pub max_page_size: usize,
    /// Used when neither the request nor the query orders its rows.
    pub default_sort: Option<Sort>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_page_size: 12,
            max_page_size: 2000,
            default_sort: Some(Sort::by(Direction::Desc, &["username"])),
        }
    }
}

impl PagingConfig {
    pub fn default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn default_sort(mut self, sort: Option<Sort>) -> Self {
        self.default_sort = sort;
        self
    }

    /// A request for `page` with the configured size and sort.
    pub fn request(&self, page: usize) -> PageRequest {
        PageRequest::sorted(
            page,
            self.default_page_size,
            self.default_sort.clone().unwrap_or_default(),
        )
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_page_size == 0 {
            return Err("default_page_size must be > 0".to_string());
        }
        if self.max_page_size == 0 {
            return Err("max_page_size must be > 0".to_string());
        }
        if self.default_page_size > self.max_page_size {
            return Err("default_page_size cannot exceed max_page_size".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// How long a statement waits for rows locked by another session.
    pub lock_timeout_ms: u64,
    /// How long a row lock survives a session that never releases it.
    pub lock_lease_ms: u64,
    /// Recorded in `created_by` / `last_modified_by`.
    pub auditor: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            lock_timeout_ms: 5_000,
            lock_lease_ms: 30_000,
            auditor: None,
        }
    }
}

impl SessionConfig {
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn auditor(mut self, auditor: &str) -> Self {
        self.auditor = Some(auditor.to_string());
        self
    }

    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease_duration(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lock_lease_ms == 0 {
            return Err("lock_lease_ms must be > 0".to_string());
        }
        if self.auditor.as_deref().is_some_and(str::is_empty) {
            return Err("auditor cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Everything the persistence layer reads once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    pub paging: PagingConfig,
    pub session: SessionConfig,
}

const ENV_PREFIX: &str = "ENTITY_SESSION_";

impl OrmConfig {
    pub fn paging(mut self, paging: PagingConfig) -> Self {
        self.paging = paging;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DbError::Config(format!("invalid configuration: {}", err)))?;
        config.checked()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            DbError::Config(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_json(&json)
    }

    /// Defaults overridden by `ENTITY_SESSION_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Recognised keys (after the `ENTITY_SESSION_` prefix):
    /// `DEFAULT_PAGE_SIZE`, `MAX_PAGE_SIZE`, `DEFAULT_SORT` (`username,desc`,
    /// empty for none), `FLUSH_MODE` (`auto`/`manual`), `LOCK_TIMEOUT_MS`,
    /// `LOCK_LEASE_MS`, `AUDITOR`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match key {
                "DEFAULT_PAGE_SIZE" => config.paging.default_page_size = number(key, value)?,
                "MAX_PAGE_SIZE" => config.paging.max_page_size = number(key, value)?,
                "DEFAULT_SORT" if value.is_empty() => config.paging.default_sort = None,
                "DEFAULT_SORT" => {
                    let sort = Sort::parse(value)
                        .map_err(|err| DbError::Config(format!("{}{}: {}", ENV_PREFIX, key, err)))?;
                    config.paging.default_sort = Some(sort);
                }
                "FLUSH_MODE" => {
                    config.session.flush_mode = match value.to_ascii_lowercase().as_str() {
                        "auto" => FlushMode::Auto,
                        "manual" => FlushMode::Manual,
                        other => {
                            return Err(DbError::Config(format!(
                                "{}{}: unknown flush mode '{}'",
                                ENV_PREFIX, key, other
                            )));
                        }
                    }
                }
                "LOCK_TIMEOUT_MS" => config.session.lock_timeout_ms = number(key, value)?,
                "LOCK_LEASE_MS" => config.session.lock_lease_ms = number(key, value)?,
                "AUDITOR" => config.session.auditor = Some(value.to_string()),
                _ => log::warn!("ignoring unknown setting {}{}", ENV_PREFIX, key),
            }
        }
        config.checked()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.paging.validate()?;
        self.session.validate()
    }

    fn checked(self) -> Result<Self> {
        self.validate().map_err(DbError::Config)?;
        Ok(self)
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        DbError::Config(format!(
            "{}{}: expected a number, got '{}'",
            ENV_PREFIX, key, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrmConfig::default();
        assert_eq!(config.paging.default_page_size, 12);
        assert_eq!(config.paging.max_page_size, 2000);
        assert_eq!(
            config.paging.default_sort,
            Some(Sort::by(Direction::Desc, &["username"]))
        );
        assert_eq!(config.session.flush_mode, FlushMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = OrmConfig::default()
            .paging(PagingConfig::default().default_page_size(20).default_sort(None))
            .session(
                SessionConfig::default()
                    .flush_mode(FlushMode::Manual)
                    .lock_timeout(Duration::from_millis(250))
                    .auditor("admin"),
            );
        assert_eq!(config.paging.default_page_size, 20);
        assert_eq!(config.session.lock_timeout_duration(), Duration::from_millis(250));
        assert_eq!(config.session.auditor.as_deref(), Some("admin"));
    }

    #[test]
    fn test_validate() {
        let zero = PagingConfig::default().default_page_size(0);
        assert!(zero.validate().is_err());
        let inverted = PagingConfig::default().default_page_size(50).max_page_size(10);
        assert!(inverted.validate().is_err());
        let no_lease = SessionConfig {
            lock_lease_ms: 0,
            ..SessionConfig::default()
        };
        assert!(no_lease.validate().is_err());
    }
}

//! Server configuration from the environment.

use anyhow::Context;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (`PORT`, default 8080).
    pub port: u16,
    /// Origin allow-list (`ALLOWED_ORIGINS`, comma-separated, entries
    /// trimmed). Empty means any origin is accepted, the development
    /// default.
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT value '{raw}'"))?,
            _ => 8080,
        };

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .unwrap_or_default();

        Ok(Self {
            port,
            allowed_origins,
        })
    }

    /// Whether requests from `origin` are accepted.
    ///
    /// The single canonicalization point for origin checks: entries were
    /// trimmed at parse time and are matched exactly here, for both the
    /// CORS headers and the upgrade check. With no allow-list configured
    /// every origin passes.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty()
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

use std::env;

use anyhow::bail;

/// How sessions map to a lab partition key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tenancy {
    /// One lab per deployment; every case lives under `LabId::SINGLE`.
    Single,
    /// Cases are scoped to the session's lab.
    Multi,
}

impl Tenancy {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Tenancy::Single),
            "multi" => Ok(Tenancy::Multi),
            other => bail!("TENANCY must be single or multi, got {other:?}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub run_migrations: bool,
    pub tenancy: Tenancy,
    pub sequence_allow_gaps: bool,
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(5);
        let tenancy = match env::var("TENANCY") {
            Ok(s) => Tenancy::parse(&s)?,
            Err(_) => Tenancy::Multi,
        };

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections,
            run_migrations: flag("RUN_MIGRATIONS", true),
            tenancy,
            sequence_allow_gaps: flag("SEQUENCE_ALLOW_GAPS", false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tenancy() {
        assert_eq!(Tenancy::parse("single").unwrap(), Tenancy::Single);
        assert_eq!(Tenancy::parse(" Multi ").unwrap(), Tenancy::Multi);
        assert!(Tenancy::parse("both").is_err());
    }
}

use anyhow::Context;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to the roster Postgres instance")?;
        let max_connections =
            parse_max_connections(std::env::var("DATABASE_MAX_CONNECTIONS").ok().as_deref())?;

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

fn parse_max_connections(value: Option<&str>) -> anyhow::Result<u32> {
    match value.map(str::trim) {
        None | Some("") => Ok(DEFAULT_MAX_CONNECTIONS),
        Some(raw) => {
            let parsed: u32 = raw
                .parse()
                .with_context(|| format!("DATABASE_MAX_CONNECTIONS is not a number: {raw}"))?;
            anyhow::ensure!(parsed > 0, "DATABASE_MAX_CONNECTIONS must be at least 1");
            Ok(parsed)
        }
    }
}

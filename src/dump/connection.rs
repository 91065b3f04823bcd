//! PostgreSQL connection string parsing
//!
//! Accepts the key/value form used by .NET-style configuration
//! (`Host=db;Port=5432;Database=app;Username=postgres;Password=secret`)
//! and libpq URLs (`postgres://postgres:secret@db:5432/app`).

use std::fmt;

use crate::error::AppError;

const DEFAULT_PORT: u16 = 5432;

/// Parameters handed to the dump tool
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Passed to the dump tool through `PGPASSWORD`, never on the command line
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectionParams {
    /// Parse either connection string form
    ///
    /// # Errors
    /// Returns `InvalidConnectionString` naming every missing parameter,
    /// or the value that could not be parsed
    pub fn parse(input: &str) -> Result<Self, AppError> {
        let input = input.trim();
        if input.starts_with("postgres://") || input.starts_with("postgresql://") {
            Self::parse_url(input)
        } else {
            Self::parse_key_value(input)
        }
    }

    fn parse_key_value(input: &str) -> Result<Self, AppError> {
        let mut host = None;
        let mut port = None;
        let mut database = None;
        let mut username = None;
        let mut password = None;

        for pair in input.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(AppError::InvalidConnectionString(format!(
                    "expected key=value, got {:?}",
                    key_only(pair)
                )));
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "host" | "server" => host = Some(value),
                "port" => port = Some(parse_port(&value)?),
                "database" | "db" | "dbname" => database = Some(value),
                "username" | "user" | "user id" | "userid" => username = Some(value),
                "password" | "pwd" => password = Some(value),
                other => tracing::debug!(key = %other, "Ignoring connection string parameter"),
            }
        }

        Self::assemble(host, port, database, username, password)
    }

    fn parse_url(input: &str) -> Result<Self, AppError> {
        let url = url::Url::parse(input)
            .map_err(|e| AppError::InvalidConnectionString(e.to_string()))?;

        let decode = |value: &str| -> Result<String, AppError> {
            urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .map_err(|e| AppError::InvalidConnectionString(e.to_string()))
        };

        let host = url.host_str().map(str::to_string);
        let database = Some(decode(url.path().trim_start_matches('/'))?);
        let username = Some(decode(url.username())?);
        let password = url.password().map(decode).transpose()?;

        Self::assemble(host, url.port(), database, username, password)
    }

    fn assemble(
        host: Option<String>,
        port: Option<u16>,
        database: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, AppError> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());

        let missing: Vec<&str> = [
            ("host", present(&host)),
            ("database", present(&database)),
            ("username", present(&username)),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(AppError::InvalidConnectionString(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            host: host.unwrap_or_default(),
            port: port.unwrap_or(DEFAULT_PORT),
            database: database.unwrap_or_default(),
            username: username.unwrap_or_default(),
            password: password.filter(|value| !value.is_empty()),
        })
    }
}

fn parse_port(value: &str) -> Result<u16, AppError> {
    value
        .parse()
        .map_err(|_| AppError::InvalidConnectionString(format!("invalid port {:?}", value)))
}

// Avoid echoing a possible secret back in errors
fn key_only(pair: &str) -> &str {
    pair.split_whitespace().next().unwrap_or_default()
}

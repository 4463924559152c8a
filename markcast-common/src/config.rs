//! Configuration helpers shared by the core and plugins
//!
//! Plugin configs arrive as raw `toml::Table`s. [`SectionReader`] pulls typed
//! values out of one table and records every missing or mistyped key, so a
//! constructor can report all problems in a single [`ConfigError`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Seconds from a config value as a `Duration`
///
/// The error is the problem text, e.g. for [`SectionReader::invalid`].
pub fn seconds_to_duration(secs: f64) -> std::result::Result<Duration, &'static str> {
    if !secs.is_finite() || secs < 0.0 {
        return Err("must be a non-negative number of seconds");
    }
    Duration::try_from_secs_f64(secs).map_err(|_| "is too large a number of seconds")
}

/// Platform configuration directory for markcast
///
/// `~/.config/markcast` on Linux, the platform equivalent elsewhere, and the
/// current directory when no home can be determined.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("markcast"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Expand `$VAR` and `${VAR}` references from the environment
///
/// Unknown variables and malformed references are left verbatim.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed): (&str, usize) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        let value = if name.is_empty() {
            None
        } else {
            std::env::var(name).ok()
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

/// Typed reader over one TOML section
///
/// Each accessor returns a value (or default) and records a message when the
/// key is missing or has the wrong type. Call [`SectionReader::finish`] once
/// everything has been read.
pub struct SectionReader<'a> {
    section: String,
    table: &'a toml::Table,
    errors: Vec<String>,
}

impl<'a> SectionReader<'a> {
    /// # Arguments
    /// * `section` - Name used in error messages, e.g. `plugin.IRC`
    pub fn new(section: impl Into<String>, table: &'a toml::Table) -> Self {
        Self {
            section: section.into(),
            table,
            errors: Vec::new(),
        }
    }

    pub fn required_str(&mut self, key: &str) -> String {
        match self.table.get(key) {
            Some(toml::Value::String(s)) => s.clone(),
            Some(_) => self.mistyped(key, "a string"),
            None => self.missing(key),
        }
    }

    pub fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.table.get(key) {
            Some(toml::Value::String(s)) => Some(s.clone()),
            Some(_) => self.mistyped(key, "a string"),
            None => None,
        }
    }

    /// Required string with environment variables expanded
    pub fn required_path(&mut self, key: &str) -> String {
        expand_env_vars(&self.required_str(key))
    }

    pub fn optional_path(&mut self, key: &str) -> Option<String> {
        self.optional_str(key).map(|p| expand_env_vars(&p))
    }

    pub fn required_bool(&mut self, key: &str) -> bool {
        match self.table.get(key) {
            Some(toml::Value::Boolean(b)) => *b,
            Some(_) => self.mistyped(key, "a boolean"),
            None => self.missing(key),
        }
    }

    pub fn optional_bool(&mut self, key: &str, default: bool) -> bool {
        match self.table.get(key) {
            Some(toml::Value::Boolean(b)) => *b,
            Some(_) => self.mistyped(key, "a boolean"),
            None => default,
        }
    }

    /// Required number; integers are accepted and widened
    pub fn required_f64(&mut self, key: &str) -> f64 {
        match self.table.get(key) {
            Some(v) => self.number(key, v),
            None => self.missing(key),
        }
    }

    pub fn optional_f64(&mut self, key: &str, default: f64) -> f64 {
        match self.table.get(key) {
            Some(v) => self.number(key, v),
            None => default,
        }
    }

    /// Required non-negative seconds value
    pub fn required_seconds(&mut self, key: &str) -> Duration {
        let value = self.required_f64(key);
        self.checked_seconds(key, value)
    }

    /// Optional non-negative seconds value
    pub fn optional_seconds(&mut self, key: &str, default: Duration) -> Duration {
        match self.table.get(key) {
            Some(v) => {
                let value = self.number(key, v);
                self.checked_seconds(key, value)
            }
            None => default,
        }
    }

    pub fn optional_integer(&mut self, key: &str, default: i64) -> i64 {
        match self.table.get(key) {
            Some(toml::Value::Integer(i)) => *i,
            Some(_) => self.mistyped(key, "an integer"),
            None => default,
        }
    }

    /// Required TCP port (1..=65535)
    pub fn required_port(&mut self, key: &str) -> u16 {
        match self.table.get(key) {
            Some(toml::Value::Integer(i)) => match u16::try_from(*i) {
                Ok(port) if port > 0 => port,
                _ => {
                    self.invalid(key, "must be a port number between 1 and 65535");
                    0
                }
            },
            Some(_) => self.mistyped(key, "an integer"),
            None => self.missing(key),
        }
    }

    /// Optional array of strings; absent means empty
    pub fn string_list(&mut self, key: &str) -> Vec<String> {
        let Some(value) = self.table.get(key) else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            return self.mistyped(key, "an array of strings");
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str() {
                Some(s) => out.push(s.to_string()),
                None => return self.mistyped(key, "an array of strings"),
            }
        }
        out
    }

    /// Nested table; absent yields `None`
    pub fn subtable(&mut self, key: &str) -> Option<&'a toml::Table> {
        let table: &'a toml::Table = self.table;
        match table.get(key) {
            Some(toml::Value::Table(t)) => Some(t),
            Some(_) => {
                self.mistyped::<()>(key, "a table");
                None
            }
            None => None,
        }
    }

    /// Record a constraint violation found by the caller
    pub fn invalid(&mut self, key: &str, problem: &str) {
        self.errors
            .push(format!("[{}] \"{}\" {}", self.section, key, problem));
    }

    /// Record a problem not tied to one key
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors
            .push(format!("[{}] {}", self.section, message.into()));
    }

    /// Take over the problems found in a nested section
    pub fn merge(&mut self, nested: ConfigError) {
        self.errors.extend(nested.messages().iter().cloned());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fail with every recorded problem, if any
    pub fn finish(self) -> Result<(), ConfigError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(self.errors))
        }
    }

    fn checked_seconds(&mut self, key: &str, value: f64) -> Duration {
        seconds_to_duration(value).unwrap_or_else(|problem| {
            self.invalid(key, problem);
            Duration::ZERO
        })
    }

    fn number(&mut self, key: &str, value: &toml::Value) -> f64 {
        match value {
            toml::Value::Float(f) => *f,
            toml::Value::Integer(i) => *i as f64,
            _ => self.mistyped(key, "a number"),
        }
    }

    fn missing<T: Default>(&mut self, key: &str) -> T {
        self.errors
            .push(format!("[{}] missing \"{}\"", self.section, key));
        T::default()
    }

    fn mistyped<T: Default>(&mut self, key: &str, expected: &str) -> T {
        self.errors.push(format!(
            "[{}] \"{}\" must be {}",
            self.section, key, expected
        ));
        T::default()
    }
}

//! Database credentials for the dump sub-task.

use crate::config::{DbInfo, EnvFileInfo};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::io::Cursor;

/// Complete credentials; only built when every field is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub name: String,
}

/// Parse env-file content into key/value pairs.
///
/// Lines dotenvy cannot parse are dropped, as are keys with empty values.
/// CRLF files are accepted. Values are kept verbatim: dotenvy expands `$VAR`,
/// so any line carrying a `$` is re-read literally.
pub fn parse_env(content: &[u8]) -> HashMap<String, String> {
    let normalized: Vec<u8> = content.iter().copied().filter(|b| *b != b'\r').collect();
    let mut entries: HashMap<String, String> =
        dotenvy::from_read_iter(Cursor::new(normalized.as_slice()))
            .filter_map(|item| item.ok())
            .collect();

    let text = String::from_utf8_lossy(&normalized);
    for (key, value) in text.lines().filter(|line| line.contains('$')).filter_map(literal_pair) {
        entries.insert(key, value);
    }

    entries.retain(|_, value| !value.is_empty());
    entries
}

/// `KEY=value` without substitution. Surrounding quotes are stripped; an
/// unquoted value ends at ` #`.
fn literal_pair(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = &raw[1..];
            &inner[..inner.rfind(quote)?]
        }
        _ => raw.split_once(" #").map_or(raw, |(value, _)| value).trim_end(),
    };
    Some((key.to_string(), value.to_string()))
}

/// Overlay env entries on the explicit config values.
///
/// A key present in `entries` wins over the explicit field; a port that does
/// not parse leaves the field unset.
pub fn merge_env(explicit: &DbInfo, keys: &EnvFileInfo, entries: &HashMap<String, String>) -> DbInfo {
    let pick = |key: &str, fallback: &Option<String>| {
        entries.get(key).cloned().or_else(|| fallback.clone())
    };

    let port = match entries.get(&keys.port_key) {
        Some(raw) => raw.trim().parse().ok(),
        None => explicit.port,
    };

    DbInfo {
        host: pick(&keys.host_key, &explicit.host),
        port,
        user: pick(&keys.user_key, &explicit.user),
        pass: pick(&keys.pass_key, &explicit.pass),
        name: pick(&keys.name_key, &explicit.name),
    }
}

impl DbCredentials {
    /// Every field must be present and non-empty.
    pub fn from_info(info: &DbInfo) -> Result<Self> {
        fn present(value: &Option<String>) -> Option<String> {
            value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
        }

        let host = present(&info.host);
        let user = present(&info.user);
        let pass = present(&info.pass);
        let name = present(&info.name);
        let port = info.port.filter(|p| *p > 0);

        match (host, port, user, pass, name) {
            (Some(host), Some(port), Some(user), Some(pass), Some(name)) => Ok(DbCredentials {
                host,
                port,
                user,
                pass,
                name,
            }),
            (host, port, user, pass, name) => {
                let mut missing = Vec::new();
                if host.is_none() {
                    missing.push("host");
                }
                if port.is_none() {
                    missing.push("port");
                }
                if user.is_none() {
                    missing.push("user");
                }
                if pass.is_none() {
                    missing.push("pass");
                }
                if name.is_none() {
                    missing.push("name");
                }
                Err(BackupError::CredentialsIncomplete { missing })
            }
        }
    }
}

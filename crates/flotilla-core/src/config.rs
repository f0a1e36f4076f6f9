//! Configuration values as the core consumes them.
//!
//! File parsing lives outside the core; what arrives here is a map of
//! `section name → key → value` plus typed getters for the value syntaxes
//! backends use (booleans, byte sizes with binary suffixes, durations).
//! Credentials may be stored obscured with the reversible codec in
//! [`obscure`]/[`reveal`].

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;

use crate::error::{FsError, FsResult};

/// `section → key → value`, typically one section per configured remote with
/// a `type` key naming the backend scheme.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    sections: HashMap<String, HashMap<String, String>>,
}

impl ConfigMap {
    pub fn new() -> Self {
        ConfigMap::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }

    /// Parse a boolean value: `true/false`, `yes/no`, `1/0`.
    pub fn get_bool(&self, section: &str, key: &str) -> FsResult<Option<bool>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                other => Err(FsError::Validation(format!(
                    "{section}.{key}: not a boolean: {other:?}"
                ))),
            },
        }
    }

    /// Parse a byte size with optional binary suffix: `65536`, `16M`, `1G`.
    pub fn get_size(&self, section: &str, key: &str) -> FsResult<Option<u64>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => parse_size(v)
                .map(Some)
                .ok_or_else(|| {
                    FsError::Validation(format!("{section}.{key}: not a size: {v:?}"))
                }),
        }
    }

    /// Parse a duration with unit suffix: `500ms`, `10s`, `5m`, `2h`.
    pub fn get_duration(&self, section: &str, key: &str) -> FsResult<Option<Duration>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => parse_duration(v)
                .map(Some)
                .ok_or_else(|| {
                    FsError::Validation(format!("{section}.{key}: not a duration: {v:?}"))
                }),
        }
    }
}

/// Parse `1024`, `64K`, `16M`, `2G`, `1T` (binary multiples, optional
/// trailing `B` or `iB`).
pub fn parse_size(v: &str) -> Option<u64> {
    let v = v.trim();
    let stripped = v
        .strip_suffix("iB")
        .or_else(|| v.strip_suffix('B'))
        .unwrap_or(v);
    let (digits, multiplier) = match stripped.chars().last()? {
        'K' | 'k' => (&stripped[..stripped.len() - 1], 1u64 << 10),
        'M' | 'm' => (&stripped[..stripped.len() - 1], 1u64 << 20),
        'G' | 'g' => (&stripped[..stripped.len() - 1], 1u64 << 30),
        'T' | 't' => (&stripped[..stripped.len() - 1], 1u64 << 40),
        _ => (stripped, 1),
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(multiplier)
}

/// Parse `100ns`, `5us`, `250ms`, `30s`, `10m`, `2h`.
pub fn parse_duration(v: &str) -> Option<Duration> {
    let v = v.trim();
    let split = v.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = v.split_at(split);
    let value: f64 = num.parse().ok()?;
    let secs = match unit.trim() {
        "ns" => value / 1e9,
        "us" | "µs" => value / 1e6,
        "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    if secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Key for the repeating-XOR obscure codec.
///
/// This provides reversible at-rest scrambling of credentials in config
/// values, not confidentiality against an attacker who has the binary.
const OBSCURE_KEY: &[u8] = &[
    0x9c, 0x93, 0x5b, 0x48, 0x73, 0x0a, 0x55, 0x4d, 0x6b, 0xfd, 0x7c, 0x63, 0xc8, 0x86, 0xa9,
    0x2b, 0xd3, 0x90, 0x19, 0x8e, 0xb8, 0x12, 0x8a, 0xfb, 0xf4, 0xde, 0x16, 0x2b, 0x8b, 0x95,
    0xf6, 0x38,
];

/// Obscure a credential for storage in a config value.
pub fn obscure(plain: &str) -> String {
    let mixed: Vec<u8> = plain
        .bytes()
        .enumerate()
        .map(|(i, b)| b ^ OBSCURE_KEY[i % OBSCURE_KEY.len()])
        .collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mixed)
}

/// Reverse [`obscure`].
pub fn reveal(obscured: &str) -> FsResult<String> {
    let mixed = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(obscured.trim())
        .map_err(|_| FsError::Validation("obscured value is not valid base64".into()))?;
    let plain: Vec<u8> = mixed
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ OBSCURE_KEY[i % OBSCURE_KEY.len()])
        .collect();
    String::from_utf8(plain)
        .map_err(|_| FsError::Validation("obscured value does not decode to UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_map_round_trip() {
        let mut cfg = ConfigMap::new();
        cfg.set("s3", "type", "s3");
        cfg.set("s3", "region", "eu-west-1");
        assert_eq!(cfg.get("s3", "type"), Some("s3"));
        assert_eq!(cfg.get("s3", "missing"), None);
        assert_eq!(cfg.get("nope", "type"), None);
        assert!(cfg.has_section("s3"));
    }

    #[test]
    fn test_get_bool() {
        let mut cfg = ConfigMap::new();
        cfg.set("r", "a", "true");
        cfg.set("r", "b", "no");
        cfg.set("r", "c", "maybe");
        assert_eq!(cfg.get_bool("r", "a").unwrap(), Some(true));
        assert_eq!(cfg.get_bool("r", "b").unwrap(), Some(false));
        assert_eq!(cfg.get_bool("r", "missing").unwrap(), None);
        assert!(cfg.get_bool("r", "c").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("16MiB"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("junk"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("100"), None);
        assert_eq!(parse_duration("1fortnight"), None);
    }

    #[test]
    fn test_obscure_round_trip() {
        for secret in ["", "hunter2", "pa ss:with/odd~chars\u{1F512}"] {
            let hidden = obscure(secret);
            assert_eq!(reveal(&hidden).unwrap(), secret, "round trip of {secret:?}");
            if !secret.is_empty() {
                assert_ne!(hidden, secret);
            }
        }
    }

    #[test]
    fn test_reveal_rejects_garbage() {
        assert!(reveal("!!not-base64!!").is_err());
    }
}

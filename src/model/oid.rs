use std::fmt;

use regex_lite::Regex;
use serde::de::{self, Deserialize, Deserializer};
use serde::{Serialize, Serializer};

lazy_static::lazy_static! {
    static ref OID_PATTERN: Regex = Regex::new(r"^\.?(\d+\.)+\d+$").unwrap();
}

/// A dotted SNMP OID, normalised to leading-dot form (`.1.3.6.1.2.1.1.5.0`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    /// Parse and normalise a dotted OID string. Adds the leading
    /// dot when absent, rejects anything not matching `^\.?(\d+\.)+\d+$`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if !OID_PATTERN.is_match(s) {
            anyhow::bail!("bad OID `{}`", s);
        }
        if s.starts_with('.') {
            Ok(Oid(s.to_string()))
        } else {
            Ok(Oid(format!(".{}", s)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tells whether `name` is a strict descendant of this OID.
    pub fn contains(&self, name: &str) -> bool {
        name.len() > self.0.len() && name.starts_with(self.0.as_str()) && name.as_bytes()[self.0.len()] == b'.'
    }

    /// Sub-OID of `name` past this base OID, without the separating dot.
    /// Empty when `name` does not extend the base.
    pub fn suffix_of<'a>(&self, name: &'a str) -> &'a str {
        if self.contains(name) {
            &name[self.0.len() + 1..]
        } else {
            ""
        }
    }

    /// Key used for the per-request walk cache. The community flag is part
    /// of the key since the same OID can be walked under both communities.
    pub fn cache_key(&self, alternate_community: bool) -> String {
        format!("{}@{}", self.0, alternate_community)
    }

    /// Numeric components, used to build the wire-level OID.
    pub fn components(&self) -> anyhow::Result<Vec<u64>> {
        self.0
            .trim_start_matches('.')
            .split('.')
            .map(|p| p.parse::<u64>().map_err(|e| anyhow::anyhow!("oid component `{}`: {}", p, e)))
            .collect()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !OID_PATTERN.is_match(&self.0) {
            return Err(serde::ser::Error::custom(format!("bad OID format `{}`", self.0)));
        }
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Oid::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adds_leading_dot() {
        assert_eq!(Oid::parse("1.3.6.1.2.1.1.5.0").unwrap().as_str(), ".1.3.6.1.2.1.1.5.0");
        assert_eq!(Oid::parse(".1.3.6.1.2.1.1.5.0").unwrap().as_str(), ".1.3.6.1.2.1.1.5.0");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Oid::parse("..1.2").is_err());
        assert!(Oid::parse("").is_err());
        assert!(Oid::parse("1").is_err());
        assert!(Oid::parse("1.2.x").is_err());
        assert!(Oid::parse(".1.2.").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let o: Oid = serde_json::from_str(r#""1.3.6.1.2.1.1.5.0""#).unwrap();
        assert_eq!(o.as_str(), ".1.3.6.1.2.1.1.5.0");
        assert_eq!(serde_json::to_string(&o).unwrap(), r#"".1.3.6.1.2.1.1.5.0""#);
    }

    #[test]
    fn test_suffix_of() {
        let o = Oid::parse(".1.3.6.1.2.1.2.2.1.8").unwrap();
        assert_eq!(o.suffix_of(".1.3.6.1.2.1.2.2.1.8.42"), "42");
        assert_eq!(o.suffix_of(".1.3.6.1.2.1.2.2.1.8.4.2"), "4.2");
        assert_eq!(o.suffix_of(".1.3.6.1.2.1.2.2.1.8"), "");
        assert_eq!(o.suffix_of(".1.3.6.1.2.1.2.2.1.80.1"), "");
    }

    #[test]
    fn test_components() {
        let o = Oid::parse(".1.3.6").unwrap();
        assert_eq!(o.components().unwrap(), vec![1, 3, 6]);
    }
}

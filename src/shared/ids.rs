use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(JobName, "job name");
define_id_type!(CycleName, "cycle name");
define_id_type!(TriggerName, "trigger name");

/// Random lowercase hex, `bytes * 2` characters long.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    if getrandom::getrandom(&mut buf).is_err() {
        // Fall back to clock entropy; ids only need to be unique per record set.
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let mixed = nanos ^ u64::from(std::process::id()).rotate_left(32);
        for (index, slot) in buf.iter_mut().enumerate() {
            *slot = (mixed >> ((index % 8) * 8)) as u8;
        }
    }
    buf.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// `<prefix>-<YYYYMMDDHHMMSS>-<6 hex>`; sortable by creation time.
pub fn new_record_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        random_hex(3)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_reject_tag_breaking_characters() {
        assert!(JobName::parse("extract_facts").is_ok());
        assert!(JobName::parse("final-output2").is_ok());
        assert!(JobName::parse("").is_err());
        assert!(JobName::parse("bad#name").is_err());
        assert!(JobName::parse("two words").is_err());
    }

    #[test]
    fn record_ids_carry_prefix_and_differ() {
        let first = new_record_id("task");
        let second = new_record_id("task");
        assert!(first.starts_with("task-"));
        assert_eq!(first.len(), "task-".len() + 14 + 1 + 6);
        assert_ne!(first, second);
    }
}

use std::{collections::BTreeMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    checkpoint,
    error::{Result, SluiceError},
    selector::LabelSelector,
};

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("valid regex")
});

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9.]{0,251}[a-z0-9])?$").expect("valid regex")
});

static BUCKET_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid regex")
});

/// Longest accepted `pollFrequency`, one day.
pub const MAX_POLL_FREQUENCY_SECS: i64 = 24 * 60 * 60;

/// Namespaced identity of a trigger resource.
#[derive(
    Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TriggerKey {
    pub namespace: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Namespace must be a DNS label and the name a DNS subdomain. Both end
    /// up in file paths and function URLs.
    pub fn validate(&self) -> Result<()> {
        if !DNS_LABEL.is_match(&self.namespace) {
            return Err(SluiceError::invalid_trigger(
                self,
                format!("namespace '{}' is not a valid DNS label", self.namespace),
            ));
        }
        if !DNS_SUBDOMAIN.is_match(&self.name) {
            return Err(SluiceError::invalid_trigger(
                self,
                format!("name '{}' is not a valid DNS subdomain", self.name),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Declared polling intent: which bucket prefix to watch, how often, and
/// which functions to invoke.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    pub bucket: String,
    /// Key prefix inside the bucket. Empty watches the whole bucket.
    #[serde(default)]
    pub sub_dir: String,
    /// Poll interval in seconds.
    pub poll_frequency: i64,
    #[serde(default)]
    pub function_selector: LabelSelector,
}

impl TriggerSpec {
    pub fn new(
        bucket: impl Into<String>,
        sub_dir: impl Into<String>,
        poll_frequency: i64,
        function_selector: LabelSelector,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            sub_dir: sub_dir.into(),
            poll_frequency,
            function_selector,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_frequency
                .clamp(1, MAX_POLL_FREQUENCY_SECS)
                .unsigned_abs(),
        )
    }

    pub fn validate(&self, key: &TriggerKey) -> Result<()> {
        key.validate()?;

        if self.bucket.trim().is_empty() {
            return Err(SluiceError::invalid_trigger(key, "bucket is required"));
        }
        if !BUCKET_NAME.is_match(&self.bucket) {
            return Err(SluiceError::invalid_trigger(
                key,
                format!("bucket '{}' is not a valid bucket name", self.bucket),
            ));
        }
        if self.sub_dir.starts_with('/') {
            return Err(SluiceError::invalid_trigger(
                key,
                "subDir must be relative to the bucket root",
            ));
        }
        if self.poll_frequency < 1 {
            return Err(SluiceError::invalid_trigger(
                key,
                format!(
                    "pollFrequency must be at least 1 second, got {}",
                    self.poll_frequency
                ),
            ));
        }
        if self.poll_frequency > MAX_POLL_FREQUENCY_SECS {
            return Err(SluiceError::invalid_trigger(
                key,
                format!(
                    "pollFrequency must be at most {MAX_POLL_FREQUENCY_SECS} seconds, got {}",
                    self.poll_frequency
                ),
            ));
        }
        self.function_selector
            .validate()
            .map_err(|reason| SluiceError::invalid_trigger(key, reason))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled: Option<String>,
}

impl TriggerStatus {
    pub fn at(checkpoint: DateTime<Utc>) -> Self {
        Self {
            last_polled: Some(checkpoint::format(checkpoint)),
        }
    }

    /// Parsed `lastPolled`. A malformed value is logged and treated as if no
    /// checkpoint had been recorded.
    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_polled.as_deref()?;
        if raw.trim().is_empty() {
            return None;
        }
        match checkpoint::parse(raw) {
            Ok(at) => Some(at),
            Err(err) => {
                warn!(
                    target: "sluice::checkpoint",
                    raw,
                    error = %err,
                    "ignoring unparseable lastPolled status"
                );
                None
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: TriggerSpec,
    #[serde(default)]
    pub status: TriggerStatus,
}

impl Trigger {
    pub fn new(key: TriggerKey, spec: TriggerSpec) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            spec,
            status: TriggerStatus::default(),
        }
    }

    pub fn with_status(mut self, status: TriggerStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec() -> TriggerSpec {
        TriggerSpec::new(
            "uploads",
            "photos/",
            30,
            LabelSelector::from_labels([("fn", "resize")]),
        )
    }

    #[test]
    fn valid_spec_passes() {
        let key = TriggerKey::new("default", "photos");
        assert!(spec().validate(&key).is_ok());
    }

    #[test]
    fn rejects_missing_fields_and_bad_values() {
        let key = TriggerKey::new("default", "photos");

        let mut missing_bucket = spec();
        missing_bucket.bucket.clear();
        assert!(matches!(
            missing_bucket.validate(&key),
            Err(SluiceError::InvalidTrigger { .. })
        ));

        let mut zero_interval = spec();
        zero_interval.poll_frequency = 0;
        assert!(zero_interval.validate(&key).is_err());

        let mut huge_interval = spec();
        huge_interval.poll_frequency = i64::MAX;
        assert!(huge_interval.validate(&key).is_err());
        assert_eq!(
            huge_interval.poll_interval(),
            Duration::from_secs(MAX_POLL_FREQUENCY_SECS as u64)
        );

        let mut one_day = spec();
        one_day.poll_frequency = MAX_POLL_FREQUENCY_SECS;
        assert!(one_day.validate(&key).is_ok());

        let mut absolute_prefix = spec();
        absolute_prefix.sub_dir = "/photos".into();
        assert!(absolute_prefix.validate(&key).is_err());

        let mut no_selector = spec();
        no_selector.function_selector = LabelSelector::default();
        assert!(no_selector.validate(&key).is_err());

        let bad_key = TriggerKey::new("Default", "../escape");
        assert!(spec().validate(&bad_key).is_err());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let raw = r#"{
            "bucket": "uploads",
            "subDir": "incoming/",
            "pollFrequency": 15,
            "functionSelector": {"matchLabels": {"fn": "ingest"}}
        }"#;
        let parsed: TriggerSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.sub_dir, "incoming/");
        assert_eq!(parsed.poll_interval(), Duration::from_secs(15));

        let status = TriggerStatus::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        );
        let encoded = serde_json::to_value(&status).unwrap();
        assert_eq!(encoded["lastPolled"], "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn malformed_status_reads_as_absent() {
        let status = TriggerStatus {
            last_polled: Some("yesterday".into()),
        };
        assert!(status.checkpoint().is_none());
        assert!(TriggerStatus::default().checkpoint().is_none());
    }
}

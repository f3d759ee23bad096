use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::types::{FunctionTarget, TriggerKey, TriggerSpec};

/// Composite key of one logical poller. Any change to a component means a
/// different consumer; everything else is a tunable parameter.
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConsumerIdentity {
    pub namespace: String,
    pub trigger: String,
    pub function: String,
    pub bucket: String,
    pub prefix: String,
}

impl ConsumerIdentity {
    pub fn new(key: &TriggerKey, function: &str, spec: &TriggerSpec) -> Self {
        Self {
            namespace: key.namespace.clone(),
            trigger: key.name.clone(),
            function: function.to_string(),
            bucket: spec.bucket.clone(),
            prefix: spec.sub_dir.clone(),
        }
    }

    pub fn trigger_key(&self) -> TriggerKey {
        TriggerKey::new(self.namespace.clone(), self.trigger.clone())
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.namespace, self.trigger, self.function, self.bucket, self.prefix
        )
    }
}

/// Non-identity parameters of a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerParams {
    pub function: FunctionTarget,
    pub poll_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LabelSelector;

    #[test]
    fn identity_ignores_interval_but_not_prefix() {
        let key = TriggerKey::new("default", "photos");
        let selector = LabelSelector::from_labels([("fn", "resize")]);
        let a = TriggerSpec::new("uploads", "photos/", 30, selector.clone());
        let b = TriggerSpec::new("uploads", "photos/", 60, selector.clone());
        let c = TriggerSpec::new("uploads", "thumbs/", 30, selector);

        let id_a = ConsumerIdentity::new(&key, "resize", &a);
        assert_eq!(id_a, ConsumerIdentity::new(&key, "resize", &b));
        assert_ne!(id_a, ConsumerIdentity::new(&key, "resize", &c));
        assert_ne!(id_a, ConsumerIdentity::new(&key, "thumbnail", &a));
        assert_eq!(id_a.to_string(), "default_photos_resize_uploads_photos/");
        assert_eq!(id_a.trigger_key(), key);
    }
}

//! Label selectors used by triggers to pick the functions they invoke.
//!
//! Semantics follow Kubernetes label selectors: every `matchLabels` entry and
//! every `matchExpressions` requirement must hold for a label set to match.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Set-based operator for a [`LabelSelectorRequirement`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => {
                value.is_some_and(|v| self.values.iter().any(|want| want == v))
            }
            SelectorOperator::NotIn => {
                value.is_none_or(|v| self.values.iter().all(|want| want != v))
            }
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.key.trim().is_empty() {
            return Err("selector requirement has an empty key".to_string());
        }
        match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn
                if self.values.is_empty() =>
            {
                Err(format!(
                    "operator {:?} on key '{}' requires at least one value",
                    self.operator, self.key
                ))
            }
            SelectorOperator::Exists | SelectorOperator::DoesNotExist
                if !self.values.is_empty() =>
            {
                Err(format!(
                    "operator {:?} on key '{}' must not carry values",
                    self.operator, self.key
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn with_requirement(
        mut self,
        key: impl Into<String>,
        operator: SelectorOperator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.match_expressions.push(LabelSelectorRequirement {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// True when the selector carries no requirements at all.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self
                .match_expressions
                .iter()
                .all(|requirement| requirement.matches(labels))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("function selector must not be empty".to_string());
        }
        if self.match_labels.keys().any(|key| key.trim().is_empty()) {
            return Err("function selector has an empty label key".to_string());
        }
        self.match_expressions
            .iter()
            .try_for_each(LabelSelectorRequirement::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector =
            LabelSelector::from_labels([("app", "thumbs"), ("tier", "fn")]);
        assert!(selector.matches(&labels(&[
            ("app", "thumbs"),
            ("tier", "fn"),
            ("extra", "x"),
        ])));
        assert!(!selector.matches(&labels(&[("app", "thumbs")])));
        assert!(!selector.matches(&labels(&[("app", "other"), ("tier", "fn")])));
    }

    #[test]
    fn set_based_operators() {
        let selector = LabelSelector::default()
            .with_requirement("env", SelectorOperator::In, ["prod", "staging"])
            .with_requirement("legacy", SelectorOperator::DoesNotExist, [] as [&str; 0]);

        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("legacy", "1")])));

        let not_in = LabelSelector::default()
            .with_requirement("env", SelectorOperator::NotIn, ["dev"]);
        assert!(not_in.matches(&labels(&[])), "absent key satisfies NotIn");
        assert!(not_in.matches(&labels(&[("env", "prod")])));
        assert!(!not_in.matches(&labels(&[("env", "dev")])));

        let exists = LabelSelector::default()
            .with_requirement("owner", SelectorOperator::Exists, [] as [&str; 0]);
        assert!(exists.matches(&labels(&[("owner", "")])));
        assert!(!exists.matches(&labels(&[])));
    }

    #[test]
    fn validation_rejects_empty_and_malformed_selectors() {
        assert!(LabelSelector::default().validate().is_err());
        assert!(
            LabelSelector::default()
                .with_requirement("env", SelectorOperator::In, [] as [&str; 0])
                .validate()
                .is_err()
        );
        assert!(
            LabelSelector::default()
                .with_requirement("env", SelectorOperator::Exists, ["x"])
                .validate()
                .is_err()
        );
        assert!(LabelSelector::from_labels([("app", "x")]).validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_wire_form() {
        let raw = r#"{
            "matchLabels": {"function": "resize"},
            "matchExpressions": [{"key": "env", "operator": "NotIn", "values": ["dev"]}]
        }"#;
        let selector: LabelSelector = serde_json::from_str(raw).unwrap();
        assert_eq!(selector.match_labels.get("function").unwrap(), "resize");
        assert_eq!(
            selector.match_expressions[0].operator,
            SelectorOperator::NotIn
        );
    }
}

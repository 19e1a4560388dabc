//! Label selector evaluation.
//!
//! Pool affinity is expressed with the standard Kubernetes `LabelSelector`
//! (`matchLabels` plus `matchExpressions` with In/NotIn/Exists/DoesNotExist).
//! An empty selector matches everything.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let actual = labels.get(&expression.key);
            let values = expression.values.clone().unwrap_or_default();
            let matched = match expression.operator.as_str() {
                "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(matches(&LabelSelector::default(), &labels(&[("a", "b")])));
        assert!(matches(&LabelSelector::default(), &BTreeMap::new()));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("zone", "east")])),
            ..Default::default()
        };
        assert!(matches(&selector, &labels(&[("zone", "east"), ("x", "y")])));
        assert!(!matches(&selector, &labels(&[("zone", "west")])));
        assert!(!matches(&selector, &BTreeMap::new()));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                requirement("zone", "In", &["east", "north"]),
                requirement("dedicated", "DoesNotExist", &[]),
            ]),
            ..Default::default()
        };
        assert!(matches(&selector, &labels(&[("zone", "north")])));
        assert!(!matches(&selector, &labels(&[("zone", "west")])));
        assert!(!matches(
            &selector,
            &labels(&[("zone", "east"), ("dedicated", "db")])
        ));
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("zone", "NotIn", &["west"])]),
            ..Default::default()
        };
        assert!(matches(&selector, &BTreeMap::new()));
        assert!(matches(&selector, &labels(&[("zone", "east")])));
        assert!(!matches(&selector, &labels(&[("zone", "west")])));
    }

    #[test]
    fn test_unknown_operator_never_matches() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("zone", "Near", &["east"])]),
            ..Default::default()
        };
        assert!(!matches(&selector, &labels(&[("zone", "east")])));
    }
}

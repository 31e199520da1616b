//! Label maps and the node selector expression language.

use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// An ordered list of expressions evaluated as a logical AND. The empty
/// selector matches every node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Expression>);

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
    /// Operator names are not validated at parse time; anything unrecognized
    /// is carried through and matches no node.
    Unrecognized(String),
}

// === impl Selector ===

impl Selector {
    /// Parses a JSON array of expressions. The empty string yields the
    /// match-all selector.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        if text.is_empty() {
            return Ok(Self::default());
        }
        let exprs = serde_json::from_str::<Vec<Expression>>(text)?;
        Ok(Self(exprs))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|expr| expr.matches(labels.as_ref()))
    }
}

// === impl Labels ===

impl From<Option<BTreeMap<String, String>>> for Labels {
    #[inline]
    fn from(labels: Option<BTreeMap<String, String>>) -> Self {
        Self(Arc::new(labels.unwrap_or_default()))
    }
}

impl AsRef<BTreeMap<String, String>> for Labels {
    #[inline]
    fn as_ref(&self) -> &BTreeMap<String, String> {
        self.0.as_ref()
    }
}

impl<T: AsRef<BTreeMap<String, String>>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => match labels.get(&self.key) {
                Some(v) => self.values.contains(v),
                None => false,
            },
            Operator::NotIn => match labels.get(&self.key) {
                Some(v) => !self.values.contains(v),
                None => true,
            },
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
            Operator::Gt => self.compares(labels, |value, bound| value > bound),
            Operator::Lt => self.compares(labels, |value, bound| value < bound),
            Operator::Unrecognized(_) => false,
        }
    }

    /// Numeric comparison against `values[0]`. A missing key, missing bound,
    /// or a side that is not a signed 64-bit decimal integer matches nothing.
    fn compares(&self, labels: &Map, cmp: impl Fn(i64, i64) -> bool) -> bool {
        let value = labels.get(&self.key).and_then(|v| v.parse::<i64>().ok());
        let bound = self.values.first().and_then(|v| v.parse::<i64>().ok());
        match (value, bound) {
            (Some(value), Some(bound)) => cmp(value, bound),
            _ => false,
        }
    }
}

// === impl Operator ===

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(match name.as_str() {
            "In" => Self::In,
            "NotIn" => Self::NotIn,
            "Exists" => Self::Exists,
            "DoesNotExist" => Self::DoesNotExist,
            "Gt" => Self::Gt,
            "Lt" => Self::Lt,
            _ => Self::Unrecognized(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Map>(),
        )
        .into()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = Selector::parse("").unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("zone", "zone-a")])));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(Selector::parse("{not json").is_err());
        assert!(Selector::parse(r#"{"key": "k"}"#).is_err());
    }

    #[test]
    fn expressions_are_anded() {
        let selector = Selector::parse(
            r#"[
                {"key": "node-type", "operator": "In", "values": ["edge"]},
                {"key": "zone", "operator": "NotIn", "values": ["zone-a"]}
            ]"#,
        )
        .unwrap();

        assert!(selector.matches(&labels(&[("node-type", "edge"), ("zone", "zone-b")])));
        assert!(!selector.matches(&labels(&[("node-type", "edge"), ("zone", "zone-a")])));
        assert!(!selector.matches(&labels(&[("node-type", "internal"), ("zone", "zone-b")])));
    }

    #[test]
    fn not_in_matches_when_the_key_is_absent() {
        let selector =
            Selector::parse(r#"[{"key": "zone", "operator": "NotIn", "values": ["zone-a"]}]"#)
                .unwrap();
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn existence_operators_ignore_values() {
        let exists = Selector::parse(r#"[{"key": "gpu", "operator": "Exists"}]"#).unwrap();
        assert!(exists.matches(&labels(&[("gpu", "a100")])));
        assert!(!exists.matches(&labels(&[])));

        let absent = Selector::parse(r#"[{"key": "gpu", "operator": "DoesNotExist"}]"#).unwrap();
        assert!(!absent.matches(&labels(&[("gpu", "a100")])));
        assert!(absent.matches(&labels(&[])));
    }

    #[test]
    fn numeric_comparisons() {
        let gt =
            Selector::parse(r#"[{"key": "cores", "operator": "Gt", "values": ["8"]}]"#).unwrap();
        assert!(gt.matches(&labels(&[("cores", "16")])));
        assert!(!gt.matches(&labels(&[("cores", "8")])));
        assert!(!gt.matches(&labels(&[("cores", "four")])));
        assert!(!gt.matches(&labels(&[])));

        let lt =
            Selector::parse(r#"[{"key": "cores", "operator": "Lt", "values": ["8"]}]"#).unwrap();
        assert!(lt.matches(&labels(&[("cores", "4")])));
        assert!(!lt.matches(&labels(&[("cores", "8")])));
    }

    #[test]
    fn comparison_without_a_bound_matches_nothing() {
        let selector = Selector::parse(r#"[{"key": "cores", "operator": "Gt"}]"#).unwrap();
        assert!(!selector.matches(&labels(&[("cores", "16")])));
    }

    #[test]
    fn unrecognized_operators_parse_but_never_match() {
        let selector =
            Selector::parse(r#"[{"key": "zone", "operator": "Near", "values": ["zone-a"]}]"#)
                .unwrap();
        assert!(!selector.matches(&labels(&[("zone", "zone-a")])));
    }
}

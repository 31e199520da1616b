//! Parsing and matching of taint-removal rules.
//!
//! The configuration grammar is a comma-separated list of rules, each of the
//! form `key`, `key:Effect`, or `key=value:Effect`. A rule's value and effect
//! are independently optional; an absent part matches any taint part, while a
//! present-but-empty value only matches an empty taint value.

use crate::k8s::Taint;
use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    key: String,
    value: Option<String>,
    effect: Option<Effect>,
}

/// Strips matching taints from nodes. Built from the `--remove-taints` flag;
/// an empty flag disables the feature entirely (`parse` returns `Ok(None)`).
#[derive(Clone, Debug)]
pub struct TaintRemover {
    rules: Vec<Rule>,
}

// === impl Effect ===

impl FromStr for Effect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoSchedule" => Ok(Self::NoSchedule),
            "PreferNoSchedule" => Ok(Self::PreferNoSchedule),
            "NoExecute" => Ok(Self::NoExecute),
            s => Err(anyhow!("invalid taint effect: {}", s)),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSchedule => "NoSchedule".fmt(f),
            Self::PreferNoSchedule => "PreferNoSchedule".fmt(f),
            Self::NoExecute => "NoExecute".fmt(f),
        }
    }
}

// === impl Rule ===

impl Rule {
    fn matches(&self, taint: &Taint) -> bool {
        if self.key != taint.key {
            return false;
        }
        if let Some(value) = &self.value {
            if value != taint.value.as_deref().unwrap_or("") {
                return false;
            }
        }
        if let Some(effect) = &self.effect {
            if effect.to_string() != taint.effect {
                return false;
            }
        }
        true
    }
}

impl FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((left, suffix)) = s.rsplit_once(':') {
            if let Ok(effect) = suffix.parse::<Effect>() {
                let (key, value) = match left.split_once('=') {
                    Some((key, value)) => (key, Some(value.to_string())),
                    None => (left, None),
                };
                if key.is_empty() {
                    bail!("invalid taint rule {:?}: empty key", s);
                }
                return Ok(Self {
                    key: key.to_string(),
                    value,
                    effect: Some(effect),
                });
            }
            // The suffix is not an effect literal, so the whole element is
            // the key, colon included.
            return Ok(Self {
                key: s.to_string(),
                value: None,
                effect: None,
            });
        }

        let (key, value) = match s.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (s, None),
        };
        if key.is_empty() {
            bail!("invalid taint rule {:?}: empty key", s);
        }
        Ok(Self {
            key: key.to_string(),
            value,
            effect: None,
        })
    }
}

// === impl TaintRemover ===

impl TaintRemover {
    /// Parses the comma-separated rule list. Whitespace-only input (or input
    /// that reduces to zero rules) disables taint removal.
    pub fn parse(config: &str) -> Result<Option<Self>> {
        let mut rules = Vec::new();
        for part in config.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            rules.push(part.parse::<Rule>()?);
        }

        if rules.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { rules }))
    }

    pub fn should_remove(&self, taint: &Taint) -> bool {
        self.rules.iter().any(|rule| rule.matches(taint))
    }

    /// The node's taints matched by any rule, in their original order.
    pub fn taints_to_remove(&self, node: &crate::k8s::Node) -> Vec<Taint> {
        node.spec
            .as_ref()
            .and_then(|spec| spec.taints.as_ref())
            .map(|taints| {
                taints
                    .iter()
                    .filter(|taint| self.should_remove(taint))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The taints of `taints` not present in `remove`, preserving order.
/// Membership is decided by the full `key=value:Effect` identity.
pub fn filter_out(taints: &[Taint], remove: &[Taint]) -> Vec<Taint> {
    let remove = remove.iter().map(taint_id).collect::<Vec<_>>();
    taints
        .iter()
        .filter(|taint| !remove.contains(&taint_id(taint)))
        .cloned()
        .collect()
}

/// `key=value:Effect` identities for a set of taints, mostly for logging.
pub fn taint_ids(taints: &[Taint]) -> Vec<String> {
    taints.iter().map(taint_id).collect()
}

fn taint_id(taint: &Taint) -> String {
    format!(
        "{}={}:{}",
        taint.key,
        taint.value.as_deref().unwrap_or(""),
        taint.effect
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: Option<&str>, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.map(String::from),
            effect: effect.to_string(),
            ..Taint::default()
        }
    }

    #[test]
    fn empty_config_disables_removal() {
        assert!(TaintRemover::parse("").unwrap().is_none());
        assert!(TaintRemover::parse("   ").unwrap().is_none());
        assert!(TaintRemover::parse(" , ,").unwrap().is_none());
    }

    #[test]
    fn rule_forms_match_as_configured() {
        let remover = TaintRemover::parse("k1,k2:NoSchedule,k3=v:NoExecute")
            .unwrap()
            .unwrap();

        // Bare key matches any value and effect.
        assert!(remover.should_remove(&taint("k1", None, "NoExecute")));
        assert!(remover.should_remove(&taint("k1", Some("anything"), "NoSchedule")));

        // Key plus effect requires the effect to line up.
        assert!(remover.should_remove(&taint("k2", None, "NoSchedule")));
        assert!(!remover.should_remove(&taint("k2", None, "NoExecute")));

        // Full triple requires an exact value.
        assert!(remover.should_remove(&taint("k3", Some("v"), "NoExecute")));
        assert!(!remover.should_remove(&taint("k3", Some("wrong"), "NoExecute")));

        // Unrelated keys are untouched.
        assert!(!remover.should_remove(&taint("other", None, "NoSchedule")));
    }

    #[test]
    fn invalid_effect_suffix_folds_into_the_key() {
        let rule = "node.example.com/flag:bogus".parse::<Rule>().unwrap();
        assert_eq!(
            rule,
            Rule {
                key: "node.example.com/flag:bogus".to_string(),
                value: None,
                effect: None,
            }
        );
    }

    #[test]
    fn empty_value_is_distinct_from_absent() {
        let remover = TaintRemover::parse("k=:NoSchedule").unwrap().unwrap();
        assert!(remover.should_remove(&taint("k", None, "NoSchedule")));
        assert!(remover.should_remove(&taint("k", Some(""), "NoSchedule")));
        assert!(!remover.should_remove(&taint("k", Some("v"), "NoSchedule")));
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(TaintRemover::parse(":NoSchedule").is_err());
        assert!(TaintRemover::parse("=v:NoSchedule").is_err());
    }

    #[test]
    fn removal_preserves_taint_order() {
        let taints = vec![
            taint("a", None, "NoSchedule"),
            taint("b", Some("v"), "NoExecute"),
            taint("c", None, "PreferNoSchedule"),
        ];
        let remove = vec![taint("b", Some("v"), "NoExecute")];

        let kept = filter_out(&taints, &remove);
        assert_eq!(kept, vec![taints[0].clone(), taints[2].clone()]);

        // A near-miss identity (different value) is not filtered.
        let near_miss = vec![taint("b", Some("w"), "NoExecute")];
        assert_eq!(filter_out(&taints, &near_miss), taints);

        assert_eq!(filter_out(&taints, &[]), taints);
    }

    #[test]
    fn ids_join_the_full_triple() {
        assert_eq!(
            taint_ids(&[taint("k", Some("v"), "NoExecute"), taint("b", None, "NoSchedule")]),
            vec!["k=v:NoExecute".to_string(), "b=:NoSchedule".to_string()]
        );
    }
}

//! The forwarding-rule predicate: a tagged expression
//! structure over a small, enumerated instance-metadata projection, rather
//! than embedded source code or a dynamic plugin.

use serde::{Deserialize, Serialize};

/// The instance-metadata projection a [`ForwardingRule`] is evaluated
/// against. Deliberately small: modality, SOP class, the AE that
/// originated the association, and an operator-supplied label set.
#[derive(Debug, Clone, Default)]
pub struct InstanceMetadata<'a> {
    pub modality: Option<&'a str>,
    pub sop_class_uid: &'a str,
    pub called_ae: &'a str,
    pub labels: &'a [String],
}

/// A destination's forwarding rule, stored as `jsonb` in the `destinations`
/// table. `None` (absent) on any field means "no constraint on this
/// dimension"; a present list means "one of these".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingRule {
    pub modality: Option<Vec<String>>,
    pub sop_class_uid: Option<Vec<String>>,
    pub called_ae: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
}

impl ForwardingRule {
    /// True if every present constraint is satisfied by `metadata`.
    pub fn matches(&self, metadata: &InstanceMetadata) -> bool {
        let modality_ok = match (&self.modality, metadata.modality) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(allowed), Some(m)) => allowed.iter().any(|a| a == m),
        };
        let sop_class_ok = self
            .sop_class_uid
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|a| a == metadata.sop_class_uid));
        let called_ae_ok = self
            .called_ae
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|a| a == metadata.called_ae));
        let labels_ok = self.labels.as_ref().is_none_or(|required| {
            required.iter().all(|r| metadata.labels.contains(r))
        });

        modality_ok && sop_class_ok && called_ae_ok && labels_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta<'a>(modality: Option<&'a str>, sop_class_uid: &'a str) -> InstanceMetadata<'a> {
        InstanceMetadata {
            modality,
            sop_class_uid,
            called_ae: "MODALITY1",
            labels: &[],
        }
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rule = ForwardingRule::default();
        assert!(rule.matches(&meta(Some("CT"), "1.2.840.10008.5.1.4.1.1.2")));
        assert!(rule.matches(&meta(None, "")));
    }

    #[test]
    fn modality_constraint_filters() {
        let rule = ForwardingRule {
            modality: Some(vec!["CT".into(), "MR".into()]),
            ..Default::default()
        };
        assert!(rule.matches(&meta(Some("CT"), "x")));
        assert!(!rule.matches(&meta(Some("US"), "x")));
        assert!(!rule.matches(&meta(None, "x")));
    }

    #[test]
    fn labels_require_all_present() {
        let rule = ForwardingRule {
            labels: Some(vec!["research".into()]),
            ..Default::default()
        };
        let with_label = InstanceMetadata {
            modality: None,
            sop_class_uid: "x",
            called_ae: "A",
            labels: &["research".to_string(), "extra".to_string()],
        };
        let without_label = InstanceMetadata {
            labels: &[],
            ..with_label.clone()
        };
        assert!(rule.matches(&with_label));
        assert!(!rule.matches(&without_label));
    }
}

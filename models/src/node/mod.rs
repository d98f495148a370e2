mod client;
mod conditions;
pub mod drain;
pub mod error;

pub use self::client::*;
pub use self::conditions::{summarize_conditions, ConditionSummary};
pub use self::error::Error as NodeError;

#[cfg(feature = "mockall")]
pub use self::client::MockNodeClient;

use k8s_openapi::api::core::v1::Node;

use crate::constants;

/// Whether the node is currently marked unschedulable.
pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Whether the node carries the mechanic cordon-ownership label.
pub fn has_cordon_label(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|labels| {
            labels
                .get(constants::CORDONED_LABEL)
                .map(String::as_str)
                == Some(constants::CORDONED_LABEL_VALUE)
        })
        .unwrap_or(false)
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;

    #[test]
    fn unschedulable_defaults_to_false() {
        assert!(!is_unschedulable(&Node::default()));

        let mut node = Node::default();
        node.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        assert!(is_unschedulable(&node));
    }

    #[test]
    fn cordon_label_must_carry_the_expected_value() {
        let mut node = Node::default();
        assert!(!has_cordon_label(&node));

        node.metadata.labels = Some(
            [(constants::CORDONED_LABEL.to_string(), "false".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!has_cordon_label(&node));

        node.metadata.labels = Some(
            [(
                constants::CORDONED_LABEL.to_string(),
                constants::CORDONED_LABEL_VALUE.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        assert!(has_cordon_label(&node));
    }
}

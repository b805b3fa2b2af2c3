//! Built-in device support flow.
//!
//! Three steps: confirm warranty, classify the issue, resolve it. The
//! resolution step can send the customer back to either earlier step when
//! they correct themselves.

use stepwise_core::config::{ActionConfig, ActionKindConfig, FlowConfig, StepConfig};
use stepwise_core::error::Result;
use stepwise_core::types::TerminalKind;

use crate::registry::StepRegistry;

pub const WARRANTY_COLLECTOR: &str = "warranty_collector";
pub const ISSUE_CLASSIFIER: &str = "issue_classifier";
pub const RESOLUTION_SPECIALIST: &str = "resolution_specialist";

const WARRANTY_COLLECTOR_PROMPT: &str = "You are a customer support agent helping with device issues.

CURRENT STAGE: Warranty verification

In this stage:
1. Greet the customer warmly
2. Ask whether their device is still under warranty
3. Call record_warranty_status with their answer to move on

Keep it conversational and ask one question at a time.";

const ISSUE_CLASSIFIER_PROMPT: &str = "You are a customer support agent helping with device issues.

CURRENT STAGE: Issue classification
CUSTOMER INFO: Warranty status is {warranty_status}

In this stage:
1. Ask the customer to describe the problem
2. Decide whether it is a hardware issue (physical damage, broken parts) or a software issue (app crashes, slowness)
3. Call record_issue_type with the classification to move on

Ask clarifying questions first if the problem is unclear.";

const RESOLUTION_SPECIALIST_PROMPT: &str = "You are a customer support agent helping with device issues.

CURRENT STAGE: Resolution
CUSTOMER INFO: Warranty status is {warranty_status}, issue type is {issue_type}

In this stage:
1. SOFTWARE issues: walk through troubleshooting steps with provide_solution
2. HARDWARE issues:
   - IN WARRANTY: explain the warranty repair process with provide_solution
   - OUT OF WARRANTY: use escalate_to_human for paid repair options

If the customer says earlier information was wrong, use:
- go_back_to_warranty to correct the warranty status
- go_back_to_classification to correct the issue type

Be specific and helpful.";

fn action(name: &str, kind: ActionKindConfig, description: &str, param: &str) -> ActionConfig {
    ActionConfig {
        name: name.to_string(),
        kind,
        description: description.to_string(),
        param: Some(param.to_string()),
        fact: None,
        values: Vec::new(),
        target: None,
        outcome: None,
    }
}

/// The support flow as configuration, e.g. for `stepwise config` output.
pub fn flow_config() -> FlowConfig {
    let record_warranty = ActionConfig {
        fact: Some("warranty_status".into()),
        values: vec!["in_warranty".into(), "out_of_warranty".into()],
        ..action(
            "record_warranty_status",
            ActionKindConfig::Record,
            "Record the customer's warranty status and move to issue classification.",
            "status",
        )
    };
    let record_issue = ActionConfig {
        fact: Some("issue_type".into()),
        values: vec!["hardware".into(), "software".into()],
        ..action(
            "record_issue_type",
            ActionKindConfig::Record,
            "Record the type of issue and move to resolution.",
            "issue_type",
        )
    };
    let provide_solution = ActionConfig {
        outcome: Some(TerminalKind::Resolved),
        ..action(
            "provide_solution",
            ActionKindConfig::Terminal,
            "Provide a solution to the customer's issue.",
            "solution",
        )
    };
    let escalate = ActionConfig {
        outcome: Some(TerminalKind::Escalate),
        ..action(
            "escalate_to_human",
            ActionKindConfig::Terminal,
            "Escalate the case to a human support specialist.",
            "reason",
        )
    };
    let back_to_warranty = ActionConfig {
        target: Some(WARRANTY_COLLECTOR.into()),
        ..action(
            "go_back_to_warranty",
            ActionKindConfig::Revert,
            "Go back to the warranty verification step.",
            "reason",
        )
    };
    let back_to_classification = ActionConfig {
        target: Some(ISSUE_CLASSIFIER.into()),
        ..action(
            "go_back_to_classification",
            ActionKindConfig::Revert,
            "Go back to the issue classification step.",
            "reason",
        )
    };

    FlowConfig {
        initial: WARRANTY_COLLECTOR.into(),
        steps: vec![
            StepConfig {
                name: WARRANTY_COLLECTOR.into(),
                prompt: WARRANTY_COLLECTOR_PROMPT.into(),
                requires: vec![],
                next: Some(ISSUE_CLASSIFIER.into()),
                actions: vec![record_warranty],
            },
            StepConfig {
                name: ISSUE_CLASSIFIER.into(),
                prompt: ISSUE_CLASSIFIER_PROMPT.into(),
                requires: vec!["warranty_status".into()],
                next: Some(RESOLUTION_SPECIALIST.into()),
                actions: vec![record_issue],
            },
            StepConfig {
                name: RESOLUTION_SPECIALIST.into(),
                prompt: RESOLUTION_SPECIALIST_PROMPT.into(),
                requires: vec!["warranty_status".into(), "issue_type".into()],
                next: None,
                actions: vec![
                    provide_solution,
                    escalate,
                    back_to_warranty,
                    back_to_classification,
                ],
            },
        ],
    }
}

/// Build the support flow registry.
pub fn registry() -> Result<StepRegistry> {
    StepRegistry::from_config(&flow_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActionKind;

    #[test]
    fn support_flow_is_valid() {
        let reg = registry().unwrap();
        let names: Vec<_> = reg.steps().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![WARRANTY_COLLECTOR, ISSUE_CLASSIFIER, RESOLUTION_SPECIALIST]
        );
        assert_eq!(reg.step(reg.initial()).name, WARRANTY_COLLECTOR);
    }

    #[test]
    fn resolution_is_terminal_in_the_forward_sense() {
        let reg = registry().unwrap();
        let resolution = reg.step_id(RESOLUTION_SPECIALIST).unwrap();
        assert!(reg.step(resolution).next.is_none());
        assert!(reg
            .actions_for(resolution)
            .all(|a| !matches!(a.kind, ActionKind::Record { .. })));
    }

    #[test]
    fn revert_targets_are_earlier_steps() {
        let reg = registry().unwrap();
        let warranty = reg.step_id(WARRANTY_COLLECTOR).unwrap();
        let classifier = reg.step_id(ISSUE_CLASSIFIER).unwrap();
        assert_eq!(
            reg.action("go_back_to_warranty").unwrap().kind,
            ActionKind::Revert { target: warranty }
        );
        assert_eq!(
            reg.action("go_back_to_classification").unwrap().kind,
            ActionKind::Revert { target: classifier }
        );
    }

    #[test]
    fn record_actions_use_original_parameter_names() {
        let reg = registry().unwrap();
        assert_eq!(reg.action("record_warranty_status").unwrap().param, "status");
        assert_eq!(reg.action("record_issue_type").unwrap().param, "issue_type");
        assert_eq!(reg.action("provide_solution").unwrap().param, "solution");
    }
}

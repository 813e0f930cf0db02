//! The JSON surface a submitting client speaks.

use pretty_assertions::assert_eq;
use serde_json::json;
use trellis_workflow::{ExecutionMode, StepBody, Workflow};

#[test]
fn full_workflow_deserializes_from_api_json() {
    let workflow: Workflow = serde_json::from_value(json!({
        "id": "checkout-flow",
        "name": "Checkout happy path",
        "options": {
            "mode": "functional",
            "continue_on_error": false,
            "default_step_timeout": "30s",
        },
        "variables": {"base_url": "https://shop.example", "user": "ada"},
        "pre_hooks": [{"type": "script", "config": {"script": "1"}}],
        "steps": [
            {
                "id": "login",
                "type": "http",
                "name": "Log in",
                "config": {
                    "method": "POST",
                    "url": "${base_url}/login",
                    "body": {"user": "${user}"},
                },
                "retry": {
                    "max_attempts": 3,
                    "backoff": {"strategy": "fixed", "delay": "500ms"},
                },
                "post_processors": [
                    {
                        "type": "extract_param",
                        "config": {"name": "token", "source": "json", "expression": "token"},
                    },
                    {
                        "type": "assertion",
                        "config": {"operator": "eq", "expected": 200},
                    },
                ],
            },
            {
                "id": "browse",
                "condition": "${token} != ''",
                "parallel": {
                    "steps": [
                        {"id": "list_items", "type": "http", "config": {"url": "${base_url}/items"}},
                        {"id": "profile", "type": "http", "config": {"url": "${base_url}/me"}},
                    ],
                    "max_parallel": 2,
                    "fail_fast": true,
                },
            },
            {
                "id": "buy_each",
                "loop": {
                    "over": "${cart}",
                    "while": null,
                    "steps": [
                        {"id": "buy", "type": "http", "config": {"url": "${base_url}/buy"}},
                    ],
                    "break_on_error": true,
                },
            },
        ],
    }))
    .unwrap();

    workflow.validate().unwrap();
    assert_eq!(workflow.options.mode, ExecutionMode::Functional);
    assert_eq!(workflow.steps.len(), 3);
    assert_eq!(workflow.total_leaves(), 4);

    assert!(matches!(workflow.steps[0].body(), StepBody::Leaf));
    assert!(matches!(workflow.steps[1].body(), StepBody::Parallel(_)));
    match workflow.steps[2].body() {
        StepBody::Loop(spec) => {
            assert!(spec.break_on_error);
            assert!(spec.over.is_some());
            assert!(spec.while_cond.is_none());
        }
        other => panic!("expected a loop body, got {other:?}"),
    }

    // The model round-trips without losing the wire field names.
    let round_tripped = serde_json::to_value(&workflow).unwrap();
    assert_eq!(round_tripped["steps"][2]["loop"]["break_on_error"], json!(true));
    assert_eq!(round_tripped["steps"][0]["type"], json!("http"));
}

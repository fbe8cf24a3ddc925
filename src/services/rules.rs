use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ValidationDetail;
use crate::schemas::{RuleDef, RuleKind, UserContext, WriteAction};
use crate::services::expression;

/// Run an entity's rules against the in-memory record. Tiers run in order —
/// field rules, expression rules, computed fields — and a failing rule with
/// `stop_on_fail` halts the remainder of its own tier only. Computed fields
/// run only when no errors have accrued (including `carried_errors` from
/// static validation) and mutate the record in place.
pub fn run_rules(
    rules: &[Arc<RuleDef>],
    record: &mut Map<String, Value>,
    old: Option<&Value>,
    action: WriteAction,
    user: &UserContext,
    carried_errors: usize,
) -> Vec<ValidationDetail> {
    let mut errors: Vec<ValidationDetail> = Vec::new();

    // Tier 1: field rules
    for rule in rules {
        let RuleKind::Field { .. } = rule.kind else {
            continue;
        };
        if let Some(detail) = check_field_rule(rule, record) {
            errors.push(detail);
            if rule.stop_on_fail {
                break;
            }
        }
    }

    // Tier 2: expression rules
    let ctx = expression::write_context(record, old, action, user);
    for rule in rules {
        let RuleKind::Expression {
            expression,
            field,
            message,
        } = &rule.kind
        else {
            continue;
        };
        let fired = match expression::eval_bool(expression, &ctx) {
            Ok(result) => result,
            Err(error) => {
                errors.push(ValidationDetail::new(
                    field.clone().unwrap_or_default(),
                    "expression",
                    format!("Rule expression failed: {error}"),
                ));
                if rule.stop_on_fail {
                    break;
                }
                continue;
            }
        };
        if fired {
            errors.push(ValidationDetail::new(
                field.clone().unwrap_or_default(),
                "expression",
                message
                    .clone()
                    .unwrap_or_else(|| "Rule violated.".to_string()),
            ));
            if rule.stop_on_fail {
                break;
            }
        }
    }

    // Tier 3: computed fields, only on a clean record
    if errors.is_empty() && carried_errors == 0 {
        for rule in rules {
            let RuleKind::Computed { field, expression: source } = &rule.kind else {
                continue;
            };
            let ctx = expression::write_context(record, old, action, user);
            match expression::eval_value(source, &ctx) {
                Ok(value) => {
                    record.insert(field.clone(), value);
                }
                Err(error) => {
                    errors.push(ValidationDetail::new(
                        field.clone(),
                        "computed",
                        format!("Computed field failed: {error}"),
                    ));
                }
            }
        }
    }

    errors
}

fn check_field_rule(rule: &RuleDef, record: &Map<String, Value>) -> Option<ValidationDetail> {
    let RuleKind::Field {
        field,
        min,
        max,
        min_length,
        max_length,
        pattern,
        message,
    } = &rule.kind
    else {
        return None;
    };

    let value = record.get(field.as_str());
    // Null values skip validation; `required` is static validation's job.
    let value = match value {
        None | Some(Value::Null) => return None,
        Some(value) => value,
    };

    let fail = |rule_name: &str, default: String| {
        Some(ValidationDetail::new(
            field.clone(),
            rule_name,
            message.clone().unwrap_or(default),
        ))
    };

    if min.is_some() || max.is_some() {
        let number = match numeric(value) {
            Some(number) => number,
            None => {
                return fail("min", format!("'{field}' must be a number."));
            }
        };
        if let Some(min) = min {
            if number < *min {
                return fail("min", format!("'{field}' must be at least {min}."));
            }
        }
        if let Some(max) = max {
            if number > *max {
                return fail("max", format!("'{field}' must be at most {max}."));
            }
        }
    }

    if min_length.is_some() || max_length.is_some() || pattern.is_some() {
        let text = match value.as_str() {
            Some(text) => text,
            None => return fail("pattern", format!("'{field}' must be a string.")),
        };
        if let Some(min_length) = min_length {
            if text.chars().count() < *min_length {
                return fail(
                    "min_length",
                    format!("'{field}' must be at least {min_length} characters."),
                );
            }
        }
        if let Some(max_length) = max_length {
            if text.chars().count() > *max_length {
                return fail(
                    "max_length",
                    format!("'{field}' must be at most {max_length} characters."),
                );
            }
        }
        if let Some(pattern) = pattern {
            match Regex::new(pattern) {
                Ok(regex) => {
                    if !regex.is_match(text) {
                        return fail("pattern", format!("'{field}' has an invalid format."));
                    }
                }
                // A broken pattern is the rule's own failure, surfaced on the field.
                Err(error) => {
                    return Some(ValidationDetail::new(
                        field.clone(),
                        "pattern",
                        format!("Rule pattern is invalid: {error}"),
                    ));
                }
            }
        }
    }

    None
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: vec!["editor".into()],
        }
    }

    fn rule(value: Value) -> Arc<RuleDef> {
        Arc::new(serde_json::from_value(value).unwrap())
    }

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn field_rule_bounds_and_null_skip() {
        let rules = vec![rule(json!({
            "id": 1, "entity": "order", "hook": "before_write",
            "type": "field", "field": "qty", "min": 1.0, "max": 10.0
        }))];

        let mut ok = record(json!({"qty": 5}));
        assert!(run_rules(&rules, &mut ok, None, WriteAction::Create, &user(), 0).is_empty());

        let mut low = record(json!({"qty": 0}));
        let errors = run_rules(&rules, &mut low, None, WriteAction::Create, &user(), 0);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule, "min");

        // numeric strings coerce
        let mut coerced = record(json!({"qty": "7"}));
        assert!(run_rules(&rules, &mut coerced, None, WriteAction::Create, &user(), 0).is_empty());

        // nulls skip
        let mut absent = record(json!({"other": 1}));
        assert!(run_rules(&rules, &mut absent, None, WriteAction::Create, &user(), 0).is_empty());
    }

    #[test]
    fn pattern_rule_and_invalid_regex() {
        let rules = vec![rule(json!({
            "id": 1, "entity": "person", "hook": "before_write",
            "type": "field", "field": "email", "pattern": "^[a-z]+@example\\.test$"
        }))];
        let mut bad = record(json!({"email": "nope"}));
        let errors = run_rules(&rules, &mut bad, None, WriteAction::Create, &user(), 0);
        assert_eq!(errors[0].rule, "pattern");

        let rules = vec![rule(json!({
            "id": 1, "entity": "person", "hook": "before_write",
            "type": "field", "field": "email", "pattern": "(unclosed"
        }))];
        let mut any = record(json!({"email": "x"}));
        let errors = run_rules(&rules, &mut any, None, WriteAction::Create, &user(), 0);
        assert!(errors[0].message.contains("pattern is invalid"));
    }

    #[test]
    fn expression_rule_true_is_violation() {
        let rules = vec![rule(json!({
            "id": 1, "entity": "order", "hook": "before_write",
            "type": "expression", "expression": "record.total < 0",
            "field": "total", "message": "Total cannot be negative."
        }))];
        let mut bad = record(json!({"total": -5}));
        let errors = run_rules(&rules, &mut bad, None, WriteAction::Create, &user(), 0);
        assert_eq!(errors[0].message, "Total cannot be negative.");

        let mut ok = record(json!({"total": 5}));
        assert!(run_rules(&rules, &mut ok, None, WriteAction::Create, &user(), 0).is_empty());
    }

    #[test]
    fn stop_on_fail_halts_only_its_tier() {
        let rules = vec![
            rule(json!({
                "id": 1, "entity": "order", "hook": "before_write",
                "type": "field", "field": "qty", "min": 1.0, "stop_on_fail": true
            })),
            rule(json!({
                "id": 2, "entity": "order", "hook": "before_write",
                "type": "field", "field": "name", "min_length": 3
            })),
            rule(json!({
                "id": 3, "entity": "order", "hook": "before_write",
                "type": "expression", "expression": "record.total < 0", "field": "total"
            })),
        ];
        let mut bad = record(json!({"qty": 0, "name": "x", "total": -1}));
        let errors = run_rules(&rules, &mut bad, None, WriteAction::Create, &user(), 0);
        // field tier stopped after rule 1; expression tier still ran
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].rule, "min");
        assert_eq!(errors[1].rule, "expression");
    }

    #[test]
    fn computed_field_overrides_caller_value() {
        let rules = vec![rule(json!({
            "id": 1, "entity": "person", "hook": "before_write",
            "type": "computed", "field": "full_name",
            "expression": "record.first + \" \" + record.last"
        }))];
        let mut body = record(json!({
            "first": "Ada", "last": "Lovelace", "full_name": "IGNORED"
        }));
        let errors = run_rules(&rules, &mut body, None, WriteAction::Create, &user(), 0);
        assert!(errors.is_empty());
        assert_eq!(body["full_name"], json!("Ada Lovelace"));
    }

    #[test]
    fn computed_skipped_when_errors_accrued() {
        let rules = vec![
            rule(json!({
                "id": 1, "entity": "order", "hook": "before_write",
                "type": "field", "field": "qty", "min": 1.0
            })),
            rule(json!({
                "id": 2, "entity": "order", "hook": "before_write",
                "type": "computed", "field": "doubled", "expression": "record.qty * 2"
            })),
        ];
        let mut bad = record(json!({"qty": 0}));
        run_rules(&rules, &mut bad, None, WriteAction::Create, &user(), 0);
        assert!(!bad.contains_key("doubled"));

        // carried static errors also suppress computed fields
        let mut ok = record(json!({"qty": 2}));
        run_rules(&rules, &mut ok, None, WriteAction::Create, &user(), 1);
        assert!(!ok.contains_key("doubled"));

        let mut clean = record(json!({"qty": 2}));
        run_rules(&rules, &mut clean, None, WriteAction::Create, &user(), 0);
        assert_eq!(clean["doubled"], json!(4));
    }
}

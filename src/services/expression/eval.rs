use regex::Regex;
use serde_json::{json, Value};

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

pub type EvalResult = Result<Value, String>;

/// Truthiness for boolean contexts: null and empty containers are false,
/// numbers are false only at zero.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn eval(expr: &Expr, ctx: &Value) -> EvalResult {
    match expr {
        Expr::Literal(literal) => Ok(literal_value(literal)),
        Expr::Path(segments) => Ok(resolve_path(segments, ctx)),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, ctx)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match as_number(&value) {
                    Some(number) => Ok(number_value(-number)),
                    None => Err(format!("Cannot negate {}", type_name(&value))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        Expr::Call { name, args } => eval_call(name, args, ctx),
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(flag) => Value::Bool(*flag),
        Literal::Int(number) => json!(number),
        Literal::Float(number) => json!(number),
        Literal::Str(text) => Value::String(text.clone()),
    }
}

fn resolve_path(segments: &[String], ctx: &Value) -> Value {
    let mut current = ctx;
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, ctx: &Value) -> EvalResult {
    // Logical operators short-circuit.
    match op {
        BinaryOp::And => {
            let lhs = eval(left, ctx)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            let rhs = eval(right, ctx)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        BinaryOp::Or => {
            let lhs = eval(left, ctx)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            let rhs = eval(right, ctx)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        _ => {}
    }

    let lhs = eval(left, ctx)?;
    let rhs = eval(right, ctx)?;

    match op {
        BinaryOp::Add => match (as_number(&lhs), as_number(&rhs)) {
            (Some(a), Some(b)) => Ok(number_value(a + b)),
            _ => {
                if lhs.is_string() || rhs.is_string() {
                    Ok(Value::String(format!(
                        "{}{}",
                        stringify(&lhs),
                        stringify(&rhs)
                    )))
                } else {
                    Err(format!(
                        "Cannot add {} and {}",
                        type_name(&lhs),
                        type_name(&rhs)
                    ))
                }
            }
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = match (as_number(&lhs), as_number(&rhs)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(format!(
                        "Arithmetic needs numbers, got {} and {}",
                        type_name(&lhs),
                        type_name(&rhs)
                    ))
                }
            };
            match op {
                BinaryOp::Sub => Ok(number_value(a - b)),
                BinaryOp::Mul => Ok(number_value(a * b)),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Err("Division by zero".to_string())
                    } else {
                        Ok(number_value(a / b))
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        Err("Division by zero".to_string())
                    } else {
                        Ok(number_value(a % b))
                    }
                }
                _ => unreachable!(),
            }
        }
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinaryOp::In => match &rhs {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| loose_eq(item, &lhs)))),
            Value::String(haystack) => match &lhs {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                other => Err(format!("Cannot test {} in string", type_name(other))),
            },
            other => Err(format!("`in` needs a list, got {}", type_name(other))),
        },
        BinaryOp::Matches => {
            let text = match &lhs {
                Value::String(text) => text.as_str(),
                Value::Null => return Ok(Value::Bool(false)),
                other => return Err(format!("`matches` needs a string, got {}", type_name(other))),
            };
            let pattern = match &rhs {
                Value::String(pattern) => pattern,
                other => {
                    return Err(format!(
                        "`matches` needs a pattern string, got {}",
                        type_name(other)
                    ))
                }
            };
            let regex =
                Regex::new(pattern).map_err(|error| format!("Invalid pattern: {error}"))?;
            Ok(Value::Bool(regex.is_match(text)))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &Value) -> EvalResult {
    match name {
        "len" => {
            let value = single_arg("len", args, ctx)?;
            let length = match &value {
                Value::String(text) => text.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(format!("len() cannot measure {}", type_name(other))),
            };
            Ok(json!(length))
        }
        // sum(list) adds numeric items; sum(list, expr) evaluates expr per
        // item with the element bound as `item`.
        "sum" => {
            if args.is_empty() || args.len() > 2 {
                return Err("sum() takes 1 or 2 arguments".to_string());
            }
            let list = eval(&args[0], ctx)?;
            let items = match list {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => return Err(format!("sum() needs a list, got {}", type_name(&other))),
            };
            let mut total = 0.0;
            for item in items {
                let term = if args.len() == 2 {
                    let scoped = scope_with_item(ctx, item);
                    eval(&args[1], &scoped)?
                } else {
                    item
                };
                match as_number(&term) {
                    Some(number) => total += number,
                    None => {
                        return Err(format!("sum() over non-number {}", type_name(&term)));
                    }
                }
            }
            Ok(number_value(total))
        }
        "lower" => {
            let value = single_arg("lower", args, ctx)?;
            Ok(Value::String(stringify(&value).to_lowercase()))
        }
        "upper" => {
            let value = single_arg("upper", args, ctx)?;
            Ok(Value::String(stringify(&value).to_uppercase()))
        }
        "trim" => {
            let value = single_arg("trim", args, ctx)?;
            Ok(Value::String(stringify(&value).trim().to_string()))
        }
        "abs" => {
            let value = single_arg("abs", args, ctx)?;
            match as_number(&value) {
                Some(number) => Ok(number_value(number.abs())),
                None => Err(format!("abs() needs a number, got {}", type_name(&value))),
            }
        }
        "round" => {
            let value = single_arg("round", args, ctx)?;
            match as_number(&value) {
                Some(number) => Ok(json!(number.round() as i64)),
                None => Err(format!("round() needs a number, got {}", type_name(&value))),
            }
        }
        "coalesce" => {
            for arg in args {
                let value = eval(arg, ctx)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        other => Err(format!("Unknown function '{other}'")),
    }
}

fn single_arg(name: &str, args: &[Expr], ctx: &Value) -> EvalResult {
    if args.len() != 1 {
        return Err(format!("{name}() takes exactly 1 argument"));
    }
    eval(&args[0], ctx)
}

fn scope_with_item(ctx: &Value, item: Value) -> Value {
    let mut scoped = ctx.as_object().cloned().unwrap_or_default();
    scoped.insert("item".to_string(), item);
    Value::Object(scoped)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        json!(number as i64)
    } else {
        json!(number)
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (numeric_only(left), numeric_only(right)) {
        return a == b;
    }
    left == right
}

fn numeric_only(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| "Numbers are not comparable".to_string());
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!(
            "Cannot compare {} with {}",
            type_name(left),
            type_name(right)
        )),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;

    fn ctx() -> Value {
        json!({
            "record": {
                "total": 120,
                "status": "open",
                "email": "ada@example.test",
                "tags": ["red", "green"],
                "items": [{"qty": 2, "price": 10}, {"qty": 1, "price": 5}],
                "first": "Ada",
                "last": "Lovelace",
                "discount": null
            },
            "old": {"status": "draft"},
            "action": "update",
            "user": {"id": "u1", "roles": ["editor"]}
        })
    }

    fn eval_str(source: &str) -> Value {
        eval(&parse(source).unwrap(), &ctx()).unwrap()
    }

    #[test]
    fn field_access_and_comparison() {
        assert_eq!(eval_str("record.total > 100"), json!(true));
        assert_eq!(eval_str("old.status == \"draft\""), json!(true));
        assert_eq!(eval_str("record.missing == null"), json!(true));
        assert_eq!(eval_str("record.discount == null"), json!(true));
    }

    #[test]
    fn arithmetic_and_concat() {
        assert_eq!(eval_str("record.total * 2 + 10"), json!(250));
        assert_eq!(
            eval_str("record.first + \" \" + record.last"),
            json!("Ada Lovelace")
        );
    }

    #[test]
    fn membership_and_regex() {
        assert_eq!(eval_str("\"red\" in record.tags"), json!(true));
        assert_eq!(eval_str("\"blue\" in record.tags"), json!(false));
        assert_eq!(eval_str("record.status in [\"open\", \"held\"]"), json!(true));
        assert_eq!(
            eval_str("record.email matches \"^[a-z]+@example\\\\.test$\""),
            json!(true)
        );
    }

    #[test]
    fn logic_short_circuits_on_missing_fields() {
        assert_eq!(
            eval_str("record.missing != null && record.missing.deep > 1"),
            json!(false)
        );
        assert_eq!(eval_str("action == \"update\" || 1 / 0 > 0"), json!(true));
    }

    #[test]
    fn functions() {
        assert_eq!(eval_str("len(record.tags)"), json!(2));
        assert_eq!(eval_str("len(record.first)"), json!(3));
        assert_eq!(eval_str("sum([1, 2, 3])"), json!(6));
        assert_eq!(
            eval_str("sum(record.items, item.qty * item.price)"),
            json!(25)
        );
        assert_eq!(eval_str("upper(record.status)"), json!("OPEN"));
        assert_eq!(eval_str("coalesce(record.discount, 0)"), json!(0));
    }

    #[test]
    fn numeric_string_coercion_in_comparison() {
        let context = json!({"record": {"total": "15"}});
        let expr = parse("record.total > 10").unwrap();
        assert_eq!(eval(&expr, &context).unwrap(), json!(true));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let expr = parse("1 / 0").unwrap();
        assert!(eval(&expr, &ctx()).is_err());
    }

    #[test]
    fn unknown_function_is_an_error() {
        let expr = parse("shell(\"rm\")").unwrap();
        assert!(eval(&expr, &ctx()).is_err());
    }
}

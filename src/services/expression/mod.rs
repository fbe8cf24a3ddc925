//! Sandboxed expression engine for rules, guards, permissions, workflow
//! conditions and webhook conditions. Expressions see only the context map
//! they are handed (`{record, old, action, user}` on the write path); there
//! is no I/O and no process access. Callers go through [`CompiledExpr`] so
//! the underlying engine stays swappable.

mod ast;
mod eval;
mod parser;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::schemas::{UserContext, WriteAction};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExprError(pub String);

#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: ast::Expr,
}

impl CompiledExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval_value(&self, ctx: &Value) -> Result<Value, ExprError> {
        eval::eval(&self.ast, ctx).map_err(ExprError)
    }

    pub fn eval_bool(&self, ctx: &Value) -> Result<bool, ExprError> {
        let value = self.eval_value(ctx)?;
        Ok(eval::truthy(&value))
    }
}

pub fn compile(source: &str) -> Result<CompiledExpr, ExprError> {
    let ast = parser::parse(source).map_err(ExprError)?;
    Ok(CompiledExpr {
        source: source.to_string(),
        ast,
    })
}

pub fn eval_bool(source: &str, ctx: &Value) -> Result<bool, ExprError> {
    compile(source)?.eval_bool(ctx)
}

pub fn eval_value(source: &str, ctx: &Value) -> Result<Value, ExprError> {
    compile(source)?.eval_value(ctx)
}

/// The write-pipeline evaluation context.
pub fn write_context(
    record: &Map<String, Value>,
    old: Option<&Value>,
    action: WriteAction,
    user: &UserContext,
) -> Value {
    json!({
        "record": Value::Object(record.clone()),
        "old": old.cloned().unwrap_or(Value::Null),
        "action": action.as_str(),
        "user": {
            "id": user.id,
            "email": user.email,
            "roles": user.roles,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_then_eval_many_times() {
        let compiled = compile("record.total > 0").unwrap();
        assert!(compiled
            .eval_bool(&json!({"record": {"total": 5}}))
            .unwrap());
        assert!(!compiled
            .eval_bool(&json!({"record": {"total": 0}}))
            .unwrap());
        assert_eq!(compiled.source(), "record.total > 0");
    }

    #[test]
    fn compile_error_surfaces() {
        assert!(compile("record.total >").is_err());
    }

    #[test]
    fn write_context_shape() {
        let user = UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: vec!["admin".into()],
        };
        let mut record = Map::new();
        record.insert("total".into(), json!(10));
        let ctx = write_context(&record, None, WriteAction::Create, &user);
        assert_eq!(ctx["action"], json!("create"));
        assert_eq!(ctx["old"], Value::Null);
        assert_eq!(ctx["record"]["total"], json!(10));
        assert_eq!(ctx["user"]["roles"][0], json!("admin"));
    }
}

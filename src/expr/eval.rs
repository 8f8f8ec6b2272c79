use serde_json::{Map, Number, Value};

use super::{BinaryOp, Expr, ExprError, Program, UnaryOp};

/// Variable environment for one evaluation. The engine builds a fresh map
/// per call (`record`, `old`, `action`, `user`, ... for rules; `context`
/// for workflow condition steps) and programs resolve dot-paths into it.
pub struct Env<'a> {
    vars: &'a Map<String, Value>,
}

impl<'a> Env<'a> {
    pub fn new(vars: &'a Map<String, Value>) -> Self {
        Self { vars }
    }

    fn resolve(&self, path: &[String]) -> Value {
        let mut current: Option<&Value> = self.vars.get(path[0].as_str());
        for segment in &path[1..] {
            current = match current {
                Some(Value::Object(map)) => map.get(segment.as_str()),
                _ => None,
            };
        }
        current.cloned().unwrap_or(Value::Null)
    }
}

/// `null`, `false`, `0`, `""`, and `[]` are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

impl Program {
    /// Evaluate against a variable environment. Unknown identifiers resolve
    /// to `null`; division or modulo by zero is an error.
    pub fn eval(&self, env: &Env) -> Result<Value, ExprError> {
        eval_expr(self.root(), env)
    }

    /// Evaluate and coerce the result through [`truthy`].
    pub fn eval_truthy(&self, env: &Env) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(env)?))
    }
}

fn eval_expr(expr: &Expr, env: &Env) -> Result<Value, ExprError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(flag) => Ok(Value::Bool(*flag)),
        Expr::Number(n) => Ok(number_value(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, env)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Path(path) => Ok(env.resolve(path)),
        Expr::Unary(op, inner) => {
            let value = eval_expr(inner, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match as_number(&value) {
                    Some(n) => Ok(number_value(-n)),
                    None => Err(ExprError::Eval(format!(
                        "cannot negate {}",
                        type_name(&value)
                    ))),
                },
            }
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, env),
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, env)?);
            }
            call_builtin(name, &values)
        }
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, env: &Env) -> Result<Value, ExprError> {
    // Logical operators short-circuit.
    match op {
        BinaryOp::And => {
            let lhs = eval_expr(left, env)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            let rhs = eval_expr(right, env)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        BinaryOp::Or => {
            let lhs = eval_expr(left, env)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            let rhs = eval_expr(right, env)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        _ => {}
    }

    let lhs = eval_expr(left, env)?;
    let rhs = eval_expr(right, env)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => match &rhs {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| loose_eq(&lhs, item)))),
            Value::String(haystack) => match &lhs {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                other => Err(ExprError::Eval(format!(
                    "'in' on a string requires a string needle, got {}",
                    type_name(other)
                ))),
            },
            other => Err(ExprError::Eval(format!(
                "'in' requires an array or string on the right, got {}",
                type_name(other)
            ))),
        },
        BinaryOp::Add => {
            // String concatenation when either side is a string.
            if let (Value::String(a), b) = (&lhs, &rhs) {
                return Ok(Value::String(format!("{a}{}", stringify(b))));
            }
            if let (a, Value::String(b)) = (&lhs, &rhs) {
                return Ok(Value::String(format!("{}{b}", stringify(a))));
            }
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, &lhs, &rhs),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) else {
        return Err(ExprError::Eval(format!(
            "arithmetic requires numbers, got {} and {}",
            type_name(lhs),
            type_name(rhs)
        )));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            a / b
        }
        BinaryOp::Rem => {
            if b == 0.0 {
                return Err(ExprError::Eval("modulo by zero".to_string()));
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(number_value(result))
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "len" => {
            expect_arity(name, args, 1)?;
            let length = match &args[0] {
                Value::String(text) => text.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => {
                    return Err(ExprError::Eval(format!(
                        "len() expects a string, array, or object, got {}",
                        type_name(other)
                    )))
                }
            };
            Ok(number_value(length as f64))
        }
        "abs" => {
            expect_arity(name, args, 1)?;
            match as_number(&args[0]) {
                Some(n) => Ok(number_value(n.abs())),
                None => Err(ExprError::Eval("abs() expects a number".to_string())),
            }
        }
        "lower" => {
            expect_arity(name, args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.to_lowercase()))
        }
        "upper" => {
            expect_arity(name, args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.to_uppercase()))
        }
        "trim" => {
            expect_arity(name, args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.trim().to_string()))
        }
        "contains" => {
            expect_arity(name, args, 2)?;
            match &args[0] {
                Value::String(haystack) => {
                    Ok(Value::Bool(haystack.contains(string_arg(name, &args[1])?)))
                }
                Value::Array(items) => {
                    Ok(Value::Bool(items.iter().any(|item| loose_eq(item, &args[1]))))
                }
                other => Err(ExprError::Eval(format!(
                    "contains() expects a string or array, got {}",
                    type_name(other)
                ))),
            }
        }
        "startsWith" => {
            expect_arity(name, args, 2)?;
            Ok(Value::Bool(
                string_arg(name, &args[0])?.starts_with(string_arg(name, &args[1])?),
            ))
        }
        "endsWith" => {
            expect_arity(name, args, 2)?;
            Ok(Value::Bool(
                string_arg(name, &args[0])?.ends_with(string_arg(name, &args[1])?),
            ))
        }
        other => Err(ExprError::Eval(format!("unknown function '{other}'"))),
    }
}

fn expect_arity(name: &str, args: &[Value], arity: usize) -> Result<(), ExprError> {
    if args.len() == arity {
        Ok(())
    } else {
        Err(ExprError::Eval(format!(
            "{name}() expects {arity} argument(s), got {}",
            args.len()
        )))
    }
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, ExprError> {
    value.as_str().ok_or_else(|| {
        ExprError::Eval(format!("{name}() expects a string, got {}", type_name(value)))
    })
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).ok_or_else(|| {
            ExprError::Eval("numbers are not comparable".to_string())
        });
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(ExprError::Eval(format!(
        "cannot compare {} with {}",
        type_name(a),
        type_name(b)
    )))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(source: &str, vars: Value) -> Result<Value, ExprError> {
        let map = vars.as_object().cloned().unwrap_or_default();
        Program::compile(source).unwrap().eval(&Env::new(&map))
    }

    #[test]
    fn resolves_dot_paths_and_unknowns() {
        let vars = json!({"record": {"status": "draft", "total": 100}});
        assert_eq!(eval("record.status", vars.clone()).unwrap(), json!("draft"));
        assert_eq!(eval("record.missing", vars.clone()).unwrap(), Value::Null);
        assert_eq!(eval("ghost.path", vars).unwrap(), Value::Null);
    }

    #[test]
    fn truthiness_matches_the_contract() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!([])] {
            assert!(!truthy(&falsy), "{falsy} should be falsy");
        }
        for truthy_value in [json!(true), json!(1), json!("x"), json!([0]), json!({})] {
            assert!(truthy(&truthy_value), "{truthy_value} should be truthy");
        }
    }

    #[test]
    fn comparison_and_membership() {
        let vars = json!({"record": {"status": "sent", "total": 150}});
        assert_eq!(eval("record.total > 100", vars.clone()).unwrap(), json!(true));
        assert_eq!(
            eval("record.status in ['draft', 'sent']", vars.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval("record.status in ['void']", vars.clone()).unwrap(),
            json!(false)
        );
        assert_eq!(eval("'en' in record.status", vars).unwrap(), json!(true));
    }

    #[test]
    fn arithmetic_with_integer_results() {
        assert_eq!(eval("2 + 3 * 4", json!({})).unwrap(), json!(14));
        assert_eq!(eval("10 / 4", json!({})).unwrap(), json!(2.5));
        assert_eq!(eval("10 % 3", json!({})).unwrap(), json!(1));
        assert_eq!(eval("-(2 + 3)", json!({})).unwrap(), json!(-5));
    }

    #[test]
    fn division_by_zero_errors() {
        assert!(eval("1 / 0", json!({})).is_err());
        assert!(eval("1 % 0", json!({})).is_err());
    }

    #[test]
    fn logic_short_circuits_through_truthy() {
        let vars = json!({"record": {"total": 0}});
        assert_eq!(
            eval("record.total && 1 / 0", vars.clone()).unwrap(),
            json!(false)
        );
        assert_eq!(eval("1 or 1 / 0", vars).unwrap(), json!(true));
    }

    #[test]
    fn loose_numeric_equality() {
        assert_eq!(eval("1 == 1.0", json!({})).unwrap(), json!(true));
        assert_eq!(eval("'1' == 1", json!({})).unwrap(), json!(false));
    }

    #[test]
    fn string_concatenation() {
        let vars = json!({"record": {"number": "INV-1"}});
        assert_eq!(
            eval("'ref:' + record.number", vars).unwrap(),
            json!("ref:INV-1")
        );
    }

    #[test]
    fn builtins() {
        let vars = json!({"record": {"name": "  Rocket  ", "tags": ["a", "b"]}});
        assert_eq!(eval("len(record.tags)", vars.clone()).unwrap(), json!(2));
        assert_eq!(eval("len('abc')", vars.clone()).unwrap(), json!(3));
        assert_eq!(eval("abs(-3)", vars.clone()).unwrap(), json!(3));
        assert_eq!(eval("lower('ABC')", vars.clone()).unwrap(), json!("abc"));
        assert_eq!(eval("upper('abc')", vars.clone()).unwrap(), json!("ABC"));
        assert_eq!(eval("trim(record.name)", vars.clone()).unwrap(), json!("Rocket"));
        assert_eq!(
            eval("contains(record.tags, 'a')", vars.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval("startsWith('INV-1', 'INV-')", vars.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(eval("endsWith('INV-1', '-1')", vars).unwrap(), json!(true));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(eval("exec('rm -rf /')", json!({})).is_err());
    }

    #[test]
    fn guard_style_expression_over_rule_env() {
        let vars = json!({
            "record": {"status": "pending_approval", "total": 5000},
            "old": {"status": "sent"},
            "action": "update",
            "user": {"id": "u1", "roles": ["accountant"]},
        });
        assert_eq!(
            eval(
                "action == 'update' && old.status == 'sent' && record.total > 1000",
                vars
            )
            .unwrap(),
            json!(true)
        );
    }
}

//! Subscription filter policies.
//!
//! A policy is a JSON object mapping keys to arrays of matchers. Every key
//! must match; a key matches when any of its matchers does. `$or` holds a list
//! of sub-policies of which at least one must match. With the `MessageBody`
//! scope, nested objects address nested fields of the JSON message body.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::attribute::{AttributeType, MessageAttributeValue};
use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterScope {
    #[default]
    MessageAttributes,
    MessageBody,
}

impl FilterScope {
    pub fn parse(value: &str) -> BusResult<Self> {
        match value {
            "MessageAttributes" => Ok(FilterScope::MessageAttributes),
            "MessageBody" => Ok(FilterScope::MessageBody),
            other => Err(BusError::invalid_parameter(format!(
                "Invalid parameter: Attributes Reason: FilterPolicyScope: Invalid value [{other}]. Please use either MessageBody or MessageAttributes"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterScope::MessageAttributes => "MessageAttributes",
            FilterScope::MessageBody => "MessageBody",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Cmp::Eq => left == right,
            Cmp::Lt => left < right,
            Cmp::Le => left <= right,
            Cmp::Gt => left > right,
            Cmp::Ge => left >= right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    Equals(Literal),
    Prefix(String),
    Suffix(String),
    EqualsIgnoreCase(String),
    AnythingBut(Vec<Literal>),
    AnythingButPrefix(String),
    AnythingButSuffix(String),
    Numeric(Vec<(Cmp, f64)>),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    path: Vec<String>,
    matchers: Vec<Matcher>,
}

/// A compiled policy, ready to evaluate against publishes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterPolicy {
    scope: FilterScope,
    conditions: Vec<Condition>,
    alternatives: Vec<Vec<FilterPolicy>>,
}

fn invalid(reason: impl std::fmt::Display) -> BusError {
    BusError::invalid_parameter(format!(
        "Invalid parameter: FilterPolicy: {reason}"
    ))
}

impl FilterPolicy {
    pub fn compile(json: &str, scope: FilterScope) -> BusResult<Self> {
        let value: Value = serde_json::from_str(json).map_err(invalid)?;
        let object = value
            .as_object()
            .ok_or_else(|| invalid("Filter policy must be a JSON object"))?;
        let mut policy = FilterPolicy {
            scope,
            ..Default::default()
        };
        policy.add_object(object, &[])?;
        if policy.conditions.is_empty() && policy.alternatives.is_empty() {
            return Err(invalid("Filter policy must not be empty"));
        }
        Ok(policy)
    }

    fn add_object(&mut self, object: &Map<String, Value>, prefix: &[String]) -> BusResult<()> {
        for (key, value) in object {
            if key == "$or" {
                let branches = value
                    .as_array()
                    .filter(|a| a.len() >= 2)
                    .ok_or_else(|| invalid("$or must be an array of at least two objects"))?;
                let mut alternatives = Vec::with_capacity(branches.len());
                for branch in branches {
                    let branch = branch
                        .as_object()
                        .ok_or_else(|| invalid("$or must contain objects"))?;
                    let mut sub = FilterPolicy {
                        scope: self.scope,
                        ..Default::default()
                    };
                    sub.add_object(branch, prefix)?;
                    alternatives.push(sub);
                }
                self.alternatives.push(alternatives);
                continue;
            }
            let mut path = prefix.to_vec();
            path.push(key.clone());
            match value {
                Value::Array(items) => {
                    if items.is_empty() {
                        return Err(invalid(format!("Empty arrays are not allowed for {key}")));
                    }
                    let matchers = items
                        .iter()
                        .map(compile_matcher)
                        .collect::<BusResult<Vec<_>>>()?;
                    self.conditions.push(Condition { path, matchers });
                }
                Value::Object(nested) if self.scope == FilterScope::MessageBody => {
                    self.add_object(nested, &path)?;
                }
                _ => {
                    return Err(invalid(format!(
                        "Match value for {key} must be an array"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Evaluates the policy against a publish. `body` is only consulted for
    /// the `MessageBody` scope; a body that is not JSON matches nothing.
    pub fn matches(&self, attributes: &HashMap<String, MessageAttributeValue>, body: &str) -> bool {
        match self.scope {
            FilterScope::MessageAttributes => self.eval(&|path: &[String]| {
                path.first()
                    .and_then(|name| attributes.get(name))
                    .map(attribute_values)
            }),
            FilterScope::MessageBody => {
                let Ok(parsed) = serde_json::from_str::<Value>(body) else {
                    return false;
                };
                self.eval(&|path: &[String]| body_values(&parsed, path))
            }
        }
    }

    fn eval(&self, lookup: &dyn Fn(&[String]) -> Option<Vec<Literal>>) -> bool {
        let conditions = self.conditions.iter().all(|c| {
            let values = lookup(&c.path);
            c.matchers.iter().any(|m| m.matches(values.as_deref()))
        });
        conditions
            && self
                .alternatives
                .iter()
                .all(|branches| branches.iter().any(|p| p.eval(lookup)))
    }
}

fn literal(value: &Value) -> Option<Literal> {
    match value {
        Value::String(s) => Some(Literal::Str(s.clone())),
        Value::Number(n) => n.as_f64().map(Literal::Num),
        Value::Bool(b) => Some(Literal::Bool(*b)),
        Value::Null => Some(Literal::Null),
        _ => None,
    }
}

fn compile_matcher(value: &Value) -> BusResult<Matcher> {
    if let Some(lit) = literal(value) {
        return Ok(Matcher::Equals(lit));
    }
    let object = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| invalid(format!("Unrecognized match type {value}")))?;
    let Some((operator, operand)) = object.iter().next() else {
        return Err(invalid("Empty match object"));
    };
    let string_operand = || {
        operand
            .as_str()
            .map(String::from)
            .ok_or_else(|| invalid(format!("{operator} match pattern must be a string")))
    };
    match operator.as_str() {
        "prefix" => Ok(Matcher::Prefix(string_operand()?)),
        "suffix" => Ok(Matcher::Suffix(string_operand()?)),
        "equals-ignore-case" => Ok(Matcher::EqualsIgnoreCase(string_operand()?)),
        "exists" => operand
            .as_bool()
            .map(Matcher::Exists)
            .ok_or_else(|| invalid("exists match pattern must be either true or false.")),
        "numeric" => compile_numeric(operand),
        "anything-but" => match operand {
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    literal(v).ok_or_else(|| invalid("anything-but list must contain literals"))
                })
                .collect::<BusResult<Vec<_>>>()
                .map(Matcher::AnythingBut),
            Value::Object(inner) => match inner.iter().next() {
                Some((op, Value::String(s))) if inner.len() == 1 && op == "prefix" => {
                    Ok(Matcher::AnythingButPrefix(s.clone()))
                }
                Some((op, Value::String(s))) if inner.len() == 1 && op == "suffix" => {
                    Ok(Matcher::AnythingButSuffix(s.clone()))
                }
                _ => Err(invalid("Unsupported anything-but pattern")),
            },
            other => literal(other)
                .map(|l| Matcher::AnythingBut(vec![l]))
                .ok_or_else(|| invalid("Unsupported anything-but pattern")),
        },
        other => Err(invalid(format!("Unrecognized match type {other}"))),
    }
}

fn compile_numeric(operand: &Value) -> BusResult<Matcher> {
    let items = operand
        .as_array()
        .filter(|a| !a.is_empty() && a.len() % 2 == 0 && a.len() <= 4)
        .ok_or_else(|| invalid("Value of numeric must be an array of operator/value pairs."))?;
    let mut ranges = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        let cmp = match pair[0].as_str() {
            Some("=") => Cmp::Eq,
            Some("<") => Cmp::Lt,
            Some("<=") => Cmp::Le,
            Some(">") => Cmp::Gt,
            Some(">=") => Cmp::Ge,
            _ => return Err(invalid(format!("Unrecognized numeric range operator: {}", pair[0]))),
        };
        let bound = pair[1]
            .as_f64()
            .ok_or_else(|| invalid(format!("Value of {} must be numeric", pair[0])))?;
        ranges.push((cmp, bound));
    }
    Ok(Matcher::Numeric(ranges))
}

/// Candidate values of one attribute: `String.Array` attributes yield each
/// element, numbers yield their numeric value, binaries yield nothing.
fn attribute_values(attr: &MessageAttributeValue) -> Vec<Literal> {
    let raw = attr.string_value.as_deref().unwrap_or("");
    match attr.attribute_type() {
        Some(AttributeType::Number) => raw
            .trim()
            .parse::<f64>()
            .map(|n| vec![Literal::Num(n)])
            .unwrap_or_default(),
        Some(AttributeType::String) if attr.data_type == "String.Array" => {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(items)) => items.iter().filter_map(literal).collect(),
                _ => vec![Literal::Str(raw.to_string())],
            }
        }
        Some(AttributeType::String) => vec![Literal::Str(raw.to_string())],
        _ => Vec::new(),
    }
}

fn body_values(body: &Value, path: &[String]) -> Option<Vec<Literal>> {
    let mut current = body;
    for key in path {
        current = current.as_object()?.get(key)?;
    }
    match current {
        Value::Array(items) => Some(items.iter().filter_map(literal).collect()),
        Value::Object(_) => Some(Vec::new()),
        other => literal(other).map(|l| vec![l]),
    }
}

impl Matcher {
    /// `values` is `None` when the key is absent.
    fn matches(&self, values: Option<&[Literal]>) -> bool {
        if let Matcher::Exists(expected) = self {
            return values.is_some() == *expected;
        }
        let Some(values) = values else {
            return false;
        };
        let strings = || {
            values.iter().filter_map(|v| match v {
                Literal::Str(s) => Some(s.as_str()),
                _ => None,
            })
        };
        match self {
            Matcher::Equals(expected) => values.iter().any(|v| literal_eq(v, expected)),
            Matcher::Prefix(p) => strings().any(|s| s.starts_with(p.as_str())),
            Matcher::Suffix(p) => strings().any(|s| s.ends_with(p.as_str())),
            Matcher::EqualsIgnoreCase(p) => strings().any(|s| s.eq_ignore_ascii_case(p)),
            Matcher::AnythingBut(excluded) => {
                !values.is_empty()
                    && values
                        .iter()
                        .all(|v| !excluded.iter().any(|e| literal_eq(v, e)))
            }
            Matcher::AnythingButPrefix(p) => {
                !values.is_empty() && strings().all(|s| !s.starts_with(p.as_str()))
            }
            Matcher::AnythingButSuffix(p) => {
                !values.is_empty() && strings().all(|s| !s.ends_with(p.as_str()))
            }
            Matcher::Numeric(ranges) => values.iter().any(|v| match v {
                Literal::Num(n) => ranges.iter().all(|(cmp, bound)| cmp.holds(*n, *bound)),
                _ => false,
            }),
            Matcher::Exists(_) => true,
        }
    }
}

fn literal_eq(value: &Literal, expected: &Literal) -> bool {
    match (value, expected) {
        (Literal::Num(a), Literal::Num(b)) => a == b,
        (Literal::Str(a), Literal::Str(b)) => a == b,
        (Literal::Bool(a), Literal::Bool(b)) => a == b,
        (Literal::Null, Literal::Null) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, MessageAttributeValue)]) -> HashMap<String, MessageAttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn policy(json: &str) -> FilterPolicy {
        FilterPolicy::compile(json, FilterScope::MessageAttributes).unwrap()
    }

    #[test]
    fn exact_string_and_missing_attribute() {
        let p = policy(r#"{"kind": ["order"]}"#);
        assert!(p.matches(&attrs(&[("kind", MessageAttributeValue::string("order"))]), ""));
        assert!(!p.matches(&attrs(&[("kind", MessageAttributeValue::string("invoice"))]), ""));
        assert!(!p.matches(&HashMap::new(), ""));
    }

    #[test]
    fn numeric_ranges_and_exact_numbers() {
        let p = policy(r#"{"price": [{"numeric": [">", 10, "<=", 20]}], "qty": [3]}"#);
        let ok = attrs(&[
            ("price", MessageAttributeValue::number("15.5")),
            ("qty", MessageAttributeValue::number("3.0")),
        ]);
        assert!(p.matches(&ok, ""));
        let high = attrs(&[
            ("price", MessageAttributeValue::number("25")),
            ("qty", MessageAttributeValue::number("3")),
        ]);
        assert!(!p.matches(&high, ""));
        // a number in a String attribute is not numeric
        let text = attrs(&[
            ("price", MessageAttributeValue::string("15")),
            ("qty", MessageAttributeValue::number("3")),
        ]);
        assert!(!p.matches(&text, ""));
    }

    #[test]
    fn prefix_suffix_ignore_case_and_anything_but() {
        let p = policy(
            r#"{"region": [{"prefix": "eu-"}], "file": [{"suffix": ".png"}], "env": [{"equals-ignore-case": "PROD"}], "tier": [{"anything-but": ["free", "trial"]}]}"#,
        );
        let m = attrs(&[
            ("region", MessageAttributeValue::string("eu-west-1")),
            ("file", MessageAttributeValue::string("cat.png")),
            ("env", MessageAttributeValue::string("prod")),
            ("tier", MessageAttributeValue::string("gold")),
        ]);
        assert!(p.matches(&m, ""));
        let mut free = m.clone();
        free.insert("tier".into(), MessageAttributeValue::string("free"));
        assert!(!p.matches(&free, ""));

        let p = policy(r#"{"name": [{"anything-but": {"prefix": "tmp"}}]}"#);
        assert!(p.matches(&attrs(&[("name", MessageAttributeValue::string("report"))]), ""));
        assert!(!p.matches(&attrs(&[("name", MessageAttributeValue::string("tmp-1"))]), ""));
    }

    #[test]
    fn exists_operator() {
        let present = policy(r#"{"trace": [{"exists": true}]}"#);
        let absent = policy(r#"{"trace": [{"exists": false}]}"#);
        let with = attrs(&[("trace", MessageAttributeValue::string("x"))]);
        assert!(present.matches(&with, ""));
        assert!(!present.matches(&HashMap::new(), ""));
        assert!(absent.matches(&HashMap::new(), ""));
        assert!(!absent.matches(&with, ""));
    }

    #[test]
    fn or_branches_and_string_arrays() {
        let p = policy(r#"{"$or": [{"kind": ["order"]}, {"size": [{"numeric": [">", 100]}]}]}"#);
        assert!(p.matches(&attrs(&[("kind", MessageAttributeValue::string("order"))]), ""));
        assert!(p.matches(&attrs(&[("size", MessageAttributeValue::number("101"))]), ""));
        assert!(!p.matches(&attrs(&[("size", MessageAttributeValue::number("5"))]), ""));

        let p = policy(r#"{"colors": ["red"]}"#);
        let arr = MessageAttributeValue {
            data_type: "String.Array".into(),
            string_value: Some(r#"["blue","red"]"#.into()),
            binary_value: None,
        };
        assert!(p.matches(&attrs(&[("colors", arr)]), ""));
    }

    #[test]
    fn body_scope_walks_nested_keys() {
        let p = FilterPolicy::compile(
            r#"{"order": {"status": ["paid"], "total": [{"numeric": [">=", 50]}]}}"#,
            FilterScope::MessageBody,
        )
        .unwrap();
        let empty = HashMap::new();
        assert!(p.matches(&empty, r#"{"order": {"status": "paid", "total": 75}}"#));
        assert!(!p.matches(&empty, r#"{"order": {"status": "open", "total": 75}}"#));
        assert!(!p.matches(&empty, "not json"));
    }

    #[test]
    fn rejects_malformed_policies() {
        for bad in [
            "[]",
            "{}",
            r#"{"kind": "order"}"#,
            r#"{"kind": []}"#,
            r#"{"kind": [{"numeric": [">"]}]}"#,
            r#"{"kind": [{"wildcard": "x"}]}"#,
            r#"{"nested": {"kind": ["x"]}}"#,
        ] {
            assert!(
                FilterPolicy::compile(bad, FilterScope::MessageAttributes).is_err(),
                "{bad}"
            );
        }
    }
}

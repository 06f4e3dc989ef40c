// ABOUTME: Stateless row transformation between source and target shape
// ABOUTME: Row filter, field renames, and value converters applied in order

use serde_json::Value;
use thiserror::Error;

use crate::config::{ConverterKind, FieldMapping, TableMapping};
use crate::sqlite::RowData;

/// A non-retryable transformation failure; the engine records it as a
/// data error against the originating event.
#[derive(Error, Debug)]
#[error("field '{field}': {message}")]
pub struct TransformError {
    pub field: String,
    pub message: String,
}

/// Parsed row-level filter predicate.
///
/// Supports the comparison subset mapping configurations actually use:
/// equality and ordering against a literal, and null checks.
#[derive(Debug, Clone)]
pub enum RowFilter {
    IsNull(String),
    IsNotNull(String),
    Compare {
        field: String,
        op: CompareOp,
        literal: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl RowFilter {
    /// Parse a predicate like `status = 'active'` or `deleted_at IS NULL`.
    pub fn parse(condition: &str) -> Result<Self, crate::error::SyncError> {
        let bad = |msg: &str| {
            crate::error::SyncError::Config(format!(
                "unsupported filter_condition '{}': {}",
                condition, msg
            ))
        };

        let trimmed = condition.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(field) = upper.strip_suffix("IS NOT NULL") {
            let field = trimmed[..field.len()].trim();
            if field.is_empty() {
                return Err(bad("missing field"));
            }
            return Ok(RowFilter::IsNotNull(field.to_string()));
        }
        if let Some(field) = upper.strip_suffix("IS NULL") {
            let field = trimmed[..field.len()].trim();
            if field.is_empty() {
                return Err(bad("missing field"));
            }
            return Ok(RowFilter::IsNull(field.to_string()));
        }

        for (token, op) in [
            ("!=", CompareOp::Ne),
            ("<>", CompareOp::Ne),
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("=", CompareOp::Eq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ] {
            if let Some(idx) = trimmed.find(token) {
                let field = trimmed[..idx].trim();
                let literal_raw = trimmed[idx + token.len()..].trim();
                if field.is_empty() || literal_raw.is_empty() {
                    return Err(bad("missing field or literal"));
                }
                let literal = parse_literal(literal_raw).ok_or_else(|| bad("bad literal"))?;
                return Ok(RowFilter::Compare {
                    field: field.to_string(),
                    op,
                    literal,
                });
            }
        }

        Err(bad("expected comparison or null check"))
    }

    /// Evaluate against a source row. Missing fields evaluate to NULL.
    pub fn matches(&self, row: &RowData) -> bool {
        match self {
            RowFilter::IsNull(field) => row.get(field).map(Value::is_null).unwrap_or(true),
            RowFilter::IsNotNull(field) => {
                row.get(field).map(|v| !v.is_null()).unwrap_or(false)
            }
            RowFilter::Compare { field, op, literal } => {
                let value = match row.get(field) {
                    Some(v) if !v.is_null() => v,
                    // SQL three-valued logic: NULL compares to nothing
                    _ => return false,
                };
                compare_values(value, literal)
                    .map(|ordering| match op {
                        CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
                        CompareOp::Ne => ordering != std::cmp::Ordering::Equal,
                        CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
                        CompareOp::Ge => ordering != std::cmp::Ordering::Less,
                        CompareOp::Lt => ordering == std::cmp::Ordering::Less,
                        CompareOp::Le => ordering != std::cmp::Ordering::Greater,
                    })
                    .unwrap_or(false)
            }
        }
    }
}

fn parse_literal(raw: &str) -> Option<Value> {
    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        return Some(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    if raw.eq_ignore_ascii_case("null") {
        return Some(Value::Null);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Some(Value::from(f));
    }
    None
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Applies a table mapping to rows: filter, rename, convert.
pub struct Transformer<'a> {
    mapping: &'a TableMapping,
    filter: Option<RowFilter>,
}

impl<'a> Transformer<'a> {
    pub fn new(mapping: &'a TableMapping) -> Result<Self, crate::error::SyncError> {
        let filter = mapping
            .filter_condition
            .as_deref()
            .map(RowFilter::parse)
            .transpose()?;
        Ok(Self { mapping, filter })
    }

    pub fn target_table(&self) -> &str {
        self.mapping.target_name()
    }

    /// The target-side name of the mapping's primary key field.
    pub fn target_primary_key(&self) -> &str {
        self.field_mapping(&self.mapping.primary_key)
            .map(FieldMapping::target_name)
            .unwrap_or(&self.mapping.primary_key)
    }

    fn field_mapping(&self, source_field: &str) -> Option<&FieldMapping> {
        self.mapping
            .field_mappings
            .iter()
            .find(|fm| fm.source_field == source_field)
    }

    /// Transform one source row. `Ok(None)` means the row filter dropped it.
    pub fn transform(&self, row: &RowData) -> Result<Option<RowData>, TransformError> {
        if let Some(filter) = &self.filter {
            if !filter.matches(row) {
                return Ok(None);
            }
        }

        let mut out = RowData::new();
        for (source_field, value) in row {
            match self.field_mapping(source_field) {
                Some(fm) => {
                    let converted = match fm.converter {
                        Some(kind) => convert(value.clone(), kind, fm)?,
                        None => value.clone(),
                    };
                    out.insert(fm.target_name().to_string(), converted);
                }
                None => {
                    out.insert(source_field.clone(), value.clone());
                }
            }
        }
        Ok(Some(out))
    }

    /// Transform a batch, dropping filtered rows.
    pub fn transform_batch(&self, rows: &[RowData]) -> Result<Vec<RowData>, TransformError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(transformed) = self.transform(row)? {
                out.push(transformed);
            }
        }
        Ok(out)
    }
}

/// Apply one converter to one value.
fn convert(
    value: Value,
    kind: ConverterKind,
    fm: &FieldMapping,
) -> Result<Value, TransformError> {
    let field = fm.source_field.clone();
    match kind {
        ConverterKind::Lowercase => Ok(map_string(value, |s| s.to_lowercase())),
        ConverterKind::Uppercase => Ok(map_string(value, |s| s.to_uppercase())),
        ConverterKind::Trim => Ok(map_string(value, |s| s.trim().to_string())),
        ConverterKind::Default => {
            let is_empty = value.is_null() || value.as_str().map(str::is_empty).unwrap_or(false);
            if is_empty {
                Ok(fm
                    .converter_params
                    .get("value")
                    .cloned()
                    .unwrap_or(Value::Null))
            } else {
                Ok(value)
            }
        }
        ConverterKind::Typecast => {
            let target = fm
                .converter_params
                .get("target_type")
                .and_then(Value::as_str)
                .unwrap_or("str");
            typecast(value, target).map_err(|message| TransformError { field, message })
        }
    }
}

fn map_string(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn typecast(value: Value, target: &str) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match target {
        "int" => match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .ok_or_else(|| format!("cannot cast {} to int", value)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("cannot cast '{}' to int", s)),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            other => Err(format!("cannot cast {} to int", other)),
        },
        "float" => match &value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("cannot cast {} to float", value)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("cannot cast '{}' to float", s)),
            other => Err(format!("cannot cast {} to float", other)),
        },
        "str" => match value {
            Value::String(s) => Ok(Value::String(s)),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("cannot cast {} to str", other)),
        },
        "bool" => match &value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("cannot cast '{}' to bool", s)),
            },
            other => Err(format!("cannot cast {} to bool", other)),
        },
        other => Err(format!("unknown target_type '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn mapping(fields: Vec<FieldMapping>, filter: Option<&str>) -> TableMapping {
        TableMapping {
            source_table: "users".into(),
            target_table: Some("users_backup".into()),
            field_mappings: fields,
            filter_condition: filter.map(String::from),
            primary_key: "id".into(),
            parallel_ranges: None,
        }
    }

    fn field(
        source: &str,
        target: Option<&str>,
        converter: Option<ConverterKind>,
        params: Vec<(&str, Value)>,
    ) -> FieldMapping {
        FieldMapping {
            source_field: source.into(),
            target_field: target.map(String::from),
            converter,
            converter_params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn trim_rename_and_lowercase() {
        let mapping = mapping(
            vec![
                field("name", Some("user_name"), Some(ConverterKind::Trim), vec![]),
                field("email", None, Some(ConverterKind::Lowercase), vec![]),
            ],
            None,
        );
        let transformer = Transformer::new(&mapping).unwrap();

        let out = transformer
            .transform(&row(&[
                ("name", json!(" Zhang ")),
                ("email", json!("A@B.COM")),
            ]))
            .unwrap()
            .unwrap();

        assert_eq!(out["user_name"], json!("Zhang"));
        assert_eq!(out["email"], json!("a@b.com"));
        assert!(!out.contains_key("name"));
    }

    #[test]
    fn unmapped_fields_pass_through() {
        let mapping = mapping(vec![], None);
        let transformer = Transformer::new(&mapping).unwrap();
        let out = transformer
            .transform(&row(&[("id", json!(1)), ("name", json!("x"))]))
            .unwrap()
            .unwrap();
        assert_eq!(out["id"], json!(1));
        assert_eq!(out["name"], json!("x"));
    }

    #[test]
    fn default_substitutes_null_and_empty() {
        let mapping = mapping(
            vec![field(
                "status",
                None,
                Some(ConverterKind::Default),
                vec![("value", json!("active"))],
            )],
            None,
        );
        let transformer = Transformer::new(&mapping).unwrap();

        let out = transformer
            .transform(&row(&[("status", Value::Null)]))
            .unwrap()
            .unwrap();
        assert_eq!(out["status"], json!("active"));

        let out = transformer
            .transform(&row(&[("status", json!(""))]))
            .unwrap()
            .unwrap();
        assert_eq!(out["status"], json!("active"));

        let out = transformer
            .transform(&row(&[("status", json!("archived"))]))
            .unwrap()
            .unwrap();
        assert_eq!(out["status"], json!("archived"));
    }

    #[test]
    fn typecast_success_and_failure() {
        let mapping = mapping(
            vec![field(
                "age",
                None,
                Some(ConverterKind::Typecast),
                vec![("target_type", json!("int"))],
            )],
            None,
        );
        let transformer = Transformer::new(&mapping).unwrap();

        let out = transformer
            .transform(&row(&[("age", json!("42"))]))
            .unwrap()
            .unwrap();
        assert_eq!(out["age"], json!(42));

        let err = transformer
            .transform(&row(&[("age", json!("not-a-number"))]))
            .unwrap_err();
        assert_eq!(err.field, "age");
        assert!(err.message.contains("cannot cast"));
    }

    #[test]
    fn non_string_passes_through_string_converters() {
        let mapping = mapping(
            vec![field("n", None, Some(ConverterKind::Uppercase), vec![])],
            None,
        );
        let transformer = Transformer::new(&mapping).unwrap();
        let out = transformer
            .transform(&row(&[("n", json!(5))]))
            .unwrap()
            .unwrap();
        assert_eq!(out["n"], json!(5));
    }

    #[test]
    fn filter_drops_rows() {
        let mapping = mapping(vec![], Some("deleted_at IS NULL"));
        let transformer = Transformer::new(&mapping).unwrap();

        let kept = transformer
            .transform(&row(&[("id", json!(1)), ("deleted_at", Value::Null)]))
            .unwrap();
        assert!(kept.is_some());

        let dropped = transformer
            .transform(&row(&[("id", json!(2)), ("deleted_at", json!("2026-01-01"))]))
            .unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn filter_comparisons() {
        let filter = RowFilter::parse("status = 'active'").unwrap();
        assert!(filter.matches(&row(&[("status", json!("active"))])));
        assert!(!filter.matches(&row(&[("status", json!("archived"))])));
        assert!(!filter.matches(&row(&[("status", Value::Null)])));

        let filter = RowFilter::parse("age >= 18").unwrap();
        assert!(filter.matches(&row(&[("age", json!(18))])));
        assert!(!filter.matches(&row(&[("age", json!(17))])));

        let filter = RowFilter::parse("deleted_at IS NOT NULL").unwrap();
        assert!(filter.matches(&row(&[("deleted_at", json!("x"))])));
        assert!(!filter.matches(&row(&[("deleted_at", Value::Null)])));
    }

    #[test]
    fn bad_filter_is_config_error() {
        assert!(RowFilter::parse("status BETWEEN 1 AND 2").is_err());
        assert!(RowFilter::parse("").is_err());
    }

    #[test]
    fn target_primary_key_follows_rename() {
        let mapping = TableMapping {
            source_table: "orders".into(),
            target_table: None,
            field_mappings: vec![field("id", Some("order_id"), None, vec![])],
            filter_condition: None,
            primary_key: "id".into(),
            parallel_ranges: None,
        };
        let transformer = Transformer::new(&mapping).unwrap();
        assert_eq!(transformer.target_primary_key(), "order_id");
        assert_eq!(transformer.target_table(), "orders");
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Conversions between entities, their JSON projection and SQL rows.

use rowguard_core::error::{Result, RowguardError};
use rowguard_core::sql::{Row, SqlValue};
use rowguard_core::types::PLACEHOLDER;
use serde_json::{Map, Number, Value};

use crate::entity::{ColumnKind, Entity};
use crate::registry::TableMapping;

/// Column holding the row signature.
pub const SIGNATURE_COLUMN: &str = "sig";
/// Column holding the fingerprint of the canonical form that signed the row.
pub const SIGNER_COLUMN: &str = "signer";

/// An entity decoded from a row, with its signature columns split off.
#[derive(Debug)]
pub(crate) struct Loaded<T> {
    pub entity: T,
    pub signature: Option<Vec<u8>>,
    pub signer: Option<String>,
}

/// JSON projection of an entity. Must be an object.
pub(crate) fn to_object<T: Entity>(entity: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(RowguardError::InvalidData(format!(
            "{} serialized as {other}, expected an object",
            T::NAME
        ))),
    }
}

pub(crate) fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    object
        .get(name)
        .ok_or_else(|| RowguardError::InvalidData(format!("serialized entity has no field {name}")))
}

/// Textual form of a key value, comparable with the `CAST(... AS TEXT)` of
/// the stored column.
pub(crate) fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Bind a JSON field value as a column of the given kind.
pub(crate) fn json_to_sql(value: &Value, kind: ColumnKind) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let bound = match kind {
        ColumnKind::Integer => match value {
            Value::Number(n) => n.as_i64().map(SqlValue::Integer),
            Value::Bool(b) => Some(SqlValue::from(*b)),
            _ => None,
        },
        ColumnKind::Real => value.as_f64().map(SqlValue::Real),
        ColumnKind::Text => value.as_str().map(SqlValue::from),
        ColumnKind::Bool => value.as_bool().map(SqlValue::from),
        ColumnKind::Json => Some(SqlValue::Text(value.to_string())),
        ColumnKind::Blob => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(SqlValue::Blob),
            Value::String(s) => Some(SqlValue::Blob(s.as_bytes().to_vec())),
            _ => None,
        },
    };
    bound.ok_or_else(|| {
        RowguardError::InvalidData(format!("cannot store {value} in a {kind:?} column"))
    })
}

/// Decode a column value into the JSON shape its field deserializes from.
pub(crate) fn sql_to_json(value: SqlValue, kind: ColumnKind) -> Result<Value> {
    Ok(match (kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnKind::Json, SqlValue::Text(s)) => serde_json::from_str(&s)?,
        (ColumnKind::Blob, SqlValue::Blob(b)) => {
            Value::Array(b.into_iter().map(Value::from).collect())
        }
        (_, SqlValue::Integer(i)) => Value::from(i),
        (_, SqlValue::Real(f)) => Number::from_f64(f).map(Value::Number).ok_or_else(|| {
            RowguardError::InvalidData(format!("{f} has no JSON representation"))
        })?,
        (_, SqlValue::Text(s)) => Value::String(s),
        (_, SqlValue::Blob(b)) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    })
}

/// Decode a result row into an entity.
///
/// Encrypted fields come back masked. Columns the mapping does not know
/// about are ignored.
pub(crate) fn decode_row<T: Entity>(mapping: &TableMapping, mut row: Row) -> Result<Loaded<T>> {
    let signature = match row.take(SIGNATURE_COLUMN) {
        Some(SqlValue::Blob(b)) => Some(b),
        Some(SqlValue::Text(s)) => Some(s.into_bytes()),
        _ => None,
    };
    let signer = row
        .take(SIGNER_COLUMN)
        .filter(|v| !v.is_null())
        .map(|v| v.to_text());

    let mut object = Map::new();
    for (column, value) in row.into_pairs() {
        if let Some(map) = mapping.columns.iter().find(|c| c.column == column) {
            object.insert(map.field.to_owned(), sql_to_json(value, map.kind)?);
        }
    }
    for encrypted in &mapping.encrypted_fields {
        object.insert(
            encrypted.field.to_owned(),
            Value::String(PLACEHOLDER.to_owned()),
        );
    }

    let entity = serde_json::from_value(Value::Object(object)).map_err(|e| {
        RowguardError::Database(format!("cannot decode {} row: {e}", mapping.entity_name))
    })?;
    Ok(Loaded {
        entity,
        signature,
        signer,
    })
}

/// Overwrite one serialized field of `entity`, keeping every secret as it is.
pub(crate) fn replace_field<T: Entity>(entity: &mut T, name: &str, value: Value) -> Result<()> {
    let secrets = entity
        .secrets()
        .into_iter()
        .map(|(field, secret)| Ok::<_, RowguardError>((field, secret.plaintext_json()?)))
        .collect::<Result<Vec<_>>>()?;

    let mut object = to_object(entity)?;
    object.insert(name.to_owned(), value);
    let mut rebuilt: T = serde_json::from_value(Value::Object(object))?;

    for (field, secret) in rebuilt.secrets_mut() {
        match secrets.iter().find(|(known, _)| *known == field) {
            Some((_, Some(plaintext))) => secret.set_plaintext_json(plaintext)?,
            _ => secret.mask(),
        }
    }
    *entity = rebuilt;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binds_values_by_kind() {
        assert_eq!(
            json_to_sql(&json!(5), ColumnKind::Integer).unwrap(),
            SqlValue::Integer(5)
        );
        assert_eq!(
            json_to_sql(&json!(true), ColumnKind::Bool).unwrap(),
            SqlValue::Integer(1)
        );
        assert_eq!(
            json_to_sql(&json!({"b": 1}), ColumnKind::Json).unwrap(),
            SqlValue::Text(r#"{"b":1}"#.into())
        );
        assert_eq!(
            json_to_sql(&json!([1, 255]), ColumnKind::Blob).unwrap(),
            SqlValue::Blob(vec![1, 255])
        );
        assert_eq!(
            json_to_sql(&Value::Null, ColumnKind::Text).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn rejects_mismatched_kinds() {
        assert!(json_to_sql(&json!("x"), ColumnKind::Integer).is_err());
        assert!(json_to_sql(&json!(3), ColumnKind::Text).is_err());
        assert!(json_to_sql(&json!([256]), ColumnKind::Blob).is_err());
        assert!(json_to_sql(&json!(u64::MAX), ColumnKind::Integer).is_err());
    }

    #[test]
    fn decodes_values_by_kind() {
        assert_eq!(
            sql_to_json(SqlValue::Integer(0), ColumnKind::Bool).unwrap(),
            json!(false)
        );
        assert_eq!(
            sql_to_json(SqlValue::Text("[1,2]".into()), ColumnKind::Json).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            sql_to_json(SqlValue::Blob(vec![9]), ColumnKind::Blob).unwrap(),
            json!([9])
        );
        assert_eq!(
            sql_to_json(SqlValue::Real(1.5), ColumnKind::Real).unwrap(),
            json!(1.5)
        );
        assert!(sql_to_json(SqlValue::Real(f64::NAN), ColumnKind::Real).is_err());
    }

    #[test]
    fn key_text_matches_storage_cast() {
        assert_eq!(json_text(&json!(42)), SqlValue::Integer(42).to_text());
        assert_eq!(json_text(&json!("a-b")), SqlValue::Text("a-b".into()).to_text());
    }
}

//! Conversions between engine values and PostgreSQL wire types.

use chrono::{DateTime, NaiveDateTime, Utc};
use strata_migrate::{Row, SqlValue};
use tokio_postgres::types::{ToSql, Type};

use crate::error::{PgError, PgResult};

/// A boxed statement parameter.
pub type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert a value to a parameter of the type the server inferred for it.
///
/// Integers are narrowed to `INT2`/`INT4` when the placeholder asks for it,
/// and timestamps are bound without a zone for `TIMESTAMP` columns.
pub fn to_sql_param(value: &SqlValue, ty: &Type) -> PgResult<PgParam> {
    match value {
        SqlValue::Null => Ok(typed_null(ty)),
        SqlValue::Bool(b) => Ok(Box::new(*b)),
        SqlValue::Int(i) => match *ty {
            Type::INT2 => i16::try_from(*i)
                .map(|v| Box::new(v) as PgParam)
                .map_err(|_| PgError::type_conversion(format!("{} does not fit in INT2", i))),
            Type::INT4 => i32::try_from(*i)
                .map(|v| Box::new(v) as PgParam)
                .map_err(|_| PgError::type_conversion(format!("{} does not fit in INT4", i))),
            _ => Ok(Box::new(*i)),
        },
        SqlValue::Text(s) => Ok(Box::new(s.clone())),
        SqlValue::Timestamp(ts) => match *ty {
            Type::TIMESTAMP => Ok(Box::new(ts.naive_utc())),
            _ => Ok(Box::new(*ts)),
        },
    }
}

fn typed_null(ty: &Type) -> PgParam {
    match *ty {
        Type::BOOL => Box::new(Option::<bool>::None),
        Type::INT2 => Box::new(Option::<i16>::None),
        Type::INT4 => Box::new(Option::<i32>::None),
        Type::INT8 => Box::new(Option::<i64>::None),
        Type::TIMESTAMP => Box::new(Option::<NaiveDateTime>::None),
        Type::TIMESTAMPTZ => Box::new(Option::<DateTime<Utc>>::None),
        _ => Box::new(Option::<String>::None),
    }
}

/// Convert values to parameters, pairing each with its placeholder type.
pub fn to_sql_params(values: &[SqlValue], types: &[Type]) -> PgResult<Vec<PgParam>> {
    if values.len() != types.len() {
        return Err(PgError::type_conversion(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| to_sql_param(value, ty))
        .collect()
}

/// Convert a driver row into an engine row.
pub fn from_pg_row(row: &tokio_postgres::Row) -> PgResult<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push(column_value(row, idx, column.type_())?);
    }
    Ok(Row::new(values))
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> PgResult<SqlValue> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.into(),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|ts| ts.and_utc())
            .into(),
        Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.into(),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|_| {
                PgError::type_conversion(format!("unsupported column type {} at {}", ty, idx))
            })?
            .into(),
    };
    Ok(value)
}

//! Newtypes bridging our row types and sqlite's storage classes

use rusqlite::{
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    ToSql,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Uuids are stored as their hyphenated text rendering
#[derive(Clone, Copy, Debug)]
pub(super) struct UuidText(pub Uuid);

impl ToSql for UuidText {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for UuidText {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        let uuid = Uuid::parse_str(text).map_err(|err| FromSqlError::Other(Box::new(err)))?;
        Ok(Self(uuid))
    }
}

impl From<UuidText> for Uuid {
    fn from(wrapper: UuidText) -> Self {
        wrapper.0
    }
}

/// Values without a natural column shape (schedules, filters, log details)
/// round-trip through a JSON text column
#[derive(Clone, Debug)]
pub(super) struct Json<T>(pub T);

impl<T: Serialize> ToSql for Json<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let text = serde_json::to_string(&self.0)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        Ok(ToSqlOutput::from(text))
    }
}

impl<T: DeserializeOwned> FromSql for Json<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        let inner =
            serde_json::from_str(text).map_err(|err| FromSqlError::Other(Box::new(err)))?;
        Ok(Self(inner))
    }
}

use crate::error::{PipelineError, Result};
use std::fmt;
use std::sync::Arc;

/// Declared type of a cell value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Text,
    Integer,
    Float,
    Boolean,
}

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Text(_) => ValueType::Text,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Boolean(_) => ValueType::Boolean,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// A raw, positional record as produced by a splitter or a record source
pub type Record = Vec<Value>;

/// A typed row: column names mapped to values with their declared type.
///
/// The column list is shared by every row of a run; cloning a row copies the
/// values and only bumps the reference count of the column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    fields: Vec<(Value, ValueType)>,
}

impl Row {
    /// Column names in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of a column by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.position(column).map(|i| &self.fields[i].0)
    }

    /// Declared type of a column by name
    pub fn value_type(&self, column: &str) -> Option<ValueType> {
        self.position(column).map(|i| self.fields[i].1)
    }

    /// Replace the value of an existing column; the declared type follows the value
    pub fn set(&mut self, column: &str, value: Value) -> Result<()> {
        let i = self
            .position(column)
            .ok_or_else(|| PipelineError::Config(format!("unknown column '{}'", column)))?;
        let value_type = value.value_type();
        self.fields[i] = (value, value_type);
        Ok(())
    }

    /// Values in column order
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(v, _)| v)
    }

    /// `(column, value)` pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.fields.iter().map(|(v, _)| v))
    }

    /// Consume the row, returning its values in column order
    pub fn into_values(self) -> Vec<Value> {
        self.fields.into_iter().map(|(v, _)| v).collect()
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Builds rows for a fixed, ordered column list
#[derive(Debug, Clone)]
pub struct RowFactory {
    columns: Arc<[String]>,
}

impl RowFactory {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Build a row from a positional record with exactly one value per column
    pub fn create_row(&self, record: Record) -> Result<Row> {
        if record.len() != self.columns.len() {
            return Err(PipelineError::FieldCountMismatch {
                expected: self.columns.len(),
                actual: record.len(),
            });
        }
        let fields = record
            .into_iter()
            .map(|value| {
                let value_type = value.value_type();
                (value, value_type)
            })
            .collect();
        Ok(Row {
            columns: Arc::clone(&self.columns),
            fields,
        })
    }
}

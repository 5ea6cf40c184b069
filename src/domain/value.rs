//! Column kinds and input coercion.
//!
//! Every settable column declares a [`ColumnKind`]; caller input is coerced
//! uniformly before it reaches the query executor so that `"42"`, `42` and
//! `42.0` land as the declared kind regardless of how the outer layer parsed
//! them.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value kind of a settable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Str,
    Int,
    Bool,
    Double,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Double => "double",
        }
    }
}

impl Display for ColumnKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "str" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "bool" => Ok(Self::Bool),
            "double" => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

/// Coerce a caller-supplied value to the declared column kind.
///
/// Lossy inputs that cannot be interpreted (e.g. `"abc"` for an `Int`
/// column) collapse to a neutral default rather than erroring: the engine
/// treats coercion as normalization, not validation.
pub fn coerce(kind: ColumnKind, value: &Value) -> Value {
    match kind {
        ColumnKind::Str => match value {
            Value::String(_) => value.clone(),
            Value::Null => Value::Null,
            other => Value::String(other.to_string()),
        },
        ColumnKind::Int => match value {
            Value::Number(n) => {
                Value::from(n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64))
            }
            Value::String(s) => Value::from(parse_int(s)),
            Value::Bool(b) => Value::from(i64::from(*b)),
            Value::Null => Value::Null,
            _ => Value::from(0),
        },
        ColumnKind::Bool => match value {
            Value::Bool(_) => value.clone(),
            Value::Number(n) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => Value::Bool(matches!(s.as_str(), "1" | "true" | "yes" | "on")),
            Value::Null => Value::Null,
            _ => Value::Bool(false),
        },
        ColumnKind::Double => match value {
            Value::Number(n) => Value::from(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Value::from(s.trim().parse::<f64>().unwrap_or(0.0)),
            Value::Bool(b) => Value::from(f64::from(u8::from(*b))),
            Value::Null => Value::Null,
            _ => Value::from(0.0),
        },
    }
}

fn parse_int(s: &str) -> i64 {
    let trimmed = s.trim();
    trimmed
        .parse::<i64>()
        .or_else(|_| trimmed.parse::<f64>().map(|f| f as i64))
        .unwrap_or(0)
}

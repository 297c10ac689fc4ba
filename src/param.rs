//! Task parameters and their canonical text form.
//!
//! Every value that takes part in a salted version must render to the same
//! text on every run and on every machine. Relying on `Debug` output for this
//! is fragile, so each supported type gets exactly one canonical rendering
//! here, and user types opt in through [`Canonical`].

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::RenderError;
use crate::interval::DateInterval;

/// Capability of a user-defined parameter type to render itself
/// deterministically. Returning an error marks the value as unfit for
/// hashing, which fails the whole fingerprint computation.
pub trait Canonical: Send + Sync + Debug {
    fn canonical(&self) -> Result<String, RenderError>;

    /// Text used when the value is substituted into a path template.
    fn path_segment(&self) -> Result<String, RenderError> {
        self.canonical()
    }
}

/// A single parameter value.
#[derive(Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Interval(DateInterval),
    List(Vec<Value>),
    Custom(Arc<dyn Canonical>),
}

impl Value {
    /// Canonical text of the value, used as hash input.
    ///
    /// Strings are JSON-quoted so that `"1"` and `1` never collide.
    pub fn canonical(&self) -> Result<String, RenderError> {
        Ok(match self {
            Value::Str(s) => quote(s)?,
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float(*f)?,
            Value::Bool(b) => b.to_string(),
            Value::Date(date) => date.format("%Y-%m-%d").to_string(),
            Value::Interval(interval) => interval.to_string(),
            Value::List(items) => {
                let items = items
                    .iter()
                    .map(Value::canonical)
                    .collect::<Result<Vec<_>, _>>()?;
                format!("[{}]", items.join(","))
            }
            Value::Custom(custom) => custom.canonical()?,
        })
    }

    /// Text of the value as it appears inside a file path.
    pub fn path_segment(&self) -> Result<String, RenderError> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::List(items) => Ok(items
                .iter()
                .map(Value::path_segment)
                .collect::<Result<Vec<_>, _>>()?
                .join(",")),
            Value::Custom(custom) => custom.path_segment(),
            other => other.canonical(),
        }
    }
}

fn quote(s: &str) -> Result<String, RenderError> {
    serde_json::to_string(s).map_err(|e| RenderError::Custom {
        type_name: "String",
        reason: e.to_string(),
    })
}

fn float(f: f64) -> Result<String, RenderError> {
    if !f.is_finite() {
        return Err(RenderError::NonFinite(f));
    }
    // -0.0 == 0.0, both render as 0.0
    if f == 0.0 {
        return Ok("0.0".into());
    }
    // Debug is the shortest form that round-trips and always keeps a
    // fractional part or an exponent, so 100.0 never looks like the int 100.
    Ok(format!("{f:?}"))
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x:?})"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Date(d) => write!(f, "Date({d})"),
            Value::Interval(i) => write!(f, "Interval({i})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Custom(c) => f.debug_tuple("Custom").field(c).finish(),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

impl_from!(
    String => Str,
    i64 => Int,
    i32 => Int as i64,
    u32 => Int as i64,
    u8 => Int as i64,
    f64 => Float,
    f32 => Float as f64,
    bool => Bool,
    NaiveDate => Date,
    DateInterval => Interval,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl<T> From<Vec<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// A parameter value together with its significance.
#[derive(Debug, Clone)]
pub struct Param {
    pub value: Value,
    /// Whether the value takes part in the salted version.
    pub significant: bool,
}

/// Named parameters of a task. Names are unique, setting a name twice keeps
/// the last value.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: BTreeMap<String, Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter that changes the salted version.
    pub fn significant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value, true);
        self
    }

    /// Adds a parameter that is ignored by the salted version, for example
    /// because the output is already partitioned by it.
    pub fn insignificant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value, false);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>, significant: bool) {
        self.map.insert(
            name.into(),
            Param {
                value: value.into(),
                significant,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name).map(|param| &param.value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All parameters sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.map.iter().map(|(name, param)| (name.as_str(), param))
    }

    /// Significant parameters only, sorted by name.
    pub fn significant_iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.iter()
            .filter(|(_, param)| param.significant)
            .map(|(name, param)| (name, &param.value))
    }
}

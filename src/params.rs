use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde_json::Value;
use thiserror::Error;

use crate::{data::flatten_json, model::ParamSpec};

#[derive(Error, Debug)]
pub enum InitError {
    #[error("no initial value for parameter {0}")]
    Missing(String),
    #[error("initial value for {name} has shape {found:?}, expected {expected:?}")]
    WrongShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("initial value {value} for {name} is outside of its support")]
    OutOfSupport { name: String, value: f64 },
    #[error("expected {expected} parameter values, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("value for {name} is not a number or rectangular array of numbers")]
    Malformed { name: String },
    #[error("parameter values must be a json object")]
    NotAnObject,
    #[error("could not parse parameter values as json")]
    Json(#[from] serde_json::Error),
    #[error("could not access parameter file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A point value for one parameter, flattened in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl ParamValue {
    pub fn scalar(value: f64) -> Self {
        ParamValue {
            shape: vec![],
            values: vec![value],
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        ParamValue {
            shape: vec![values.len()],
            values,
        }
    }

    /// The single value of a scalar parameter.
    pub fn as_scalar(&self) -> Option<f64> {
        if self.shape.is_empty() {
            self.values.first().copied()
        } else {
            None
        }
    }

    fn to_json(&self) -> Value {
        fn nest(shape: &[usize], values: &[f64]) -> Value {
            match shape.split_first() {
                None => number(values[0]),
                Some((_, rest)) => {
                    let stride: usize = rest.iter().product();
                    if stride == 0 {
                        return Value::Array(vec![]);
                    }
                    Value::Array(
                        values
                            .chunks(stride)
                            .map(|chunk| nest(rest, chunk))
                            .collect(),
                    )
                }
            }
        }
        fn number(v: f64) -> Value {
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or_else(|| {
                    Value::String(
                        match v {
                            v if v.is_nan() => "NaN",
                            v if v > 0. => "Inf",
                            _ => "-Inf",
                        }
                        .to_string(),
                    )
                })
        }
        nest(&self.shape, &self.values)
    }
}

/// Named parameter values on the constrained scale.
///
/// This is what the variational fit produces and what the sampler
/// accepts as initial values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    values: BTreeMap<String, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a flat constrained vector according to the parameter block.
    pub fn from_flat(specs: &[ParamSpec], flat: &[f64]) -> Result<Self, InitError> {
        let expected: usize = specs.iter().map(|p| p.size()).sum();
        if expected != flat.len() {
            return Err(InitError::DimensionMismatch {
                expected,
                found: flat.len(),
            });
        }
        let mut offset = 0;
        let values = specs
            .iter()
            .map(|spec| {
                let end = offset + spec.size();
                let value = ParamValue {
                    shape: spec.shape.clone(),
                    values: flat[offset..end].to_vec(),
                };
                offset = end;
                (spec.name.clone(), value)
            })
            .collect();
        Ok(ParamMap { values })
    }

    /// Collect the values for the parameter block into one flat vector.
    ///
    /// Entries that the parameter block does not declare are ignored.
    pub fn to_flat(&self, specs: &[ParamSpec]) -> Result<Vec<f64>, InitError> {
        let mut flat = Vec::with_capacity(specs.iter().map(|p| p.size()).sum());
        for spec in specs {
            let value = self
                .values
                .get(&spec.name)
                .ok_or_else(|| InitError::Missing(spec.name.clone()))?;
            let empty_ok = spec.size() == 0 && value.values.is_empty() && !value.shape.is_empty();
            if value.shape != spec.shape && !empty_ok {
                return Err(InitError::WrongShape {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    found: value.shape.clone(),
                });
            }
            flat.extend_from_slice(&value.values);
        }
        Ok(flat)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) -> Option<ParamValue> {
        self.values.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    pub fn from_json_str(text: &str) -> Result<Self, InitError> {
        let Value::Object(map) = serde_json::from_str::<Value>(text)? else {
            return Err(InitError::NotAnObject);
        };
        let values = map
            .into_iter()
            .map(|(name, value)| match flatten_json(&value) {
                Some(data) => Ok((
                    name,
                    ParamValue {
                        shape: data.shape,
                        values: data.values,
                    },
                )),
                None => Err(InitError::Malformed { name }),
            })
            .collect::<Result<_, _>>()?;
        Ok(ParamMap { values })
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), InitError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, text).map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl fmt::Display for ParamMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.values {
            match value.as_scalar() {
                Some(v) => writeln!(f, "{name} = {v:.6}")?,
                None => writeln!(
                    f,
                    "{name} = [{}]",
                    value.values.iter().map(|v| format!("{v:.6}")).join(", ")
                )?,
            }
        }
        Ok(())
    }
}

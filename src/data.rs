//! Observed data in the Stan JSON layout.
//!
//! A dataset is a JSON object mapping variable names to numbers or
//! (nested, row-major) arrays of numbers.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("could not read data file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse data as json")]
    Json(#[from] serde_json::Error),
    #[error("data must be a json object mapping names to values")]
    NotAnObject,
    #[error("variable {0} does not exist in the data")]
    Missing(String),
    #[error("variable {name} is not {expected}")]
    WrongType { name: String, expected: &'static str },
    #[error("variable {name} has shape {found:?}, expected {expected:?}")]
    WrongShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("variable {name} is not a rectangular array of numbers")]
    Malformed { name: String },
}

/// A single data variable, flattened in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
    /// All entries were written as integers
    pub integer: bool,
}

impl DataValue {
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }
}

/// Parse a json number or one of the strings Stan writes for non-finite values.
fn json_number(value: &Value) -> Option<(f64, bool)> {
    match value {
        Value::Number(num) => {
            let integer = num.is_i64() || num.is_u64();
            num.as_f64().map(|v| (v, integer))
        }
        Value::String(s) => match s.as_str() {
            "NaN" | "nan" => Some((f64::NAN, false)),
            "Inf" | "inf" | "Infinity" | "+Infinity" => Some((f64::INFINITY, false)),
            "-Inf" | "-inf" | "-Infinity" => Some((f64::NEG_INFINITY, false)),
            _ => None,
        },
        Value::Bool(b) => Some((if *b { 1. } else { 0. }, true)),
        _ => None,
    }
}

fn flatten_into(value: &Value, depth: usize, shape: &mut Vec<usize>, out: &mut DataValue) -> bool {
    match value {
        Value::Array(items) => {
            if shape.len() == depth {
                // Depth has not been seen yet, so this sets the shape.
                if !out.values.is_empty() && depth > 0 {
                    return false;
                }
                shape.push(items.len());
            } else if shape.len() < depth || shape[depth] != items.len() {
                return false;
            }
            items
                .iter()
                .all(|item| flatten_into(item, depth + 1, shape, out))
        }
        scalar => {
            if shape.len() != depth {
                return false;
            }
            match json_number(scalar) {
                Some((v, integer)) => {
                    out.values.push(v);
                    out.integer &= integer;
                    true
                }
                None => false,
            }
        }
    }
}

/// Flatten a json number or nested array into a row-major [`DataValue`].
///
/// Returns `None` for ragged arrays or non-numeric entries.
pub(crate) fn flatten_json(value: &Value) -> Option<DataValue> {
    let mut out = DataValue {
        shape: vec![],
        values: vec![],
        integer: true,
    };
    let mut shape = vec![];
    if !flatten_into(value, 0, &mut shape, &mut out) {
        return None;
    }
    out.shape = shape;
    if out.values.len() != out.shape.iter().product::<usize>() {
        return None;
    }
    Some(out)
}

/// A read-only collection of named data variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    vars: BTreeMap<String, DataValue>,
}

impl Dataset {
    pub fn from_json_str(text: &str) -> Result<Self, DataError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(DataError::NotAnObject);
        };
        let vars = map
            .into_iter()
            .map(|(name, value)| match flatten_json(&value) {
                Some(data) => Ok((name, data)),
                None => Err(DataError::Malformed { name }),
            })
            .collect::<Result<_, _>>()?;
        Ok(Dataset { vars })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(|k| k.as_str())
    }

    pub fn get(&self, name: &str) -> Result<&DataValue, DataError> {
        self.vars
            .get(name)
            .ok_or_else(|| DataError::Missing(name.to_string()))
    }

    /// A non-negative integer scalar, as used for sizes.
    pub fn size(&self, name: &str) -> Result<usize, DataError> {
        let value = self.get(name)?;
        let wrong = || DataError::WrongType {
            name: name.to_string(),
            expected: "a non-negative integer",
        };
        if !value.is_scalar() || !value.integer {
            return Err(wrong());
        }
        let v = value.values[0];
        if v < 0. {
            return Err(wrong());
        }
        Ok(v as usize)
    }

    /// A real array with the given shape.
    ///
    /// Empty arrays are accepted for any shape with zero entries, since the
    /// json layout cannot express the trailing dimensions of an empty array.
    pub fn array(&self, name: &str, shape: &[usize]) -> Result<&[f64], DataError> {
        let value = self.get(name)?;
        let expected_len: usize = shape.iter().product();
        let empty_ok = expected_len == 0 && value.values.is_empty() && !value.is_scalar();
        if value.shape != shape && !empty_ok {
            return Err(DataError::WrongShape {
                name: name.to_string(),
                expected: shape.to_vec(),
                found: value.shape.clone(),
            });
        }
        Ok(&value.values)
    }

    pub fn vector(&self, name: &str, len: usize) -> Result<&[f64], DataError> {
        self.array(name, &[len])
    }

    /// A row-major matrix.
    pub fn matrix(&self, name: &str, rows: usize, cols: usize) -> Result<&[f64], DataError> {
        self.array(name, &[rows, cols])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_stan_layout() -> Result<(), DataError> {
        let data = Dataset::from_json_str(
            r#"{"N": 2, "D": 3, "X": [[1, 2, 3], [4, 5.5, 6]], "y": [0.5, "-inf"]}"#,
        )?;
        assert_eq!(data.size("N")?, 2);
        assert_eq!(data.size("D")?, 3);
        assert_eq!(data.matrix("X", 2, 3)?, &[1., 2., 3., 4., 5.5, 6.]);
        let y = data.vector("y", 2)?;
        assert_eq!(y[0], 0.5);
        assert_eq!(y[1], f64::NEG_INFINITY);
        assert_eq!(data.names().collect::<Vec<_>>(), vec!["D", "N", "X", "y"]);
        Ok(())
    }

    #[test]
    fn shape_errors() -> Result<(), DataError> {
        let data = Dataset::from_json_str(r#"{"N": 2.5, "M": -1, "y": [1, 2]}"#)?;
        assert!(matches!(data.size("N"), Err(DataError::WrongType { .. })));
        assert!(matches!(data.size("M"), Err(DataError::WrongType { .. })));
        assert!(matches!(data.size("K"), Err(DataError::Missing(_))));
        assert!(matches!(
            data.vector("y", 3),
            Err(DataError::WrongShape { .. })
        ));
        assert!(matches!(
            data.matrix("y", 1, 2),
            Err(DataError::WrongShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn empty_matrix() -> Result<(), DataError> {
        let data = Dataset::from_json_str(r#"{"X": [], "y": []}"#)?;
        assert!(data.matrix("X", 0, 4)?.is_empty());
        assert!(data.vector("y", 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            Dataset::from_json_str(r#"{"X": [[1, 2], [3]]}"#),
            Err(DataError::Malformed { .. })
        ));
        assert!(matches!(
            Dataset::from_json_str(r#"{"X": [1, [2]]}"#),
            Err(DataError::Malformed { .. })
        ));
        assert!(matches!(
            Dataset::from_json_str(r#"{"X": ["a"]}"#),
            Err(DataError::Malformed { .. })
        ));
        assert!(matches!(
            Dataset::from_json_str("[1, 2]"),
            Err(DataError::NotAnObject)
        ));
        assert!(matches!(
            Dataset::from_json_str("{"),
            Err(DataError::Json(_))
        ));
    }
}

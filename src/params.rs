use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A concrete scalar value in a parameterization or result map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A trial's parameterization: argument name to scalar value.
///
/// `BTreeMap` keeps iteration deterministic, which matters for rendering
/// submission scripts and composing slice keys.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A job or trial result map: metric name to scalar value.
pub type ResultMap = BTreeMap<String, ParamValue>;

/// A single bound invocation argument.
///
/// Plain parameters and one-to-one propagated values are scalars; an
/// all-to-one merge binds the full per-slice mapping, keyed by each parent
/// slice's composite key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Scalar(ParamValue),
    PerSlice(BTreeMap<String, ParamValue>),
}

impl ArgValue {
    /// The scalar value, if this argument is not a per-slice mapping.
    pub fn as_scalar(&self) -> Option<&ParamValue> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::PerSlice(_) => None,
        }
    }

    /// The per-slice mapping, if this argument is an all-to-one binding.
    pub fn as_per_slice(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            Self::Scalar(_) => None,
            Self::PerSlice(m) => Some(m),
        }
    }
}

impl From<ParamValue> for ArgValue {
    fn from(value: ParamValue) -> Self {
        Self::Scalar(value)
    }
}

/// The full set of invocation arguments handed to a job's payload.
pub type ArgMap = BTreeMap<String, ArgValue>;

/// Build an [`ArgMap`] from a plain parameterization.
pub fn args_from_params(params: &ParamMap) -> ArgMap {
    params
        .iter()
        .map(|(name, value)| (name.clone(), ArgValue::Scalar(value.clone())))
        .collect()
}

/// An ordered list of (dimension, value) pairs identifying one slice of a
/// global-parameter expansion.
///
/// Dimension order is fixed (lexicographic by name), so the composite key
/// is stable across repeated expansions of the same set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceKey(Vec<(String, ParamValue)>);

impl SliceKey {
    pub fn new(entries: Vec<(String, ParamValue)>) -> Self {
        Self(entries)
    }

    /// The ordered (dimension, value) entries of this slice.
    pub fn entries(&self) -> &[(String, ParamValue)] {
        &self.0
    }

    /// Canonical `dim=value+dim=value` key used to index per-slice job maps
    /// and to key all-to-one merge maps.
    pub fn composite(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.composite())
    }
}

/// A set of named dimensions, each with an ordered list of values.
///
/// The Cartesian product of all dimensions defines the slices a
/// parameter-sensitive step is replicated over. Dimensions are stored in a
/// `BTreeMap`, so expansion order is independent of declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameterSet {
    dimensions: BTreeMap<String, Vec<ParamValue>>,
}

impl GlobalParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dimension with its ordered values.
    pub fn with_dimension(
        mut self,
        name: impl Into<String>,
        values: Vec<ParamValue>,
    ) -> Self {
        self.dimensions.insert(name.into(), values);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty() || self.dimensions.values().any(Vec::is_empty)
    }

    /// Enumerate every slice of the Cartesian product.
    ///
    /// Dimension names are taken in lexicographic order and the product is
    /// expanded in that fixed order, so repeated calls on the same set yield
    /// the same slices with the same composite keys.
    pub fn slices(&self) -> Vec<SliceKey> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut slices: Vec<Vec<(String, ParamValue)>> = vec![Vec::new()];
        for (name, values) in &self.dimensions {
            let mut next = Vec::with_capacity(slices.len() * values.len());
            for prefix in &slices {
                for value in values {
                    let mut entry = prefix.clone();
                    entry.push((name.clone(), value.clone()));
                    next.push(entry);
                }
            }
            slices = next;
        }

        slices.into_iter().map(SliceKey::new).collect()
    }
}

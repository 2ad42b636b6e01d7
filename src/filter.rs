//! Feature filters.
//!
//! Queries take anything implementing [`FeatureFilter`]. Plain closures work,
//! and [`Filter`] covers the usual property and geometry-type tests.

use std::cmp::Ordering;

use serde_json::Value;

use crate::feature::{Feature, GeometryType};

/// A boolean test over one feature record.
pub trait FeatureFilter {
    fn matches(&self, feature: &Feature) -> bool;
}

impl<F> FeatureFilter for F
where
    F: Fn(&Feature) -> bool,
{
    fn matches(&self, feature: &Feature) -> bool {
        self(feature)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Matches when every sub-filter matches (vacuously true when empty).
    All(Vec<Filter>),
    /// Matches when at least one sub-filter matches.
    Any(Vec<Filter>),
    /// Matches when no sub-filter matches.
    None(Vec<Filter>),
    Has(String),
    NotHas(String),
    Eq(String, Value),
    NotEq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    GeometryType(GeometryType),
}

impl Filter {
    /// Matches every feature.
    pub fn everything() -> Self {
        Filter::All(Vec::new())
    }

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(key.into(), value.into())
    }

    pub fn has(key: impl Into<String>) -> Self {
        Filter::Has(key.into())
    }

    fn compare(feature: &Feature, key: &str, value: &Value, accept: fn(Ordering) -> bool) -> bool {
        feature
            .property(key)
            .and_then(|actual| compare_values(actual, value))
            .map_or(false, accept)
    }
}

impl FeatureFilter for Filter {
    fn matches(&self, feature: &Feature) -> bool {
        match self {
            Filter::All(filters) => filters.iter().all(|f| f.matches(feature)),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(feature)),
            Filter::None(filters) => !filters.iter().any(|f| f.matches(feature)),
            Filter::Has(key) => feature.property(key).is_some(),
            Filter::NotHas(key) => feature.property(key).is_none(),
            Filter::Eq(key, value) => feature
                .property(key)
                .map_or(false, |actual| values_equal(actual, value)),
            Filter::NotEq(key, value) => !feature
                .property(key)
                .map_or(false, |actual| values_equal(actual, value)),
            Filter::In(key, values) => feature
                .property(key)
                .map_or(false, |actual| values.iter().any(|v| values_equal(actual, v))),
            Filter::NotIn(key, values) => !feature
                .property(key)
                .map_or(false, |actual| values.iter().any(|v| values_equal(actual, v))),
            Filter::Lt(key, value) => Filter::compare(feature, key, value, Ordering::is_lt),
            Filter::Le(key, value) => Filter::compare(feature, key, value, Ordering::is_le),
            Filter::Gt(key, value) => Filter::compare(feature, key, value, Ordering::is_gt),
            Filter::Ge(key, value) => Filter::compare(feature, key, value, Ordering::is_ge),
            Filter::GeometryType(kind) => feature.geometry.geometry_type() == *kind,
        }
    }
}

/// Equality where `1` and `1.0` are the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numbers compare numerically and strings lexically; anything else is unordered.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

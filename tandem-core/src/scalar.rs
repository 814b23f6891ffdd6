//! Counter and flag containers.
//!
//! Both give commutative semantics to concurrent edits that last-writer-wins
//! assignment would lose: two increments add up, two inverts cancel out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Additive numeric container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    value: f64,
}

impl Counter {
    pub fn new(value: f64) -> Self {
        Self { value }
    }

    /// Promote a plain value; non-numbers start from zero.
    pub fn from_value(value: &Value) -> Self {
        Self::new(value.as_f64().unwrap_or(0.0))
    }

    pub fn increment(&mut self, by: f64) -> f64 {
        self.value += by;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Integral counters materialize as JSON integers.
    pub fn to_json(&self) -> Value {
        if self.value.fract() == 0.0 && self.value.abs() < i64::MAX as f64 {
            Value::from(self.value as i64)
        } else {
            serde_json::Number::from_f64(self.value)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

/// Boolean container flipped by `invert`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    value: bool,
}

impl Flag {
    pub fn new(value: bool) -> Self {
        Self { value }
    }

    /// Promote a plain value; anything but `true` starts as false.
    pub fn from_value(value: &Value) -> Self {
        Self::new(value.as_bool().unwrap_or(false))
    }

    pub fn invert(&mut self) -> bool {
        self.value = !self.value;
        self.value
    }

    pub fn value(&self) -> bool {
        self.value
    }
}

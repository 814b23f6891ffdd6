//! Field-filtered views over a backing collection.
//!
//! A projection is either inclusive (allow-list, must name `_id`) or
//! exclusive (deny-list, must not name `_id`). Visibility is decided on the
//! top-level segment of a field path.
//!
//! ```text
//!   backing "auths" ──project_op──► public "users"   (invisible ops dropped)
//!   public  "users" ──validate_op─► ok | FieldNotVisible
//!                   ──unproject_op► backing "auths"
//! ```

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::op::{Op, OpKind};

/// Identity field present on every document.
pub const ID_FIELD: &str = "_id";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("projection {0} mixes included and excluded fields")]
    MixedPolarity(String),
    #[error("projection {0} lists no fields")]
    NoFields(String),
    #[error("projection {projection}: field {field} must be a boolean or 0/1")]
    InvalidFlag { projection: String, field: String },
    #[error("inclusive projection {0} must include _id")]
    MissingIdentity(String),
    #[error("exclusive projection {0} must not exclude _id")]
    ExcludedIdentity(String),
    #[error("field {field} is not visible in {projection}")]
    FieldNotVisible { projection: String, field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    name: String,
    backing: String,
    fields: BTreeSet<String>,
    inclusive: bool,
}

impl Projection {
    /// Build from `(field, included)` pairs.
    pub fn new(
        name: impl Into<String>,
        backing: impl Into<String>,
        fields: impl IntoIterator<Item = (String, bool)>,
    ) -> Result<Self, ProjectionError> {
        let name = name.into();
        let mut polarity = None;
        let mut set = BTreeSet::new();
        for (field, included) in fields {
            match polarity {
                None => polarity = Some(included),
                Some(p) if p != included => return Err(ProjectionError::MixedPolarity(name)),
                Some(_) => {}
            }
            set.insert(field);
        }
        let inclusive = polarity.ok_or_else(|| ProjectionError::NoFields(name.clone()))?;
        if inclusive && !set.contains(ID_FIELD) {
            return Err(ProjectionError::MissingIdentity(name));
        }
        if !inclusive && set.contains(ID_FIELD) {
            return Err(ProjectionError::ExcludedIdentity(name));
        }
        Ok(Self {
            name,
            backing: backing.into(),
            fields: set,
            inclusive,
        })
    }

    /// Build from a JSON field map such as `{"_id": true, "email": true}`.
    pub fn from_json(
        name: impl Into<String>,
        backing: impl Into<String>,
        fields: &Map<String, Value>,
    ) -> Result<Self, ProjectionError> {
        let name = name.into();
        let mut pairs = Vec::with_capacity(fields.len());
        for (field, flag) in fields {
            let included = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_i64() == Some(1) => true,
                Value::Number(n) if n.as_i64() == Some(0) => false,
                _ => {
                    return Err(ProjectionError::InvalidFlag {
                        projection: name,
                        field: field.clone(),
                    })
                }
            };
            pairs.push((field.clone(), included));
        }
        Self::new(name, backing, pairs)
    }

    /// Public collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backing(&self) -> &str {
        &self.backing
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    /// Whether a field path is visible (decided on its top-level segment).
    pub fn is_visible(&self, field: &str) -> bool {
        let top = field.split('.').next().unwrap_or(field);
        if top == ID_FIELD {
            return true;
        }
        self.fields.contains(top) == self.inclusive
    }

    /// Copy of a backing document with only the visible fields.
    pub fn project_doc(&self, doc: &Value) -> Value {
        let Value::Object(source) = doc else {
            return doc.clone();
        };
        let projected: Map<String, Value> = source
            .iter()
            .filter(|(field, _)| self.is_visible(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        Value::Object(projected)
    }

    /// Rewrite a backing-collection op for subscribers of this projection.
    ///
    /// Returns `None` when the op touches nothing visible.
    pub fn project_op(&self, op: &Op) -> Option<Op> {
        if let Some(field) = op.field.as_deref() {
            if !self.is_visible(field) {
                return None;
            }
        }
        let mut projected = op.clone();
        projected.collection_name = self.name.clone();
        if op.field.is_none() {
            match &mut projected.kind {
                OpKind::Add { value } | OpKind::Set { value } => {
                    *value = self.project_doc(value);
                }
                _ => {}
            }
        }
        Some(projected)
    }

    /// Check that a client op on the projection only touches visible fields.
    pub fn validate_op(&self, op: &Op) -> Result<(), ProjectionError> {
        if let Some(field) = op.field.as_deref() {
            if !self.is_visible(field) {
                return Err(self.not_visible(field));
            }
            return Ok(());
        }
        match &op.kind {
            OpKind::Add { value: Value::Object(map) } | OpKind::Set { value: Value::Object(map) } => {
                match map.keys().find(|field| !self.is_visible(field)) {
                    Some(field) => Err(self.not_visible(field)),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Map a validated client op back onto the backing collection.
    pub fn unproject_op(&self, mut op: Op) -> Op {
        op.collection_name = self.backing.clone();
        op
    }

    fn not_visible(&self, field: &str) -> ProjectionError {
        ProjectionError::FieldNotVisible {
            projection: self.name.clone(),
            field: field.to_string(),
        }
    }
}

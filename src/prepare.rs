//! Schema-aware validation of selection trees and document rendering.
//!
//! Preparing walks an unprepared selection against a [`Schema`], checks every
//! field and directive name, resolves sub-selections against leaf output
//! types, and produces an immutable, renderable tree. Prepared trees are
//! built once per execution and discarded after rendering; they are never
//! cached across schemas because every link they carry points into the schema
//! they were validated against.

use std::fmt;
use std::sync::Arc;

use crate::error::ValidationError;
use crate::schema::Schema;
use crate::schema::model;
use crate::selection::Directive;
use crate::selection::Field;
use crate::selection::Fields;

/// A directive validated against a schema.
#[derive(Debug, Clone)]
pub struct PreparedDirective {
    name: String,
    schema_directive: Arc<model::Directive>,
}

impl PreparedDirective {
    /// The directive name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema declaration this directive resolved to.
    pub fn definition(&self) -> &Arc<model::Directive> {
        &self.schema_directive
    }
}

impl fmt::Display for PreparedDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)
    }
}

impl Directive {
    /// Validate this directive against the schema's directive registry.
    pub fn prepare(&self, schema: &Schema) -> Result<PreparedDirective, ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyDirectiveName);
        }
        let schema_directive = schema
            .directive(&self.name)
            .ok_or_else(|| ValidationError::UnknownDirective {
                directive: self.name.clone(),
            })?
            .clone();
        Ok(PreparedDirective {
            name: self.name.clone(),
            schema_directive,
        })
    }
}

/// A field validated against a schema, carrying its resolved schema links.
#[derive(Debug, Clone)]
pub struct PreparedField {
    parent_type: Arc<model::Type>,
    field_type: model::Field,
    name: String,
    alias: Option<String>,
    directive: Option<PreparedDirective>,
    sub_fields: Option<PreparedFields>,
}

impl PreparedField {
    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The alias the field is selected under, if any.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The schema type this field was validated on.
    pub fn parent_type(&self) -> &Arc<model::Type> {
        &self.parent_type
    }

    /// The schema field declaration this selection resolved to.
    pub fn field_type(&self) -> &model::Field {
        &self.field_type
    }
}

impl fmt::Display for PreparedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}: ")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(directive) = &self.directive {
            write!(f, " {directive}")?;
        }
        if let Some(sub_fields) = &self.sub_fields {
            write!(f, " {{ {sub_fields} }}")?;
        }
        Ok(())
    }
}

impl Field {
    /// Validate this field against its parent type.
    ///
    /// Checks run in order: the name must be non-empty, the parent type must
    /// declare the field, an attached directive must exist in the schema, and
    /// sub-selections are prepared against the field's resolved output leaf
    /// type.
    pub fn prepare(
        &self,
        parent_type: &Arc<model::Type>,
        schema: &Schema,
    ) -> Result<PreparedField, ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyFieldName);
        }

        let field_type = parent_type
            .field(&self.name)
            .ok_or_else(|| ValidationError::UnknownField {
                field: self.name.clone(),
                parent: parent_type.name.clone().unwrap_or_default(),
            })?
            .clone();

        let directive = self
            .directive
            .as_ref()
            .map(|directive| directive.prepare(schema))
            .transpose()?;

        let sub_fields = match &self.sub_fields {
            Some(sub_fields) => {
                let output_type =
                    field_type
                        .output_type(schema)
                        .ok_or_else(|| ValidationError::UndefinedType {
                            name: field_type
                                .ty
                                .leaf_type_name()
                                .unwrap_or_default()
                                .to_string(),
                        })?;
                Some(sub_fields.prepare(output_type, schema)?)
            }
            None => None,
        };

        Ok(PreparedField {
            parent_type: parent_type.clone(),
            field_type,
            name: self.name.clone(),
            alias: self.alias.clone(),
            directive,
            sub_fields,
        })
    }
}

/// A selection set validated against a schema, ready for rendering.
#[derive(Debug, Clone)]
pub struct PreparedFields {
    fields: Vec<PreparedField>,
}

impl PreparedFields {
    /// The prepared fields, in the selection's first-occurrence order.
    pub fn iter(&self) -> impl Iterator<Item = &PreparedField> {
        self.fields.iter()
    }
}

/// Renders the GraphQL selection-set text, deterministic and
/// order-preserving.
impl fmt::Display for PreparedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = self.fields.iter();
        if let Some(field) = fields.next() {
            write!(f, "{field}")?;
        }
        for field in fields {
            write!(f, " {field}")?;
        }
        Ok(())
    }
}

impl Fields {
    /// Validate every selected field against the parent type.
    pub fn prepare(
        &self,
        parent_type: &Arc<model::Type>,
        schema: &Schema,
    ) -> Result<PreparedFields, ValidationError> {
        let fields = self
            .selected
            .iter()
            .map(|field| field.prepare(parent_type, schema))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PreparedFields { fields })
    }
}

//! Typed representation of GraphQL introspection entities.
//!
//! The type graph is cyclic (a type may reference itself through its own
//! fields), so cross-references are kept by name and resolved against the
//! schema's type registry instead of being owned pointers.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::json_ext::deserialize_null_default;
use crate::schema::Schema;

/// The kind of a GraphQL schema type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Object,
    Scalar,
    NonNull,
    List,
    Interface,
    Enum,
    InputObject,
    Union,
}

/// A reference to a schema type, possibly wrapped in `NON_NULL`/`LIST`
/// modifiers.
///
/// Exactly one of `name` or `of_type` leads to a concrete named type; a
/// reference is only usable for validation once the registry it points into
/// has been built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    /// The kind of the referenced type, or of the wrapping modifier.
    pub kind: Kind,

    /// The name of the referenced type; `None` on modifier wrappers.
    #[serde(default)]
    pub name: Option<String>,

    /// The wrapped reference for `NON_NULL` and `LIST` kinds.
    #[serde(default)]
    pub of_type: Option<Box<TypeRef>>,
}

impl TypeRef {
    /// The name of the innermost named type after stripping all modifiers.
    pub fn leaf_type_name(&self) -> Option<&str> {
        match &self.of_type {
            Some(inner) => inner.leaf_type_name(),
            None => self.name.as_deref(),
        }
    }

    /// Resolve the innermost named type against the given schema's registry.
    pub fn leaf_type<'a>(&self, schema: &'a Schema) -> Option<&'a Arc<Type>> {
        schema.get(self.leaf_type_name()?)
    }

    pub(crate) fn check_resolvable(&self, names: &HashSet<String>) {
        if let Some(leaf) = self.leaf_type_name()
            && !names.contains(leaf)
        {
            tracing::trace!("type reference `{leaf}` does not resolve to a declared type");
        }
    }
}

/// Displays the GraphQL text form of the reference, e.g. `[Character!]`.
impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.of_type) {
            (Kind::NonNull, Some(inner)) => write!(f, "{inner}!"),
            (Kind::List, Some(inner)) => write!(f, "[{inner}]"),
            _ => write!(f, "{}", self.name.as_deref().unwrap_or_default()),
        }
    }
}

/// An input argument of a field or directive, or a field of an input object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValue {
    /// The argument name.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// The argument type.
    #[serde(rename = "type")]
    pub ty: TypeRef,

    /// The GraphQL literal text of the default value, if any.
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// A field of an object or interface type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// The field name.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// The field arguments.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: Vec<InputValue>,

    /// The field output type reference.
    #[serde(rename = "type")]
    pub ty: TypeRef,

    #[serde(default)]
    pub is_deprecated: Option<bool>,

    #[serde(default)]
    pub deprecation_reason: Option<String>,
}

impl Field {
    /// Look up an argument by name.
    pub fn arg(&self, name: &str) -> Option<&InputValue> {
        self.args.iter().find(|arg| arg.name == name)
    }

    /// The resolved output leaf type of this field, stripped of modifiers.
    pub fn output_type<'a>(&self, schema: &'a Schema) -> Option<&'a Arc<Type>> {
        self.ty.leaf_type(schema)
    }
}

/// A value of an enum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValue {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub is_deprecated: Option<bool>,

    #[serde(default)]
    pub deprecation_reason: Option<String>,
}

/// A directive declared by the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    /// The directive name, without the leading `@`.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// The locations the directive may be applied at.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub locations: Vec<String>,

    /// The directive arguments.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: Vec<InputValue>,
}

impl Directive {
    /// Look up an argument by name.
    pub fn arg(&self, name: &str) -> Option<&InputValue> {
        self.args.iter().find(|arg| arg.name == name)
    }
}

/// A GraphQL schema type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Type {
    pub kind: Kind,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// The fields of an object or interface type; empty otherwise.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub fields: Vec<Field>,

    /// The fields of an input object type; empty otherwise.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub input_fields: Vec<InputValue>,

    /// The interfaces implemented by an object type.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub interfaces: Vec<TypeRef>,

    /// The values of an enum type.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub enum_values: Vec<EnumValue>,

    /// The member types of a union or the implementers of an interface.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub possible_types: Vec<TypeRef>,

    // Derived name lookup, built by `resolve` once the registry exists.
    #[serde(skip)]
    field_index: HashMap<String, usize>,
}

impl Type {
    /// Look up a field by name.
    ///
    /// Backed by an index built after parsing; if the introspection document
    /// declared duplicate field names the last one wins.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index
            .get(name)
            .map(|index| &self.fields[*index])
    }

    /// Second parsing pass: build the derived field lookup and verify every
    /// contained type reference points at a declared type.
    ///
    /// Required because introspection expresses the (possibly cyclic) type
    /// graph by name, so references can only be checked once every type has
    /// been constructed.
    pub(crate) fn resolve(&mut self, names: &HashSet<String>) {
        self.field_index = self
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.name.clone(), index))
            .collect();

        for field in &self.fields {
            field.ty.check_resolvable(names);
        }
        for input_field in &self.input_fields {
            input_field.ty.check_resolvable(names);
        }
        for interface in &self.interfaces {
            interface.check_resolvable(names);
        }
        for possible_type in &self.possible_types {
            possible_type.check_resolvable(names);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn character_list_ref() -> TypeRef {
        serde_json_bytes::from_value(json!({
            "kind": "NON_NULL",
            "name": null,
            "ofType": {
                "kind": "LIST",
                "name": null,
                "ofType": {"kind": "OBJECT", "name": "Character", "ofType": null}
            }
        }))
        .unwrap()
    }

    #[test]
    fn leaf_type_name_strips_modifiers() {
        assert_eq!(character_list_ref().leaf_type_name(), Some("Character"));
    }

    #[test]
    fn displays_graphql_type_notation() {
        assert_eq!(character_list_ref().to_string(), "[Character]!");
    }

    #[test]
    fn kind_uses_introspection_spelling() {
        let kind: Kind = serde_json_bytes::from_value(json!("INPUT_OBJECT")).unwrap();
        assert_eq!(kind, Kind::InputObject);
    }

    #[test]
    fn null_member_lists_deserialize_to_empty() {
        let ty: Type = serde_json_bytes::from_value(json!({
            "kind": "SCALAR",
            "name": "String",
            "fields": null,
            "inputFields": null,
            "interfaces": null,
            "enumValues": null,
            "possibleTypes": null
        }))
        .unwrap();
        assert!(ty.fields.is_empty());
        assert!(ty.enum_values.is_empty());
    }

    #[test]
    fn field_lookup_is_last_write_wins() {
        let mut ty: Type = serde_json_bytes::from_value(json!({
            "kind": "OBJECT",
            "name": "Query",
            "fields": [
                {"name": "hero", "type": {"kind": "OBJECT", "name": "Character"}, "description": "first"},
                {"name": "hero", "type": {"kind": "OBJECT", "name": "Character"}, "description": "second"}
            ]
        }))
        .unwrap();
        ty.resolve(&HashSet::from(["Character".to_string()]));
        assert_eq!(
            ty.field("hero").and_then(|f| f.description.as_deref()),
            Some("second")
        );
    }
}

//! GraphQL schema introspection model and parser.

pub mod model;
mod parser;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json_bytes::Value;

use crate::error::SchemaError;
use crate::schema::model::Directive;
use crate::schema::model::Type;
use crate::schema::parser::ParseResult;

/// A parsed GraphQL schema, the validation context for every prepared
/// selection.
///
/// Construction is the only place parsing occurs; a `Schema` is immutable
/// thereafter and can be shared read-only without synchronization.
#[derive(Clone)]
pub struct Schema {
    raw: Value,
    query_type: Option<Arc<Type>>,
    mutation_type: Option<Arc<Type>>,
    subscription_type: Option<Arc<Type>>,
    types: HashMap<String, Arc<Type>>,
    directives: Option<HashMap<String, Arc<Directive>>>,
}

impl Schema {
    /// Parse a raw introspection document into a `Schema`.
    pub fn parse(raw: Value) -> Result<Self, SchemaError> {
        let ParseResult {
            query_type,
            mutation_type,
            subscription_type,
            types,
            directives,
        } = parser::parse(&raw)?;
        tracing::debug!("schema successfully introspected");
        Ok(Self {
            raw,
            query_type,
            mutation_type,
            subscription_type,
            types,
            directives,
        })
    }

    /// The raw introspection document this schema was parsed from.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Type>> {
        self.types.get(name)
    }

    /// The root type for `query` operations.
    pub fn query_type(&self) -> Option<&Arc<Type>> {
        self.query_type.as_ref()
    }

    /// The root type for `mutation` operations, if the server exposes one.
    pub fn mutation_type(&self) -> Option<&Arc<Type>> {
        self.mutation_type.as_ref()
    }

    /// The root type for `subscription` operations, if the server exposes one.
    pub fn subscription_type(&self) -> Option<&Arc<Type>> {
        self.subscription_type.as_ref()
    }

    /// Look up a directive by name.
    ///
    /// Returns `None` both for unknown names and for schemas that declare no
    /// directives at all.
    pub fn directive(&self, name: &str) -> Option<&Arc<Directive>> {
        self.directives.as_ref()?.get(name)
    }

    /// The directive registry, `None` when the introspection document
    /// declared zero directives.
    pub fn directives(&self) -> Option<&HashMap<String, Arc<Directive>>> {
        self.directives.as_ref()
    }
}

/// Equality is structural on the raw introspection document.
impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Schema {}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("query_type", &self.query_type.as_ref().and_then(|ty| ty.name.clone()))
            .field("mutation_type", &self.mutation_type.as_ref().and_then(|ty| ty.name.clone()))
            .field(
                "subscription_type",
                &self.subscription_type.as_ref().and_then(|ty| ty.name.clone()),
            )
            .field("types", &self.types.len())
            .finish()
    }
}

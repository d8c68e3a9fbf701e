//! Parses a raw introspection document into the schema registries.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json_bytes::Value;

use crate::error::SchemaError;
use crate::json_ext::deserialize_null_default;
use crate::schema::model::Directive;
use crate::schema::model::Type;

/// The raw shape of a standard introspection result.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIntrospection {
    #[serde(default)]
    query_type: Option<RootType>,
    #[serde(default)]
    mutation_type: Option<RootType>,
    #[serde(default)]
    subscription_type: Option<RootType>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    types: Vec<Type>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    directives: Vec<Directive>,
}

#[derive(Deserialize)]
struct RootType {
    #[serde(default)]
    name: Option<String>,
}

/// The parsed registries of an introspection document.
pub(crate) struct ParseResult {
    pub(crate) query_type: Option<Arc<Type>>,
    pub(crate) mutation_type: Option<Arc<Type>>,
    pub(crate) subscription_type: Option<Arc<Type>>,
    pub(crate) types: HashMap<String, Arc<Type>>,
    /// `None` when the document declares zero directives, as opposed to an
    /// empty-but-present registry.
    pub(crate) directives: Option<HashMap<String, Arc<Directive>>>,
}

/// Parse a raw introspection document.
///
/// Types are built in two passes: all of them are constructed first, then
/// each one is resolved against the complete registry. A single pass can not
/// work because types reference each other by name before all types exist.
pub(crate) fn parse(raw: &Value) -> Result<ParseResult, SchemaError> {
    let raw: RawIntrospection = serde_json_bytes::from_value(raw.clone())?;

    if raw.types.is_empty() {
        return Err(SchemaError::NoTypesFound);
    }

    let mut types = raw.types;
    let names: HashSet<String> = types.iter().filter_map(|ty| ty.name.clone()).collect();
    for ty in &mut types {
        ty.resolve(&names);
    }

    let types: HashMap<String, Arc<Type>> = types
        .into_iter()
        .filter_map(|ty| ty.name.clone().map(|name| (name, Arc::new(ty))))
        .collect();

    let extract = |root: &Option<RootType>| -> Option<Arc<Type>> {
        root.as_ref()
            .and_then(|root| root.name.as_deref())
            .and_then(|name| types.get(name))
            .cloned()
    };

    let directives = if raw.directives.is_empty() {
        None
    } else {
        Some(
            raw.directives
                .into_iter()
                .map(|directive| (directive.name.clone(), Arc::new(directive)))
                .collect(),
        )
    };

    Ok(ParseResult {
        query_type: extract(&raw.query_type),
        mutation_type: extract(&raw.mutation_type),
        subscription_type: extract(&raw.subscription_type),
        types,
        directives,
    })
}

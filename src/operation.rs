//! Operation document construction.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::error::ValidationError;
use crate::graphql::Request;
use crate::json_ext::JsonMap;
use crate::json_ext::Object;
use crate::schema::Schema;
use crate::selection::Field;
use crate::selection::Fields;
use crate::selection::Selection;

/// The kind of a GraphQL operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A root-field invocation, rendered into a GraphQL document once validated.
///
/// The operation selects a single field on the root operation type of its
/// kind, with an optional sub-selection. Variables ride in the request
/// payload; the document itself declares none because field arguments are
/// outside the selection model.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Operation {
    /// The operation kind, deciding which root type validates the field.
    pub kind: OperationKind,

    /// The root field to invoke.
    pub field: String,

    /// The sub-selection on the root field's output type.
    pub selection: Option<Fields>,

    /// The variables sent with the request payload.
    pub variables: Object,

    /// The operation name; defaults to the root field name when absent.
    pub operation_name: Option<String>,
}

#[buildstructor::buildstructor]
impl Operation {
    /// Returns a builder that builds an [`Operation`].
    ///
    /// Builder methods:
    ///
    /// * `.kind(`[`OperationKind`]`)` — required.
    /// * `.field(impl Into<`[`String`]`>)` — required.
    /// * `.selection(impl Into<`[`Fields`]`>)` — optional.
    /// * `.variables(...)` / `.variable(key, value)` — optional.
    /// * `.operation_name(impl Into<`[`String`]`>)` — optional.
    /// * `.build()`
    #[builder(visibility = "pub")]
    fn new(
        kind: OperationKind,
        field: String,
        selection: Option<Fields>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        variables: JsonMap<ByteString, Value>,
        operation_name: Option<String>,
    ) -> Self {
        Self {
            kind,
            field,
            selection,
            variables,
            operation_name,
        }
    }

    /// Validate the operation against the schema and render its document.
    ///
    /// The root field and its sub-selection are prepared against the root
    /// operation type for `kind`; a schema that exposes no such root fails
    /// with [`ValidationError::MissingOperationRoot`].
    pub fn prepare(&self, schema: &Schema) -> Result<Request, ValidationError> {
        let root_type = match self.kind {
            OperationKind::Query => schema.query_type(),
            OperationKind::Mutation => schema.mutation_type(),
            OperationKind::Subscription => schema.subscription_type(),
        }
        .ok_or(ValidationError::MissingOperationRoot(self.kind))?;

        let root_field = Field::builder()
            .name(self.field.clone())
            .and_sub_fields(self.selection.clone())
            .build();
        let prepared = Fields::new(Selection::Field(root_field)).prepare(root_type, schema)?;

        let operation_name = self
            .operation_name
            .clone()
            .unwrap_or_else(|| self.field.clone());
        let query = format!("{} {} {{ {} }}", self.kind, operation_name, prepared);

        Ok(Request::builder()
            .query(query)
            .operation_name(operation_name)
            .variables(self.variables.clone())
            .build())
    }
}

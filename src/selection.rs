//! Schema-free composition of selection trees.
//!
//! Selections are built from strings, nested pairs, sequences or other
//! selection values, deduplicated structurally, and only checked against a
//! [`Schema`](crate::schema::Schema) when prepared. This allows selection
//! fragments to be composed and combined before any schema is available.

use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::ops::Add;
use std::ops::BitAnd;

use indexmap::IndexMap;

/// A `@name` annotation attachable to a selected field.
///
/// Validated against the schema's directive registry during preparation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Directive {
    pub(crate) name: String,
}

impl Directive {
    /// Create a directive from its name, without the leading `@`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The directive name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A single selected field.
///
/// Identity is structural: two fields are the same selection when their
/// `(alias, name, directive, sub_fields)` tuples are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) alias: Option<String>,
    pub(crate) directive: Option<Directive>,
    pub(crate) sub_fields: Option<Fields>,
}

#[buildstructor::buildstructor]
impl Field {
    /// Returns a builder for a selected [`Field`].
    ///
    /// Builder methods:
    ///
    /// * `.name(impl Into<`[`String`]`>)` — required.
    /// * `.alias(impl Into<`[`String`]`>)` — optional.
    /// * `.directive(`[`Directive`]`)` — optional.
    /// * `.sub_fields(impl Into<`[`Fields`]`>)` — optional.
    /// * `.build()`
    #[builder(visibility = "pub")]
    fn new(
        name: String,
        alias: Option<String>,
        directive: Option<Directive>,
        sub_fields: Option<Fields>,
    ) -> Self {
        Self {
            name,
            alias,
            directive,
            sub_fields,
        }
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        Field {
            name: name.to_string(),
            alias: None,
            directive: None,
            sub_fields: None,
        }
    }
}

impl From<String> for Field {
    fn from(name: String) -> Self {
        Field {
            name,
            alias: None,
            directive: None,
            sub_fields: None,
        }
    }
}

/// A selection input, normalized into [`Fields`] on construction.
///
/// The variant set is closed: every accepted input shape has exactly one
/// normalization rule, so invalid selection inputs are unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A bare field name; trimmed, dropped when empty.
    Name(String),
    /// An explicitly constructed field.
    Field(Field),
    /// A field name with a nested sub-selection.
    Nested(String, Fields),
    /// A sequence of selections, flattened recursively.
    List(Vec<Selection>),
    /// An existing selection set, merged field by field.
    Group(Fields),
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Selection::Name(name.to_string())
    }
}

impl From<String> for Selection {
    fn from(name: String) -> Self {
        Selection::Name(name)
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

impl From<Fields> for Selection {
    fn from(fields: Fields) -> Self {
        Selection::Group(fields)
    }
}

/// `(name, selection)` pairs select a field with a nested sub-selection; an
/// empty sub-selection yields a bare field.
impl<K, V> From<(K, V)> for Selection
where
    K: Into<String>,
    V: Into<Selection>,
{
    fn from((name, selection): (K, V)) -> Self {
        Selection::Nested(name.into(), Fields::new(selection))
    }
}

impl<T> From<Vec<T>> for Selection
where
    T: Into<Selection>,
{
    fn from(items: Vec<T>) -> Self {
        Selection::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T, const N: usize> From<[T; N]> for Selection
where
    T: Into<Selection>,
{
    fn from(items: [T; N]) -> Self {
        Selection::List(items.into_iter().map(Into::into).collect())
    }
}

/// `None` selects nothing, so `("hero", None::<Selection>)` is the bare field
/// `hero`.
impl<T> From<Option<T>> for Selection
where
    T: Into<Selection>,
{
    fn from(selection: Option<T>) -> Self {
        match selection {
            Some(selection) => selection.into(),
            None => Selection::List(Vec::new()),
        }
    }
}

impl From<Selection> for Fields {
    fn from(selection: Selection) -> Self {
        Fields::new(selection)
    }
}

/// An ordered selection of fields, deduplicated by structural identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Fields {
    pub(crate) selected: Vec<Field>,
}

impl Fields {
    /// Build a selection set from any [`Selection`] input shape.
    ///
    /// Later occurrences of a structurally identical field replace earlier
    /// ones while keeping the first occurrence's position.
    pub fn new(selection: impl Into<Selection>) -> Self {
        let mut fields = IndexMap::new();
        insert_selection(&mut fields, selection.into());
        Self {
            selected: fields.into_values().collect(),
        }
    }

    /// The selected fields, in first-occurrence order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.selected.iter()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// True if a structurally identical field is part of this selection.
    pub fn contains(&self, field: &Field) -> bool {
        self.selected.contains(field)
    }
}

fn structural_key(field: &Field) -> u64 {
    let mut hasher = DefaultHasher::new();
    field.hash(&mut hasher);
    hasher.finish()
}

fn insert_field(fields: &mut IndexMap<u64, Field>, field: Field) {
    // IndexMap keeps the first occurrence's position on replacement.
    fields.insert(structural_key(&field), field);
}

fn insert_selection(fields: &mut IndexMap<u64, Field>, selection: Selection) {
    match selection {
        Selection::Name(name) => {
            let name = name.trim();
            if name.is_empty() {
                return;
            }
            insert_field(fields, Field::from(name));
        }
        Selection::Field(field) => insert_field(fields, field),
        Selection::Nested(name, sub_fields) => {
            let sub_fields = (!sub_fields.is_empty()).then_some(sub_fields);
            insert_field(
                fields,
                Field {
                    name,
                    alias: None,
                    directive: None,
                    sub_fields,
                },
            );
        }
        Selection::List(items) => {
            for item in items {
                insert_selection(fields, item);
            }
        }
        Selection::Group(group) => {
            for field in group.selected {
                insert_field(fields, field);
            }
        }
    }
}

/// Combining two selections produces their structural union.
impl<R: Into<Selection>> Add<R> for Fields {
    type Output = Fields;

    fn add(self, other: R) -> Fields {
        Fields::new(Selection::List(vec![Selection::Group(self), other.into()]))
    }
}

/// Synonym for `+`.
impl<R: Into<Selection>> BitAnd<R> for Fields {
    type Output = Fields;

    fn bitand(self, other: R) -> Fields {
        self + other
    }
}

impl<R: Into<Selection>> Add<R> for Field {
    type Output = Fields;

    fn add(self, other: R) -> Fields {
        Fields::new(Selection::List(vec![Selection::Field(self), other.into()]))
    }
}

impl<R: Into<Selection>> BitAnd<R> for Field {
    type Output = Fields;

    fn bitand(self, other: R) -> Fields {
        self + other
    }
}

//! Field collection: `@skip`/`@include`, fragment inlining and merging of
//! fields that share a response key.

use crate::coerce::Variables;
use crate::schema::{Schema, TypeId};
use indexmap::IndexMap;
use quill_syntax::{Directive, Document, FieldSelection, Selection, SelectionSet, Value};
use rustc_hash::FxHashSet;

/// Fields grouped by response key, in document order.
pub type GroupedFields<'d> = IndexMap<&'d str, Vec<&'d FieldSelection>>;

/// Collects the fields selected on a value of `object_type`.
///
/// Several selection sets can be merged at once; this is how the
/// sub-selections of fields sharing a response key are combined.
pub fn collect_fields<'d, I>(
    schema: &Schema,
    document: &'d Document,
    object_type: TypeId,
    selection_sets: I,
    variables: &Variables,
) -> GroupedFields<'d>
where
    I: IntoIterator<Item = &'d SelectionSet>,
{
    let mut collector = Collector {
        schema,
        document,
        object_type,
        variables,
        visited_fragments: FxHashSet::default(),
        grouped: IndexMap::new(),
    };
    for set in selection_sets {
        collector.collect(set);
    }
    collector.grouped
}

struct Collector<'s, 'd> {
    schema: &'s Schema,
    document: &'d Document,
    object_type: TypeId,
    variables: &'s Variables,
    visited_fragments: FxHashSet<&'d str>,
    grouped: GroupedFields<'d>,
}

impl<'d> Collector<'_, 'd> {
    fn collect(&mut self, set: &'d SelectionSet) {
        for selection in &set.selections {
            if !should_include(selection.directives(), self.variables) {
                continue;
            }
            match selection {
                Selection::Field(field) => {
                    self.grouped
                        .entry(field.response_key())
                        .or_default()
                        .push(field);
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    if !self.visited_fragments.insert(name) {
                        continue;
                    }
                    let Some(fragment) = self.document.fragment(name) else {
                        continue;
                    };
                    if self.applies(fragment.type_condition.as_str()) {
                        self.collect(&fragment.selection_set);
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline
                        .type_condition
                        .as_ref()
                        .map_or(true, |condition| self.applies(condition.as_str()));
                    if applies {
                        self.collect(&inline.selection_set);
                    }
                }
            }
        }
    }

    fn applies(&self, condition: &str) -> bool {
        self.schema
            .type_id(condition)
            .is_some_and(|id| self.schema.type_applies(id, self.object_type))
    }
}

/// Evaluates `@skip` and `@include` on a selection.
pub fn should_include(directives: &[Directive], variables: &Variables) -> bool {
    for directive in directives {
        match directive.name.as_str() {
            "skip" if if_argument(directive, variables) => return false,
            "include" if !if_argument(directive, variables) => return false,
            _ => {}
        }
    }
    true
}

fn if_argument(directive: &Directive, variables: &Variables) -> bool {
    match directive.argument("if").map(|a| &a.value) {
        Some(Value::Boolean(b, _)) => *b,
        Some(Value::Variable(name)) => variables
            .get(name.as_str())
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, InterfaceDef, ObjectDef, SchemaBuilder, TypeRef};
    use serde_json::json;

    fn schema() -> Schema {
        let name = || FieldDef::new("name", TypeRef::named("String"));
        SchemaBuilder::new()
            .add_type(InterfaceDef::new("Named").with_field(name()))
            .add_type(ObjectDef::new("User").implements("Named").with_field(name()))
            .add_type(ObjectDef::new("Pet").implements("Named").with_field(name()))
            .add_type(
                ObjectDef::new("Query")
                    .with_field(FieldDef::new("a", TypeRef::named("Int")))
                    .with_field(FieldDef::new("b", TypeRef::named("Int")))
                    .with_field(FieldDef::new("named", TypeRef::named("Named"))),
            )
            .build()
            .unwrap()
    }

    fn keys(source: &str, type_name: &str, variables: &Variables) -> Vec<String> {
        let schema = schema();
        let document = quill_syntax::parse(source).into_result().unwrap();
        let operation = document.operations().next().unwrap();
        let object_type = schema.type_id(type_name).unwrap();
        collect_fields(&schema, &document, object_type, [&operation.selection_set], variables)
            .keys()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_merges_by_response_key() {
        let schema = schema();
        let document = quill_syntax::parse("{ a x: b a }").into_result().unwrap();
        let operation = document.operations().next().unwrap();
        let grouped = collect_fields(
            &schema,
            &document,
            schema.query_type(),
            [&operation.selection_set],
            &Variables::new(),
        );
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec!["a", "x"]);
        assert_eq!(grouped["a"].len(), 2);
    }

    #[test]
    fn test_skip_and_include() {
        let mut vars = Variables::new();
        vars.insert("yes".into(), json!(true));
        assert_eq!(
            keys("query ($yes: Boolean) { a @skip(if: $yes) b @include(if: $yes) }", "Query", &vars),
            vec!["b"]
        );
        assert_eq!(
            keys("{ a @include(if: false) b @skip(if: false) }", "Query", &Variables::new()),
            vec!["b"]
        );
    }

    #[test]
    fn test_fragments_respect_type_conditions() {
        let source = "{ ...Shared ... on Pet { petOnly: name } ... on Named { name } } fragment Shared on User { shared: name }";
        let vars = Variables::new();
        assert_eq!(keys(source, "User", &vars), vec!["shared", "name"]);
        assert_eq!(keys(source, "Pet", &vars), vec!["petOnly", "name"]);
    }

    #[test]
    fn test_fragment_spread_once() {
        let source = "{ ...F ...F } fragment F on Query { a }";
        assert_eq!(keys(source, "Query", &Variables::new()), vec!["a"]);
    }
}

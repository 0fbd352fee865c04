//! Exercises `ValueReader` from outside the crate against a small fixture
//! implementation of `NativeValue`. `MockValue` (src/value/mod.rs's own
//! `#[cfg(test)]` fixture) isn't visible here, so this file builds its own —
//! the trait itself is fully public, which is exactly what makes the Value
//! Reader testable without a real ICorDebug binding.

use netdbg::model::sentinel;
use netdbg::value::{ComputedProperty, NamedChild, NativeValue, ScalarValue, Specialized, ValueReader};
use std::collections::HashSet;

#[derive(Clone)]
enum Node {
    Scalar(i32),
    Str(String),
    Null,
    Ref { addr: u64, target: Box<Node> },
    Object { type_name: String, fields: Vec<(String, Node)> },
    CompilerGenerated { fields: Vec<(String, Node)> },
    Enum { raw: i64, member: Option<String> },
    NullableSome(Box<Node>),
    NullableNone,
    Array(Vec<Node>),
    List(Vec<Node>),
    Dictionary(Vec<(Node, Node)>),
    Formatted(String),
}

struct Fixture(Node);

impl NativeValue for Fixture {
    fn type_name(&self) -> String {
        match &self.0 {
            Node::Scalar(_) => "System.Int32".to_string(),
            Node::Str(_) => "System.String".to_string(),
            Node::Null | Node::Ref { .. } => "Fixture.Ref".to_string(),
            Node::Object { type_name, .. } => type_name.clone(),
            Node::CompilerGenerated { .. } => "Fixture.<>c__DisplayClass".to_string(),
            Node::Enum { .. } => "Fixture.Color".to_string(),
            Node::NullableSome(_) | Node::NullableNone => "System.Nullable`1".to_string(),
            Node::Array(_) => "Fixture.Item[]".to_string(),
            Node::List(_) => "System.Collections.Generic.List`1".to_string(),
            Node::Dictionary(_) => "System.Collections.Generic.Dictionary`2".to_string(),
            Node::Formatted(_) => "Fixture.Formatted".to_string(),
        }
    }

    fn is_reference(&self) -> bool {
        matches!(self.0, Node::Null | Node::Ref { .. })
    }

    fn heap_address(&self) -> Option<u64> {
        match &self.0 {
            Node::Ref { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    fn as_scalar(&self) -> Option<ScalarValue> {
        match &self.0 {
            Node::Scalar(v) => Some(ScalarValue::I32(*v)),
            _ => None,
        }
    }

    fn as_string(&self) -> Option<String> {
        match &self.0 {
            Node::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn is_null_reference(&self) -> bool {
        matches!(self.0, Node::Null)
    }

    fn dereference(&self) -> Result<Box<dyn NativeValue>, anyhow::Error> {
        match &self.0 {
            Node::Ref { target, .. } => Ok(Box::new(Fixture((**target).clone()))),
            _ => Err(anyhow::anyhow!("not a reference")),
        }
    }

    fn is_array(&self) -> bool {
        matches!(self.0, Node::Array(_))
    }

    fn array_len(&self) -> usize {
        match &self.0 {
            Node::Array(items) => items.len(),
            _ => 0,
        }
    }

    fn array_element(&self, index: usize) -> Result<Box<dyn NativeValue>, anyhow::Error> {
        match &self.0 {
            Node::Array(items) => Ok(Box::new(Fixture(items[index].clone()))),
            _ => Err(anyhow::anyhow!("not an array")),
        }
    }

    fn is_enum(&self) -> bool {
        matches!(self.0, Node::Enum { .. })
    }

    fn enum_member_name(&self) -> Result<(i64, Option<String>), anyhow::Error> {
        match &self.0 {
            Node::Enum { raw, member } => Ok((*raw, member.clone())),
            _ => Err(anyhow::anyhow!("not an enum")),
        }
    }

    fn is_nullable(&self) -> bool {
        matches!(self.0, Node::NullableSome(_) | Node::NullableNone)
    }

    fn nullable_parts(&self) -> Result<(bool, Option<Box<dyn NativeValue>>), anyhow::Error> {
        match &self.0 {
            Node::NullableSome(inner) => Ok((true, Some(Box::new(Fixture((**inner).clone()))))),
            Node::NullableNone => Ok((false, None)),
            _ => Err(anyhow::anyhow!("not nullable")),
        }
    }

    fn is_compiler_generated_state(&self) -> bool {
        matches!(self.0, Node::CompilerGenerated { .. })
    }

    fn fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
        match &self.0 {
            Node::Object { fields, .. } | Node::CompilerGenerated { fields } => Ok(fields
                .iter()
                .map(|(name, value)| NamedChild {
                    name: name.clone(),
                    value: Box::new(Fixture(value.clone())),
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn computed_properties(&self, _field_names: &HashSet<String>) -> Result<Vec<ComputedProperty>, anyhow::Error> {
        Ok(Vec::new())
    }

    fn static_fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
        Ok(Vec::new())
    }

    fn as_specialized(&self) -> Option<Specialized> {
        match &self.0 {
            Node::List(items) => Some(Specialized::List(
                items.iter().map(|v| Box::new(Fixture(v.clone())) as Box<dyn NativeValue>).collect(),
            )),
            Node::Dictionary(pairs) => Some(Specialized::Dictionary(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        (
                            Box::new(Fixture(k.clone())) as Box<dyn NativeValue>,
                            Box::new(Fixture(v.clone())) as Box<dyn NativeValue>,
                        )
                    })
                    .collect(),
            )),
            Node::Formatted(s) => Some(Specialized::Formatted(s.clone())),
            _ => None,
        }
    }
}

fn obj(type_name: &str, fields: Vec<(&str, Node)>) -> Node {
    Node::Object {
        type_name: type_name.to_string(),
        fields: fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
    }
}

#[test]
fn scalar_and_string_are_leaves() {
    let mut reader = ValueReader::new();
    let info = reader.read("count", &Fixture(Node::Scalar(42)));
    assert_eq!(info.value, "42");
    assert!(info.children.is_empty());

    let info = reader.read("name", &Fixture(Node::Str("hello".to_string())));
    assert_eq!(info.value, "hello");
}

#[test]
fn null_reference_short_circuits_before_dereference() {
    let mut reader = ValueReader::new();
    let info = reader.read("target", &Fixture(Node::Null));
    assert_eq!(info.value, sentinel::NULL);
    assert!(info.children.is_empty());
}

#[test]
fn mutually_referencing_objects_detect_the_cycle_on_the_second_hop() {
    // root (addr 1) -> next (addr 2) -> next (addr 1, back-edge). Both ends
    // of the cycle are reached through `Ref` nodes so their addresses land
    // in the visited set; the back-edge's own target is never dereferenced
    // because the address check short-circuits first.
    let node2 = obj(
        "Fixture.Node",
        vec![
            ("value", Node::Scalar(2)),
            ("next", Node::Ref { addr: 1, target: Box::new(Node::Scalar(0)) }),
        ],
    );
    let node1 = obj("Fixture.Node", vec![("value", Node::Scalar(1)), ("next", Node::Ref { addr: 2, target: Box::new(node2) })]);
    let root = Node::Ref { addr: 1, target: Box::new(node1) };

    let mut reader = ValueReader::new();
    let info = reader.read("head", &Fixture(root));

    let next = info.children.iter().find(|c| c.name == "next").unwrap();
    let grandchild_next = next.children.iter().find(|c| c.name == "next").unwrap();
    assert_eq!(grandchild_next.value, sentinel::CIRCULAR);
}

#[test]
fn nested_objects_are_truncated_past_the_depth_cap() {
    // root -> L2 -> L3 -> L4 -> leaf, four plain (non-reference) hops;
    // MAX_DEPTH is 3, so the fifth level never gets expanded at all.
    let leaf = Node::Scalar(5);
    let l4 = obj("Fixture.L4", vec![("inner", leaf)]);
    let l3 = obj("Fixture.L3", vec![("inner", l4)]);
    let l2 = obj("Fixture.L2", vec![("inner", l3)]);
    let l1 = obj("Fixture.L1", vec![("inner", l2)]);

    let mut reader = ValueReader::new();
    let info = reader.read("root", &Fixture(l1));

    let l2_node = &info.children[0];
    let l3_node = &l2_node.children[0];
    let l4_node = &l3_node.children[0];
    let truncated = &l4_node.children[0];
    assert_eq!(truncated.value, sentinel::MAX_DEPTH);
    assert!(truncated.children.is_empty());
}

#[test]
fn arrays_are_truncated_to_the_element_cap() {
    let items: Vec<Node> = (0..25).map(Node::Scalar).collect();
    let mut reader = ValueReader::new();
    let info = reader.read("items", &Fixture(Node::Array(items)));
    assert_eq!(info.children.len(), 10);
    assert!(info.value.contains("length=25"));
}

#[test]
fn list_specialization_renders_count_and_truncates_elements() {
    let items: Vec<Node> = (0..15).map(Node::Scalar).collect();
    let mut reader = ValueReader::new();
    let info = reader.read("values", &Fixture(Node::List(items)));
    assert!(info.value.contains("count=15"));
    assert_eq!(info.children.len(), 10);
}

#[test]
fn dictionary_specialization_renders_key_value_pairs() {
    let pairs = vec![
        (Node::Str("a".to_string()), Node::Scalar(1)),
        (Node::Str("b".to_string()), Node::Scalar(2)),
    ];
    let mut reader = ValueReader::new();
    let info = reader.read("map", &Fixture(Node::Dictionary(pairs)));
    assert!(info.value.contains("count=2"));
    assert_eq!(info.children.len(), 2);
    assert_eq!(info.children[0].name, "[a]");
}

#[test]
fn enum_resolves_a_known_member_and_falls_back_to_raw_value() {
    let mut reader = ValueReader::new();
    let known = reader.read("color", &Fixture(Node::Enum { raw: 1, member: Some("Green".to_string()) }));
    assert!(known.value.ends_with(".Green"));

    let unknown = reader.read("color", &Fixture(Node::Enum { raw: 99, member: None }));
    assert!(unknown.value.contains("<99>"));
}

#[test]
fn nullable_some_unwraps_and_none_renders_as_null() {
    let mut reader = ValueReader::new();
    let some = reader.read("maybe", &Fixture(Node::NullableSome(Box::new(Node::Scalar(7)))));
    assert_eq!(some.value, "7");

    let none = reader.read("maybe", &Fixture(Node::NullableNone));
    assert_eq!(none.value, sentinel::NULL);
}

#[test]
fn compiler_generated_state_renames_known_fields_and_drops_infrastructure_fields() {
    let state = Node::CompilerGenerated {
        fields: vec![
            ("<>2__current".to_string(), Node::Scalar(5)),
            ("<>1__state".to_string(), Node::Scalar(-1)),
            ("<x>5__1".to_string(), Node::Str("hoisted".to_string())),
            ("<>4__this".to_string(), Node::Scalar(0)),
        ],
    };
    let mut reader = ValueReader::new();
    let info = reader.read("enumerator", &Fixture(state));
    let names: Vec<_> = info.children.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"Current"));
    assert!(names.contains(&"_state"));
    assert!(names.contains(&"x"));
    assert_eq!(names.len(), 3);
}

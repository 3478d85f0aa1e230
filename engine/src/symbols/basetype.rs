//! Nodes of the type graph.
//!
//! The graph is an arena of `BaseType` values indexed by their DWARF id;
//! all inter-type references are stored as ids and resolved through the
//! factory on demand. Polymorphic behavior lives in match statements over
//! the kind payload.

use super::alt::AltRefType;
use super::realtype::{RealType, RealTypeSet};
use super::typeinfo::TypeId;

#[derive(Debug, Clone, PartialEq)]
pub struct RefInfo {
    pub ref_type_id: TypeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerInfo {
    pub ref_type_id: TypeId,
    /// `container_of`-style adjustment supplied by the source oracle: the
    /// dereferenced target begins this many bytes before the pointer value.
    pub macro_extra_offset: i64,
    pub alt_ref_types: Vec<AltRefType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub ref_type_id: TypeId,
    /// Number of elements; -1 when unknown.
    pub length: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    /// Enumerators in declaration order.
    pub values: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMember {
    /// Empty for anonymous inner structs/unions.
    pub name: String,
    pub offset: u32,
    pub bit_size: i8,
    pub bit_offset: i8,
    pub ref_type_id: TypeId,
    pub alt_ref_types: Vec<AltRefType>,
}

impl StructuredMember {
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_bitfield(&self) -> bool {
        self.bit_size >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredInfo {
    pub members: Vec<StructuredMember>,
}

impl StructuredInfo {
    pub fn member(&self, name: &str) -> Option<&StructuredMember> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    /// Parameters in order, name plus type id.
    pub params: Vec<(String, TypeId)>,
    /// Return type id, zero for void.
    pub ref_type_id: TypeId,
    pub pc_low: u64,
    pub pc_high: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// Int/UInt/Bool of every width, Float, Double, Void, VaList.
    Numeric(RealType),
    /// Const, Volatile, Typedef.
    Lexical(RealType, RefInfo),
    Pointer(PointerInfo),
    Array(ArrayInfo),
    Enum(EnumInfo),
    Struct(StructuredInfo),
    Union(StructuredInfo),
    Function(FunctionInfo),
    FuncPointer(FunctionInfo),
}

#[derive(Debug, Clone)]
pub struct BaseType {
    pub id: TypeId,
    pub name: Option<String>,
    pub size: u32,
    pub kind: TypeKind,
    pub src_line: i32,
    /// Content fingerprint, valid after factory finalization.
    pub(crate) hash: u32,
}

impl BaseType {
    pub fn real_type(&self) -> RealType {
        match &self.kind {
            TypeKind::Numeric(rt) => *rt,
            TypeKind::Lexical(rt, _) => *rt,
            TypeKind::Pointer(_) => RealType::Pointer,
            TypeKind::Array(_) => RealType::Array,
            TypeKind::Enum(_) => RealType::Enum,
            TypeKind::Struct(_) => RealType::Struct,
            TypeKind::Union(_) => RealType::Union,
            TypeKind::Function(_) => RealType::Function,
            TypeKind::FuncPointer(_) => RealType::FuncPointer,
        }
    }

    pub fn is(&self, set: RealTypeSet) -> bool {
        self.real_type().is_in(set)
    }

    /// Content hash; stable across structurally equal types once the
    /// factory has finalized.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// The one type this type refers to, if it is a referencing kind.
    /// For functions this is the return type.
    pub fn ref_type_id(&self) -> Option<TypeId> {
        let id = match &self.kind {
            TypeKind::Lexical(_, r) => r.ref_type_id,
            TypeKind::Pointer(p) => p.ref_type_id,
            TypeKind::Array(a) => a.ref_type_id,
            TypeKind::Function(f) | TypeKind::FuncPointer(f) => f.ref_type_id,
            _ => return None,
        };
        (id != 0).then_some(id)
    }

    pub fn structured(&self) -> Option<&StructuredInfo> {
        match &self.kind {
            TypeKind::Struct(s) | TypeKind::Union(s) => Some(s),
            _ => None,
        }
    }

    pub fn structured_mut(&mut self) -> Option<&mut StructuredInfo> {
        match &mut self.kind {
            TypeKind::Struct(s) | TypeKind::Union(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerInfo> {
        match &self.kind {
            TypeKind::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayInfo> {
        match &self.kind {
            TypeKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionInfo> {
        match &self.kind {
            TypeKind::Function(f) | TypeKind::FuncPointer(f) => Some(f),
            _ => None,
        }
    }

    /// Alternatives registered on this type (pointers only).
    pub fn alt_ref_types(&self) -> &[AltRefType] {
        match &self.kind {
            TypeKind::Pointer(p) => &p.alt_ref_types,
            _ => &[],
        }
    }
}

/// A named global with an address.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: i32,
    pub name: String,
    pub address: u64,
    pub ref_type_id: TypeId,
    pub alt_ref_types: Vec<AltRefType>,
    pub src_line: i32,
}

//! Transient records handed over by the upstream debug-symbol reader.
//!
//! One record per DWARF DIE of interest. The factory consumes and discards
//! them during assembly; they never outlive parsing. The records are
//! serde-derived so any external producer can stream them as JSON lines.

use serde::{Deserialize, Serialize};

use super::realtype::RealType;

pub type TypeId = i32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rec")]
pub enum TypeInfo {
    #[serde(rename = "type")]
    Type(TypeRecord),
    #[serde(rename = "var")]
    Variable(VarRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRecord {
    pub id: TypeId,
    pub kind: RealType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: u32,
    /// Referenced type for Const/Volatile/Typedef/Pointer/Array and the
    /// return type for Function/FuncPointer. Zero means none.
    #[serde(default)]
    pub ref_type_id: TypeId,
    /// Array length in elements; -1 when the DWARF leaves it open.
    #[serde(default = "minus_one")]
    pub array_length: i64,
    #[serde(default)]
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub enum_values: Vec<(String, i64)>,
    #[serde(default)]
    pub params: Vec<(String, TypeId)>,
    #[serde(default)]
    pub pc_low: u64,
    #[serde(default)]
    pub pc_high: u64,
    #[serde(default)]
    pub src_line: i32,
}

fn minus_one() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Empty for anonymous inner structs and unions.
    #[serde(default)]
    pub name: String,
    pub offset: u32,
    pub ref_type_id: TypeId,
    /// Bitfield width, -1 for plain members.
    #[serde(default = "minus_one_i8")]
    pub bit_size: i8,
    #[serde(default = "minus_one_i8")]
    pub bit_offset: i8,
}

fn minus_one_i8() -> i8 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarRecord {
    pub id: i32,
    pub name: String,
    pub address: u64,
    pub ref_type_id: TypeId,
    #[serde(default)]
    pub src_line: i32,
}

impl TypeRecord {
    pub fn plain(id: TypeId, kind: RealType, name: Option<&str>, size: u32) -> TypeRecord {
        TypeRecord {
            id,
            kind,
            name: name.map(str::to_owned),
            size,
            ref_type_id: 0,
            array_length: -1,
            members: Vec::new(),
            enum_values: Vec::new(),
            params: Vec::new(),
            pc_low: 0,
            pc_high: 0,
            src_line: 0,
        }
    }

    pub fn referencing(id: TypeId, kind: RealType, ref_id: TypeId, size: u32) -> TypeRecord {
        let mut r = Self::plain(id, kind, None, size);
        r.ref_type_id = ref_id;
        r
    }
}

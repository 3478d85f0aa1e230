//! The closed set of C type kinds and the OR-able predicate sets built
//! over them. Every kind occupies one bit so that resolution filters and
//! type-class tests are plain bit operations.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// One kind per DWARF type DIE of interest. The discriminant is the codec
/// tag; the bit position used in [`RealTypeSet`] is derived from it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum RealType {
    Int8 = 0,
    UInt8 = 1,
    Bool8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Bool16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Bool32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Bool64 = 11,
    Float = 12,
    Double = 13,
    Pointer = 14,
    Array = 15,
    Enum = 16,
    Struct = 17,
    Union = 18,
    Typedef = 19,
    Const = 20,
    Volatile = 21,
    FuncPointer = 22,
    Function = 23,
    Void = 24,
    VaList = 25,
}

impl RealType {
    #[inline]
    pub fn bit(self) -> RealTypeSet {
        RealTypeSet::from_bits_retain(1 << (self as u8 as u32))
    }

    #[inline]
    pub fn is_in(self, set: RealTypeSet) -> bool {
        set.contains(self.bit())
    }

    pub fn name(self) -> &'static str {
        match self {
            RealType::Int8 => "Int8",
            RealType::UInt8 => "UInt8",
            RealType::Bool8 => "Bool8",
            RealType::Int16 => "Int16",
            RealType::UInt16 => "UInt16",
            RealType::Bool16 => "Bool16",
            RealType::Int32 => "Int32",
            RealType::UInt32 => "UInt32",
            RealType::Bool32 => "Bool32",
            RealType::Int64 => "Int64",
            RealType::UInt64 => "UInt64",
            RealType::Bool64 => "Bool64",
            RealType::Float => "Float",
            RealType::Double => "Double",
            RealType::Pointer => "Pointer",
            RealType::Array => "Array",
            RealType::Enum => "Enum",
            RealType::Struct => "Struct",
            RealType::Union => "Union",
            RealType::Typedef => "Typedef",
            RealType::Const => "Const",
            RealType::Volatile => "Volatile",
            RealType::FuncPointer => "FuncPointer",
            RealType::Function => "Function",
            RealType::Void => "Void",
            RealType::VaList => "VaList",
        }
    }
}

bitflags! {
    /// A set of [`RealType`] kinds. Also doubles as the resolution filter
    /// passed to dereference operations; `NON_NULL` is a modifier bit that
    /// keeps resolution going until a non-reference type or a null pointer
    /// is reached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RealTypeSet: u32 {
        const INT8 = 1 << 0;
        const UINT8 = 1 << 1;
        const BOOL8 = 1 << 2;
        const INT16 = 1 << 3;
        const UINT16 = 1 << 4;
        const BOOL16 = 1 << 5;
        const INT32 = 1 << 6;
        const UINT32 = 1 << 7;
        const BOOL32 = 1 << 8;
        const INT64 = 1 << 9;
        const UINT64 = 1 << 10;
        const BOOL64 = 1 << 11;
        const FLOAT = 1 << 12;
        const DOUBLE = 1 << 13;
        const POINTER = 1 << 14;
        const ARRAY = 1 << 15;
        const ENUM = 1 << 16;
        const STRUCT = 1 << 17;
        const UNION = 1 << 18;
        const TYPEDEF = 1 << 19;
        const CONST = 1 << 20;
        const VOLATILE = 1 << 21;
        const FUNC_POINTER = 1 << 22;
        const FUNCTION = 1 << 23;
        const VOID = 1 << 24;
        const VA_LIST = 1 << 25;

        /// Modifier: stop resolution at null pointers instead of following.
        const NON_NULL = 1 << 30;

        const INTEGER_TYPES = Self::INT8.bits() | Self::UINT8.bits()
            | Self::BOOL8.bits() | Self::INT16.bits() | Self::UINT16.bits()
            | Self::BOOL16.bits() | Self::INT32.bits() | Self::UINT32.bits()
            | Self::BOOL32.bits() | Self::INT64.bits() | Self::UINT64.bits()
            | Self::BOOL64.bits() | Self::ENUM.bits();
        const FLOATING_TYPES = Self::FLOAT.bits() | Self::DOUBLE.bits();
        const STRUCT_OR_UNION = Self::STRUCT.bits() | Self::UNION.bits();
        const REF_BASE_TYPES = Self::CONST.bits() | Self::VOLATILE.bits()
            | Self::POINTER.bits() | Self::ARRAY.bits() | Self::TYPEDEF.bits()
            | Self::FUNC_POINTER.bits();

        /// Lexical wrappers only: const, volatile, typedef.
        const TR_LEXICAL = Self::CONST.bits() | Self::VOLATILE.bits()
            | Self::TYPEDEF.bits();
        /// Lexical wrappers plus one level of pointers.
        const TR_LEXICAL_POINTERS = Self::TR_LEXICAL.bits()
            | Self::POINTER.bits();
        /// Every referencing kind.
        const TR_ANY = Self::REF_BASE_TYPES.bits();
        /// Every referencing kind, stopping at null pointers.
        const TR_ANY_NON_NULL = Self::TR_ANY.bits() | Self::NON_NULL.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_disjoint() {
        let all = [
            RealType::Int8,
            RealType::UInt64,
            RealType::Pointer,
            RealType::Struct,
            RealType::VaList,
        ];
        let mut seen = RealTypeSet::empty();
        for t in all {
            assert!(!seen.intersects(t.bit()));
            seen |= t.bit();
        }
    }

    #[test]
    fn composite_sets() {
        assert!(RealType::Enum.is_in(RealTypeSet::INTEGER_TYPES));
        assert!(RealType::Typedef.is_in(RealTypeSet::TR_LEXICAL));
        assert!(!RealType::Pointer.is_in(RealTypeSet::TR_LEXICAL));
        assert!(RealType::Pointer.is_in(RealTypeSet::TR_ANY));
        assert!(RealType::FuncPointer.is_in(RealTypeSet::REF_BASE_TYPES));
        assert!(!RealType::Struct.is_in(RealTypeSet::REF_BASE_TYPES));
    }

    #[test]
    fn codec_tag_round_trip() {
        for tag in 0..=25u8 {
            let rt = RealType::try_from(tag).unwrap();
            assert_eq!(u8::from(rt), tag);
        }
        assert!(RealType::try_from(26u8).is_err());
    }
}

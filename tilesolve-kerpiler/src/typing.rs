use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scalar element types known to the kernel compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Bool,
    Float16,
    Float32,
    Float64,
    // pair of float32 words emulating extended precision
    TwoFloat32,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Void,
}

pub const ALL_TYPES: [Type; 14] = [
    Type::Bool, Type::Float16, Type::Float32, Type::Float64, Type::TwoFloat32,
    Type::Int8, Type::Int16, Type::Int32, Type::Int64,
    Type::Uint8, Type::Uint16, Type::Uint32, Type::Uint64, Type::Void,
];

impl Type {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        use Type::*;
        match self {
            Void => 0,
            Bool | Int8 | Uint8 => 1,
            Float16 | Int16 | Uint16 => 2,
            Float32 | Int32 | Uint32 => 4,
            Float64 | TwoFloat32 | Int64 | Uint64 => 8,
        }
    }
    pub fn is_float(self) -> bool {
        matches!(self, Type::Float16 | Type::Float32 | Type::Float64 | Type::TwoFloat32)
    }
    pub fn is_integer(self) -> bool {
        use Type::*;
        matches!(self, Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64)
    }
    pub fn is_signed(self) -> bool {
        self.is_float() || matches!(self, Type::Int8 | Type::Int16 | Type::Int32 | Type::Int64)
    }
    pub fn is_bool(self) -> bool { self == Type::Bool }

    /// Name used in configuration files and string representations.
    pub fn name(self) -> &'static str {
        use Type::*;
        match self {
            Bool => "bool",
            Float16 => "float16",
            Float32 => "float32",
            Float64 => "float64",
            TwoFloat32 => "twofloat32",
            Int8 => "int8",
            Int16 => "int16",
            Int32 => "int32",
            Int64 => "int64",
            Uint8 => "uint8",
            Uint16 => "uint16",
            Uint32 => "uint32",
            Uint64 => "uint64",
            Void => "void",
        }
    }

    /// Spelling of the type in generated kernel source.
    pub fn c_name(self) -> &'static str {
        use Type::*;
        match self {
            Bool => "bool",
            Float16 => "half",
            Float32 => "float",
            Float64 => "double",
            TwoFloat32 => "::twofloat::two<float>",
            Int8 => "signed char",
            Int16 => "short",
            Int32 => "int",
            Int64 => "long long",
            Uint8 => "unsigned char",
            Uint16 => "unsigned short",
            Uint32 => "unsigned int",
            Uint64 => "unsigned long long",
            Void => "void",
        }
    }

    pub fn parse(name: &str) -> Result<Type> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| t.name() == name)
            .ok_or_else(|| Error::UnknownType(name.to_owned()))
    }

    /// The wider of two types. Larger size wins, at equal size a float
    /// beats an integer and an unsigned integer beats a signed one.
    pub fn larger(a: Type, b: Type) -> Type {
        use std::cmp::Ordering::*;
        if a.is_bool() { return b }
        if b.is_bool() { return a }
        match a.size().cmp(&b.size()) {
            Greater => a,
            Less => b,
            Equal => {
                if a.is_float() != b.is_float() {
                    if a.is_float() { a } else { b }
                } else if a.is_signed() != b.is_signed() {
                    if a.is_signed() { b } else { a }
                } else {
                    a
                }
            }
        }
    }

    /// Smallest representable value, used as identity of max reductions.
    pub fn lowest(self) -> f64 {
        use Type::*;
        match self {
            Bool => 0.0,
            Float16 => f64::from(half::f16::MIN),
            Float32 | TwoFloat32 => f32::MIN as f64,
            Float64 => f64::MIN,
            Int8 => i8::MIN as f64,
            Int16 => i16::MIN as f64,
            Int32 => i32::MIN as f64,
            Int64 => i64::MIN as f64,
            Uint8 | Uint16 | Uint32 | Uint64 | Void => 0.0,
        }
    }

    /// Largest representable value, used as identity of min reductions.
    pub fn max_value(self) -> f64 {
        use Type::*;
        match self {
            Bool => 1.0,
            Float16 => f64::from(half::f16::MAX),
            Float32 | TwoFloat32 => f32::MAX as f64,
            Float64 => f64::MAX,
            Int8 => i8::MAX as f64,
            Int16 => i16::MAX as f64,
            Int32 => i32::MAX as f64,
            Int64 => i64::MAX as f64,
            Uint8 => u8::MAX as f64,
            Uint16 => u16::MAX as f64,
            Uint32 => u32::MAX as f64,
            Uint64 => u64::MAX as f64,
            Void => 0.0,
        }
    }

    /// Convert a value into this type and back, the way a store into a
    /// variable of this type would.
    pub fn round(self, v: f64) -> f64 {
        use Type::*;
        match self {
            Bool => if v != 0.0 { 1.0 } else { 0.0 },
            Float16 => f64::from(half::f16::from_f64(v)),
            Float32 => v as f32 as f64,
            Float64 | Void => v,
            TwoFloat32 => {
                let hi = v as f32;
                let lo = (v - hi as f64) as f32;
                hi as f64 + lo as f64
            }
            // `as` between integers wraps, between float and integer it saturates
            Int8 => (v as i64) as i8 as f64,
            Int16 => (v as i64) as i16 as f64,
            Int32 => (v as i64) as i32 as f64,
            Int64 => v.trunc(),
            Uint8 => (v as i64) as u8 as f64,
            Uint16 => (v as i64) as u16 as f64,
            Uint32 => (v as i64) as u32 as f64,
            Uint64 => if v < 0.0 { (v as i64) as u64 as f64 } else { v.trunc() },
        }
    }

    /// Smallest unsigned type able to hold `max`, used for index tensors.
    pub fn unsigned_for(max: usize) -> Type {
        if max <= u8::MAX as usize {
            Type::Uint8
        } else if max <= u16::MAX as usize {
            Type::Uint16
        } else {
            Type::Uint32
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical spelling of a literal, shared by generated source and
/// expression strings: `%.8e` plus `f` for single precision, `%.16e` for
/// double precision.
pub fn format_literal(value: f64, ty: Type) -> String {
    use Type::*;
    match ty {
        Bool => if value != 0.0 { "true" } else { "false" }.to_owned(),
        Int64 => format!("{}ll", value as i64),
        Uint64 => format!("{}ull", value as u64),
        t if t.is_integer() && t.is_signed() => format!("{}", value as i64),
        t if t.is_integer() => format!("{}u", value as u64),
        _ if !value.is_finite() => c_exponent(value, 0),
        Float16 | Float32 => c_exponent(value, 8) + "f",
        _ => c_exponent(value, 16),
    }
}

// printf("%.*e") spelling: two-digit exponent with explicit sign
fn c_exponent(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return "NAN".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_owned();
    }
    let text = format!("{value:.digits$e}");
    let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.abs())
}

/// Rust scalars that can be moved in and out of tensors.
pub trait Scalar: Copy + 'static {
    const TYPE: Type;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_scalar {
    ($t: ty, $Type: ident) => {
        impl Scalar for $t {
            const TYPE: Type = Type::$Type;
            fn to_f64(self) -> f64 { self as f64 }
            fn from_f64(v: f64) -> Self { v as $t }
        }
    };
}

impl_scalar!(f32, Float32);
impl_scalar!(f64, Float64);
impl_scalar!(i8, Int8);
impl_scalar!(i16, Int16);
impl_scalar!(i32, Int32);
impl_scalar!(i64, Int64);
impl_scalar!(u8, Uint8);
impl_scalar!(u16, Uint16);
impl_scalar!(u32, Uint32);
impl_scalar!(u64, Uint64);

impl Scalar for bool {
    const TYPE: Type = Type::Bool;
    fn to_f64(self) -> f64 { if self { 1.0 } else { 0.0 } }
    fn from_f64(v: f64) -> Self { v != 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn larger_type_rules() {
        assert_eq!(Type::larger(Type::Float32, Type::Int32), Type::Float32);
        assert_eq!(Type::larger(Type::Int32, Type::Uint32), Type::Uint32);
        assert_eq!(Type::larger(Type::Int64, Type::Float32), Type::Int64);
        assert_eq!(Type::larger(Type::Float32, Type::Float64), Type::Float64);
        assert_eq!(Type::larger(Type::Bool, Type::Int8), Type::Int8);
    }

    #[test]
    fn parse_round_trips_names() {
        for t in ALL_TYPES {
            assert_eq!(Type::parse(t.name()).unwrap(), t);
        }
        assert!(Type::parse("float128").is_err());
        assert_eq!(Type::TwoFloat32.size(), 8);
        assert_eq!(Type::TwoFloat32.c_name(), "::twofloat::two<float>");
    }

    #[test]
    fn rounding_follows_storage_type() {
        assert_eq!(Type::Int32.round(-2.7), -2.0);
        assert_eq!(Type::Uint8.round(257.0), 1.0);
        assert_eq!(Type::Bool.round(-3.0), 1.0);
        assert_eq!(Type::Float32.round(0.1), 0.1f32 as f64);
        // two words keep more digits than one
        let v = 1.0 + 1e-10;
        assert!((Type::TwoFloat32.round(v) - v).abs() < (Type::Float32.round(v) - v).abs());
        assert_eq!(Type::Float16.round(1.0 / 3.0), f64::from(half::f16::from_f64(1.0 / 3.0)));
    }

    #[test]
    fn index_type_selection() {
        assert_eq!(Type::unsigned_for(200), Type::Uint8);
        assert_eq!(Type::unsigned_for(1000), Type::Uint16);
        assert_eq!(Type::unsigned_for(70000), Type::Uint32);
    }

    #[test]
    fn literals_use_c_exponent_form() {
        assert_eq!(format_literal(1.0, Type::Float32), "1.00000000e+00f");
        assert_eq!(format_literal(-0.15625, Type::Float64), "-1.5625000000000000e-01");
        assert_eq!(format_literal(1234.0, Type::Float32), "1.23400000e+03f");
        assert_eq!(format_literal(3.0, Type::Uint32), "3u");
        assert_eq!(format_literal(-3.0, Type::Int32), "-3");
        assert_eq!(format_literal(1.0, Type::Bool), "true");
        assert_eq!(format_literal(f64::NEG_INFINITY, Type::Float32), "-INFINITY");
    }
}

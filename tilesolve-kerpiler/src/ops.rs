//! Elementwise operators, their typing rules and their scalar semantics.

use serde::{Deserialize, Serialize};

use crate::{error::{Error, Result}, typing::Type};

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Absolute, Asin, BitwiseNot, Cbrt, Ceil, Cos, CountLeadingZeros, Erf,
    Exponent, ExponentMinusOne, Exponent2, Floor, GeluErf, Inverse,
    IsFinite, IsInf, IsNan, Logarithm, LogarithmOnePlus, LogicalNot,
    Negate, NearbyInt, Popcount, Relu, Signum, Sin, Tan, Tanh, Round,
    Sqrt, Square, Sigmoid, Rsqrt, Trunc,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add, Atan2, BitwiseAnd, BitwiseOr, BitwiseXor, BitwiseXnor, Divide,
    Equal, GreaterEqual, GreaterThan, LessEqual, LogicalAnd, LogicalOr,
    LessThan, Maximum, Minimum, Multiply, NotEqual, Power, Remainder,
    ShiftLeft, ShiftRight, Subtract,
}

/// Reduce operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Add, Mul, Min, Max, LogicalAnd, LogicalOr,
    // squares each element before summing
    SquareAdd,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        use UnaryOp::*;
        match self {
            Absolute => "abs", Asin => "asin", BitwiseNot => "bitwise_not",
            Cbrt => "cbrt", Ceil => "ceil", Cos => "cos",
            CountLeadingZeros => "count_leading_zeros", Erf => "erf",
            Exponent => "exp", ExponentMinusOne => "expm1", Exponent2 => "exp2",
            Floor => "floor", GeluErf => "gelu_erf", Inverse => "inverse",
            IsFinite => "is_finite", IsInf => "is_inf", IsNan => "is_nan",
            Logarithm => "log", LogarithmOnePlus => "log1p", LogicalNot => "logical_not",
            Negate => "negate", NearbyInt => "nearby_int", Popcount => "popcount",
            Relu => "relu", Signum => "signum", Sin => "sin", Tan => "tan",
            Tanh => "tanh", Round => "round", Sqrt => "sqrt", Square => "square",
            Sigmoid => "sigmoid", Rsqrt => "rsqrt", Trunc => "trunc",
        }
    }

    // result type for an operand of type `t`
    pub fn infer(self, t: Type) -> Result<Type> {
        use UnaryOp::*;
        let err = || Error::TypeMismatch { op: self.name(), lhs: t, rhs: t };
        match self {
            BitwiseNot | CountLeadingZeros | Popcount if !t.is_integer() => Err(err()),
            BitwiseNot | CountLeadingZeros | Popcount => Ok(t),
            IsFinite | IsInf | IsNan | LogicalNot => Ok(Type::Bool),
            _ if t == Type::TwoFloat32 && !matches!(self, Negate | Absolute | Square) => Err(err()),
            Absolute | Negate | Square | Signum | Relu => Ok(t),
            Ceil | Floor | Round | Trunc | NearbyInt if t.is_integer() => Ok(t),
            // math functions compute in at least single precision
            _ => Ok(Type::larger(Type::Float32, t)),
        }
    }

    pub fn apply(self, x: f64) -> f64 {
        use UnaryOp::*;
        let b = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            Absolute => x.abs(),
            Asin => x.asin(),
            BitwiseNot => !(x as i64) as f64,
            Cbrt => x.cbrt(),
            Ceil => x.ceil(),
            Cos => x.cos(),
            CountLeadingZeros => (x as i64 as u32).leading_zeros() as f64,
            Erf => erf(x),
            Exponent => x.exp(),
            ExponentMinusOne => x.exp_m1(),
            Exponent2 => x.exp2(),
            Floor => x.floor(),
            GeluErf => 0.5 * x * (1.0 + erf(x / std::f64::consts::SQRT_2)),
            Inverse => 1.0 / x,
            IsFinite => b(x.is_finite()),
            IsInf => b(x.is_infinite()),
            IsNan => b(x.is_nan()),
            Logarithm => x.ln(),
            LogarithmOnePlus => x.ln_1p(),
            LogicalNot => b(x == 0.0),
            Negate => -x,
            NearbyInt => round_half_even(x),
            Popcount => (x as i64 as u64).count_ones() as f64,
            Relu => x.max(0.0),
            Signum => if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 },
            Sin => x.sin(),
            Tan => x.tan(),
            Tanh => x.tanh(),
            Round => x.round(),
            Sqrt => x.sqrt(),
            Square => x * x,
            Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Rsqrt => 1.0 / x.sqrt(),
            Trunc => x.trunc(),
        }
    }
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "add", Atan2 => "atan2", BitwiseAnd => "bitwise_and",
            BitwiseOr => "bitwise_or", BitwiseXor => "bitwise_xor",
            BitwiseXnor => "bitwise_xnor", Divide => "divide", Equal => "equal",
            GreaterEqual => "greater_equal", GreaterThan => "greater_than",
            LessEqual => "less_equal", LogicalAnd => "logical_and",
            LogicalOr => "logical_or", LessThan => "less_than", Maximum => "max",
            Minimum => "min", Multiply => "multiply", NotEqual => "not_equal",
            Power => "pow", Remainder => "remainder", ShiftLeft => "shift_left",
            ShiftRight => "shift_right", Subtract => "subtract",
        }
    }

    // infix spelling in generated source, None for function-call style
    pub fn symbol(self) -> Option<&'static str> {
        use BinaryOp::*;
        Some(match self {
            Add => "+", Subtract => "-", Multiply => "*", Divide => "/",
            Remainder => "%", BitwiseAnd => "&", BitwiseOr => "|", BitwiseXor => "^",
            Equal => "==", NotEqual => "!=", GreaterEqual => ">=", GreaterThan => ">",
            LessEqual => "<=", LessThan => "<", LogicalAnd => "&&", LogicalOr => "||",
            ShiftLeft => "<<", ShiftRight => ">>",
            Atan2 | BitwiseXnor | Maximum | Minimum | Power => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Equal | NotEqual | GreaterEqual | GreaterThan | LessEqual | LessThan)
    }

    pub fn infer(self, lhs: Type, rhs: Type) -> Result<Type> {
        use BinaryOp::*;
        let err = || Error::TypeMismatch { op: self.name(), lhs, rhs };
        // extended precision only supports the four basic operations
        if lhs == Type::TwoFloat32 || rhs == Type::TwoFloat32 {
            let other = if lhs == Type::TwoFloat32 { rhs } else { lhs };
            let ok = matches!(self, Add | Subtract | Multiply | Divide)
                && matches!(other, Type::Float32 | Type::TwoFloat32);
            return if ok { Ok(Type::TwoFloat32) } else { Err(err()) };
        }
        match self {
            Add | Subtract | Multiply | Divide | Remainder | Maximum | Minimum => {
                let t = Type::larger(lhs, rhs);
                let (int, float) = if lhs.is_float() { (rhs, lhs) } else { (lhs, rhs) };
                if int.is_integer() && float.is_float() && int.size() > float.size() {
                    tracing::warn!("{} of {lhs} and {rhs} narrows to {t}", self.name());
                }
                Ok(t)
            }
            BitwiseAnd | BitwiseOr | BitwiseXor | BitwiseXnor | ShiftLeft | ShiftRight => {
                if lhs.is_integer() && rhs.is_integer() { Ok(Type::larger(lhs, rhs)) } else { Err(err()) }
            }
            Equal | NotEqual | GreaterEqual | GreaterThan | LessEqual | LessThan | LogicalAnd | LogicalOr => Ok(Type::Bool),
            Atan2 | Power => Ok(Type::larger(Type::Float32, Type::larger(lhs, rhs))),
        }
    }

    // `integer` selects truncating division and remainder
    pub fn apply(self, a: f64, b: f64, integer: bool) -> f64 {
        use BinaryOp::*;
        let c = |x: bool| if x { 1.0 } else { 0.0 };
        let (ia, ib) = (a as i64, b as i64);
        match self {
            Add => a + b,
            Subtract => a - b,
            Multiply => a * b,
            Divide if integer => if ib == 0 { 0.0 } else { (ia / ib) as f64 },
            Divide => a / b,
            Remainder if integer => if ib == 0 { 0.0 } else { (ia % ib) as f64 },
            Remainder => a % b,
            Atan2 => a.atan2(b),
            BitwiseAnd => (ia & ib) as f64,
            BitwiseOr => (ia | ib) as f64,
            BitwiseXor => (ia ^ ib) as f64,
            BitwiseXnor => !(ia ^ ib) as f64,
            ShiftLeft => ia.wrapping_shl(ib as u32) as f64,
            ShiftRight => ia.wrapping_shr(ib as u32) as f64,
            Equal => c(a == b),
            NotEqual => c(a != b),
            GreaterEqual => c(a >= b),
            GreaterThan => c(a > b),
            LessEqual => c(a <= b),
            LessThan => c(a < b),
            LogicalAnd => c(a != 0.0 && b != 0.0),
            LogicalOr => c(a != 0.0 || b != 0.0),
            Maximum => a.max(b),
            Minimum => a.min(b),
            Power => a.powf(b),
        }
    }
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        use ReduceOp::*;
        match self {
            Add => "add", Mul => "mul", Min => "min", Max => "max",
            LogicalAnd => "logical_and", LogicalOr => "logical_or", SquareAdd => "square_add",
        }
    }

    /// Neutral element of the reduction for values of type `t`.
    pub fn identity(self, t: Type) -> f64 {
        use ReduceOp::*;
        match self {
            Add | SquareAdd | LogicalOr => 0.0,
            Mul | LogicalAnd => 1.0,
            Min => if t.is_float() { f64::INFINITY } else { t.max_value() },
            Max => if t.is_float() { f64::NEG_INFINITY } else { t.lowest() },
        }
    }

    /// The operation to use once partial results have been combined once.
    /// Squaring must only happen on the original elements.
    pub fn downgraded(self) -> ReduceOp {
        match self {
            ReduceOp::SquareAdd => ReduceOp::Add,
            op => op,
        }
    }

    pub fn result_type(self, t: Type) -> Type {
        match self {
            ReduceOp::LogicalAnd | ReduceOp::LogicalOr => Type::Bool,
            _ => t,
        }
    }

    // the binary operator that folds a new element into an accumulator
    pub fn combiner(self) -> BinaryOp {
        use ReduceOp::*;
        match self {
            Add | SquareAdd => BinaryOp::Add,
            Mul => BinaryOp::Multiply,
            Min => BinaryOp::Minimum,
            Max => BinaryOp::Maximum,
            LogicalAnd => BinaryOp::LogicalAnd,
            LogicalOr => BinaryOp::LogicalOr,
        }
    }
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 { 2.0 * (x / 2.0).round() } else { r }
}

// Abramowitz-Stegun 7.1.26, absolute error below 1.5e-7
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let y = 1.0 - poly * (-x * x).exp();
    if x < 0.0 { -y } else { y }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_widens() {
        assert_eq!(BinaryOp::Add.infer(Type::Float32, Type::Int32).unwrap(), Type::Float32);
        assert_eq!(BinaryOp::Add.infer(Type::Float32, Type::Float64).unwrap(), Type::Float64);
        assert_eq!(BinaryOp::LessThan.infer(Type::Float32, Type::Float32).unwrap(), Type::Bool);
        assert!(BinaryOp::BitwiseAnd.infer(Type::Float32, Type::Int32).is_err());
        assert_eq!(BinaryOp::ShiftLeft.infer(Type::Uint8, Type::Int32).unwrap(), Type::Int32);
    }

    #[test]
    fn twofloat_only_basic_arithmetic() {
        assert_eq!(BinaryOp::Add.infer(Type::TwoFloat32, Type::Float32).unwrap(), Type::TwoFloat32);
        assert!(BinaryOp::Add.infer(Type::TwoFloat32, Type::Float64).is_err());
        assert!(BinaryOp::Power.infer(Type::TwoFloat32, Type::TwoFloat32).is_err());
        assert!(UnaryOp::Sqrt.infer(Type::TwoFloat32).is_err());
    }

    #[test]
    fn math_functions_are_floating() {
        assert_eq!(UnaryOp::Sqrt.infer(Type::Int32).unwrap(), Type::Float32);
        assert_eq!(UnaryOp::Sqrt.infer(Type::Float64).unwrap(), Type::Float64);
        assert_eq!(UnaryOp::Square.infer(Type::Int32).unwrap(), Type::Int32);
        assert_eq!(UnaryOp::IsNan.infer(Type::Float32).unwrap(), Type::Bool);
        assert!(UnaryOp::Popcount.infer(Type::Float32).is_err());
    }

    #[test]
    fn scalar_semantics() {
        assert_eq!(BinaryOp::Divide.apply(7.0, 2.0, true), 3.0);
        assert_eq!(BinaryOp::Divide.apply(7.0, 2.0, false), 3.5);
        assert_eq!(BinaryOp::Remainder.apply(-7.0, 2.0, true), -1.0);
        assert_eq!(UnaryOp::Popcount.apply(7.0), 3.0);
        assert_eq!(UnaryOp::NearbyInt.apply(2.5), 2.0);
        assert!((UnaryOp::Erf.apply(1.0) - 0.8427).abs() < 1e-3);
    }

    #[test]
    fn reduce_identities() {
        assert_eq!(ReduceOp::Max.identity(Type::Float32), f64::NEG_INFINITY);
        assert_eq!(ReduceOp::Min.identity(Type::Uint8), 255.0);
        assert_eq!(ReduceOp::SquareAdd.downgraded(), ReduceOp::Add);
        assert_eq!(ReduceOp::Mul.downgraded(), ReduceOp::Mul);
    }
}

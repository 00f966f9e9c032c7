use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use super::Expression;
use crate::{
    error::Result,
    ops::{BinaryOp, UnaryOp},
    tensor::Tensor,
    typing::{Scalar, Type},
};

/// Anything that can stand as an operand of an expression.
pub trait IntoExpression {
    fn into_expression(self) -> Expression;
}

impl IntoExpression for Expression {
    fn into_expression(self) -> Expression { self }
}

impl IntoExpression for &Expression {
    fn into_expression(self) -> Expression { self.clone() }
}

impl IntoExpression for Tensor {
    fn into_expression(self) -> Expression { Expression::input(&self) }
}

impl IntoExpression for &Tensor {
    fn into_expression(self) -> Expression { Expression::input(self) }
}

macro_rules! impl_scalar_operand {
    ($($t: ty),*) => {$(
        impl IntoExpression for $t {
            fn into_expression(self) -> Expression {
                Expression::constant(self.to_f64(), <$t as Scalar>::TYPE)
            }
        }
    )*};
}

impl_scalar_operand!(f32, f64, i32, u32, bool);

// expression on the left, anything on the right
macro_rules! impl_bin_op {
    ($Trait: ident, $method: ident, $Op: ident) => {
        impl<R: IntoExpression> $Trait<R> for Expression {
            type Output = Result<Expression>;
            fn $method(self, rhs: R) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self, rhs.into_expression())
            }
        }
        impl<R: IntoExpression> $Trait<R> for &Expression {
            type Output = Result<Expression>;
            fn $method(self, rhs: R) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self.clone(), rhs.into_expression())
            }
        }
        impl<R: IntoExpression> $Trait<R> for &Tensor {
            type Output = Result<Expression>;
            fn $method(self, rhs: R) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self.into_expression(), rhs.into_expression())
            }
        }
        impl_bin_op!(@scalar $Trait, $method, $Op, f32);
        impl_bin_op!(@scalar $Trait, $method, $Op, f64);
    };
    // scalar on the left
    (@scalar $Trait: ident, $method: ident, $Op: ident, $S: ty) => {
        impl $Trait<Expression> for $S {
            type Output = Result<Expression>;
            fn $method(self, rhs: Expression) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self.into_expression(), rhs)
            }
        }
        impl $Trait<&Expression> for $S {
            type Output = Result<Expression>;
            fn $method(self, rhs: &Expression) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self.into_expression(), rhs.clone())
            }
        }
        impl $Trait<&Tensor> for $S {
            type Output = Result<Expression>;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                Expression::binary(BinaryOp::$Op, self.into_expression(), rhs.into_expression())
            }
        }
    };
}

impl_bin_op!(Add, add, Add);
impl_bin_op!(Sub, sub, Subtract);
impl_bin_op!(Mul, mul, Multiply);
impl_bin_op!(Div, div, Divide);
impl_bin_op!(Rem, rem, Remainder);

impl Neg for Expression {
    type Output = Result<Expression>;
    fn neg(self) -> Self::Output { self.unary(UnaryOp::Negate) }
}

impl Neg for &Expression {
    type Output = Result<Expression>;
    fn neg(self) -> Self::Output { self.clone().unary(UnaryOp::Negate) }
}

impl Neg for &Tensor {
    type Output = Result<Expression>;
    fn neg(self) -> Self::Output { self.into_expression().unary(UnaryOp::Negate) }
}

macro_rules! unary_methods {
    ($($name: ident => $Op: ident),* $(,)?) => {
        impl Expression {$(
            pub fn $name(&self) -> Result<Expression> { self.clone().unary(UnaryOp::$Op) }
        )*}
    };
}

unary_methods! {
    abs => Absolute, sqrt => Sqrt, rsqrt => Rsqrt, square => Square,
    exp => Exponent, log => Logarithm, sin => Sin, cos => Cos, tanh => Tanh,
    sigmoid => Sigmoid, relu => Relu, inverse => Inverse, signum => Signum,
    floor => Floor, ceil => Ceil, is_nan => IsNan, logical_not => LogicalNot,
}

macro_rules! binary_methods {
    ($($name: ident => $Op: ident),* $(,)?) => {
        impl Expression {$(
            pub fn $name(&self, rhs: impl IntoExpression) -> Result<Expression> {
                Expression::binary(BinaryOp::$Op, self.clone(), rhs.into_expression())
            }
        )*}
    };
}

binary_methods! {
    max => Maximum, min => Minimum, pow => Power, atan2 => Atan2,
    lt => LessThan, le => LessEqual, gt => GreaterThan, ge => GreaterEqual,
    equal => Equal, not_equal => NotEqual, and => LogicalAnd, or => LogicalOr,
}

impl Expression {
    pub fn to_type(&self, ty: Type) -> Expression { self.clone().cast(ty) }
    pub fn dot_with(&self, rhs: impl IntoExpression) -> Result<Expression> {
        Expression::dot(self.clone(), rhs.into_expression())
    }
    pub fn cross_with(&self, rhs: impl IntoExpression) -> Result<Expression> {
        Expression::cross(self.clone(), rhs.into_expression())
    }
}

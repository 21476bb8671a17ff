//! Float trait abstraction for f32/f64 support.
//!
//! This module provides a unified trait for floating-point operations,
//! enabling the mixture-model engine to work with both f32 and f64 precision.

use num_traits::{Float, FromPrimitive, NumAssign};
use std::fmt::{Debug, Display};
use std::iter::Sum;

/// Trait alias for floating point types supported by the engine.
///
/// This trait combines all the bounds needed by the estimation engine:
/// - Basic float operations (Float, NumAssign)
/// - Conversion from primitive types (FromPrimitive)
/// - Iteration support (Sum)
/// - Debug/Display printing
/// - Thread safety for rayon parallelism (Send, Sync)
pub trait GmmFloat:
    Float + FromPrimitive + NumAssign + Sum + Debug + Display + Send + Sync + 'static
{
    /// The constant ln(2*pi), the normalization term of the Gaussian log-density.
    const LN_TWO_PI: Self;

    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Convert to f64 for sampling and robust comparisons.
    fn to_f64_c(self) -> f64;
}

impl GmmFloat for f32 {
    const LN_TWO_PI: Self = 1.837_877_1;

    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self as f64
    }
}

impl GmmFloat for f64 {
    const LN_TWO_PI: Self = 1.837_877_066_409_345_3;

    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self
    }
}

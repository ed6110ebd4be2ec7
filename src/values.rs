//! Concrete values flowing through sessions.

use crate::computation::{Dtype, ValueType};
use crate::error::{Error, Result};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::num::Wrapping;

pub const KEY_SIZE: usize = 16;

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub struct RawSeed(pub [u8; KEY_SIZE]);

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub struct RawPrfKey(pub [u8; KEY_SIZE]);

/// Runtime value; one variant per `ValueType` a kernel can produce.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub enum Value {
    Unit,
    Float32Tensor(ArrayD<f32>),
    Float64Tensor(ArrayD<f64>),
    Int64Tensor(ArrayD<i64>),
    Ring64Tensor(ArrayD<Wrapping<u64>>),
    BitTensor(ArrayD<u8>),
    Shape(Vec<usize>),
    Seed(RawSeed),
    PrfKey(RawPrfKey),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Float32Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Float32,
            },
            Value::Float64Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Float64,
            },
            Value::Int64Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Int64,
            },
            Value::Ring64Tensor(_) => ValueType::Ring,
            Value::BitTensor(_) => ValueType::Bit,
            Value::Shape(_) => ValueType::Shape,
            Value::Seed(_) => ValueType::Seed,
            Value::PrfKey(_) => ValueType::PrfKey,
        }
    }

    fn type_mismatch(&self, slot: &str, expected: &str) -> Error {
        Error::TypeMismatch {
            slot: slot.to_string(),
            expected: expected.to_string(),
            actual: format!("{}", self.ty()),
        }
    }

    pub fn as_float64(&self, slot: &str) -> Result<&ArrayD<f64>> {
        match self {
            Value::Float64Tensor(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Tensor(float64)")),
        }
    }

    pub fn as_float32(&self, slot: &str) -> Result<&ArrayD<f32>> {
        match self {
            Value::Float32Tensor(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Tensor(float32)")),
        }
    }

    pub fn as_int64(&self, slot: &str) -> Result<&ArrayD<i64>> {
        match self {
            Value::Int64Tensor(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Tensor(int64)")),
        }
    }

    pub fn as_ring64(&self, slot: &str) -> Result<&ArrayD<Wrapping<u64>>> {
        match self {
            Value::Ring64Tensor(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Ring")),
        }
    }

    pub fn as_bit(&self, slot: &str) -> Result<&ArrayD<u8>> {
        match self {
            Value::BitTensor(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Bit")),
        }
    }

    pub fn as_shape(&self, slot: &str) -> Result<&[usize]> {
        match self {
            Value::Shape(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Shape")),
        }
    }

    pub fn as_seed(&self, slot: &str) -> Result<&RawSeed> {
        match self {
            Value::Seed(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "Seed")),
        }
    }

    pub fn as_prf_key(&self, slot: &str) -> Result<&RawPrfKey> {
        match self {
            Value::PrfKey(x) => Ok(x),
            other => Err(other.type_mismatch(slot, "PrfKey")),
        }
    }
}

/// Graph-time literal carried by a `Constant` operation.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub enum Constant {
    Float32(f32),
    Float64(f64),
    Int64(i64),
    Float32Tensor(ArrayD<f32>),
    Float64Tensor(ArrayD<f64>),
    Int64Tensor(ArrayD<i64>),
    Ring64Tensor(ArrayD<Wrapping<u64>>),
}

impl Constant {
    /// Materialize as a runtime value; scalars become 0-dimensional tensors.
    pub fn value(&self) -> Value {
        match self {
            Constant::Float32(v) => Value::Float32Tensor(ndarray::arr0(*v).into_dyn()),
            Constant::Float64(v) => Value::Float64Tensor(ndarray::arr0(*v).into_dyn()),
            Constant::Int64(v) => Value::Int64Tensor(ndarray::arr0(*v).into_dyn()),
            Constant::Float32Tensor(v) => Value::Float32Tensor(v.clone()),
            Constant::Float64Tensor(v) => Value::Float64Tensor(v.clone()),
            Constant::Int64Tensor(v) => Value::Int64Tensor(v.clone()),
            Constant::Ring64Tensor(v) => Value::Ring64Tensor(v.clone()),
        }
    }

    pub fn ty(&self) -> ValueType {
        match self {
            Constant::Float32(_) | Constant::Float32Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Float32,
            },
            Constant::Float64(_) | Constant::Float64Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Float64,
            },
            Constant::Int64(_) | Constant::Int64Tensor(_) => ValueType::Tensor {
                dtype: Dtype::Int64,
            },
            Constant::Ring64Tensor(_) => ValueType::Ring,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_constants_become_0d_tensors() {
        let value = Constant::Float64(3.5).value();
        let tensor = value.as_float64("value").unwrap();
        assert_eq!(tensor.ndim(), 0);
        assert_eq!(tensor.sum(), 3.5);
    }

    #[test]
    fn test_extraction_mismatch_reports_types() {
        let value = Constant::Int64(1).value();
        let err = value.as_ring64("lhs").unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { slot, expected, actual }
                if slot == "lhs" && expected == "Ring" && actual == "Tensor(int64)"
        ));
    }
}

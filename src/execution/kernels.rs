//! One kernel per operator variant.
//!
//! Strict kernels await all inputs and compute synchronously; channel
//! kernels suspend on the networking manager; program kernels hand off
//! to a subprocess with guaranteed reaping.

use super::Session;
use crate::computation::*;
use crate::error::{Error, Result};
use crate::prng::AesRng;
use crate::values::{RawPrfKey, RawSeed, Value};
use async_cell::sync::AsyncCell;
use ndarray::{ArrayD, IxDyn, LinalgScalar};
use rand::RngCore;
use std::collections::BTreeMap;
use std::num::Wrapping;
use std::sync::Arc;

pub(crate) async fn execute(
    op: Operation,
    session: Arc<Session>,
    inputs: BTreeMap<String, Arc<AsyncCell<Value>>>,
    output: Arc<AsyncCell<Value>>,
) -> Result<()> {
    let result = match &op.kind {
        Operator::Send(send) => {
            let value = resolve_one(&op, &inputs, "value").await?;
            session
                .networking
                .send(
                    &value,
                    &session.identity_for(&send.sender)?,
                    &session.identity_for(&send.receiver)?,
                    &send.rendezvous_key,
                    session.session_id,
                )
                .await?;
            Value::Unit
        }
        Operator::Receive(receive) => {
            session
                .networking
                .receive(
                    &session.identity_for(&receive.sender)?,
                    &session.identity_for(&receive.receiver)?,
                    &receive.rendezvous_key,
                    session.session_id,
                )
                .await?
        }
        Operator::Load(load) => session.storage.load(&load.key).await?,
        Operator::Save(save) => {
            let value = resolve_one(&op, &inputs, "value").await?;
            session.storage.save(&save.key, &value).await?;
            Value::Unit
        }
        Operator::RunProgram(program) => {
            let values = resolve_all(inputs).await;
            run_program(&op, program, &session, values).await?
        }
        Operator::CallForeignFunction(call) => {
            let handler = session.foreign_fn.clone().ok_or_else(|| {
                Error::KernelError("no foreign function handler registered".to_string())
            })?;
            let values = resolve_all(inputs).await;
            let ordered: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
            handler.as_ref()(&call.fn_bytes, &ordered)?
        }
        _ => {
            let values = resolve_all(inputs).await;
            strict_kernel(&op, &session, &values)?
        }
    };
    output.set(result);
    Ok(())
}

async fn resolve_all(
    inputs: BTreeMap<String, Arc<AsyncCell<Value>>>,
) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    for (slot, cell) in inputs {
        let value = cell.get().await;
        values.insert(slot, value);
    }
    values
}

async fn resolve_one(
    op: &Operation,
    inputs: &BTreeMap<String, Arc<AsyncCell<Value>>>,
    slot: &str,
) -> Result<Value> {
    let cell = inputs.get(slot).ok_or_else(|| Error::MissingInput {
        op: op.name.clone(),
        slot: slot.to_string(),
    })?;
    Ok(cell.get().await)
}

fn input<'v>(op: &Operation, values: &'v BTreeMap<String, Value>, slot: &str) -> Result<&'v Value> {
    values.get(slot).ok_or_else(|| Error::MissingInput {
        op: op.name.clone(),
        slot: slot.to_string(),
    })
}

macro_rules! std_elementwise_kernel {
    ($op:expr, $values:expr, $operator:tt) => {{
        let lhs = input($op, $values, "lhs")?;
        let rhs = input($op, $values, "rhs")?;
        match (lhs, rhs) {
            (Value::Float64Tensor(x), Value::Float64Tensor(y)) => {
                Ok(Value::Float64Tensor(x $operator y))
            }
            (Value::Float32Tensor(x), Value::Float32Tensor(y)) => {
                Ok(Value::Float32Tensor(x $operator y))
            }
            (Value::Int64Tensor(x), Value::Int64Tensor(y)) => {
                Ok(Value::Int64Tensor(x $operator y))
            }
            (x, y) => Err(Error::TypeMismatch {
                slot: "rhs".to_string(),
                expected: format!("{}", x.ty()),
                actual: format!("{}", y.ty()),
            }),
        }
    }};
}

fn strict_kernel(
    op: &Operation,
    session: &Session,
    values: &BTreeMap<String, Value>,
) -> Result<Value> {
    match &op.kind {
        Operator::Constant(constant) => Ok(constant.value.value()),
        Operator::Input(arg) => session
            .arguments
            .get(&arg.arg_name)
            .cloned()
            .ok_or_else(|| Error::MissingArgument(arg.arg_name.clone())),
        Operator::Identity(_) | Operator::Output(_) => {
            Ok(input(op, values, "value")?.clone())
        }
        Operator::Add(_) => std_elementwise_kernel!(op, values, +),
        Operator::Sub(_) => std_elementwise_kernel!(op, values, -),
        Operator::Mul(_) => std_elementwise_kernel!(op, values, *),
        Operator::Div(_) => std_elementwise_kernel!(op, values, /),
        Operator::Dot(_) => {
            let lhs = input(op, values, "lhs")?;
            let rhs = input(op, values, "rhs")?;
            match (lhs, rhs) {
                (Value::Float64Tensor(x), Value::Float64Tensor(y)) => {
                    Ok(Value::Float64Tensor(dot(x, y)?))
                }
                (Value::Float32Tensor(x), Value::Float32Tensor(y)) => {
                    Ok(Value::Float32Tensor(dot(x, y)?))
                }
                (x, y) => Err(Error::TypeMismatch {
                    slot: "rhs".to_string(),
                    expected: format!("{}", x.ty()),
                    actual: format!("{}", y.ty()),
                }),
            }
        }
        Operator::Cast(_) => cast_kernel(op, input(op, values, "value")?),
        Operator::Shape(_) => {
            let shape = match input(op, values, "value")? {
                Value::Float32Tensor(x) => x.shape().to_vec(),
                Value::Float64Tensor(x) => x.shape().to_vec(),
                Value::Int64Tensor(x) => x.shape().to_vec(),
                Value::Ring64Tensor(x) => x.shape().to_vec(),
                Value::BitTensor(x) => x.shape().to_vec(),
                other => {
                    return Err(Error::TypeMismatch {
                        slot: "value".to_string(),
                        expected: "a tensor".to_string(),
                        actual: format!("{}", other.ty()),
                    })
                }
            };
            Ok(Value::Shape(shape))
        }
        Operator::RingAdd(_) => ring_elementwise(op, values, |x, y| x + y),
        Operator::RingSub(_) => ring_elementwise(op, values, |x, y| x - y),
        Operator::RingMul(_) => ring_elementwise(op, values, |x, y| x * y),
        Operator::RingDot(_) => {
            let x = input(op, values, "lhs")?.as_ring64("lhs")?;
            let y = input(op, values, "rhs")?.as_ring64("rhs")?;
            Ok(Value::Ring64Tensor(dot(x, y)?))
        }
        Operator::RingShape(_) => {
            let x = input(op, values, "value")?.as_ring64("value")?;
            Ok(Value::Shape(x.shape().to_vec()))
        }
        Operator::RingFill(fill) => {
            let shape = input(op, values, "shape")?.as_shape("shape")?;
            Ok(Value::Ring64Tensor(ArrayD::from_elem(
                IxDyn(shape),
                Wrapping(fill.value),
            )))
        }
        Operator::RingSampleSeeded(_) => {
            let shape = input(op, values, "shape")?.as_shape("shape")?;
            let seed = input(op, values, "seed")?.as_seed("seed")?;
            let mut rng = AesRng::from_seed(seed.0);
            let size = shape.iter().product();
            let samples: Vec<Wrapping<u64>> =
                (0..size).map(|_| Wrapping(rng.next_u64())).collect();
            let tensor = ndarray::Array::from_shape_vec(IxDyn(shape), samples)
                .map_err(|e| Error::KernelError(e.to_string()))?;
            Ok(Value::Ring64Tensor(tensor))
        }
        Operator::RingShl(shl) => {
            let x = input(op, values, "value")?.as_ring64("value")?;
            Ok(Value::Ring64Tensor(x.mapv(|v| v << shl.amount)))
        }
        Operator::RingShr(shr) => {
            let x = input(op, values, "value")?.as_ring64("value")?;
            Ok(Value::Ring64Tensor(x.mapv(|v| v >> shr.amount)))
        }
        Operator::RingFixedpointEncode(encode) => {
            let factor = u64::pow(encode.scaling_base, encode.scaling_exp);
            match input(op, values, "value")? {
                Value::Float64Tensor(x) => Ok(Value::Ring64Tensor(
                    x.mapv(|el| Wrapping((el * factor as f64) as i64 as u64)),
                )),
                Value::Float32Tensor(x) => Ok(Value::Ring64Tensor(
                    x.mapv(|el| Wrapping((el as f64 * factor as f64) as i64 as u64)),
                )),
                Value::Int64Tensor(x) => Ok(Value::Ring64Tensor(
                    x.mapv(|el| Wrapping(el.wrapping_mul(factor as i64) as u64)),
                )),
                other => Err(Error::TypeMismatch {
                    slot: "value".to_string(),
                    expected: "a numeric tensor".to_string(),
                    actual: format!("{}", other.ty()),
                }),
            }
        }
        Operator::RingFixedpointDecode(decode) => {
            let x = input(op, values, "value")?.as_ring64("value")?;
            let factor = u64::pow(decode.scaling_base, decode.scaling_exp);
            match &op.output_type {
                ValueType::Tensor {
                    dtype: Dtype::Float64,
                } => Ok(Value::Float64Tensor(
                    x.mapv(|el| el.0 as i64 as f64 / factor as f64),
                )),
                ValueType::Tensor {
                    dtype: Dtype::Float32,
                } => Ok(Value::Float32Tensor(
                    x.mapv(|el| (el.0 as i64 as f64 / factor as f64) as f32),
                )),
                ValueType::Tensor {
                    dtype: Dtype::Int64,
                } => Ok(Value::Int64Tensor(
                    x.mapv(|el| (el.0 as i64) >> decode.scaling_exp),
                )),
                other => Err(Error::KernelError(format!(
                    "cannot decode into {}",
                    other
                ))),
            }
        }
        Operator::BitExtract(extract) => {
            let x = input(op, values, "value")?.as_ring64("value")?;
            Ok(Value::BitTensor(
                x.mapv(|el| ((el.0 >> extract.bit_idx) & 1) as u8),
            ))
        }
        Operator::RingInject(inject) => {
            let x = input(op, values, "value")?.as_bit("value")?;
            Ok(Value::Ring64Tensor(
                x.mapv(|b| Wrapping((b as u64) << inject.bit_idx)),
            ))
        }
        Operator::BitXor(_) => {
            let x = input(op, values, "lhs")?.as_bit("lhs")?;
            let y = input(op, values, "rhs")?.as_bit("rhs")?;
            Ok(Value::BitTensor(x ^ y))
        }
        Operator::BitAnd(_) => {
            let x = input(op, values, "lhs")?.as_bit("lhs")?;
            let y = input(op, values, "rhs")?.as_bit("rhs")?;
            Ok(Value::BitTensor(x & y))
        }
        Operator::BitFill(fill) => {
            let shape = input(op, values, "shape")?.as_shape("shape")?;
            Ok(Value::BitTensor(ArrayD::from_elem(IxDyn(shape), fill.value)))
        }
        Operator::BitSampleSeeded(_) => {
            let shape = input(op, values, "shape")?.as_shape("shape")?;
            let seed = input(op, values, "seed")?.as_seed("seed")?;
            let mut rng = AesRng::from_seed(seed.0);
            let size = shape.iter().product();
            let samples: Vec<u8> = (0..size).map(|_| rng.get_bit()).collect();
            let tensor = ndarray::Array::from_shape_vec(IxDyn(shape), samples)
                .map_err(|e| Error::KernelError(e.to_string()))?;
            Ok(Value::BitTensor(tensor))
        }
        Operator::SampleKey(_) => {
            let mut key = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut key);
            Ok(Value::PrfKey(RawPrfKey(key)))
        }
        Operator::DeriveSeed(derive) => {
            let key = input(op, values, "key")?.as_prf_key("key")?;
            let mut hasher = blake3::Hasher::new();
            hasher.update(&key.0);
            hasher.update(&derive.nonce);
            let digest = hasher.finalize();
            let mut seed = [0u8; 16];
            seed.copy_from_slice(&digest.as_bytes()[..16]);
            Ok(Value::Seed(RawSeed(seed)))
        }
        other => Err(Error::KernelNotFound(other.type_name().to_string())),
    }
}

fn ring_elementwise(
    op: &Operation,
    values: &BTreeMap<String, Value>,
    apply: impl Fn(&ArrayD<Wrapping<u64>>, &ArrayD<Wrapping<u64>>) -> ArrayD<Wrapping<u64>>,
) -> Result<Value> {
    let x = input(op, values, "lhs")?.as_ring64("lhs")?;
    let y = input(op, values, "rhs")?.as_ring64("rhs")?;
    Ok(Value::Ring64Tensor(apply(x, y)))
}

/// Dot product over 1- and 2-dimensional tensors.
fn dot<T: LinalgScalar>(x: &ArrayD<T>, y: &ArrayD<T>) -> Result<ArrayD<T>> {
    use ndarray::{Ix1, Ix2};
    let shape_error = |e: ndarray::ShapeError| Error::KernelError(e.to_string());
    match (x.ndim(), y.ndim()) {
        (1, 1) => {
            let x = x.view().into_dimensionality::<Ix1>().map_err(shape_error)?;
            let y = y.view().into_dimensionality::<Ix1>().map_err(shape_error)?;
            Ok(ndarray::arr0(x.dot(&y)).into_dyn())
        }
        (1, 2) => {
            let x = x.view().into_dimensionality::<Ix1>().map_err(shape_error)?;
            let y = y.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            Ok(x.dot(&y).into_dyn())
        }
        (2, 1) => {
            let x = x.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            let y = y.view().into_dimensionality::<Ix1>().map_err(shape_error)?;
            Ok(x.dot(&y).into_dyn())
        }
        (2, 2) => {
            let x = x.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            let y = y.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            Ok(x.dot(&y).into_dyn())
        }
        (n, m) => Err(Error::KernelError(format!(
            "dot is only defined for 1- and 2-dimensional tensors, got {} and {}",
            n, m
        ))),
    }
}

fn cast_kernel(op: &Operation, value: &Value) -> Result<Value> {
    let dtype = match &op.output_type {
        ValueType::Tensor { dtype } => *dtype,
        other => {
            return Err(Error::KernelError(format!(
                "cast into non-tensor type {}",
                other
            )))
        }
    };
    match dtype {
        Dtype::Float64 => Ok(Value::Float64Tensor(numeric_as_f64(value)?)),
        Dtype::Float32 => Ok(Value::Float32Tensor(
            numeric_as_f64(value)?.mapv(|el| el as f32),
        )),
        Dtype::Int64 => Ok(Value::Int64Tensor(
            numeric_as_f64(value)?.mapv(|el| el as i64),
        )),
        other => Err(Error::KernelError(format!(
            "casts into {} must be lowered before execution",
            other
        ))),
    }
}

fn numeric_as_f64(value: &Value) -> Result<ArrayD<f64>> {
    match value {
        Value::Float64Tensor(x) => Ok(x.clone()),
        Value::Float32Tensor(x) => Ok(x.mapv(|el| el as f64)),
        Value::Int64Tensor(x) => Ok(x.mapv(|el| el as f64)),
        other => Err(Error::TypeMismatch {
            slot: "value".to_string(),
            expected: "a numeric tensor".to_string(),
            actual: format!("{}", other.ty()),
        }),
    }
}

async fn run_program(
    op: &Operation,
    program: &RunProgramOp,
    session: &Session,
    values: BTreeMap<String, Value>,
) -> Result<Value> {
    let ordered: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
    let input_file =
        tempfile::NamedTempFile::new().map_err(|e| Error::KernelError(e.to_string()))?;
    let output_file =
        tempfile::NamedTempFile::new().map_err(|e| Error::KernelError(e.to_string()))?;
    let payload =
        serde_json::to_vec(&ordered).map_err(|e| Error::KernelError(e.to_string()))?;
    std::fs::write(input_file.path(), payload).map_err(|e| Error::KernelError(e.to_string()))?;

    let output = tokio::process::Command::new(&program.path)
        .args(&program.args)
        .arg("--input-file")
        .arg(input_file.path())
        .arg("--output-file")
        .arg(output_file.path())
        .arg("--session-id")
        .arg(session.session_id.to_string())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::KernelError(format!("failed to launch '{}': {}", program.path, e)))?;

    if !output.status.success() {
        return Err(Error::ForeignProcessFailure {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    if op.output_type == ValueType::Unit {
        return Ok(Value::Unit);
    }
    let bytes =
        std::fs::read(output_file.path()).map_err(|e| Error::KernelError(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::KernelError(e.to_string()))
}

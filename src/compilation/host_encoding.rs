//! Rewrites host-side casts between floating-point and fixedpoint
//! dtypes into explicit encode/decode operations.

use super::emit::add_op;
use super::subgraph::{run_subgraph_replacement, SubgraphReplacementPass};
use super::{Context, Pass};
use crate::computation::*;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
pub struct HostEncodingPass {}

impl HostEncodingPass {
    pub fn new() -> HostEncodingPass {
        HostEncodingPass::default()
    }
}

impl Pass for HostEncodingPass {
    fn name(&self) -> &'static str {
        "host_encoding"
    }

    fn run(&mut self, computation: Computation, context: &mut Context) -> Result<Computation> {
        run_subgraph_replacement(self, computation, context)
    }
}

fn tensor_dtype(ty: &ValueType) -> Option<Dtype> {
    match ty {
        ValueType::Tensor { dtype } => Some(*dtype),
        _ => None,
    }
}

impl SubgraphReplacementPass for HostEncodingPass {
    type Lowered = String;

    fn collect_subgraph(&self, comp: &Computation) -> BTreeSet<String> {
        comp.operations
            .values()
            .filter(|op| matches!(op.kind, Operator::Cast(_)))
            .filter(|op| matches!(comp.placement(&op.placement_name), Some(Placement::Host(_))))
            .filter(|op| {
                let into_fixed = tensor_dtype(&op.output_type)
                    .map(|d| d.is_fixedpoint())
                    .unwrap_or(false);
                let from_fixed = op
                    .inputs
                    .get("value")
                    .and_then(|src| comp.operation(src))
                    .and_then(|src| tensor_dtype(&src.output_type))
                    .map(|d| d.is_fixedpoint())
                    .unwrap_or(false);
                into_fixed || from_fixed
            })
            .map(|op| op.name.clone())
            .collect()
    }

    fn process_operation(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        op: &Operation,
        inputs: &BTreeMap<String, String>,
    ) -> Result<String> {
        let src = inputs
            .get("value")
            .ok_or_else(|| Error::MissingInput {
                op: op.name.clone(),
                slot: "value".to_string(),
            })?
            .clone();
        let src_dtype = comp
            .operation(&src)
            .and_then(|src_op| tensor_dtype(&src_op.output_type))
            .ok_or_else(|| {
                Error::Compilation(format!(
                    "cast '{}' applied to non-tensor input '{}'",
                    op.name, src
                ))
            })?;
        let dst_dtype = tensor_dtype(&op.output_type).ok_or_else(|| {
            Error::Compilation(format!("cast '{}' into non-tensor type", op.name))
        })?;

        match (src_dtype, dst_dtype) {
            (src_dtype, dst_dtype) if !src_dtype.is_fixedpoint() && dst_dtype.is_fixedpoint() => {
                let precision = match dst_dtype {
                    Dtype::Fixed {
                        fractional_precision,
                        ..
                    } => fractional_precision,
                    _ => unreachable!(),
                };
                add_op(
                    comp,
                    ctx,
                    "fixed_encode",
                    Operator::Encode(EncodeOp { precision }),
                    &[("value", &src)],
                    &op.placement_name,
                    ValueType::EncodedTensor {
                        dtype: dst_dtype,
                        precision,
                    },
                )
            }
            (src_dtype, dst_dtype) if src_dtype.is_fixedpoint() && !dst_dtype.is_fixedpoint() => {
                let precision = match src_dtype {
                    Dtype::Fixed {
                        fractional_precision,
                        ..
                    } => fractional_precision,
                    _ => unreachable!(),
                };
                add_op(
                    comp,
                    ctx,
                    "fixed_decode",
                    Operator::Decode(DecodeOp { precision }),
                    &[("value", &src)],
                    &op.placement_name,
                    ValueType::Tensor { dtype: dst_dtype },
                )
            }
            (src_dtype, dst_dtype) if src_dtype == dst_dtype => Ok(src),
            (src_dtype, dst_dtype) => Err(Error::Compilation(format!(
                "unsupported cast from {} to {} in '{}'",
                src_dtype, dst_dtype, op.name
            ))),
        }
    }

    fn process_incoming_edge(
        &mut self,
        _comp: &mut Computation,
        _ctx: &mut Context,
        src_name: &str,
        _slot: &str,
        _dst: &Operation,
    ) -> Result<String> {
        Ok(src_name.to_string())
    }

    fn process_outgoing_edge(
        &mut self,
        _comp: &mut Computation,
        _ctx: &mut Context,
        lowered: &String,
        _src_name: &str,
        _slot: &str,
        _dst: &Operation,
    ) -> Result<String> {
        Ok(lowered.clone())
    }
}

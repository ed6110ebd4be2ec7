//! Lifts standard arithmetic on replicated placements into the
//! fixedpoint dialect, inserting encode/decode conversions at the
//! boundary to the surrounding host-side graph.

use super::emit::add_op;
use super::subgraph::{run_subgraph_replacement, SubgraphReplacementPass};
use super::{Context, Pass, DEFAULT_FIXEDPOINT_PRECISION};
use crate::computation::*;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub struct ReplicatedEncodingPass {
    default_precision: u32,
    incoming_edge_cache: HashMap<(String, String), String>,
    outgoing_edge_cache: HashMap<String, String>,
}

impl ReplicatedEncodingPass {
    pub fn new(default_precision: u32) -> ReplicatedEncodingPass {
        ReplicatedEncodingPass {
            default_precision,
            incoming_edge_cache: HashMap::new(),
            outgoing_edge_cache: HashMap::new(),
        }
    }
}

impl Default for ReplicatedEncodingPass {
    fn default() -> ReplicatedEncodingPass {
        ReplicatedEncodingPass::new(DEFAULT_FIXEDPOINT_PRECISION)
    }
}

impl Pass for ReplicatedEncodingPass {
    fn name(&self) -> &'static str {
        "replicated_encoding"
    }

    fn run(&mut self, computation: Computation, context: &mut Context) -> Result<Computation> {
        self.incoming_edge_cache.clear();
        self.outgoing_edge_cache.clear();
        run_subgraph_replacement(self, computation, context)
    }
}

fn encoded_type(op: &Operation, slot: &str) -> Result<(Dtype, u32)> {
    match &op.output_type {
        ValueType::EncodedTensor { dtype, precision } => Ok((*dtype, *precision)),
        other => Err(Error::TypeMismatch {
            slot: slot.to_string(),
            expected: "EncodedTensor".to_string(),
            actual: format!("{}", other),
        }),
    }
}

impl ReplicatedEncodingPass {
    fn resolve_pair<'c>(
        &self,
        comp: &'c Computation,
        inputs: &BTreeMap<String, String>,
        op: &Operation,
    ) -> Result<(&'c Operation, &'c Operation)> {
        let lhs = inputs.get("lhs").ok_or_else(|| Error::MissingInput {
            op: op.name.clone(),
            slot: "lhs".to_string(),
        })?;
        let rhs = inputs.get("rhs").ok_or_else(|| Error::MissingInput {
            op: op.name.clone(),
            slot: "rhs".to_string(),
        })?;
        let lhs = comp
            .operation(lhs)
            .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", lhs)))?;
        let rhs = comp
            .operation(rhs)
            .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", rhs)))?;
        Ok((lhs, rhs))
    }

    /// Additive lowering: operand dtypes and precisions must agree and
    /// carry over to the output.
    fn process_additive(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        op: &Operation,
        inputs: &BTreeMap<String, String>,
        prefix: &str,
        kind: Operator,
    ) -> Result<String> {
        let (lhs, rhs) = self.resolve_pair(comp, inputs, op)?;
        let (lhs_dtype, lhs_precision) = encoded_type(lhs, "lhs")?;
        let (rhs_dtype, rhs_precision) = encoded_type(rhs, "rhs")?;
        if lhs_dtype != rhs_dtype || lhs_precision != rhs_precision {
            return Err(Error::TypeMismatch {
                slot: "rhs".to_string(),
                expected: format!(
                    "{}",
                    ValueType::EncodedTensor {
                        dtype: lhs_dtype,
                        precision: lhs_precision
                    }
                ),
                actual: format!(
                    "{}",
                    ValueType::EncodedTensor {
                        dtype: rhs_dtype,
                        precision: rhs_precision
                    }
                ),
            });
        }
        let (lhs, rhs) = (lhs.name.clone(), rhs.name.clone());
        add_op(
            comp,
            ctx,
            prefix,
            kind,
            &[("lhs", &lhs), ("rhs", &rhs)],
            &op.placement_name,
            ValueType::EncodedTensor {
                dtype: lhs_dtype,
                precision: lhs_precision,
            },
        )
    }

    /// Multiplicative lowering: precisions add up, followed by a
    /// probabilistic truncation back to the canonical precision.
    fn process_multiplicative(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        op: &Operation,
        inputs: &BTreeMap<String, String>,
        prefix: &str,
        kind: Operator,
    ) -> Result<String> {
        let (lhs, rhs) = self.resolve_pair(comp, inputs, op)?;
        let (lhs_dtype, lhs_precision) = encoded_type(lhs, "lhs")?;
        let (rhs_dtype, rhs_precision) = encoded_type(rhs, "rhs")?;
        if lhs_dtype != rhs_dtype {
            return Err(Error::TypeMismatch {
                slot: "rhs".to_string(),
                expected: format!("{}", lhs_dtype),
                actual: format!("{}", rhs_dtype),
            });
        }
        let (lhs, rhs) = (lhs.name.clone(), rhs.name.clone());
        let product_precision = lhs_precision + rhs_precision;
        let product = add_op(
            comp,
            ctx,
            prefix,
            kind,
            &[("lhs", &lhs), ("rhs", &rhs)],
            &op.placement_name,
            ValueType::EncodedTensor {
                dtype: lhs_dtype,
                precision: product_precision,
            },
        )?;

        let scale_down = std::cmp::min(lhs_precision, rhs_precision);
        if scale_down == 0 {
            return Ok(product);
        }
        add_op(
            comp,
            ctx,
            "trunc_pr",
            Operator::TruncPr(TruncPrOp {
                precision: scale_down,
            }),
            &[("value", &product)],
            &op.placement_name,
            ValueType::EncodedTensor {
                dtype: lhs_dtype,
                precision: product_precision - scale_down,
            },
        )
    }
}

impl SubgraphReplacementPass for ReplicatedEncodingPass {
    type Lowered = String;

    fn collect_subgraph(&self, comp: &Computation) -> BTreeSet<String> {
        comp.operations
            .values()
            .filter(|op| op.kind.dialect() == Dialect::Standard)
            .filter(|op| {
                matches!(
                    comp.placement(&op.placement_name),
                    Some(Placement::Replicated(_))
                )
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
        match op.kind.clone() {
            Operator::Add(_) => self.process_additive(
                comp,
                ctx,
                op,
                inputs,
                "fixed_add",
                Operator::FixedAdd(FixedAddOp {}),
            ),
            Operator::Sub(_) => self.process_additive(
                comp,
                ctx,
                op,
                inputs,
                "fixed_sub",
                Operator::FixedSub(FixedSubOp {}),
            ),
            Operator::Mul(_) => self.process_multiplicative(
                comp,
                ctx,
                op,
                inputs,
                "fixed_mul",
                Operator::FixedMul(FixedMulOp {}),
            ),
            Operator::Dot(_) => self.process_multiplicative(
                comp,
                ctx,
                op,
                inputs,
                "fixed_dot",
                Operator::FixedDot(FixedDotOp {}),
            ),
            other => Err(Error::Compilation(format!(
                "no replicated lowering for '{}' in '{}'",
                other.type_name(),
                op.name
            ))),
        }
    }

    fn process_incoming_edge(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        src_name: &str,
        _slot: &str,
        dst: &Operation,
    ) -> Result<String> {
        let src = comp
            .operation(src_name)
            .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", src_name)))?;
        let (dtype, precision) = match &src.output_type {
            // Already fixedpoint-encoded on the host side.
            ValueType::EncodedTensor { .. } => return Ok(src_name.to_string()),
            ValueType::Tensor { dtype } if dtype.is_float() => (*dtype, self.default_precision),
            ValueType::Tensor {
                dtype: Dtype::Int64,
            } => (Dtype::Int64, 0),
            other => {
                return Err(Error::Compilation(format!(
                    "cannot encode value of type {} for replicated placement",
                    other
                )))
            }
        };

        let cache_key = (src_name.to_string(), dst.placement_name.clone());
        if let Some(encode) = self.incoming_edge_cache.get(&cache_key) {
            return Ok(encode.clone());
        }
        let encode = add_op(
            comp,
            ctx,
            "encode",
            Operator::Encode(EncodeOp { precision }),
            &[("value", src_name)],
            &dst.placement_name,
            ValueType::EncodedTensor { dtype, precision },
        )?;
        self.incoming_edge_cache.insert(cache_key, encode.clone());
        Ok(encode)
    }

    fn process_outgoing_edge(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        lowered: &String,
        _src_name: &str,
        _slot: &str,
        _dst: &Operation,
    ) -> Result<String> {
        if let Some(decode) = self.outgoing_edge_cache.get(lowered) {
            return Ok(decode.clone());
        }
        let src = comp
            .operation(lowered)
            .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", lowered)))?;
        let (_, precision) = encoded_type(src, "value")?;
        let dtype = if precision > 0 {
            Dtype::Float64
        } else {
            Dtype::Int64
        };
        let placement_name = src.placement_name.clone();
        let decode = add_op(
            comp,
            ctx,
            "decode",
            Operator::Decode(DecodeOp { precision }),
            &[("value", lowered)],
            &placement_name,
            ValueType::Tensor { dtype },
        )?;
        self.outgoing_edge_cache
            .insert(lowered.clone(), decode.clone());
        Ok(decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilation::Compiler;
    use crate::values::Constant;
    use maplit::btreemap;

    fn rep_computation(kind: Operator, dtype: Dtype) -> Computation {
        let mut comp = Computation::new();
        for host in &["alice", "bob", "carole", "dave"] {
            comp.add_placement(host, Placement::Host(HostPlacement {}))
                .unwrap();
        }
        comp.add_placement(
            "rep",
            Placement::Replicated(ReplicatedPlacement {
                player_names: [
                    "alice".to_string(),
                    "bob".to_string(),
                    "carole".to_string(),
                ],
            }),
        )
        .unwrap();
        let constant = |v| match dtype {
            Dtype::Int64 => Constant::Int64(v as i64),
            _ => Constant::Float64(v),
        };
        comp.add_operation(Operation {
            name: "a".to_string(),
            kind: Operator::Constant(ConstantOp { value: constant(1.0) }),
            inputs: btreemap! {},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor { dtype },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "b".to_string(),
            kind: Operator::Constant(ConstantOp { value: constant(2.0) }),
            inputs: btreemap! {},
            placement_name: "bob".to_string(),
            output_type: ValueType::Tensor { dtype },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "s".to_string(),
            kind,
            inputs: btreemap! {"lhs".to_string() => "a".to_string(), "rhs".to_string() => "b".to_string()},
            placement_name: "rep".to_string(),
            output_type: ValueType::Tensor { dtype },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "output_0".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "s".to_string()},
            placement_name: "dave".to_string(),
            output_type: ValueType::Unit,
        })
        .unwrap();
        comp
    }

    fn count_ops(comp: &Computation, pred: impl Fn(&Operator) -> bool) -> usize {
        comp.operations
            .values()
            .filter(|op| pred(&op.kind))
            .count()
    }

    #[test]
    fn test_add_keeps_precision() {
        let comp = rep_computation(Operator::Add(AddOp {}), Dtype::Float64);
        let mut compiler = Compiler::new(vec![Box::new(ReplicatedEncodingPass::default())]);
        let comp = compiler.run_passes(comp).unwrap();

        assert_eq!(
            count_ops(&comp, |k| matches!(k, Operator::Encode(_))),
            2
        );
        assert_eq!(count_ops(&comp, |k| matches!(k, Operator::TruncPr(_))), 0);
        let add = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::FixedAdd(_)))
            .unwrap();
        assert_eq!(add.placement_name, "rep");
        assert_eq!(
            add.output_type,
            ValueType::EncodedTensor {
                dtype: Dtype::Float64,
                precision: 16,
            }
        );
        let decode = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::Decode(_)))
            .unwrap();
        assert_eq!(decode.placement_name, "rep");
        assert_eq!(decode.kind, Operator::Decode(DecodeOp { precision: 16 }));
        assert_eq!(
            comp.operation("output_0").unwrap().inputs["value"],
            decode.name
        );
    }

    #[test]
    fn test_mul_adds_precisions_and_truncates() {
        let comp = rep_computation(Operator::Mul(MulOp {}), Dtype::Float64);
        let mut compiler = Compiler::new(vec![Box::new(ReplicatedEncodingPass::new(27))]);
        let comp = compiler.run_passes(comp).unwrap();

        let mul = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::FixedMul(_)))
            .unwrap();
        assert_eq!(
            mul.output_type,
            ValueType::EncodedTensor {
                dtype: Dtype::Float64,
                precision: 54,
            }
        );
        let trunc = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::TruncPr(_)))
            .unwrap();
        assert_eq!(
            trunc.kind,
            Operator::TruncPr(TruncPrOp { precision: 27 })
        );
        assert_eq!(
            trunc.output_type,
            ValueType::EncodedTensor {
                dtype: Dtype::Float64,
                precision: 27,
            }
        );
        assert_eq!(trunc.inputs["value"], mul.name);
        let decode = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::Decode(_)))
            .unwrap();
        assert_eq!(decode.kind, Operator::Decode(DecodeOp { precision: 27 }));
        assert_eq!(decode.inputs["value"], trunc.name);
    }

    #[test]
    fn test_int64_encodes_at_precision_zero_without_truncation() {
        let comp = rep_computation(Operator::Mul(MulOp {}), Dtype::Int64);
        let mut compiler = Compiler::new(vec![Box::new(ReplicatedEncodingPass::default())]);
        let comp = compiler.run_passes(comp).unwrap();

        let encode = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::Encode(_)))
            .unwrap();
        assert_eq!(encode.kind, Operator::Encode(EncodeOp { precision: 0 }));
        assert_eq!(count_ops(&comp, |k| matches!(k, Operator::TruncPr(_))), 0);
        let decode = comp
            .operations
            .values()
            .find(|op| matches!(op.kind, Operator::Decode(_)))
            .unwrap();
        assert_eq!(
            decode.output_type,
            ValueType::Tensor {
                dtype: Dtype::Int64
            }
        );
    }

    #[test]
    fn test_shared_host_input_is_encoded_once() {
        let mut comp = rep_computation(Operator::Add(AddOp {}), Dtype::Float64);
        // A second consumer of the same host-side constants on the same
        // replicated placement.
        comp.add_operation(Operation {
            name: "t".to_string(),
            kind: Operator::Mul(MulOp {}),
            inputs: btreemap! {"lhs".to_string() => "a".to_string(), "rhs".to_string() => "b".to_string()},
            placement_name: "rep".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "output_1".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "t".to_string()},
            placement_name: "dave".to_string(),
            output_type: ValueType::Unit,
        })
        .unwrap();

        let mut compiler = Compiler::new(vec![Box::new(ReplicatedEncodingPass::default())]);
        let comp = compiler.run_passes(comp).unwrap();
        assert_eq!(
            count_ops(&comp, |k| matches!(k, Operator::Encode(_))),
            2
        );
    }

    #[test]
    fn test_pass_is_identity_on_lowered_form() {
        let comp = rep_computation(Operator::Add(AddOp {}), Dtype::Float64);
        let mut compiler = Compiler::new(vec![Box::new(ReplicatedEncodingPass::default())]);
        let lowered = compiler.run_passes(comp).unwrap();

        let mut again = Compiler::new(vec![Box::new(ReplicatedEncodingPass::default())]);
        let relowered = again.run_passes(lowered.clone()).unwrap();
        assert_eq!(relowered, lowered);
    }
}

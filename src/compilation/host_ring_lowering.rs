//! Lowers host-side fixedpoint operations to explicit ring operations.

use super::emit::*;
use super::subgraph::{run_subgraph_replacement, SubgraphReplacementPass};
use super::{Context, Pass};
use crate::computation::*;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
pub struct HostRingLoweringPass {}

impl HostRingLoweringPass {
    pub fn new() -> HostRingLoweringPass {
        HostRingLoweringPass::default()
    }
}

impl Pass for HostRingLoweringPass {
    fn name(&self) -> &'static str {
        "host_ring_lowering"
    }

    fn run(&mut self, computation: Computation, context: &mut Context) -> Result<Computation> {
        run_subgraph_replacement(self, computation, context)
    }
}

impl SubgraphReplacementPass for HostRingLoweringPass {
    type Lowered = String;

    fn collect_subgraph(&self, comp: &Computation) -> BTreeSet<String> {
        comp.operations
            .values()
            .filter(|op| op.kind.dialect() == Dialect::Fixedpoint)
            .filter(|op| matches!(comp.placement(&op.placement_name), Some(Placement::Host(_))))
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
        let input = |slot: &str| -> Result<&str> {
            inputs
                .get(slot)
                .map(|name| name.as_str())
                .ok_or_else(|| Error::MissingInput {
                    op: op.name.clone(),
                    slot: slot.to_string(),
                })
        };
        let plc = op.placement_name.clone();

        match op.kind.clone() {
            Operator::Encode(encode) => add_op(
                comp,
                ctx,
                "ring_encode",
                Operator::RingFixedpointEncode(RingFixedpointEncodeOp {
                    scaling_base: 2,
                    scaling_exp: encode.precision,
                }),
                &[("value", input("value")?)],
                &plc,
                ValueType::Ring,
            ),
            Operator::Decode(decode) => add_op(
                comp,
                ctx,
                "ring_decode",
                Operator::RingFixedpointDecode(RingFixedpointDecodeOp {
                    scaling_base: 2,
                    scaling_exp: decode.precision,
                }),
                &[("value", input("value")?)],
                &plc,
                op.output_type.clone(),
            ),
            Operator::FixedAdd(_) => ring_add(comp, ctx, input("lhs")?, input("rhs")?, &plc),
            Operator::FixedSub(_) => ring_sub(comp, ctx, input("lhs")?, input("rhs")?, &plc),
            Operator::FixedMul(_) => ring_binary(
                comp,
                ctx,
                "ring_mul",
                Operator::RingMul(RingMulOp {}),
                input("lhs")?,
                input("rhs")?,
                &plc,
            ),
            Operator::FixedDot(_) => ring_binary(
                comp,
                ctx,
                "ring_dot",
                Operator::RingDot(RingDotOp {}),
                input("lhs")?,
                input("rhs")?,
                &plc,
            ),
            Operator::TruncPr(trunc) => {
                arithmetic_shr(comp, ctx, input("value")?, trunc.precision, &plc)
            }
            other => Err(Error::UnimplementedOperator(format!(
                "{} @ HostPlacement",
                other.type_name()
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

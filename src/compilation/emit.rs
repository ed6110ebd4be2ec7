//! Shared graph emission helpers for the lowering passes.

use super::Context;
use crate::computation::*;
use crate::error::{Error, Result};

pub(crate) fn add_op(
    comp: &mut Computation,
    ctx: &mut Context,
    prefix: &str,
    kind: Operator,
    inputs: &[(&str, &str)],
    placement: &str,
    output_type: ValueType,
) -> Result<String> {
    let name = ctx.fresh_name(prefix);
    comp.add_operation(Operation {
        name,
        kind,
        inputs: inputs
            .iter()
            .map(|(slot, producer)| (slot.to_string(), producer.to_string()))
            .collect(),
        placement_name: placement.to_string(),
        output_type,
    })
}

/// Pin a copy of `src` onto `placement`; a later networking pass turns
/// the edge into a transfer whenever the producer lives elsewhere.
pub(crate) fn identity(
    comp: &mut Computation,
    ctx: &mut Context,
    src: &str,
    placement: &str,
) -> Result<String> {
    let output_type = comp
        .operation(src)
        .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", src)))?
        .output_type
        .clone();
    add_op(
        comp,
        ctx,
        "identity",
        Operator::Identity(IdentityOp {}),
        &[("value", src)],
        placement,
        output_type,
    )
}

pub(crate) fn ring_binary(
    comp: &mut Computation,
    ctx: &mut Context,
    prefix: &str,
    kind: Operator,
    lhs: &str,
    rhs: &str,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        prefix,
        kind,
        &[("lhs", lhs), ("rhs", rhs)],
        placement,
        ValueType::Ring,
    )
}

pub(crate) fn ring_add(
    comp: &mut Computation,
    ctx: &mut Context,
    lhs: &str,
    rhs: &str,
    placement: &str,
) -> Result<String> {
    ring_binary(
        comp,
        ctx,
        "ring_add",
        Operator::RingAdd(RingAddOp {}),
        lhs,
        rhs,
        placement,
    )
}

pub(crate) fn ring_sub(
    comp: &mut Computation,
    ctx: &mut Context,
    lhs: &str,
    rhs: &str,
    placement: &str,
) -> Result<String> {
    ring_binary(
        comp,
        ctx,
        "ring_sub",
        Operator::RingSub(RingSubOp {}),
        lhs,
        rhs,
        placement,
    )
}

pub(crate) fn ring_shape(
    comp: &mut Computation,
    ctx: &mut Context,
    x: &str,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "ring_shape",
        Operator::RingShape(RingShapeOp {}),
        &[("value", x)],
        placement,
        ValueType::Shape,
    )
}

pub(crate) fn ring_fill(
    comp: &mut Computation,
    ctx: &mut Context,
    value: u64,
    shape: &str,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "ring_fill",
        Operator::RingFill(RingFillOp { value }),
        &[("shape", shape)],
        placement,
        ValueType::Ring,
    )
}

pub(crate) fn sample_key(
    comp: &mut Computation,
    ctx: &mut Context,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "key",
        Operator::SampleKey(SampleKeyOp {}),
        &[],
        placement,
        ValueType::PrfKey,
    )
}

pub(crate) fn derive_seed(
    comp: &mut Computation,
    ctx: &mut Context,
    key: &str,
    nonce: Vec<u8>,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "seed",
        Operator::DeriveSeed(DeriveSeedOp { nonce }),
        &[("key", key)],
        placement,
        ValueType::Seed,
    )
}

pub(crate) fn ring_sample_seeded(
    comp: &mut Computation,
    ctx: &mut Context,
    shape: &str,
    seed: &str,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "ring_sample",
        Operator::RingSampleSeeded(RingSampleSeededOp {}),
        &[("shape", shape), ("seed", seed)],
        placement,
        ValueType::Ring,
    )
}

/// Arithmetic right shift over the unsigned ring: logical shift of the
/// sign-offset value, then removal of the offset.
///
/// asr(x, f) = ((x + 2^63) >> f) - 2^(63 - f), valid for 1 <= f <= 63.
pub(crate) fn arithmetic_shr(
    comp: &mut Computation,
    ctx: &mut Context,
    x: &str,
    amount: u32,
    placement: &str,
) -> Result<String> {
    if amount == 0 || amount > 63 {
        return Err(Error::InvalidArgument(format!(
            "arithmetic shift amount must be in 1..=63, got {}",
            amount
        )));
    }
    let shape = ring_shape(comp, ctx, x, placement)?;
    let offset = ring_fill(comp, ctx, 1u64 << 63, &shape, placement)?;
    let shifted_in = ring_add(comp, ctx, x, &offset, placement)?;
    let shifted = add_op(
        comp,
        ctx,
        "ring_shr",
        Operator::RingShr(RingShrOp {
            amount: amount as usize,
        }),
        &[("value", &shifted_in)],
        placement,
        ValueType::Ring,
    )?;
    let correction = ring_fill(comp, ctx, 1u64 << (63 - amount), &shape, placement)?;
    ring_sub(comp, ctx, &shifted, &correction, placement)
}

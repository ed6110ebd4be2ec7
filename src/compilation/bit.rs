//! Bit-level graph builders used when lowering ring values to the bit
//! dialect, e.g. for comparison and carry-chain protocols.

use super::emit::add_op;
use super::Context;
use crate::computation::*;
use crate::error::{Error, Result};

pub const RING_BIT_LENGTH: usize = 64;

pub fn bit_extract(
    comp: &mut Computation,
    ctx: &mut Context,
    x: &str,
    bit_idx: usize,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "bit_extract",
        Operator::BitExtract(BitExtractOp { bit_idx }),
        &[("value", x)],
        placement,
        ValueType::Bit,
    )
}

/// Lift a bit tensor back into the ring at the given position.
pub fn ring_inject(
    comp: &mut Computation,
    ctx: &mut Context,
    bit: &str,
    bit_idx: usize,
    placement: &str,
) -> Result<String> {
    add_op(
        comp,
        ctx,
        "ring_inject",
        Operator::RingInject(RingInjectOp { bit_idx }),
        &[("value", bit)],
        placement,
        ValueType::Ring,
    )
}

/// Expand a 64-bit ring tensor into its 64 bit tensors, lowest first.
pub fn ring_bit_decompose(
    comp: &mut Computation,
    ctx: &mut Context,
    x: &str,
    placement: &str,
) -> Result<Vec<String>> {
    (0..RING_BIT_LENGTH)
        .map(|i| bit_extract(comp, ctx, x, i, placement))
        .collect()
}

/// Recompose bits into a ring tensor by summing their injections.
pub fn bit_compose(
    comp: &mut Computation,
    ctx: &mut Context,
    bits: &[String],
    placement: &str,
) -> Result<String> {
    if bits.is_empty() {
        return Err(Error::InvalidArgument(
            "cannot compose an empty list of bits".to_string(),
        ));
    }
    let mut acc = ring_inject(comp, ctx, &bits[0], 0, placement)?;
    for (i, bit) in bits.iter().enumerate().skip(1) {
        let injected = ring_inject(comp, ctx, bit, i, placement)?;
        acc = add_op(
            comp,
            ctx,
            "ring_add",
            Operator::RingAdd(RingAddOp {}),
            &[("lhs", &acc), ("rhs", &injected)],
            placement,
            ValueType::Ring,
        )?;
    }
    Ok(acc)
}

/// Positional left shift of a bit list: `amount` zeros enter at the
/// bottom and the top `amount` entries fall off.
pub fn rotate_left<T: Clone>(bits: &[T], amount: usize, zero: &T) -> Vec<T> {
    assert!(amount <= bits.len());
    let mut rotated = vec![zero.clone(); amount];
    rotated.extend_from_slice(&bits[..bits.len() - amount]);
    rotated
}

fn bit_binary(
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
        ValueType::Bit,
    )
}

fn bit_xor(
    comp: &mut Computation,
    ctx: &mut Context,
    lhs: &str,
    rhs: &str,
    placement: &str,
) -> Result<String> {
    bit_binary(
        comp,
        ctx,
        "bit_xor",
        Operator::BitXor(BitXorOp {}),
        lhs,
        rhs,
        placement,
    )
}

fn bit_and(
    comp: &mut Computation,
    ctx: &mut Context,
    lhs: &str,
    rhs: &str,
    placement: &str,
) -> Result<String> {
    bit_binary(
        comp,
        ctx,
        "bit_and",
        Operator::BitAnd(BitAndOp {}),
        lhs,
        rhs,
        placement,
    )
}

/// Binary addition over bit lists as a ripple-carry chain.
///
/// s_i = x_i ^ y_i ^ c_i and c_{i+1} = (x_i & y_i) ^ (c_i & (x_i ^ y_i)).
pub fn bit_add(
    comp: &mut Computation,
    ctx: &mut Context,
    x_bits: &[String],
    y_bits: &[String],
    placement: &str,
) -> Result<Vec<String>> {
    if x_bits.len() != y_bits.len() {
        return Err(Error::InvalidArgument(format!(
            "bit lists of unequal length: {} vs {}",
            x_bits.len(),
            y_bits.len()
        )));
    }
    let shape = add_op(
        comp,
        ctx,
        "shape",
        Operator::Shape(ShapeOp {}),
        &[("value", &x_bits[0])],
        placement,
        ValueType::Shape,
    )?;
    let mut carry = add_op(
        comp,
        ctx,
        "bit_fill",
        Operator::BitFill(BitFillOp { value: 0 }),
        &[("shape", &shape)],
        placement,
        ValueType::Bit,
    )?;

    let mut sum_bits = Vec::with_capacity(x_bits.len());
    for (x, y) in x_bits.iter().zip(y_bits.iter()) {
        let xy = bit_xor(comp, ctx, x, y, placement)?;
        sum_bits.push(bit_xor(comp, ctx, &xy, &carry, placement)?);
        let gen = bit_and(comp, ctx, x, y, placement)?;
        let prop = bit_and(comp, ctx, &carry, &xy, placement)?;
        carry = bit_xor(comp, ctx, &gen, &prop, placement)?;
    }
    Ok(sum_bits)
}

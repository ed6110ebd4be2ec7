//! Subgraph replacement, the workhorse behind the lowering passes.
//!
//! A pass selects a set of target operations (typically all operations
//! of one dialect on one kind of placement) and rewrites each of them,
//! resolving producers recursively and interposing boundary conversions
//! where an edge crosses into or out of the target set. Passes cache
//! their boundary conversions so that several uses of the same producer
//! share a single conversion node; downstream share generation relies
//! on this.

use super::Context;
use crate::computation::{Computation, Operation};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub trait SubgraphReplacementPass {
    /// Representative of a rewritten operation: an operation name for
    /// one-to-one passes, a share bundle for the replicated lowering.
    type Lowered: Clone;

    /// The names of the operations to rewrite. An empty set makes the
    /// pass the identity.
    fn collect_subgraph(&self, comp: &Computation) -> BTreeSet<String>;

    /// Rewrite one target operation given its fully resolved inputs.
    fn process_operation(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        op: &Operation,
        inputs: &BTreeMap<String, Self::Lowered>,
    ) -> Result<Self::Lowered>;

    /// Convert a producer outside the target set for use inside it.
    fn process_incoming_edge(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        src_name: &str,
        slot: &str,
        dst: &Operation,
    ) -> Result<Self::Lowered>;

    /// Convert a rewritten operation for a consumer outside the target
    /// set; returns the operation name the consumer should be rewired to.
    fn process_outgoing_edge(
        &mut self,
        comp: &mut Computation,
        ctx: &mut Context,
        lowered: &Self::Lowered,
        src_name: &str,
        slot: &str,
        dst: &Operation,
    ) -> Result<String>;
}

pub(crate) fn run_subgraph_replacement<P: SubgraphReplacementPass>(
    pass: &mut P,
    mut comp: Computation,
    ctx: &mut Context,
) -> Result<Computation> {
    let targets = pass.collect_subgraph(&comp);
    if targets.is_empty() {
        return Ok(comp);
    }

    let mut lowered: HashMap<String, P::Lowered> = HashMap::with_capacity(targets.len());
    for name in &targets {
        lower_operation(pass, &mut comp, ctx, &targets, &mut lowered, name)?;
    }

    // Rewire consumers outside the target set through boundary-out
    // conversions. Newly inserted operations never reference targets,
    // so including them in the scan is harmless.
    let consumers: Vec<String> = comp
        .operations
        .keys()
        .filter(|name| !targets.contains(*name))
        .cloned()
        .collect();
    for consumer_name in consumers {
        let consumer = comp.operations[&consumer_name].clone();
        let mut rewired = consumer.inputs.clone();
        let mut changed = false;
        for (slot, producer) in &consumer.inputs {
            if targets.contains(producer) {
                let repr = lowered[producer].clone();
                let replacement =
                    pass.process_outgoing_edge(&mut comp, ctx, &repr, producer, slot, &consumer)?;
                rewired.insert(slot.clone(), replacement);
                changed = true;
            }
        }
        if changed {
            comp.operations.get_mut(&consumer_name).unwrap().inputs = rewired;
        }
    }

    for name in &targets {
        comp.remove_operation(name)?;
    }
    Ok(comp)
}

fn lower_operation<P: SubgraphReplacementPass>(
    pass: &mut P,
    comp: &mut Computation,
    ctx: &mut Context,
    targets: &BTreeSet<String>,
    lowered: &mut HashMap<String, P::Lowered>,
    name: &str,
) -> Result<P::Lowered> {
    if let Some(repr) = lowered.get(name) {
        return Ok(repr.clone());
    }
    let op = comp
        .operation(name)
        .cloned()
        .ok_or_else(|| Error::Compilation(format!("unknown operation '{}'", name)))?;

    let mut inputs = BTreeMap::new();
    for (slot, producer) in &op.inputs {
        let repr = if targets.contains(producer) {
            lower_operation(pass, comp, ctx, targets, lowered, producer)?
        } else {
            pass.process_incoming_edge(comp, ctx, producer, slot, &op)?
        };
        inputs.insert(slot.clone(), repr);
    }

    let repr = pass.process_operation(comp, ctx, &op, &inputs)?;
    lowered.insert(name.to_string(), repr.clone());
    Ok(repr)
}

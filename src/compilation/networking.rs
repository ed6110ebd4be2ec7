//! Materializes cross-host edges as send/receive pairs.
//!
//! Runs after all local lowering. Every edge whose producer and
//! consumer sit on different host placements is split into a `Send` on
//! the producer side and a `Receive` on the consumer side, sharing a
//! fresh rendezvous key. One transfer is materialized per (producer,
//! receiving host) so that several consumers on the same host share a
//! single receive.

use super::emit::add_op;
use super::{Context, Pass};
use crate::computation::*;
use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Default)]
pub struct NetworkingPass {}

impl NetworkingPass {
    pub fn new() -> NetworkingPass {
        NetworkingPass::default()
    }
}

impl Pass for NetworkingPass {
    fn name(&self) -> &'static str {
        "networking"
    }

    fn run(&mut self, mut comp: Computation, ctx: &mut Context) -> Result<Computation> {
        let mut receive_cache: HashMap<(String, String), String> = HashMap::new();

        let consumers: Vec<String> = comp.operations.keys().cloned().collect();
        for consumer_name in consumers {
            let consumer = comp.operations[&consumer_name].clone();
            let mut rewired = consumer.inputs.clone();
            let mut changed = false;

            for (slot, producer_name) in &consumer.inputs {
                let producer = comp
                    .operation(producer_name)
                    .ok_or_else(|| {
                        Error::MalformedComputation(format!(
                            "operation '{}' references unknown input '{}'",
                            consumer_name, producer_name
                        ))
                    })?
                    .clone();
                if producer.placement_name == consumer.placement_name {
                    continue;
                }
                let local = matches!(
                    comp.placement(&producer.placement_name),
                    Some(Placement::Host(_))
                ) && matches!(
                    comp.placement(&consumer.placement_name),
                    Some(Placement::Host(_))
                );
                if !local {
                    return Err(Error::Compilation(format!(
                        "cannot materialize networking for edge '{}' -> '{}' between \
                         non-host placements",
                        producer_name, consumer_name
                    )));
                }

                let cache_key = (producer_name.clone(), consumer.placement_name.clone());
                let receive = match receive_cache.get(&cache_key) {
                    Some(receive) => receive.clone(),
                    None => {
                        let rendezvous_key =
                            RendezvousKey(ctx.fresh_name("rendezvous"));
                        add_op(
                            &mut comp,
                            ctx,
                            "send",
                            Operator::Send(SendOp {
                                sender: producer.placement_name.clone(),
                                receiver: consumer.placement_name.clone(),
                                rendezvous_key: rendezvous_key.clone(),
                            }),
                            &[("value", producer_name)],
                            &producer.placement_name,
                            ValueType::Unit,
                        )?;
                        let receive = add_op(
                            &mut comp,
                            ctx,
                            "receive",
                            Operator::Receive(ReceiveOp {
                                sender: producer.placement_name.clone(),
                                receiver: consumer.placement_name.clone(),
                                rendezvous_key,
                            }),
                            &[],
                            &consumer.placement_name,
                            producer.output_type.clone(),
                        )?;
                        receive_cache.insert(cache_key, receive.clone());
                        receive
                    }
                };
                rewired.insert(slot.clone(), receive);
                changed = true;
            }

            if changed {
                comp.operations.get_mut(&consumer_name).unwrap().inputs = rewired;
            }
        }
        Ok(comp)
    }
}

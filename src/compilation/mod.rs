//! Compilation of computations.
//!
//! A `Compiler` drives an ordered list of passes, each rewriting the
//! computation one dialect closer to something the executors can run.

use crate::computation::Computation;
use crate::error::Result;

pub mod bit;
pub(crate) mod emit;
pub mod host_encoding;
pub mod host_ring_lowering;
pub mod networking;
pub mod replicated_encoding;
pub mod replicated_lowering;
pub mod subgraph;

/// Default fractional precision used when encoding floating-point
/// inputs on replicated placements.
pub const DEFAULT_FIXEDPOINT_PRECISION: u32 = 16;

/// State threaded through an entire pass pipeline.
///
/// Names minted here are strictly monotone so that no pass can reuse a
/// name produced by an earlier pass.
#[derive(Default, Debug)]
pub struct Context {
    counter: u64,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    pub fn fresh_name(&mut self, prefix: &str) -> String {
        let name = format!("{}_{}", prefix, self.counter);
        self.counter += 1;
        name
    }
}

pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&mut self, computation: Computation, context: &mut Context) -> Result<Computation>;
}

pub struct Compiler {
    passes: Vec<Box<dyn Pass>>,
}

impl Compiler {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Compiler {
        Compiler { passes }
    }

    /// The canonical lowering pipeline with the given default encoding
    /// precision: standard -> fixedpoint -> ring on hosts, then
    /// networking materialization.
    pub fn from_precision(precision: u32) -> Compiler {
        Compiler::new(vec![
            Box::new(host_encoding::HostEncodingPass::new()),
            Box::new(replicated_encoding::ReplicatedEncodingPass::new(precision)),
            Box::new(replicated_lowering::ReplicatedLoweringPass::new()),
            Box::new(host_ring_lowering::HostRingLoweringPass::new()),
            Box::new(networking::NetworkingPass::new()),
        ])
    }

    pub fn run_passes(&mut self, mut computation: Computation) -> Result<Computation> {
        let mut context = Context::new();
        computation.check()?;
        for pass in self.passes.iter_mut() {
            tracing::debug!("Running pass {}", pass.name());
            computation = pass.run(computation, &mut context)?;
            computation.check()?;
        }
        Ok(computation)
    }
}

impl Default for Compiler {
    fn default() -> Compiler {
        Compiler::from_precision(DEFAULT_FIXEDPOINT_PRECISION)
    }
}

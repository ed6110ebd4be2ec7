//! The intermediate representation of computations.
//!
//! A computation is a graph of placed operations spanning several
//! dialects (standard, fixedpoint, ring, bit, primitive). Compiler
//! passes rewrite operations between dialects until only operations
//! with concrete kernels on host placements remain.

use crate::error::{Error, Result};
use crate::values::Constant;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// One end-to-end evaluation of a computation.
///
/// Chosen by the orchestrator; parties never mint their own.
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord, Display, From,
)]
#[display(fmt = "{}", _0)]
pub struct SessionId(pub u32);

/// Identifier matching a `Send` with its `Receive` within a session.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug, PartialOrd, Ord, Display, From)]
#[display(fmt = "{}", _0)]
pub struct RendezvousKey(pub String);

impl From<&str> for RendezvousKey {
    fn from(s: &str) -> RendezvousKey {
        RendezvousKey(s.to_string())
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Dtype {
    Float32,
    Float64,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Bool,
    Fixed {
        integral_precision: u32,
        fractional_precision: u32,
    },
}

impl Dtype {
    pub fn is_float(&self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64)
    }

    pub fn is_fixedpoint(&self) -> bool {
        matches!(self, Dtype::Fixed { .. })
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "float32"),
            Dtype::Float64 => write!(f, "float64"),
            Dtype::Int32 => write!(f, "int32"),
            Dtype::Int64 => write!(f, "int64"),
            Dtype::Uint32 => write!(f, "uint32"),
            Dtype::Uint64 => write!(f, "uint64"),
            Dtype::Bool => write!(f, "bool"),
            Dtype::Fixed {
                integral_precision,
                fractional_precision,
            } => write!(f, "fixed{}_{}", integral_precision, fractional_precision),
        }
    }
}

/// The closed lattice of types an operation may produce.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum ValueType {
    Unit,
    Shape,
    Seed,
    PrfKey,
    Tensor { dtype: Dtype },
    EncodedTensor { dtype: Dtype, precision: u32 },
    Ring,
    Bit,
    ReplicatedRing,
    ReplicatedBit,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueType::Unit => write!(f, "Unit"),
            ValueType::Shape => write!(f, "Shape"),
            ValueType::Seed => write!(f, "Seed"),
            ValueType::PrfKey => write!(f, "PrfKey"),
            ValueType::Tensor { dtype } => write!(f, "Tensor({})", dtype),
            ValueType::EncodedTensor { dtype, precision } => {
                write!(f, "EncodedTensor({}, {})", dtype, precision)
            }
            ValueType::Ring => write!(f, "Ring"),
            ValueType::Bit => write!(f, "Bit"),
            ValueType::ReplicatedRing => write!(f, "ReplicatedRing"),
            ValueType::ReplicatedBit => write!(f, "ReplicatedBit"),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct HostPlacement {}

/// Three hosts jointly holding 2-out-of-3 replicated shares.
///
/// The order of `player_names` is fixed and determines share roles:
/// player `i` holds shares `i` and `i+1 (mod 3)`.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ReplicatedPlacement {
    pub player_names: [String; 3],
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct MirroredPlacement {
    pub player_names: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct MpspdzPlacement {
    pub player_names: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(tag = "type_")]
pub enum Placement {
    #[serde(rename = "host.HostPlacement")]
    Host(HostPlacement),
    #[serde(rename = "rep.ReplicatedPlacement")]
    Replicated(ReplicatedPlacement),
    #[serde(rename = "mirrored.MirroredPlacement")]
    Mirrored(MirroredPlacement),
    #[serde(rename = "mpspdz.MpspdzPlacement")]
    Mpspdz(MpspdzPlacement),
}

impl Placement {
    /// Whether the placement designates `host` as one of its constituents.
    ///
    /// For a host placement the placement's own name in the placement
    /// table is the host name, so the caller passes that name along.
    pub fn designates(&self, own_name: &str, host: &str) -> bool {
        match self {
            Placement::Host(_) => own_name == host,
            Placement::Replicated(plc) => plc.player_names.iter().any(|p| p == host),
            Placement::Mirrored(plc) => plc.player_names.iter().any(|p| p == host),
            Placement::Mpspdz(plc) => plc.player_names.iter().any(|p| p == host),
        }
    }
}

// Standard dialect.

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ConstantOp {
    pub value: Constant,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct InputOp {
    pub arg_name: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct IdentityOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct AddOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct SubOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct MulOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct DivOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct DotOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct CastOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ShapeOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct OutputOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct LoadOp {
    pub key: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct SaveOp {
    pub key: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct SendOp {
    pub sender: String,
    pub receiver: String,
    pub rendezvous_key: RendezvousKey,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ReceiveOp {
    pub sender: String,
    pub receiver: String,
    pub rendezvous_key: RendezvousKey,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RunProgramOp {
    pub path: String,
    pub args: Vec<String>,
}

/// Escape hatch for party-local foreign code with bytes-to-bytes semantics.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct CallForeignFunctionOp {
    pub fn_bytes: Vec<u8>,
}

// Fixedpoint dialect.

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct EncodeOp {
    pub precision: u32,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct DecodeOp {
    pub precision: u32,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct FixedAddOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct FixedSubOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct FixedMulOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct FixedDotOp {}

/// Probabilistic truncation scaling a fixedpoint value down by `2^precision`.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct TruncPrOp {
    pub precision: u32,
}

// Ring dialect.

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingAddOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingSubOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingMulOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingDotOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingShapeOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingFillOp {
    pub value: u64,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingSampleSeededOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingShlOp {
    pub amount: usize,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingShrOp {
    pub amount: usize,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingFixedpointEncodeOp {
    pub scaling_base: u64,
    pub scaling_exp: u32,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingFixedpointDecodeOp {
    pub scaling_base: u64,
    pub scaling_exp: u32,
}

// Bit dialect.

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BitExtractOp {
    pub bit_idx: usize,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RingInjectOp {
    pub bit_idx: usize,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BitXorOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BitAndOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BitFillOp {
    pub value: u8,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BitSampleSeededOp {}

// Primitive dialect.

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct SampleKeyOp {}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct DeriveSeedOp {
    pub nonce: Vec<u8>,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Dialect {
    Standard,
    Fixedpoint,
    Ring,
    Bit,
    Primitive,
}

/// Tagged union over all operations of all dialects.
///
/// Discriminator strings are stable and shared with the serialized form.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(tag = "type_")]
pub enum Operator {
    #[serde(rename = "std.ConstantOperation")]
    Constant(ConstantOp),
    #[serde(rename = "std.InputOperation")]
    Input(InputOp),
    #[serde(rename = "std.IdentityOperation")]
    Identity(IdentityOp),
    #[serde(rename = "std.AddOperation")]
    Add(AddOp),
    #[serde(rename = "std.SubOperation")]
    Sub(SubOp),
    #[serde(rename = "std.MulOperation")]
    Mul(MulOp),
    #[serde(rename = "std.DivOperation")]
    Div(DivOp),
    #[serde(rename = "std.DotOperation")]
    Dot(DotOp),
    #[serde(rename = "std.CastOperation")]
    Cast(CastOp),
    #[serde(rename = "std.ShapeOperation")]
    Shape(ShapeOp),
    #[serde(rename = "std.OutputOperation")]
    Output(OutputOp),
    #[serde(rename = "std.LoadOperation")]
    Load(LoadOp),
    #[serde(rename = "std.SaveOperation")]
    Save(SaveOp),
    #[serde(rename = "std.SendOperation")]
    Send(SendOp),
    #[serde(rename = "std.ReceiveOperation")]
    Receive(ReceiveOp),
    #[serde(rename = "std.RunProgramOperation")]
    RunProgram(RunProgramOp),
    #[serde(rename = "std.CallForeignFunctionOperation")]
    CallForeignFunction(CallForeignFunctionOp),
    #[serde(rename = "fixedpoint.EncodeOperation")]
    Encode(EncodeOp),
    #[serde(rename = "fixedpoint.DecodeOperation")]
    Decode(DecodeOp),
    #[serde(rename = "fixedpoint.AddOperation")]
    FixedAdd(FixedAddOp),
    #[serde(rename = "fixedpoint.SubOperation")]
    FixedSub(FixedSubOp),
    #[serde(rename = "fixedpoint.MulOperation")]
    FixedMul(FixedMulOp),
    #[serde(rename = "fixedpoint.DotOperation")]
    FixedDot(FixedDotOp),
    #[serde(rename = "fixedpoint.TruncPrOperation")]
    TruncPr(TruncPrOp),
    #[serde(rename = "ring.RingAddOperation")]
    RingAdd(RingAddOp),
    #[serde(rename = "ring.RingSubOperation")]
    RingSub(RingSubOp),
    #[serde(rename = "ring.RingMulOperation")]
    RingMul(RingMulOp),
    #[serde(rename = "ring.RingDotOperation")]
    RingDot(RingDotOp),
    #[serde(rename = "ring.RingShapeOperation")]
    RingShape(RingShapeOp),
    #[serde(rename = "ring.FillTensorOperation")]
    RingFill(RingFillOp),
    #[serde(rename = "ring.RingSampleSeededOperation")]
    RingSampleSeeded(RingSampleSeededOp),
    #[serde(rename = "ring.RingShlOperation")]
    RingShl(RingShlOp),
    #[serde(rename = "ring.RingShrOperation")]
    RingShr(RingShrOp),
    #[serde(rename = "ring.RingFixedpointEncodeOperation")]
    RingFixedpointEncode(RingFixedpointEncodeOp),
    #[serde(rename = "ring.RingFixedpointDecodeOperation")]
    RingFixedpointDecode(RingFixedpointDecodeOp),
    #[serde(rename = "bit.BitExtractOperation")]
    BitExtract(BitExtractOp),
    #[serde(rename = "bit.RingInjectOperation")]
    RingInject(RingInjectOp),
    #[serde(rename = "bit.BitXorOperation")]
    BitXor(BitXorOp),
    #[serde(rename = "bit.BitAndOperation")]
    BitAnd(BitAndOp),
    #[serde(rename = "bit.BitFillOperation")]
    BitFill(BitFillOp),
    #[serde(rename = "bit.BitSampleSeededOperation")]
    BitSampleSeeded(BitSampleSeededOp),
    #[serde(rename = "prim.SampleKeyOperation")]
    SampleKey(SampleKeyOp),
    #[serde(rename = "prim.DeriveSeedOperation")]
    DeriveSeed(DeriveSeedOp),
}

impl Operator {
    /// The serialized discriminator of the operator.
    pub fn type_name(&self) -> &'static str {
        use Operator::*;
        match self {
            Constant(_) => "std.ConstantOperation",
            Input(_) => "std.InputOperation",
            Identity(_) => "std.IdentityOperation",
            Add(_) => "std.AddOperation",
            Sub(_) => "std.SubOperation",
            Mul(_) => "std.MulOperation",
            Div(_) => "std.DivOperation",
            Dot(_) => "std.DotOperation",
            Cast(_) => "std.CastOperation",
            Shape(_) => "std.ShapeOperation",
            Output(_) => "std.OutputOperation",
            Load(_) => "std.LoadOperation",
            Save(_) => "std.SaveOperation",
            Send(_) => "std.SendOperation",
            Receive(_) => "std.ReceiveOperation",
            RunProgram(_) => "std.RunProgramOperation",
            CallForeignFunction(_) => "std.CallForeignFunctionOperation",
            Encode(_) => "fixedpoint.EncodeOperation",
            Decode(_) => "fixedpoint.DecodeOperation",
            FixedAdd(_) => "fixedpoint.AddOperation",
            FixedSub(_) => "fixedpoint.SubOperation",
            FixedMul(_) => "fixedpoint.MulOperation",
            FixedDot(_) => "fixedpoint.DotOperation",
            TruncPr(_) => "fixedpoint.TruncPrOperation",
            RingAdd(_) => "ring.RingAddOperation",
            RingSub(_) => "ring.RingSubOperation",
            RingMul(_) => "ring.RingMulOperation",
            RingDot(_) => "ring.RingDotOperation",
            RingShape(_) => "ring.RingShapeOperation",
            RingFill(_) => "ring.FillTensorOperation",
            RingSampleSeeded(_) => "ring.RingSampleSeededOperation",
            RingShl(_) => "ring.RingShlOperation",
            RingShr(_) => "ring.RingShrOperation",
            RingFixedpointEncode(_) => "ring.RingFixedpointEncodeOperation",
            RingFixedpointDecode(_) => "ring.RingFixedpointDecodeOperation",
            BitExtract(_) => "bit.BitExtractOperation",
            RingInject(_) => "bit.RingInjectOperation",
            BitXor(_) => "bit.BitXorOperation",
            BitAnd(_) => "bit.BitAndOperation",
            BitFill(_) => "bit.BitFillOperation",
            BitSampleSeeded(_) => "bit.BitSampleSeededOperation",
            SampleKey(_) => "prim.SampleKeyOperation",
            DeriveSeed(_) => "prim.DeriveSeedOperation",
        }
    }

    pub fn dialect(&self) -> Dialect {
        use Operator::*;
        match self {
            Constant(_) | Input(_) | Identity(_) | Add(_) | Sub(_) | Mul(_) | Div(_) | Dot(_)
            | Cast(_) | Shape(_) | Output(_) | Load(_) | Save(_) | Send(_) | Receive(_)
            | RunProgram(_) | CallForeignFunction(_) => Dialect::Standard,
            Encode(_) | Decode(_) | FixedAdd(_) | FixedSub(_) | FixedMul(_) | FixedDot(_)
            | TruncPr(_) => Dialect::Fixedpoint,
            RingAdd(_) | RingSub(_) | RingMul(_) | RingDot(_) | RingShape(_) | RingFill(_)
            | RingSampleSeeded(_) | RingShl(_) | RingShr(_) | RingFixedpointEncode(_)
            | RingFixedpointDecode(_) => Dialect::Ring,
            BitExtract(_) | RingInject(_) | BitXor(_) | BitAnd(_) | BitFill(_)
            | BitSampleSeeded(_) => Dialect::Bit,
            SampleKey(_) | DeriveSeed(_) => Dialect::Primitive,
        }
    }

    /// The input slots the operator requires, or `None` for operators
    /// accepting an open-ended set of slots.
    pub fn expected_inputs(&self) -> Option<&'static [&'static str]> {
        use Operator::*;
        match self {
            Constant(_) | Input(_) | SampleKey(_) | Load(_) => Some(&[]),
            Receive(_) => Some(&[]),
            Identity(_) | Cast(_) | Shape(_) | Output(_) | Encode(_) | Decode(_) | TruncPr(_)
            | RingShape(_) | RingShl(_) | RingShr(_) | RingFixedpointEncode(_)
            | RingFixedpointDecode(_) | BitExtract(_) | RingInject(_) | Send(_) | Save(_) => {
                Some(&["value"])
            }
            Add(_) | Sub(_) | Mul(_) | Div(_) | Dot(_) | FixedAdd(_) | FixedSub(_)
            | FixedMul(_) | FixedDot(_) | RingAdd(_) | RingSub(_) | RingMul(_) | RingDot(_)
            | BitXor(_) | BitAnd(_) => Some(&["lhs", "rhs"]),
            RingFill(_) | BitFill(_) => Some(&["shape"]),
            RingSampleSeeded(_) | BitSampleSeeded(_) => Some(&["shape", "seed"]),
            DeriveSeed(_) => Some(&["key"]),
            RunProgram(_) | CallForeignFunction(_) => None,
        }
    }
}

/// A placed, named operation with named input slots.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Operation {
    pub name: String,
    #[serde(flatten)]
    pub kind: Operator,
    /// Slot label to producer operation name.
    pub inputs: BTreeMap<String, String>,
    pub placement_name: String,
    pub output_type: ValueType,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Computation {
    pub operations: BTreeMap<String, Operation>,
    pub placements: BTreeMap<String, Placement>,
}

impl Computation {
    pub fn new() -> Computation {
        Computation::default()
    }

    pub fn add_placement(&mut self, name: &str, placement: Placement) -> Result<()> {
        if self.placements.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        self.placements.insert(name.to_string(), placement);
        Ok(())
    }

    /// Add an operation, returning its name for convenient chaining.
    pub fn add_operation(&mut self, operation: Operation) -> Result<String> {
        if self.operations.contains_key(&operation.name) {
            return Err(Error::DuplicateName(operation.name));
        }
        let name = operation.name.clone();
        self.operations.insert(name.clone(), operation);
        Ok(name)
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    pub fn placement(&self, name: &str) -> Option<&Placement> {
        self.placements.get(name)
    }

    pub fn remove_operation(&mut self, name: &str) -> Result<Operation> {
        self.operations
            .remove(name)
            .ok_or_else(|| Error::MalformedComputation(format!("no operation named '{}'", name)))
    }

    /// Swap an operation in place, keeping its name stable.
    pub fn replace_operation(&mut self, name: &str, mut operation: Operation) -> Result<()> {
        if !self.operations.contains_key(name) {
            return Err(Error::MalformedComputation(format!(
                "no operation named '{}'",
                name
            )));
        }
        operation.name = name.to_string();
        self.operations.insert(name.to_string(), operation);
        Ok(())
    }

    /// Deterministic topological order, ties broken on operation name.
    pub fn topological_sort(&self) -> Result<Vec<&Operation>> {
        use petgraph::graph::{Graph, NodeIndex};
        use petgraph::Direction;

        let mut graph = Graph::<&str, ()>::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::with_capacity(self.operations.len());
        for name in self.operations.keys() {
            indices.insert(name, graph.add_node(name));
        }
        for op in self.operations.values() {
            for producer in op.inputs.values() {
                let src = indices.get(producer.as_str()).ok_or_else(|| {
                    Error::MalformedComputation(format!(
                        "operation '{}' references unknown input '{}'",
                        op.name, producer
                    ))
                })?;
                graph.add_edge(*src, indices[op.name.as_str()], ());
            }
        }

        let mut pending: HashMap<NodeIndex, usize> = indices
            .values()
            .map(|ix| {
                (
                    *ix,
                    graph.neighbors_directed(*ix, Direction::Incoming).count(),
                )
            })
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(ix, _)| graph[*ix])
            .collect();

        let mut ordered = Vec::with_capacity(self.operations.len());
        while let Some(name) = ready.iter().next().cloned() {
            ready.remove(name);
            ordered.push(&self.operations[name]);
            for succ in graph.neighbors_directed(indices[name], Direction::Outgoing) {
                let degree = pending.get_mut(&succ).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(graph[succ]);
                }
            }
        }

        if ordered.len() != self.operations.len() {
            return Err(Error::CycleDetected);
        }
        Ok(ordered)
    }

    /// Structural validity, verified at pass boundaries.
    pub fn check(&self) -> Result<()> {
        for op in self.operations.values() {
            if !self.placements.contains_key(&op.placement_name) {
                return Err(Error::MalformedComputation(format!(
                    "operation '{}' placed on unknown placement '{}'",
                    op.name, op.placement_name
                )));
            }
            for producer in op.inputs.values() {
                if !self.operations.contains_key(producer) {
                    return Err(Error::MalformedComputation(format!(
                        "operation '{}' references unknown input '{}'",
                        op.name, producer
                    )));
                }
            }
            if let Some(slots) = op.kind.expected_inputs() {
                for slot in slots {
                    if !op.inputs.contains_key(*slot) {
                        return Err(Error::MissingInput {
                            op: op.name.clone(),
                            slot: slot.to_string(),
                        });
                    }
                }
            }
        }
        self.topological_sort()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn host(comp: &mut Computation, name: &str) {
        comp.add_placement(name, Placement::Host(HostPlacement {}))
            .unwrap();
    }

    fn constant(name: &str, plc: &str) -> Operation {
        Operation {
            name: name.to_string(),
            kind: Operator::Constant(ConstantOp {
                value: Constant::Float64(1.0),
            }),
            inputs: btreemap! {},
            placement_name: plc.to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        }
    }

    fn add(name: &str, lhs: &str, rhs: &str, plc: &str) -> Operation {
        Operation {
            name: name.to_string(),
            kind: Operator::Add(AddOp {}),
            inputs: btreemap! {"lhs".to_string() => lhs.to_string(), "rhs".to_string() => rhs.to_string()},
            placement_name: plc.to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(constant("x", "alice")).unwrap();
        let err = comp.add_operation(constant("x", "alice")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "x"));
    }

    #[test]
    fn test_topological_sort_is_deterministic() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(constant("b", "alice")).unwrap();
        comp.add_operation(constant("a", "alice")).unwrap();
        comp.add_operation(add("z", "a", "b", "alice")).unwrap();
        let order: Vec<&str> = comp
            .topological_sort()
            .unwrap()
            .iter()
            .map(|op| op.name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "z"]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(add("x", "y", "y", "alice")).unwrap();
        comp.add_operation(add("y", "x", "x", "alice")).unwrap();
        assert!(matches!(
            comp.topological_sort().unwrap_err(),
            Error::CycleDetected
        ));
    }

    #[test]
    fn test_replace_operation_keeps_the_name() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(constant("x", "alice")).unwrap();
        let mut replacement = constant("ignored", "alice");
        replacement.kind = Operator::Constant(ConstantOp {
            value: Constant::Float64(2.0),
        });
        comp.replace_operation("x", replacement).unwrap();
        let op = comp.operation("x").unwrap();
        assert_eq!(op.name, "x");
        assert_eq!(
            op.kind,
            Operator::Constant(ConstantOp {
                value: Constant::Float64(2.0)
            })
        );
    }

    #[test]
    fn test_remove_missing_operation_fails() {
        let mut comp = Computation::new();
        assert!(matches!(
            comp.remove_operation("x").unwrap_err(),
            Error::MalformedComputation(_)
        ));
    }

    #[test]
    fn test_check_rejects_missing_placement() {
        let mut comp = Computation::new();
        comp.add_operation(constant("x", "alice")).unwrap();
        assert!(matches!(
            comp.check().unwrap_err(),
            Error::MalformedComputation(_)
        ));
    }

    #[test]
    fn test_check_rejects_missing_slot() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(constant("x", "alice")).unwrap();
        let mut op = add("z", "x", "x", "alice");
        op.inputs.remove("rhs");
        comp.add_operation(op).unwrap();
        assert!(matches!(
            comp.check().unwrap_err(),
            Error::MissingInput { op, slot } if op == "z" && slot == "rhs"
        ));
    }
}

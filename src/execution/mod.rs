//! Asynchronous per-party execution of computations.
//!
//! Each party evaluates only the slice of operations assigned to it.
//! Dataflow is wired through lazily created single-assignment cells,
//! one per produced value; every operation runs as an independent
//! cooperative task that awaits its input cells before computing. No
//! topological pre-sorting takes place, and the first failing
//! operation cancels the rest of the session slice.

use crate::computation::{Computation, Operation, Operator, SessionId};
use crate::error::{Error, Result};
use crate::networking::AsyncNetworking;
use crate::storage::AsyncStorage;
use crate::values::Value;
use async_cell::sync::AsyncCell;
use derive_more::{Display, From};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

pub mod kernels;

/// A party participating in a session, typically a host placement name
/// bound to a concrete endpoint.
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Debug, PartialOrd, Ord, Display, From,
)]
#[display(fmt = "{}", _0)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Identity {
        Identity(s.to_string())
    }
}

/// Handler for `CallForeignFunction` operations: opaque function bytes
/// plus resolved inputs to a value.
pub type ForeignFunc = Arc<dyn Fn(&[u8], &[Value]) -> Result<Value> + Send + Sync>;

pub type RoleAssignment = HashMap<String, Identity>;

/// Everything a kernel may touch during one evaluation.
pub struct Session {
    pub session_id: SessionId,
    pub own_identity: Identity,
    pub arguments: HashMap<String, Value>,
    pub role_assignment: RoleAssignment,
    pub networking: Arc<dyn AsyncNetworking>,
    pub storage: Arc<dyn AsyncStorage>,
    pub foreign_fn: Option<ForeignFunc>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        own_identity: Identity,
        role_assignment: RoleAssignment,
        networking: Arc<dyn AsyncNetworking>,
        storage: Arc<dyn AsyncStorage>,
    ) -> Session {
        Session {
            session_id,
            own_identity,
            arguments: HashMap::new(),
            role_assignment,
            networking,
            storage,
            foreign_fn: None,
        }
    }

    pub fn with_arguments(mut self, arguments: HashMap<String, Value>) -> Session {
        self.arguments = arguments;
        self
    }

    pub fn with_foreign_fn(mut self, foreign_fn: ForeignFunc) -> Session {
        self.foreign_fn = Some(foreign_fn);
        self
    }

    pub(crate) fn identity_for(&self, role: &str) -> Result<Identity> {
        self.role_assignment
            .get(role)
            .cloned()
            .ok_or_else(|| Error::Networking(format!("no identity assigned to role '{}'", role)))
    }
}

#[derive(Default)]
pub struct AsyncExecutor {}

impl AsyncExecutor {
    pub fn new() -> AsyncExecutor {
        AsyncExecutor::default()
    }

    /// Evaluate the slice of `computation` assigned to `role`,
    /// returning the values of its `Output` operations.
    pub async fn run_computation(
        &self,
        computation: &Computation,
        role: &str,
        session: &Arc<Session>,
    ) -> Result<HashMap<String, Value>> {
        let slice: Vec<&Operation> = computation
            .operations
            .values()
            .filter(|op| match computation.placement(&op.placement_name) {
                Some(plc) => plc.designates(&op.placement_name, role),
                None => false,
            })
            .collect();
        tracing::debug!(
            "{} executing {} of {} operations in session {}",
            role,
            slice.len(),
            computation.operations.len(),
            session.session_id
        );

        // After networking materialization every edge is local; reject
        // slices that would deadlock on a value no task will produce.
        let produced: HashSet<&str> = slice.iter().map(|op| op.name.as_str()).collect();
        for op in &slice {
            for producer in op.inputs.values() {
                if !produced.contains(producer.as_str()) {
                    return Err(Error::MalformedComputation(format!(
                        "operation '{}' on '{}' consumes '{}' produced elsewhere; \
                         networking has not been materialized",
                        op.name, role, producer
                    )));
                }
            }
        }

        let mut cells: HashMap<String, Arc<AsyncCell<Value>>> =
            HashMap::with_capacity(slice.len());
        let mut cell = |name: &str| -> Arc<AsyncCell<Value>> {
            cells
                .entry(name.to_string())
                .or_insert_with(AsyncCell::shared)
                .clone()
        };

        let output_names: Vec<String> = slice
            .iter()
            .filter(|op| matches!(op.kind, Operator::Output(_)))
            .map(|op| op.name.clone())
            .collect();

        let mut tasks = FuturesUnordered::new();
        for op in &slice {
            let op = (*op).clone();
            let inputs: BTreeMap<String, Arc<AsyncCell<Value>>> = op
                .inputs
                .iter()
                .map(|(slot, producer)| (slot.clone(), cell(producer)))
                .collect();
            let output = cell(&op.name);
            let session = Arc::clone(session);
            tasks.push(async move {
                let name = op.name.clone();
                kernels::execute(op, session, inputs, output)
                    .await
                    .map_err(|e| e.in_operation(&name))
            });
        }

        while let Some(completed) = tasks.next().await {
            // Dropping the remaining tasks on error cancels them,
            // including receives suspended on the channel manager.
            completed?;
        }

        let mut outputs = HashMap::with_capacity(output_names.len());
        for name in output_names {
            let value = cells[&name].get().await;
            outputs.insert(name, value);
        }
        Ok(outputs)
    }
}

/// The abstract dispatch surface a remote executor service implements:
/// a serialized computation plus a role and session id, evaluated to
/// the role's outputs.
#[async_trait::async_trait]
pub trait ComputationDispatcher: Send + Sync {
    async fn run_computation(
        &self,
        computation_bytes: &[u8],
        role: &str,
        session_id: SessionId,
    ) -> Result<HashMap<String, Value>>;
}

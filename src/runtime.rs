//! Orchestration of sessions across parties.
//!
//! The runtime fans a compiled computation out to one executor per
//! assigned identity under a shared session id and joins with
//! first-exception semantics: any party failure cancels the remaining
//! parties and fails the session.

use crate::computation::{Computation, SessionId};
use crate::error::{Error, Result};
use crate::execution::{
    AsyncExecutor, ComputationDispatcher, ForeignFunc, Identity, RoleAssignment, Session,
};
use crate::networking::LocalNetworking;
use crate::serialization::deserialize_computation;
use crate::storage::{AsyncStorage, LocalAsyncStorage};
use crate::values::Value;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct LocalRuntime {
    networking: Arc<LocalNetworking>,
    storages: HashMap<Identity, Arc<dyn AsyncStorage>>,
    foreign_fn: Option<ForeignFunc>,
}

impl LocalRuntime {
    pub fn new() -> LocalRuntime {
        LocalRuntime::default()
    }

    /// Seed parties with pre-populated storage, e.g. for `Load` inputs
    /// or to inspect `Save` results after the session.
    pub fn with_storage(storages: HashMap<Identity, Arc<dyn AsyncStorage>>) -> LocalRuntime {
        LocalRuntime {
            networking: Arc::new(LocalNetworking::new()),
            storages,
            foreign_fn: None,
        }
    }

    pub fn with_foreign_fn(mut self, foreign_fn: ForeignFunc) -> LocalRuntime {
        self.foreign_fn = Some(foreign_fn);
        self
    }

    pub async fn evaluate_computation(
        &self,
        computation: &Computation,
        role_assignment: RoleAssignment,
        arguments: HashMap<String, Value>,
    ) -> anyhow::Result<HashMap<Identity, HashMap<String, Value>>> {
        let session_id = SessionId(rand::random::<u32>());
        tracing::info!("Evaluating computation in session {}", session_id);

        let mut parties = FuturesUnordered::new();
        for (role, identity) in &role_assignment {
            let storage = self
                .storages
                .get(identity)
                .cloned()
                .unwrap_or_else(|| Arc::new(LocalAsyncStorage::new()));
            let networking: Arc<dyn crate::networking::AsyncNetworking> = self.networking.clone();
            let mut session = Session::new(
                session_id,
                identity.clone(),
                role_assignment.clone(),
                networking,
                storage,
            )
            .with_arguments(arguments.clone());
            if let Some(foreign_fn) = &self.foreign_fn {
                session = session.with_foreign_fn(foreign_fn.clone());
            }
            let session = Arc::new(session);
            parties.push(async move {
                let executor = AsyncExecutor::new();
                let outputs = executor.run_computation(computation, role, &session).await?;
                Ok::<_, Error>((session.own_identity.clone(), outputs))
            });
        }

        let mut results = HashMap::with_capacity(role_assignment.len());
        while let Some(party_result) = parties.next().await {
            match party_result {
                Ok((identity, outputs)) => {
                    results.insert(identity, outputs);
                }
                Err(e) => {
                    // Cancel the remaining parties and reclaim the
                    // session's channel state before surfacing.
                    drop(parties);
                    self.networking.release_session(session_id);
                    return Err(e.into());
                }
            }
        }
        self.networking.release_session(session_id);
        Ok(results)
    }
}

/// In-process realization of the remote executor surface: a serialized
/// computation plus role and session id, evaluated against local
/// networking and storage.
pub struct LocalDispatcher {
    identity: Identity,
    role_assignment: RoleAssignment,
    networking: Arc<dyn crate::networking::AsyncNetworking>,
    storage: Arc<dyn AsyncStorage>,
}

impl LocalDispatcher {
    pub fn new(
        identity: Identity,
        role_assignment: RoleAssignment,
        networking: Arc<dyn crate::networking::AsyncNetworking>,
        storage: Arc<dyn AsyncStorage>,
    ) -> LocalDispatcher {
        LocalDispatcher {
            identity,
            role_assignment,
            networking,
            storage,
        }
    }
}

#[async_trait::async_trait]
impl ComputationDispatcher for LocalDispatcher {
    async fn run_computation(
        &self,
        computation_bytes: &[u8],
        role: &str,
        session_id: SessionId,
    ) -> Result<HashMap<String, Value>> {
        let computation = deserialize_computation(computation_bytes)?;
        let session = Arc::new(Session::new(
            session_id,
            self.identity.clone(),
            self.role_assignment.clone(),
            self.networking.clone(),
            self.storage.clone(),
        ));
        AsyncExecutor::new()
            .run_computation(&computation, role, &session)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilation::Compiler;
    use crate::computation::*;
    use crate::serialization::serialize_computation;
    use crate::values::Constant;
    use maplit::{btreemap, hashmap};
    use std::time::Duration;

    fn host(comp: &mut Computation, name: &str) {
        comp.add_placement(name, Placement::Host(HostPlacement {}))
            .unwrap();
    }

    fn constant(comp: &mut Computation, name: &str, value: Constant, plc: &str) {
        let output_type = value.ty();
        comp.add_operation(Operation {
            name: name.to_string(),
            kind: Operator::Constant(ConstantOp { value }),
            inputs: btreemap! {},
            placement_name: plc.to_string(),
            output_type,
        })
        .unwrap();
    }

    fn rep_scenario(kind: Operator, lhs: Constant, rhs: Constant) -> Computation {
        let mut comp = Computation::new();
        for name in &["alice", "bob", "carole", "dave"] {
            host(&mut comp, name);
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
        let output_type = lhs.ty();
        constant(&mut comp, "a", lhs, "alice");
        constant(&mut comp, "b", rhs, "bob");
        comp.add_operation(Operation {
            name: "s".to_string(),
            kind,
            inputs: btreemap! {"lhs".to_string() => "a".to_string(), "rhs".to_string() => "b".to_string()},
            placement_name: "rep".to_string(),
            output_type: output_type.clone(),
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "output_0".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "s".to_string()},
            placement_name: "dave".to_string(),
            output_type,
        })
        .unwrap();
        comp
    }

    fn four_hosts() -> RoleAssignment {
        hashmap! {
            "alice".to_string() => Identity::from("alice"),
            "bob".to_string() => Identity::from("bob"),
            "carole".to_string() => Identity::from("carole"),
            "dave".to_string() => Identity::from("dave"),
        }
    }

    async fn evaluate(
        comp: &Computation,
        roles: RoleAssignment,
    ) -> HashMap<Identity, HashMap<String, Value>> {
        LocalRuntime::new()
            .evaluate_computation(comp, roles, HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replicated_addition_end_to_end() {
        let comp = rep_scenario(
            Operator::Add(AddOp {}),
            Constant::Float64(1.0),
            Constant::Float64(2.0),
        );
        let comp = Compiler::default().run_passes(comp).unwrap();
        let results = evaluate(&comp, four_hosts()).await;

        let output = results[&Identity::from("dave")]["output_0"]
            .as_float64("value")
            .unwrap()
            .sum();
        approx::assert_abs_diff_eq!(output, 3.0, epsilon = 2f64.powi(-16));
    }

    #[tokio::test]
    async fn test_replicated_multiplication_end_to_end() {
        let comp = rep_scenario(
            Operator::Mul(MulOp {}),
            Constant::Float64(1.0),
            Constant::Float64(2.0),
        );
        let comp = Compiler::from_precision(27).run_passes(comp).unwrap();
        let results = evaluate(&comp, four_hosts()).await;

        let output = results[&Identity::from("dave")]["output_0"]
            .as_float64("value")
            .unwrap()
            .sum();
        approx::assert_abs_diff_eq!(output, 2.0, epsilon = 2f64.powi(-20));
    }

    #[tokio::test]
    async fn test_replicated_integer_multiplication_end_to_end() {
        let comp = rep_scenario(
            Operator::Mul(MulOp {}),
            Constant::Int64(2),
            Constant::Int64(3),
        );
        let comp = Compiler::default().run_passes(comp).unwrap();
        let results = evaluate(&comp, four_hosts()).await;

        let output = results[&Identity::from("dave")]["output_0"]
            .as_int64("value")
            .unwrap()
            .sum();
        assert_eq!(output, 6);
    }

    #[tokio::test]
    async fn test_every_edge_is_local_after_networking() {
        let comp = rep_scenario(
            Operator::Add(AddOp {}),
            Constant::Float64(1.0),
            Constant::Float64(2.0),
        );
        let comp = Compiler::default().run_passes(comp).unwrap();

        for op in comp.operations.values() {
            for producer in op.inputs.values() {
                assert_eq!(
                    comp.operation(producer).unwrap().placement_name,
                    op.placement_name,
                    "edge {} -> {} crosses placements",
                    producer,
                    op.name
                );
            }
        }
        let keys: std::collections::HashSet<_> = comp
            .operations
            .values()
            .filter_map(|op| match &op.kind {
                Operator::Send(send) => Some(send.rendezvous_key.clone()),
                _ => None,
            })
            .collect();
        let sends = comp
            .operations
            .values()
            .filter(|op| matches!(op.kind, Operator::Send(_)))
            .count();
        assert_eq!(keys.len(), sends);
        assert!(sends > 0);
    }

    #[tokio::test]
    async fn test_party_failure_fails_the_session() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        host(&mut comp, "bob");
        comp.add_operation(Operation {
            name: "doomed".to_string(),
            kind: Operator::RunProgram(RunProgramOp {
                path: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 3".to_string(), "--".to_string()],
            }),
            inputs: btreemap! {},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "output_0".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "doomed".to_string()},
            placement_name: "bob".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        let comp = Compiler::default().run_passes(comp).unwrap();

        let runtime = LocalRuntime::new();
        let roles = hashmap! {
            "alice".to_string() => Identity::from("alice"),
            "bob".to_string() => Identity::from("bob"),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            runtime.evaluate_computation(&comp, roles, HashMap::new()),
        )
        .await
        .expect("session did not fail fast");

        let err = result.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::OperationFailed { op, source }) => {
                assert_eq!(op, "doomed");
                assert!(matches!(
                    **source,
                    Error::ForeignProcessFailure { exit_code: 3, .. }
                ));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_and_save_through_party_storage() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        comp.add_operation(Operation {
            name: "x".to_string(),
            kind: Operator::Load(LoadOp {
                key: "in".to_string(),
            }),
            inputs: btreemap! {},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "save_x".to_string(),
            kind: Operator::Save(SaveOp {
                key: "out".to_string(),
            }),
            inputs: btreemap! {"value".to_string() => "x".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Unit,
        })
        .unwrap();

        let storage = Arc::new(crate::storage::LocalAsyncStorage::from_values(
            hashmap! {"in".to_string() => Constant::Float64(7.0).value()},
        ));
        let alice_storage: Arc<dyn AsyncStorage> = storage.clone();
        let runtime = LocalRuntime::with_storage(hashmap! {
            Identity::from("alice") => alice_storage,
        });
        runtime
            .evaluate_computation(
                &comp,
                hashmap! {"alice".to_string() => Identity::from("alice")},
                HashMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            storage.load("out").await.unwrap(),
            Constant::Float64(7.0).value()
        );
    }

    #[tokio::test]
    async fn test_foreign_function_handler() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        constant(&mut comp, "x", Constant::Float64(21.0), "alice");
        comp.add_operation(Operation {
            name: "doubled".to_string(),
            kind: Operator::CallForeignFunction(CallForeignFunctionOp {
                fn_bytes: vec![2],
            }),
            inputs: btreemap! {"value".to_string() => "x".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "output_0".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "doubled".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();

        let runtime = LocalRuntime::new().with_foreign_fn(Arc::new(|fn_bytes, inputs| {
            let factor = fn_bytes[0] as f64;
            let x = inputs[0].as_float64("value")?;
            Ok(Value::Float64Tensor(x.mapv(|el| el * factor)))
        }));
        let roles = hashmap! {"alice".to_string() => Identity::from("alice")};
        let results = runtime
            .evaluate_computation(&comp, roles, HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            results[&Identity::from("alice")]["output_0"]
                .as_float64("value")
                .unwrap()
                .sum(),
            42.0
        );
    }

    #[tokio::test]
    async fn test_dispatcher_accepts_serialized_computations() {
        let mut comp = Computation::new();
        host(&mut comp, "alice");
        constant(&mut comp, "x", Constant::Float64(1.0), "alice");
        comp.add_operation(Operation {
            name: "output_0".to_string(),
            kind: Operator::Output(OutputOp {}),
            inputs: btreemap! {"value".to_string() => "x".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        let bytes = serialize_computation(&comp).unwrap();

        let dispatcher = LocalDispatcher::new(
            Identity::from("alice"),
            hashmap! {"alice".to_string() => Identity::from("alice")},
            Arc::new(LocalNetworking::new()),
            Arc::new(LocalAsyncStorage::new()),
        );
        let outputs = dispatcher
            .run_computation(&bytes, "alice", SessionId(5))
            .await
            .unwrap();
        assert_eq!(outputs["output_0"], Constant::Float64(1.0).value());
    }
}

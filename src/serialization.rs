//! Binary serialization of computations.
//!
//! The format is self-describing MessagePack: placements and operations
//! are maps whose `type_` entry carries the dialect-qualified
//! discriminator (e.g. `"ring.RingAddOperation"`, `"host.HostPlacement"`).
//! Unknown discriminators are hard failures.

use crate::computation::Computation;
use crate::error::{Error, Result};

pub fn serialize_computation(computation: &Computation) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(computation).map_err(|e| Error::SerializationError(e.to_string()))
}

pub fn deserialize_computation(bytes: &[u8]) -> Result<Computation> {
    rmp_serde::from_slice(bytes).map_err(classify_error)
}

fn classify_error(e: rmp_serde::decode::Error) -> Error {
    let message = e.to_string();
    match unknown_variant(&message) {
        Some(variant) if variant.ends_with("Placement") => Error::UnknownPlacementType(variant),
        Some(variant) => Error::UnknownOperationType(variant),
        None => Error::SerializationError(message),
    }
}

/// Extract the backtick-quoted discriminator out of serde's
/// "unknown variant" message, if that is what failed.
fn unknown_variant(message: &str) -> Option<String> {
    let start = message.find("unknown variant `")?;
    let rest = &message[start + "unknown variant `".len()..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::*;
    use crate::values::Constant;
    use maplit::btreemap;
    use proptest::prelude::*;

    fn example_computation() -> Computation {
        let mut comp = Computation::new();
        comp.add_placement("alice", Placement::Host(HostPlacement {}))
            .unwrap();
        comp.add_placement("bob", Placement::Host(HostPlacement {}))
            .unwrap();
        comp.add_placement("carole", Placement::Host(HostPlacement {}))
            .unwrap();
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
        comp.add_placement(
            "mirrored",
            Placement::Mirrored(MirroredPlacement {
                player_names: vec!["alice".to_string(), "bob".to_string()],
            }),
        )
        .unwrap();
        comp.add_placement(
            "mpspdz",
            Placement::Mpspdz(MpspdzPlacement {
                player_names: vec!["alice".to_string(), "bob".to_string()],
            }),
        )
        .unwrap();

        comp.add_operation(Operation {
            name: "x".to_string(),
            kind: Operator::Constant(ConstantOp {
                value: Constant::Float64Tensor(ndarray::arr1(&[1.0, 2.5]).into_dyn()),
            }),
            inputs: btreemap! {},
            placement_name: "alice".to_string(),
            output_type: ValueType::Tensor {
                dtype: Dtype::Float64,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "x_enc".to_string(),
            kind: Operator::Encode(EncodeOp { precision: 16 }),
            inputs: btreemap! {"value".to_string() => "x".to_string()},
            placement_name: "rep".to_string(),
            output_type: ValueType::EncodedTensor {
                dtype: Dtype::Float64,
                precision: 16,
            },
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "seed".to_string(),
            kind: Operator::DeriveSeed(DeriveSeedOp {
                nonce: vec![1, 2, 3],
            }),
            inputs: btreemap! {"key".to_string() => "key".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Seed,
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "key".to_string(),
            kind: Operator::SampleKey(SampleKeyOp {}),
            inputs: btreemap! {},
            placement_name: "alice".to_string(),
            output_type: ValueType::PrfKey,
        })
        .unwrap();
        comp.add_operation(Operation {
            name: "send_x".to_string(),
            kind: Operator::Send(SendOp {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                rendezvous_key: RendezvousKey::from("rdv_0"),
            }),
            inputs: btreemap! {"value".to_string() => "x".to_string()},
            placement_name: "alice".to_string(),
            output_type: ValueType::Unit,
        })
        .unwrap();
        comp
    }

    #[test]
    fn test_round_trip_is_identity() {
        let comp = example_computation();
        let bytes = serialize_computation(&comp).unwrap();
        let decoded = deserialize_computation(&bytes).unwrap();
        assert_eq!(decoded, comp);
    }

    #[test]
    fn test_unknown_operation_discriminator_is_rejected() {
        let bogus = serde_json::json!({
            "operations": {
                "x": {
                    "type_": "std.BogusOperation",
                    "name": "x",
                    "inputs": {},
                    "placement_name": "alice",
                    "output_type": "Unit",
                }
            },
            "placements": {
                "alice": { "type_": "host.HostPlacement" }
            }
        });
        let bytes = rmp_serde::to_vec_named(&bogus).unwrap();
        let err = deserialize_computation(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownOperationType(variant) if variant == "std.BogusOperation"
        ));
    }

    #[test]
    fn test_unknown_placement_discriminator_is_rejected() {
        let bogus = serde_json::json!({
            "operations": {},
            "placements": {
                "alice": { "type_": "host.QuantumPlacement" }
            }
        });
        let bytes = rmp_serde::to_vec_named(&bogus).unwrap();
        let err = deserialize_computation(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownPlacementType(variant) if variant == "host.QuantumPlacement"
        ));
    }

    #[test]
    fn test_value_types_round_trip() {
        let types = vec![
            ValueType::Unit,
            ValueType::Shape,
            ValueType::Seed,
            ValueType::PrfKey,
            ValueType::Tensor {
                dtype: Dtype::Float64,
            },
            ValueType::Tensor {
                dtype: Dtype::Fixed {
                    integral_precision: 14,
                    fractional_precision: 23,
                },
            },
            ValueType::EncodedTensor {
                dtype: Dtype::Float64,
                precision: 16,
            },
            ValueType::Ring,
            ValueType::Bit,
            ValueType::ReplicatedRing,
            ValueType::ReplicatedBit,
        ];
        for ty in types {
            let bytes = rmp_serde::to_vec_named(&ty).unwrap();
            let decoded: ValueType = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(decoded, ty);
        }
    }

    proptest! {
        #[test]
        fn test_rendezvous_keys_round_trip(key in "[a-z0-9_]{1,32}") {
            let rendezvous = RendezvousKey(key);
            let bytes = rmp_serde::to_vec_named(&rendezvous).unwrap();
            let decoded: RendezvousKey = rmp_serde::from_slice(&bytes).unwrap();
            prop_assert_eq!(decoded, rendezvous);
        }

        #[test]
        fn test_scalar_constants_round_trip(v in proptest::num::f64::NORMAL) {
            let constant = Constant::Float64(v);
            let bytes = rmp_serde::to_vec_named(&constant).unwrap();
            let decoded: Constant = rmp_serde::from_slice(&bytes).unwrap();
            prop_assert_eq!(decoded, constant);
        }
    }
}

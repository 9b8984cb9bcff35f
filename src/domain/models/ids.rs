//! Strongly typed store identifiers.
//!
//! The store hands out integer keys; wrapping them keeps a study id from
//! being passed where an evaluation id is expected.

use serde::{Deserialize, Serialize};

macro_rules! store_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw store key.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

store_id!(
    /// Store key of a [`Study`](super::Study).
    StudyId
);
store_id!(
    /// Store key of an inference [`Model`](super::Model).
    ModelId
);
store_id!(
    /// Store key of an [`EvalJob`](super::EvalJob).
    EvalJobId
);
store_id!(
    /// Store key of a [`StudyEvaluation`](super::StudyEvaluation); also the
    /// correlation key embedded in dispatch payloads and result messages.
    EvaluationId
);
store_id!(
    /// Store key of an [`Experiment`](super::Experiment).
    ExperimentId
);

/// Join ids into the comma separated form workers receive in their environment.
pub fn join_ids(ids: &[EvaluationId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        let json = serde_json::to_string(&EvaluationId(42)).unwrap();
        assert_eq!(json, "42");
        let back: EvaluationId = serde_json::from_str("7").unwrap();
        assert_eq!(back, EvaluationId(7));
    }

    #[test]
    fn test_join_ids() {
        assert_eq!(join_ids(&[EvaluationId(1), EvaluationId(5)]), "1,5");
        assert_eq!(join_ids(&[]), "");
    }
}

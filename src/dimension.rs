//! Evaluation dimensions.
//!
//! Every response is scored along five quality dimensions. Each dimension has
//! its own worker pool draining a dedicated queue, so the dimension name doubles
//! as the routing key for fan-out.

use serde::{Deserialize, Serialize};

/// A quality dimension along which a response is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// How well the response follows the prompt's instructions.
    Instruction,
    /// Whether the response fabricates unsupported claims.
    Hallucination,
    /// Whether the response makes unwarranted assumptions.
    Assumption,
    /// Internal consistency and readability of the response.
    Coherence,
    /// Factual accuracy against the reference, when one is provided.
    Accuracy,
}

impl Dimension {
    /// All five dimensions, in canonical order.
    pub const ALL: [Dimension; 5] = [
        Dimension::Instruction,
        Dimension::Hallucination,
        Dimension::Assumption,
        Dimension::Coherence,
        Dimension::Accuracy,
    ];

    /// The wire name of this dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Instruction => "instruction",
            Dimension::Hallucination => "hallucination",
            Dimension::Assumption => "assumption",
            Dimension::Coherence => "coherence",
            Dimension::Accuracy => "accuracy",
        }
    }

    /// Name of the queue drained by this dimension's worker pool.
    pub fn queue_name(&self) -> String {
        format!("dimension_queue:{}", self.as_str())
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instruction" => Ok(Dimension::Instruction),
            "hallucination" => Ok(Dimension::Hallucination),
            "assumption" => Ok(Dimension::Assumption),
            "coherence" => Ok(Dimension::Coherence),
            "accuracy" => Ok(Dimension::Accuracy),
            other => Err(format!("unknown dimension '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(Dimension::Instruction.as_str(), "instruction");
        assert_eq!(Dimension::Hallucination.as_str(), "hallucination");
        assert_eq!(Dimension::Assumption.as_str(), "assumption");
        assert_eq!(Dimension::Coherence.as_str(), "coherence");
        assert_eq!(Dimension::Accuracy.as_str(), "accuracy");
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(
            Dimension::Instruction.queue_name(),
            "dimension_queue:instruction"
        );
        assert_eq!(Dimension::Accuracy.queue_name(), "dimension_queue:accuracy");
    }

    #[test]
    fn test_from_str_roundtrip() {
        for dim in Dimension::ALL {
            let parsed: Dimension = dim.as_str().parse().expect("should parse");
            assert_eq!(parsed, dim);
        }

        assert!("relevance".parse::<Dimension>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&Dimension::Hallucination).expect("serialize");
        assert_eq!(json, "\"hallucination\"");

        let parsed: Dimension = serde_json::from_str("\"coherence\"").expect("deserialize");
        assert_eq!(parsed, Dimension::Coherence);
    }

    #[test]
    fn test_all_has_five_distinct_entries() {
        let unique: std::collections::HashSet<_> = Dimension::ALL.iter().collect();
        assert_eq!(unique.len(), 5);
    }
}

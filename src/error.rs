use std::fmt;

/// Common errors thrown by the partitioner.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed hypergraph or configuration (k < 2, epsilon <= 0, pin id out
    /// of range, empty edge, unknown preset or enum value).
    InvalidInput(String),

    /// The requested balance cannot be achieved with the given node weights.
    Infeasible { max_node_weight: i64, max_part_weight: i64 },

    /// An allocation failed.
    ResourceExhausted(String),

    /// The wall-clock budget was exceeded. The last committed partition is
    /// still valid and has been written to the output slice.
    Timeout,

    /// Input sets don't have matching lengths.
    InputLenMismatch { expected: usize, actual: usize },

    /// An internal invariant was violated.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Infeasible { max_node_weight, max_part_weight } => write!(
                f,
                "infeasible balance constraint: heaviest node ({max_node_weight}) exceeds \
                 the maximum block weight ({max_part_weight}); consider increasing epsilon",
            ),
            Error::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Error::Timeout => write!(f, "time limit exceeded"),
            Error::InputLenMismatch { expected, actual } => write!(
                f,
                "input sets don't have the same length (expected {expected} items, got {actual})",
            ),
            Error::Internal(msg) => write!(f, "internal invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

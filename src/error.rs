//! # Error Taxonomy
//!
//! Failures that cross the public surface. Table operations report plain
//! booleans and enums internally; only the facade and the response
//! callbacks see a [`RoutingError`].

use std::error::Error;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingError {
    /// A caller-supplied argument failed synchronous validation
    /// (empty payload, self-addressed direct send, malformed id).
    InvalidArgument(&'static str),
    /// Send attempted before `join` completed.
    NotJoined,
    /// Next-hop selection exhausted `max_forward_attempts`, or the table
    /// was empty.
    NoRoute,
    /// Deadline fired before the full response set arrived.
    Timeout,
    /// The node shut down while responses were outstanding.
    Cancelled,
    /// Table admission refused: the id is already present.
    Duplicate,
    /// Table admission refused by the bucket policy.
    NotAccepted,
    /// The transport reported a send or connection failure.
    Transport(String),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            RoutingError::NotJoined => write!(f, "node has not joined the network"),
            RoutingError::NoRoute => write!(f, "no route to destination"),
            RoutingError::Timeout => write!(f, "response deadline expired"),
            RoutingError::Cancelled => write!(f, "operation cancelled by shutdown"),
            RoutingError::Duplicate => write!(f, "node id already in table"),
            RoutingError::NotAccepted => write!(f, "node refused by table admission policy"),
            RoutingError::Transport(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

impl Error for RoutingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_detail() {
        let err = RoutingError::InvalidArgument("empty payload");
        assert!(err.to_string().contains("empty payload"));
        let err = RoutingError::Transport("connection reset".into());
        assert!(err.to_string().contains("connection reset"));
    }
}

//! Single-or-batch request envelopes.
//!
//! A body is tried as a batch (JSON array) first and only then as a single
//! request object. Batch members are decoded one by one so that a malformed
//! member only poisons its own slot.

use serde_json::Value;

use super::error::{GatewayError, Result};
use super::jsonrpc::RpcRequest;

/// A decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A single request object
    Single(RpcRequest),
    /// A JSON array of request objects, in input order
    Batch(Vec<BatchMember>),
}

/// One slot of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchMember {
    /// A well-formed request
    Call(RpcRequest),
    /// Anything that is not a request object
    Invalid,
}

impl Envelope {
    /// Decodes raw body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Parse`] if the body is neither an array nor a
    /// request object.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if let Ok(members) = serde_json::from_slice::<Vec<Value>>(body) {
            return Ok(Envelope::Batch(
                members.into_iter().map(BatchMember::from_value).collect(),
            ));
        }

        serde_json::from_slice::<RpcRequest>(body)
            .map(Envelope::Single)
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }
}

impl BatchMember {
    fn from_value(value: Value) -> Self {
        if !value.is_object() {
            return BatchMember::Invalid;
        }
        serde_json::from_value(value)
            .map(BatchMember::Call)
            .unwrap_or(BatchMember::Invalid)
    }
}

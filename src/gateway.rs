//! Tool/model gateway adapter for Agent nodes.
//!
//! Agent nodes are the non-deterministic part of a workflow: they hand a
//! projected slice of the run context to an external model/tool chain and
//! capture whatever comes back verbatim as the node's output. The gateway
//! is a narrow seam — the engine knows nothing about transports, prompts,
//! or providers.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::audit::{CostMeters, ExternalCall};
use crate::types::CorrelationId;

/// One agent-node invocation handed to the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub correlation_id: CorrelationId,
    pub node_id: String,
    pub node_name: String,
    /// 1-based attempt counter, for gateway-side idempotency/dedup.
    pub attempt: u32,
    /// The node's projected context.
    pub input: Value,
}

/// What came back from the agent chain, plus audit metering.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentReply {
    /// Captured verbatim as the node output.
    pub output: Value,
    #[serde(default)]
    pub external_calls: Vec<ExternalCall>,
    #[serde(default)]
    pub cost_meters: CostMeters,
}

impl AgentReply {
    #[must_use]
    pub fn from_output(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Gateway failures, split by whether a retry could help. The engine feeds
/// this into the node's retry policy.
#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error("transient gateway failure: {message}")]
    #[diagnostic(code(gantry::gateway::transient))]
    Transient { message: String },

    #[error("permanent gateway failure: {message}")]
    #[diagnostic(code(gantry::gateway::permanent))]
    Permanent { message: String },
}

impl GatewayError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        GatewayError::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        GatewayError::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }
}

/// Adapter contract for the external tool/model chain.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, GatewayError>;
}

/// Gateway that reflects the projected input back as the output. The
/// default for engines without an agent backend and the deterministic
/// stand-in for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoGateway;

#[async_trait]
impl AgentGateway for EchoGateway {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, GatewayError> {
        Ok(AgentReply::from_output(invocation.input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_gateway_reflects_input() {
        let reply = EchoGateway
            .invoke(AgentInvocation {
                correlation_id: CorrelationId::from("run-g"),
                node_id: "agent".into(),
                node_name: "Agent".into(),
                attempt: 1,
                input: json!({"q": "status?"}),
            })
            .await
            .unwrap();
        assert_eq!(reply.output, json!({"q": "status?"}));
        assert!(reply.external_calls.is_empty());
    }
}

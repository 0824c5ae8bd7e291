//! InternalMemberCluster CRD: per-member join/leave state and agent heartbeats
//!
//! Lives in the member's reserved hub namespace. The hub sets the desired
//! state; each agent running in the member cluster reports back through its
//! own entry in `status.agentStatus`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition type reporting whether an agent has joined the fleet
pub const AGENT_JOINED: &str = "Joined";

/// InternalMemberCluster drives the membership state machine of one member cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.kubernetes-fleet.io",
    version = "v1beta1",
    kind = "InternalMemberCluster",
    namespaced,
    status = "InternalMemberClusterStatus",
    shortname = "imc",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InternalMemberClusterSpec {
    /// Desired membership state
    pub state: ClusterState,

    /// How often agents refresh their heartbeat
    #[serde(default = "default_heartbeat_period_seconds")]
    pub heartbeat_period_seconds: i32,
}

fn default_heartbeat_period_seconds() -> i32 {
    60
}

/// Desired membership state
///
/// Unrecognised values deserialize to [`ClusterState::Unknown`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// The member participates in the fleet
    Join,
    /// The member is leaving the fleet
    Leave,
    /// Any state this agent does not understand
    #[default]
    #[serde(other)]
    Unknown,
}

/// Agents running in a member cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AgentType {
    /// Generic fleet member agent
    MemberAgent,
    /// Imports Services through MultiClusterService objects
    MultiClusterServiceAgent,
    /// Exports Services and imports endpoints
    ServiceExportImportAgent,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemberAgent => write!(f, "MemberAgent"),
            Self::MultiClusterServiceAgent => write!(f, "MultiClusterServiceAgent"),
            Self::ServiceExportImportAgent => write!(f, "ServiceExportImportAgent"),
        }
    }
}

/// Status of an InternalMemberCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InternalMemberClusterStatus {
    /// One entry per agent type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_status: Vec<AgentStatus>,
}

/// Status reported by one agent
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Agent reporting this status
    #[serde(rename = "type")]
    pub type_: AgentType,

    /// `Joined` condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last heartbeat; left in place after the agent leaves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_received_heartbeat: Option<DateTime<Utc>>,
}

impl InternalMemberClusterStatus {
    /// Status entry for `agent`, created if missing
    pub fn agent_status_mut(&mut self, agent: AgentType) -> &mut AgentStatus {
        let idx = match self.agent_status.iter().position(|s| s.type_ == agent) {
            Some(idx) => idx,
            None => {
                self.agent_status.push(AgentStatus {
                    type_: agent,
                    conditions: Vec::new(),
                    last_received_heartbeat: None,
                });
                self.agent_status.len() - 1
            }
        };
        &mut self.agent_status[idx]
    }

    /// Status entry for `agent`, if reported
    pub fn agent_status(&self, agent: AgentType) -> Option<&AgentStatus> {
        self.agent_status.iter().find(|s| s.type_ == agent)
    }
}

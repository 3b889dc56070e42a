//! Agent runtime configuration
//!
//! The agent process reads a single JSON document (`agent.json`). The direct
//! provider mounts it from a ConfigMap; the GitOps provider hands it to the
//! agent Helm chart as the `agentConfig` value.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;

use aiop_common::crd::{Agent, KnowledgeBase, RouteSpec};
use aiop_common::Error;
use aiop_knowledge_base::run_parameters;

/// Key of the configuration document in the agent ConfigMap
pub const AGENT_CONFIG_KEY: &str = "agent.json";

/// Foundation model the agent talks to
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FoundationModel {
    /// Model name
    pub name: String,
    /// In-cluster endpoint of the model Service
    pub endpoint: String,
}

/// A tool as the agent sees it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolConfig {
    /// Tool name in snake_case
    pub name: String,
    /// Tool type
    #[serde(rename = "type")]
    pub type_: String,
    /// Description shown to the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resolved backing configuration (knowledge-base tools)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, Value>>,
}

/// Complete configuration of one agent
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentConfig {
    /// Agent namespace
    pub namespace: String,
    /// Agent name
    pub name: String,
    /// Foundation model
    pub foundation_model: FoundationModel,
    /// System prompt
    pub agent_instructions: String,
    /// Completion token limit
    pub max_tokens: u32,
    /// Routing hints
    pub routes: Vec<RouteSpec>,
    /// Tools
    pub tools: Vec<ToolConfig>,
}

/// Tool names the agent framework accepts (no dashes)
pub fn sanitize_tool_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Tool configuration derived from a KnowledgeBase
///
/// Carries the same values the indexing run received, so the agent queries
/// the table the pipeline wrote.
pub fn knowledge_base_tool_config(kb: &KnowledgeBase) -> BTreeMap<String, Value> {
    let name = kb.name_any();
    let namespace = kb.namespace().unwrap_or_default();
    let mut config = run_parameters(kb, &name, &namespace);
    config.insert(
        "pipeline_name".to_string(),
        Value::from(kb.spec.pipeline.name.as_str()),
    );
    config
}

impl AgentConfig {
    /// Build the configuration for `agent`
    ///
    /// `knowledge_bases` maps tool names to the KnowledgeBases they resolved
    /// to; knowledge-base tools missing from it are left without config.
    pub fn build(
        agent: &Agent,
        model_endpoint: &str,
        knowledge_bases: &BTreeMap<String, KnowledgeBase>,
    ) -> Self {
        let spec = &agent.spec;
        let tools = spec
            .tools
            .iter()
            .map(|tool| ToolConfig {
                name: sanitize_tool_name(&tool.name),
                type_: tool.type_.clone(),
                description: tool.description.clone(),
                config: tool
                    .is_knowledge_base()
                    .then(|| knowledge_bases.get(&tool.name))
                    .flatten()
                    .map(knowledge_base_tool_config),
            })
            .collect();

        Self {
            namespace: agent.namespace().unwrap_or_default(),
            name: agent.name_any(),
            foundation_model: FoundationModel {
                name: spec.foundation_model.clone(),
                endpoint: model_endpoint.to_string(),
            },
            agent_instructions: spec.agent_instructions.clone(),
            max_tokens: spec.max_tokens,
            routes: spec.routes.clone(),
            tools,
        }
    }

    /// Pretty-printed JSON document
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization_for_kind("AgentConfig", e.to_string()))
    }

    /// Helm values for the agent chart, as YAML
    pub fn helm_values(&self) -> Result<String, Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Values<'a> {
            name_override: &'a str,
            agent_config: String,
        }

        serde_yaml::to_string(&Values {
            name_override: &self.name,
            agent_config: self.to_json()?,
        })
        .map_err(|e| Error::serialization_for_kind("HelmValues", e.to_string()))
    }
}

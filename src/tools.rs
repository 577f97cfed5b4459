use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{Tool, ToolFunction};

pub const WEB_SEARCH: &str = "webSearch";

/// Arguments of the `webSearch` tool. The same struct derives the JSON
/// schema advertised to the model and parses the accumulated call
/// arguments, so the two can never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchArgs {
    #[schemars(description = "A well constructed google search query.")]
    pub query: String,
    #[schemars(
        description = "Generate 4 related search queries that would be helpful for exploring this topic further.",
        length(min = 4, max = 4)
    )]
    pub related_searches: Vec<String>,
}

impl WebSearchArgs {
    /// Parse committed tool-call arguments; failure is fatal for the run.
    pub fn parse(arguments: &str) -> Result<Self> {
        serde_json::from_str(arguments).map_err(|source| Error::ToolArguments {
            name: WEB_SEARCH.to_string(),
            source,
        })
    }
}

/// A tool the planning stage may offer to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn as_tool(&self) -> Tool {
        Tool {
            kind: "function".to_string(),
            function: ToolFunction {
                name: self.name.to_string(),
                description: self.description.to_string(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

fn web_search_definition() -> ToolDefinition {
    ToolDefinition {
        name: WEB_SEARCH,
        description: "Get real-time or current information from the internet.",
        parameters: serde_json::to_value(schema_for!(WebSearchArgs)).unwrap(),
    }
}

pub fn default_registry() -> Vec<ToolDefinition> {
    vec![web_search_definition()]
}

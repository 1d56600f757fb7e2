use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::{
    error::Result,
    jsonrpc::{from_result, to_params},
    schema::*,
};

/// Operations a client invokes on a server.
///
/// Implementors supply [`ServerAPI::request_value`]; every typed operation is
/// built on top of it.
#[async_trait]
pub trait ServerAPI: Send + Sync {
    /// Issue one request and return the raw `result` value.
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Respond to ping requests
    async fn ping(&self) -> Result<()> {
        self.request_value(PING, None).await?;
        Ok(())
    }

    /// List available resources with optional pagination
    async fn list_resources(&self, cursor: Option<Cursor>) -> Result<ListResourcesResult> {
        let params = to_params(&PaginatedParams { cursor })?;
        from_result(self.request_value(RESOURCES_LIST, params).await?)
    }

    /// List resource templates with optional pagination
    async fn list_resource_templates(
        &self,
        cursor: Option<Cursor>,
    ) -> Result<ListResourceTemplatesResult> {
        let params = to_params(&PaginatedParams { cursor })?;
        from_result(self.request_value(RESOURCES_TEMPLATES_LIST, params).await?)
    }

    /// Read a resource by URI
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = to_params(&ResourceParams { uri: uri.into() })?;
        from_result(self.request_value(RESOURCES_READ, params).await?)
    }

    /// Subscribe to resource updates
    async fn subscribe(&self, uri: &str) -> Result<()> {
        let params = to_params(&ResourceParams { uri: uri.into() })?;
        self.request_value(RESOURCES_SUBSCRIBE, params).await?;
        Ok(())
    }

    /// Unsubscribe from resource updates
    async fn unsubscribe(&self, uri: &str) -> Result<()> {
        let params = to_params(&ResourceParams { uri: uri.into() })?;
        self.request_value(RESOURCES_UNSUBSCRIBE, params).await?;
        Ok(())
    }

    /// List available prompts with optional pagination
    async fn list_prompts(&self, cursor: Option<Cursor>) -> Result<ListPromptsResult> {
        let params = to_params(&PaginatedParams { cursor })?;
        from_result(self.request_value(PROMPTS_LIST, params).await?)
    }

    /// Get a prompt by name with optional arguments
    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult> {
        let params = to_params(&GetPromptParams {
            name: name.into(),
            arguments,
        })?;
        from_result(self.request_value(PROMPTS_GET, params).await?)
    }

    /// List available tools with optional pagination
    async fn list_tools(&self, cursor: Option<Cursor>) -> Result<ListToolsResult> {
        let params = to_params(&PaginatedParams { cursor })?;
        from_result(self.request_value(TOOLS_LIST, params).await?)
    }

    /// Call a tool with the given name and arguments
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let params = to_params(&CallToolParams {
            name: name.into(),
            arguments,
        })?;
        from_result(self.request_value(TOOLS_CALL, params).await?)
    }

    /// Handle completion requests
    async fn complete(&self, params: CompleteParams) -> Result<CompleteResult> {
        let params = to_params(&params)?;
        from_result(self.request_value(COMPLETION_COMPLETE, params).await?)
    }

    /// Set the logging level
    async fn set_level(&self, level: LoggingLevel) -> Result<()> {
        let params = to_params(&SetLevelParams { level })?;
        self.request_value(LOGGING_SET_LEVEL, params).await?;
        Ok(())
    }
}

/// Operations a server invokes on its client.
#[async_trait]
pub trait ClientAPI: Send + Sync {
    async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// List available filesystem roots
    async fn list_roots(&self) -> Result<ListRootsResult> {
        from_result(self.request_value(ROOTS_LIST, None).await?)
    }

    /// Ask the client to sample from an LLM
    async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        let params = to_params(&params)?;
        from_result(self.request_value(SAMPLING_CREATE_MESSAGE, params).await?)
    }

    /// Ask the client to collect structured input from the user
    async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult> {
        let params = to_params(&params)?;
        from_result(self.request_value(ELICITATION_CREATE, params).await?)
    }

    async fn interact(&self, params: InteractParams) -> Result<InteractResult> {
        let params = to_params(&params)?;
        from_result(self.request_value(INTERACTION_CREATE, params).await?)
    }
}

//! Dual capability client.
//!
//! One instance per session owns both configured endpoints (primary and
//! scoped), their connection states, and the merged tool registry. Endpoint
//! failures degrade only that endpoint; the other endpoint's tools stay
//! usable. Tool-call failures are structured results, never errors thrown
//! past the caller.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::ToolDescriptor;
use crate::core::auth::AuthLinkGenerator;
use crate::error::RpcCallError;

use super::events::{ClientEvent, EventBus};
use super::rpc::{CallEndpoint, RpcCallOptions};
use super::{EndpointRole, EndpointState, TOOLS_CALL_METHOD, TOOLS_LIST_METHOD};

/// Static connection settings for one endpoint.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Session identity used when producing an authorization recovery link.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub conversation_id: String,
    pub subject_id: String,
}

/// Structured tool-call failure; consumed by the next model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallFailure {
    ToolNotFound { name: String },
    AuthRequired { url: String },
    Internal { message: String },
}

impl ToolCallFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolCallFailure::ToolNotFound { .. } => "tool_not_found",
            ToolCallFailure::AuthRequired { .. } => "auth_required",
            ToolCallFailure::Internal { .. } => "internal_error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            ToolCallFailure::ToolNotFound { name } => json!({ "name": name }),
            ToolCallFailure::AuthRequired { url } => json!(url),
            ToolCallFailure::Internal { message } => json!(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Success(Value),
    Failure(ToolCallFailure),
}

/// Aggregate result of connecting both endpoints.
#[derive(Debug, Clone)]
pub struct ConnectSummary {
    pub primary_tools: Vec<ToolDescriptor>,
    pub scoped_tools: Vec<ToolDescriptor>,
    pub total_tools: usize,
}

#[derive(Deserialize)]
struct ToolsListPayload {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

struct Endpoint {
    config: EndpointConfig,
    state: EndpointState,
    tools: Vec<ToolDescriptor>,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            state: EndpointState::Disconnected,
            tools: Vec::new(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        // The scoped endpoint expects the raw access token, no scheme prefix.
        if self.config.requires_auth {
            if let Some(token) = &self.config.access_token {
                return vec![("Authorization".to_string(), token.clone())];
            }
        }
        Vec::new()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.state == EndpointState::Ready && self.tools.iter().any(|tool| tool.name == name)
    }
}

pub struct CapabilityClient {
    primary: Endpoint,
    scoped: Endpoint,
    registry: HashMap<String, EndpointRole>,
    events: EventBus,
    transport: Arc<dyn CallEndpoint>,
    auth_links: Arc<dyn AuthLinkGenerator>,
    recovery: RecoveryContext,
    call_options: RpcCallOptions,
}

impl CapabilityClient {
    pub fn new(
        primary: EndpointConfig,
        scoped: EndpointConfig,
        transport: Arc<dyn CallEndpoint>,
        auth_links: Arc<dyn AuthLinkGenerator>,
        recovery: RecoveryContext,
    ) -> Self {
        Self {
            primary: Endpoint::new(primary),
            scoped: Endpoint::new(scoped),
            registry: HashMap::new(),
            events: EventBus::default(),
            transport,
            auth_links,
            recovery,
            call_options: RpcCallOptions::default(),
        }
    }

    pub fn with_call_options(mut self, options: RpcCallOptions) -> Self {
        self.call_options = options;
        self
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn endpoint_state(&self, role: EndpointRole) -> EndpointState {
        self.endpoint(role).state
    }

    /// Merged tool view. On name collisions the scoped endpoint's descriptor
    /// shadows the primary's, matching the routing rule.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut merged: Vec<ToolDescriptor> = self
            .primary
            .tools
            .iter()
            .filter(|tool| self.registry.get(&tool.name) != Some(&EndpointRole::Scoped))
            .cloned()
            .collect();
        merged.extend(self.scoped.tools.iter().cloned());
        merged
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Connects one endpoint. Never errors: a failed listing degrades that
    /// endpoint's state and yields an empty tool list.
    pub async fn connect(&mut self, role: EndpointRole) -> Vec<ToolDescriptor> {
        self.set_state(role, EndpointState::Connecting);
        let result = self.fetch_listing(role).await;
        self.apply_listing(role, result)
    }

    /// Connects both endpoints concurrently. Each outcome is independent;
    /// one endpoint's failure never blocks the other's tools from landing in
    /// the merged registry.
    pub async fn connect_all(&mut self) -> ConnectSummary {
        self.set_state(EndpointRole::Primary, EndpointState::Connecting);
        self.set_state(EndpointRole::Scoped, EndpointState::Connecting);

        let (primary_result, scoped_result) = future::join(
            self.fetch_listing(EndpointRole::Primary),
            self.fetch_listing(EndpointRole::Scoped),
        )
        .await;

        let primary_tools = self.apply_listing(EndpointRole::Primary, primary_result);
        let scoped_tools = self.apply_listing(EndpointRole::Scoped, scoped_result);

        ConnectSummary {
            primary_tools,
            scoped_tools,
            total_tools: self.registry.len(),
        }
    }

    /// Routes and executes one tool call.
    ///
    /// Routing is a binding contract: the scoped endpoint wins when both
    /// registries contain the name, because it determines which credentials
    /// the call runs under.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallOutcome {
        let role = if self.scoped.has_tool(name) {
            EndpointRole::Scoped
        } else if self.primary.has_tool(name) {
            EndpointRole::Primary
        } else {
            return ToolCallOutcome::Failure(ToolCallFailure::ToolNotFound {
                name: name.to_string(),
            });
        };

        let endpoint = self.endpoint(role);
        debug!(tool = name, role = role.as_str(), "Dispatching tool call");
        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .transport
            .call(
                &endpoint.config.url,
                TOOLS_CALL_METHOD,
                params,
                &endpoint.headers(),
                &self.call_options,
            )
            .await;

        match result {
            Ok(value) => ToolCallOutcome::Success(value),
            Err(err) if role == EndpointRole::Scoped && err.is_unauthorized() => {
                self.recover_authorization().await
            }
            Err(err) => ToolCallOutcome::Failure(ToolCallFailure::Internal {
                message: err.to_string(),
            }),
        }
    }

    /// Resets both endpoints and drops the registry and all listeners.
    /// Idempotent.
    pub fn disconnect(&mut self) {
        self.primary.state = EndpointState::Disconnected;
        self.primary.tools.clear();
        self.scoped.state = EndpointState::Disconnected;
        self.scoped.tools.clear();
        self.registry.clear();
        self.events.clear();
    }

    async fn recover_authorization(&self) -> ToolCallOutcome {
        match self
            .auth_links
            .generate(&self.recovery.conversation_id, &self.recovery.subject_id)
            .await
        {
            Ok(url) => ToolCallOutcome::Failure(ToolCallFailure::AuthRequired { url }),
            Err(err) => {
                warn!(error = %err, "Authorization recovery failed");
                ToolCallOutcome::Failure(ToolCallFailure::Internal {
                    message: err.to_string(),
                })
            }
        }
    }

    async fn fetch_listing(&self, role: EndpointRole) -> Result<Vec<ToolDescriptor>, RpcCallError> {
        let endpoint = self.endpoint(role);
        let value = self
            .transport
            .call(
                &endpoint.config.url,
                TOOLS_LIST_METHOD,
                json!({}),
                &endpoint.headers(),
                &self.call_options,
            )
            .await?;
        let payload: ToolsListPayload =
            serde_json::from_value(value).map_err(|err| RpcCallError::Transport {
                message: format!("malformed tools listing: {err}"),
                attempts: 1,
            })?;
        Ok(payload.tools)
    }

    fn apply_listing(
        &mut self,
        role: EndpointRole,
        result: Result<Vec<ToolDescriptor>, RpcCallError>,
    ) -> Vec<ToolDescriptor> {
        match result {
            Ok(tools) => {
                {
                    let endpoint = self.endpoint_mut(role);
                    endpoint.tools = tools.clone();
                }
                self.set_state(role, EndpointState::Ready);
                self.rebuild_registry();
                self.events.emit(ClientEvent::ToolsUpdated {
                    total: self.registry.len(),
                });
                tools
            }
            Err(err) => {
                let state = if err.is_unauthorized() {
                    EndpointState::RequiresAuth
                } else {
                    EndpointState::Failed
                };
                warn!(role = role.as_str(), error = %err, "Endpoint connection failed");
                {
                    let endpoint = self.endpoint_mut(role);
                    endpoint.tools.clear();
                }
                self.set_state(role, state);
                self.rebuild_registry();
                self.events.emit(ClientEvent::Error {
                    role,
                    message: err.to_string(),
                });
                Vec::new()
            }
        }
    }

    /// The registry is rebuilt wholesale on every listing change, never
    /// patched incrementally. Primary entries land first so scoped entries
    /// overwrite them on collision.
    fn rebuild_registry(&mut self) {
        self.registry.clear();
        if self.primary.state == EndpointState::Ready {
            for tool in &self.primary.tools {
                self.registry.insert(tool.name.clone(), EndpointRole::Primary);
            }
        }
        if self.scoped.state == EndpointState::Ready {
            for tool in &self.scoped.tools {
                self.registry.insert(tool.name.clone(), EndpointRole::Scoped);
            }
        }
    }

    fn set_state(&mut self, role: EndpointRole, state: EndpointState) {
        self.endpoint_mut(role).state = state;
        self.events.emit(ClientEvent::ConnectionState { role, state });
    }

    fn endpoint(&self, role: EndpointRole) -> &Endpoint {
        match role {
            EndpointRole::Primary => &self.primary,
            EndpointRole::Scoped => &self.scoped,
        }
    }

    fn endpoint_mut(&mut self, role: EndpointRole) -> &mut Endpoint {
        match role {
            EndpointRole::Primary => &mut self.primary,
            EndpointRole::Scoped => &mut self.scoped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthLinkError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct RecordedCall {
        url: String,
        method: String,
        params: Value,
        headers: Vec<(String, String)>,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<HashMap<(String, String), VecDeque<Result<Value, RpcCallError>>>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedTransport {
        fn script(
            &self,
            url: &str,
            method: &str,
            response: Result<Value, RpcCallError>,
        ) {
            self.responses
                .lock()
                .expect("responses")
                .entry((url.to_string(), method.to_string()))
                .or_default()
                .push_back(response);
        }

        fn recorded(&self) -> Vec<RecordedCall> {
            std::mem::take(&mut *self.calls.lock().expect("calls"))
        }
    }

    #[async_trait]
    impl CallEndpoint for ScriptedTransport {
        async fn call(
            &self,
            url: &str,
            method: &str,
            params: Value,
            headers: &[(String, String)],
            _options: &RpcCallOptions,
        ) -> Result<Value, RpcCallError> {
            self.calls.lock().expect("calls").push(RecordedCall {
                url: url.to_string(),
                method: method.to_string(),
                params,
                headers: headers.to_vec(),
            });
            self.responses
                .lock()
                .expect("responses")
                .get_mut(&(url.to_string(), method.to_string()))
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(json!({ "tools": [] })))
        }
    }

    struct FixedAuthLinks;

    #[async_trait]
    impl AuthLinkGenerator for FixedAuthLinks {
        async fn generate(
            &self,
            conversation_id: &str,
            subject_id: &str,
        ) -> Result<String, AuthLinkError> {
            Ok(format!(
                "https://auth.example/grant?conversation={conversation_id}&subject={subject_id}"
            ))
        }
    }

    const PRIMARY_URL: &str = "https://storefront.example/mcp";
    const SCOPED_URL: &str = "https://customer.example/mcp";

    fn tool(name: &str) -> Value {
        json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {"type": "object"}
        })
    }

    fn build_client(transport: Arc<ScriptedTransport>) -> CapabilityClient {
        CapabilityClient::new(
            EndpointConfig {
                url: PRIMARY_URL.to_string(),
                requires_auth: false,
                access_token: None,
            },
            EndpointConfig {
                url: SCOPED_URL.to_string(),
                requires_auth: true,
                access_token: Some("tok-123".to_string()),
            },
            transport,
            Arc::new(FixedAuthLinks),
            RecoveryContext {
                conversation_id: "conv-1".to_string(),
                subject_id: "cust-9".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn shared_tool_names_route_to_the_scoped_endpoint() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            PRIMARY_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("search_shop_catalog")] })),
        );
        transport.script(
            SCOPED_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("search_shop_catalog")] })),
        );
        transport.script(
            SCOPED_URL,
            TOOLS_CALL_METHOD,
            Ok(json!({ "content": [] })),
        );

        let mut client = build_client(transport.clone());
        let summary = client.connect_all().await;
        assert_eq!(summary.total_tools, 1);

        let outcome = client
            .call_tool("search_shop_catalog", json!({"query": "jacket"}))
            .await;
        assert!(matches!(outcome, ToolCallOutcome::Success(_)));

        let calls = transport.recorded();
        let dispatch = calls
            .iter()
            .find(|call| call.method == TOOLS_CALL_METHOD)
            .expect("tool call");
        assert_eq!(dispatch.url, SCOPED_URL);
    }

    #[tokio::test]
    async fn one_failed_endpoint_leaves_the_other_usable() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            PRIMARY_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("tool_a"), tool("tool_b")] })),
        );
        transport.script(
            SCOPED_URL,
            TOOLS_LIST_METHOD,
            Err(RpcCallError::Transport {
                message: "connection refused".to_string(),
                attempts: 3,
            }),
        );

        let mut client = build_client(transport);
        let summary = client.connect_all().await;

        assert_eq!(summary.primary_tools.len(), 2);
        assert!(summary.scoped_tools.is_empty());
        assert_eq!(summary.total_tools, 2);
        assert_eq!(
            client.endpoint_state(EndpointRole::Primary),
            EndpointState::Ready
        );
        assert_eq!(
            client.endpoint_state(EndpointRole::Scoped),
            EndpointState::Failed
        );
        let names: Vec<_> = client.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["tool_a", "tool_b"]);
    }

    #[tokio::test]
    async fn unauthorized_scoped_call_returns_a_recovery_link() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            SCOPED_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("get_recent_orders")] })),
        );
        transport.script(
            SCOPED_URL,
            TOOLS_CALL_METHOD,
            Err(RpcCallError::Http {
                status: 401,
                body: "unauthorized".to_string(),
            }),
        );

        let mut client = build_client(transport);
        client.connect_all().await;

        let outcome = client.call_tool("get_recent_orders", json!({})).await;
        assert_eq!(
            outcome,
            ToolCallOutcome::Failure(ToolCallFailure::AuthRequired {
                url: "https://auth.example/grant?conversation=conv-1&subject=cust-9".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unauthorized_listing_marks_the_endpoint_requires_auth() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            SCOPED_URL,
            TOOLS_LIST_METHOD,
            Err(RpcCallError::Http {
                status: 401,
                body: String::new(),
            }),
        );

        let mut client = build_client(transport);
        client.connect(EndpointRole::Scoped).await;
        assert_eq!(
            client.endpoint_state(EndpointRole::Scoped),
            EndpointState::RequiresAuth
        );
    }

    #[tokio::test]
    async fn unknown_tools_surface_as_structured_not_found() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut client = build_client(transport);
        client.connect_all().await;

        let outcome = client.call_tool("no_such_tool", json!({})).await;
        assert_eq!(
            outcome,
            ToolCallOutcome::Failure(ToolCallFailure::ToolNotFound {
                name: "no_such_tool".to_string()
            })
        );
    }

    #[tokio::test]
    async fn scoped_requests_carry_the_raw_access_token() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut client = build_client(transport.clone());
        client.connect(EndpointRole::Scoped).await;

        let calls = transport.recorded();
        let listing = calls.first().expect("listing call");
        assert_eq!(
            listing.headers,
            vec![("Authorization".to_string(), "tok-123".to_string())]
        );
        assert_eq!(listing.params, json!({}));
    }

    #[tokio::test]
    async fn disconnect_resets_state_and_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            PRIMARY_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("tool_a")] })),
        );

        let mut client = build_client(transport);
        client.connect_all().await;
        assert_eq!(client.tool_count(), 1);

        client.disconnect();
        client.disconnect();

        assert_eq!(client.tool_count(), 0);
        assert!(client.tools().is_empty());
        assert_eq!(
            client.endpoint_state(EndpointRole::Primary),
            EndpointState::Disconnected
        );
        assert_eq!(
            client.endpoint_state(EndpointRole::Scoped),
            EndpointState::Disconnected
        );
    }

    #[tokio::test]
    async fn connection_events_reach_subscribers() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            PRIMARY_URL,
            TOOLS_LIST_METHOD,
            Ok(json!({ "tools": [tool("tool_a")] })),
        );

        let mut client = build_client(transport);
        let mut events = client.subscribe();
        client.connect(EndpointRole::Primary).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ClientEvent::ConnectionState {
            role: EndpointRole::Primary,
            state: EndpointState::Connecting,
        }));
        assert!(seen.contains(&ClientEvent::ConnectionState {
            role: EndpointRole::Primary,
            state: EndpointState::Ready,
        }));
        assert!(seen.contains(&ClientEvent::ToolsUpdated { total: 1 }));
    }
}

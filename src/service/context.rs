//! Request context: baggage members propagated by the caller.
//!
//! The RPC façade in front of this crate forwards OpenTelemetry-style
//! baggage; the only member the core consumes is the tenant (workspace) id.

use std::collections::HashMap;

use crate::constants::DEFAULT_TENANT;

/// Out-of-band context accompanying one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    baggage: HashMap<String, String>,
}

impl RequestContext {
    /// Empty context; the tenant falls back to `default`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a W3C baggage header value (`k1=v1,k2=v2`). Members without a
    /// value and empty keys are dropped.
    pub fn from_baggage_header(header: &str) -> Self {
        let mut baggage = HashMap::new();
        for member in header.split(',') {
            // properties after ';' are not consumed here
            let member = member.split(';').next().unwrap_or("");
            if let Some((key, value)) = member.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                if !key.is_empty() && !value.is_empty() {
                    baggage.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { baggage }
    }

    /// Insert one baggage member.
    pub fn with_member(mut self, key: &str, value: &str) -> Self {
        self.baggage.insert(key.to_string(), value.to_string());
        self
    }

    /// A baggage member's value.
    pub fn member(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    /// The tenant id carried in `workspace_id` or `workspaceId` baggage;
    /// absent or empty, the literal `default`.
    pub fn tenant_id(&self) -> &str {
        for key in ["workspace_id", "workspaceId"] {
            if let Some(value) = self.member(key) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
        DEFAULT_TENANT
    }
}

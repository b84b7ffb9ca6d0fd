pub mod http;
pub mod stdio;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{RawCallResult, RawToolSpec};

/// Common capability set shared by all three server variants (spec §4.3
/// "polymorphic over a common capability set").
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RawToolSpec>>;
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<RawCallResult>;
    async fn shutdown(&self);
}

//! 工具层：Tool trait、注册表、执行器（ToolInvoker）、参数规范化、决策格式 Schema

pub mod echo;
pub mod executor;
pub mod params;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{ActionOutcome, ToolExecutor, ToolInvoker};
pub use params::{normalize_parameters, ParamValue, ToolParams};
pub use registry::{normalize_action_name, Tool, ToolContext, ToolOutput, ToolRegistry, ToolSpec};
pub use schema::decision_schema_json;

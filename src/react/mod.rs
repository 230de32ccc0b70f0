//! 认知层：结构化解码、Step Loop 状态机、总结合成

pub mod context;
pub mod decision;
pub mod decoder;
pub mod events;
pub mod step_loop;
pub mod summary;

pub use context::{ActionTrace, RunContext};
pub use decision::{ResponseAction, ResponseClassification, StepDecision, StructuredOutput, SummaryOutput};
pub use decoder::{extract_key_values, parse_output, RetryConfig, StructuredDecoder};
pub use events::StepEvent;
pub use step_loop::{LoopOutcome, StepLoop, Termination, DEFAULT_MAX_ITERATIONS};
pub use summary::{Content, SummarySynthesizer, FALLBACK_TEXT};

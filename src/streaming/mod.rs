pub mod aggregator;
pub mod content;
pub mod frame;
pub mod headers;
pub mod normalizer;
pub mod orchestrator;
pub mod protocol;
pub mod sink;
pub mod sse;
pub mod tools;
pub mod usage;

pub use aggregator::{AggregateOutcome, ArgumentAggregator};
pub use content::{ContentBlock, ContentBlockManager, ContentBlockType};
pub use frame::{EventStreamDecoder, FramedMessage, encode_message};
pub use headers::{HeaderParser, HeaderValue, Headers};
pub use normalizer::{EventNormalizer, UpstreamEvent};
pub use orchestrator::{
    RequestDescriptor, SessionOutcome, StreamOrchestrator, StreamSession, StreamSummary,
};
pub use protocol::OutboundStateMachine;
pub use sink::{CollectingSink, EventSink, SseSink};
pub use sse::{Dialect, SseEncoder};
pub use tools::{ToolExecution, ToolLifecycleManager, ToolStatus};
pub use usage::UsageTracker;

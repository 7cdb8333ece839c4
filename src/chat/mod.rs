//! Tool aggregation and the bounded function-calling loop.

pub mod gemini;
pub mod model;
pub mod tools;
pub mod turn;

pub use gemini::GeminiModel;
pub use model::{ChatMessage, ChatModel, ChatRole, FunctionDeclaration, ModelReply};
pub use tools::{aggregate_tools, ServerTools, ToolIndex};
pub use turn::{ChatTurn, ChatTurnRunner, ToolCallRecord, TurnSettings};

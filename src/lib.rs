pub mod chart;
pub mod chat;
pub mod constants;
pub mod footprint;
pub mod gemini;
pub mod web_server;

pub use chat::{ChatAssistant, ChatMessage, ChatPhase, Role, SendRejected, Transcript};
pub use footprint::{BreakdownStage, EstimateError, FootprintEstimator, FootprintResult};
pub use gemini::{GeminiClient, GeminiConfig, GeminiError};

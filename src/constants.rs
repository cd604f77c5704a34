// Fixed texts and defaults. Anything that can be overridden comes from the environment.

use std::env;

lazy_static::lazy_static! {
    pub static ref TEMPLATES_DIR: String = env::var("AQUATRACK_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("AQUATRACK_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
}

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_PORT: u16 = 9900;

/// Legacy variable name, read when `GEMINI_API_KEY` is not set.
pub const FALLBACK_API_KEY_VAR: &str = "API_KEY";

// Kept as f64 so it serializes as exactly 0.2.
pub const ESTIMATE_TEMPERATURE: f64 = 0.2;

/// Capacity of the channel between the SSE reader task and the reply consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

pub const APP_TITLE: &str = "AquaTrack";

pub const SAMPLE_ITEMS: [&str; 5] = [
    "1 cup of coffee",
    "1 cotton T-shirt",
    "1 kg of beef",
    "A bar of chocolate",
    "1 liter of milk",
];

pub const BLANK_ITEM_MESSAGE: &str = "Please enter an item.";

pub const ESTIMATE_FAILED_MESSAGE: &str = "Failed to calculate water footprint. The AI model may be unable to process this item or is currently unavailable.";

pub const CHAT_PERSONA: &str = "You are Aqua, a friendly and knowledgeable AI assistant for the AquaTrack application. Your goal is to help users understand water footprints, water conservation, and sustainability. Be helpful, encouraging, and provide clear, concise answers. Do not answer questions outside of this scope.";

pub const CHAT_GREETING: &str = "Hi! I'm Aqua, your personal water conservation assistant. Ask me anything about water footprints or how you can save water!";

pub const CHAT_UNAVAILABLE_MESSAGE: &str = "Sorry, I'm having trouble connecting right now. Please try again later.";

pub const CHAT_REPLY_FAILED_MESSAGE: &str = "Oops! Something went wrong. Please try asking again.";

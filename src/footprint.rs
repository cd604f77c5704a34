//! Water footprint estimation.
//!
//! One structured-output request per item: the prompt asks for a total, a
//! comparison and a short breakdown, and the response schema pins the JSON
//! shape so the reply can be parsed straight into [`FootprintResult`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::constants;
use crate::gemini::{
    Content, GeminiClient, GeminiError, GenerateContentRequest, GenerationConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FootprintResult {
    pub item_name: String,
    pub water_footprint_liters: f64,
    pub comparison: String,
    pub breakdown: Vec<BreakdownStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownStage {
    pub stage: String,
    pub liters: f64,
}

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("item description is blank")]
    BlankItem,
    #[error("footprint request failed: {0}")]
    Request(#[from] GeminiError),
    #[error("response is not a valid footprint record: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("response has an empty breakdown")]
    EmptyBreakdown,
}

impl EstimateError {
    /// The text shown to users. Everything but a blank item collapses to one message.
    pub fn user_message(&self) -> &'static str {
        match self {
            EstimateError::BlankItem => constants::BLANK_ITEM_MESSAGE,
            _ => constants::ESTIMATE_FAILED_MESSAGE,
        }
    }

    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EstimateError::BlankItem => "blank_item",
            EstimateError::Request(_) => "request",
            EstimateError::Malformed(_) => "malformed",
            EstimateError::EmptyBreakdown => "empty_breakdown",
        }
    }
}

pub fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "itemName": {
                "type": "STRING",
                "description": "The name of the item, properly capitalized."
            },
            "waterFootprintLiters": {
                "type": "NUMBER",
                "description": "The total water footprint in liters."
            },
            "comparison": {
                "type": "STRING",
                "description": "A simple, relatable comparison to help visualize this amount of water (e.g., equivalent to X number of 8-minute showers)."
            },
            "breakdown": {
                "type": "ARRAY",
                "description": "An array of objects showing the breakdown of water usage into 2-4 key stages.",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "stage": {
                            "type": "STRING",
                            "description": "The name of the production stage (e.g., 'Growing Cotton', 'Manufacturing')."
                        },
                        "liters": {
                            "type": "NUMBER",
                            "description": "The amount of water in liters for this stage."
                        }
                    },
                    "required": ["stage", "liters"]
                }
            }
        },
        "required": ["itemName", "waterFootprintLiters", "comparison", "breakdown"]
    })
}

pub fn build_prompt(item: &str) -> String {
    format!(
        "You are an expert environmental scientist specializing in water footprint analysis.\n\
        Your task is to calculate the approximate water footprint for a given daily use item.\n\n\
        The user has provided the item: \"{item}\".\n\n\
        You must provide the total water footprint in liters.\n\
        You must also provide a simple, relatable comparison to help visualize this amount of water.\n\
        Additionally, provide a simple breakdown of the water usage into 2-4 key stages \
        (e.g., growing raw materials, manufacturing, transport).\n\n\
        Respond ONLY with a valid JSON object that strictly adheres to the provided schema. \
        Do not include any extra text or markdown formatting.\n"
    )
}

pub fn build_request(item: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content::user(build_prompt(item))],
        system_instruction: None,
        generation_config: Some(GenerationConfig {
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(response_schema()),
            temperature: Some(constants::ESTIMATE_TEMPERATURE),
        }),
    }
}

/// Parses reply text into a result, rejecting an empty breakdown.
pub fn parse_footprint(text: &str) -> Result<FootprintResult, EstimateError> {
    let result: FootprintResult =
        serde_json::from_str(text.trim()).map_err(EstimateError::Malformed)?;
    if result.breakdown.is_empty() {
        return Err(EstimateError::EmptyBreakdown);
    }
    Ok(result)
}

/// Application-wide estimator. Built once at startup and shared by reference;
/// construction fails when no API key is configured.
pub struct FootprintEstimator {
    client: GeminiClient,
}

impl FootprintEstimator {
    pub fn new(client: GeminiClient) -> Result<Self, GeminiError> {
        if !client.config().has_api_key() {
            return Err(GeminiError::MissingApiKey);
        }
        info!(model = %client.config().model, "Footprint estimator ready");
        Ok(Self { client })
    }

    /// Exactly one outbound call per non-blank item. No retries.
    #[instrument(skip(self))]
    pub async fn estimate(&self, item: &str) -> Result<FootprintResult, EstimateError> {
        let item = item.trim();
        if item.is_empty() {
            return Err(EstimateError::BlankItem);
        }

        let outcome = self.request_estimate(item).await;
        match &outcome {
            Ok(result) => debug!(
                item_name = %result.item_name,
                liters = result.water_footprint_liters,
                stages = result.breakdown.len(),
                "Footprint estimated"
            ),
            Err(e) => error!(kind = e.kind(), error = %e, "Footprint estimate failed"),
        }
        outcome
    }

    async fn request_estimate(&self, item: &str) -> Result<FootprintResult, EstimateError> {
        let response = self.client.generate_content(&build_request(item)).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(GeminiError::EmptyResponse.into());
        }
        parse_footprint(&text)
    }
}

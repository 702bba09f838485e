//! Generation parameters
//!
//! Sampling settings passed to an engine for a single generation call.

use serde::{Deserialize, Serialize};

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature (0.0 - 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling threshold (0.0 - 1.0)
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Upper bound on generated tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Fixed RNG seed, engine default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    512
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            seed: None,
            stop: None,
        }
    }
}

impl GenerationParams {
    /// Clamp every field into its accepted range
    pub fn validate(&mut self) {
        if !self.temperature.is_finite() {
            self.temperature = default_temperature();
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if !self.top_p.is_finite() {
            self.top_p = default_top_p();
        }
        self.top_p = self.top_p.clamp(0.0, 1.0);

        self.max_tokens = self.max_tokens.max(1);

        if let Some(stop) = self.stop.take() {
            let stop: Vec<String> = stop.into_iter().filter(|s| !s.is_empty()).collect();
            self.stop = if stop.is_empty() { None } else { Some(stop) };
        }
    }

    /// Validated copy
    pub fn validated(&self) -> Self {
        let mut params = self.clone();
        params.validate();
        params
    }

    /// Non-empty stop sequences
    pub fn stop_sequences(&self) -> impl Iterator<Item = &str> {
        self.stop
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

//! Feature kinds and their output schemas
//!
//! Each feature has one fixed JSON shape. Model output is parsed into the
//! matching struct and validated; anything else is rejected and replaced by
//! a neutral default marked as degraded.

use callscope_common::errors::{AppError, Result};
use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Closed set of analysis features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKind {
    SentimentAnalysis,
    QualityScoring,
    ChurnPrediction,
    CallSummary,
}

impl FeatureKind {
    pub fn all() -> [FeatureKind; 4] {
        [
            FeatureKind::SentimentAnalysis,
            FeatureKind::QualityScoring,
            FeatureKind::ChurnPrediction,
            FeatureKind::CallSummary,
        ]
    }

    /// Slug as stored in a tenant's enabled feature list
    pub fn slug(&self) -> &'static str {
        match self {
            FeatureKind::SentimentAnalysis => "sentiment-analysis",
            FeatureKind::QualityScoring => "quality-scoring",
            FeatureKind::ChurnPrediction => "churn-prediction",
            FeatureKind::CallSummary => "call-summary",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::all().into_iter().find(|k| k.slug() == slug.trim())
    }

    /// Field list appended to the configured instruction text
    pub fn schema_hint(&self) -> &'static str {
        match self {
            FeatureKind::SentimentAnalysis => {
                r#"{"sentiment": "positive|neutral|negative", "score": number between -1 and 1, "customer_emotions": [string]}"#
            }
            FeatureKind::QualityScoring => {
                r#"{"overall_score": integer 0-100, "greeting": integer 0-100, "empathy": integer 0-100, "resolution": integer 0-100, "professionalism": integer 0-100, "strengths": [string], "improvements": [string]}"#
            }
            FeatureKind::ChurnPrediction => {
                r#"{"risk_level": "low|medium|high", "probability": number between 0 and 1, "signals": [string], "recommended_action": string}"#
            }
            FeatureKind::CallSummary => {
                r#"{"summary": string, "key_points": [string], "action_items": [string], "topic": string or null}"#
            }
        }
    }

    /// Built-in instruction used when none is configured
    pub fn default_instruction(&self) -> &'static str {
        match self {
            FeatureKind::SentimentAnalysis => "Classify the customer's overall sentiment in this call.",
            FeatureKind::QualityScoring => "Score the agent's handling of this call.",
            FeatureKind::ChurnPrediction => "Estimate the risk that this customer will cancel.",
            FeatureKind::CallSummary => "Summarize this call for a supervisor.",
        }
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentOutput {
    pub sentiment: String,
    pub score: f64,
    #[serde(default)]
    pub customer_emotions: Vec<String>,
}

impl Default for SentimentOutput {
    fn default() -> Self {
        Self {
            sentiment: "neutral".to_string(),
            score: 0.0,
            customer_emotions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOutput {
    pub overall_score: i32,
    #[serde(default)]
    pub greeting: i32,
    #[serde(default)]
    pub empathy: i32,
    #[serde(default)]
    pub resolution: i32,
    #[serde(default)]
    pub professionalism: i32,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl Default for QualityOutput {
    fn default() -> Self {
        Self {
            overall_score: 50,
            greeting: 50,
            empathy: 50,
            resolution: 50,
            professionalism: 50,
            strengths: Vec::new(),
            improvements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnOutput {
    pub risk_level: String,
    pub probability: f64,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub recommended_action: String,
}

impl Default for ChurnOutput {
    fn default() -> Self {
        Self {
            risk_level: "medium".to_string(),
            probability: 0.5,
            signals: Vec::new(),
            recommended_action: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Parsed result of one feature
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutput {
    Sentiment(SentimentOutput),
    Quality(QualityOutput),
    Churn(ChurnOutput),
    Summary(SummaryOutput),
}

impl FeatureOutput {
    /// Neutral result stored when the model output is unusable
    pub fn neutral(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::SentimentAnalysis => FeatureOutput::Sentiment(SentimentOutput::default()),
            FeatureKind::QualityScoring => FeatureOutput::Quality(QualityOutput::default()),
            FeatureKind::ChurnPrediction => FeatureOutput::Churn(ChurnOutput::default()),
            FeatureKind::CallSummary => FeatureOutput::Summary(SummaryOutput::default()),
        }
    }

    /// Parse and validate model output for `kind`
    pub fn parse(kind: FeatureKind, content: &str) -> Result<Self> {
        let json = extract_json(content)?;

        match kind {
            FeatureKind::SentimentAnalysis => {
                let mut out: SentimentOutput = decode(json)?;
                out.sentiment = out.sentiment.trim().to_ascii_lowercase();
                if !matches!(out.sentiment.as_str(), "positive" | "neutral" | "negative") {
                    return Err(invalid(format!("unknown sentiment '{}'", out.sentiment)));
                }
                check_range("score", out.score, -1.0, 1.0)?;
                Ok(FeatureOutput::Sentiment(out))
            }
            FeatureKind::QualityScoring => {
                let out: QualityOutput = decode(json)?;
                for (field, value) in [
                    ("overall_score", out.overall_score),
                    ("greeting", out.greeting),
                    ("empathy", out.empathy),
                    ("resolution", out.resolution),
                    ("professionalism", out.professionalism),
                ] {
                    if !(0..=100).contains(&value) {
                        return Err(invalid(format!("{} out of range: {}", field, value)));
                    }
                }
                Ok(FeatureOutput::Quality(out))
            }
            FeatureKind::ChurnPrediction => {
                let mut out: ChurnOutput = decode(json)?;
                out.risk_level = out.risk_level.trim().to_ascii_lowercase();
                if !matches!(out.risk_level.as_str(), "low" | "medium" | "high") {
                    return Err(invalid(format!("unknown risk level '{}'", out.risk_level)));
                }
                check_range("probability", out.probability, 0.0, 1.0)?;
                Ok(FeatureOutput::Churn(out))
            }
            FeatureKind::CallSummary => {
                let out: SummaryOutput = decode(json)?;
                if out.summary.trim().is_empty() {
                    return Err(invalid("empty summary".to_string()));
                }
                Ok(FeatureOutput::Summary(out))
            }
        }
    }
}

/// Strip markdown code fences some models wrap JSON in
fn extract_json(content: &str) -> Result<&str> {
    let fence = Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").map_err(|e| AppError::Internal {
        message: format!("fence pattern: {}", e),
    })?;

    let body = match fence.captures(content).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => content.trim(),
    };

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&body[start..=end]),
        _ => Err(invalid("no JSON object in model output".to_string())),
    }
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| invalid(format!("schema mismatch: {}", e)))
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{} out of range: {}", field, value)))
    }
}

fn invalid(message: String) -> AppError {
    AppError::InvalidFormat { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_slug_round_trip() {
        for kind in FeatureKind::all() {
            assert_eq!(FeatureKind::from_slug(kind.slug()), Some(kind));
        }
        assert_eq!(FeatureKind::from_slug("lead-scoring"), None);
    }

    #[test]
    fn test_parses_fenced_output() {
        let content = "```json\n{\"sentiment\": \"Negative\", \"score\": -0.4}\n```";
        let out = FeatureOutput::parse(FeatureKind::SentimentAnalysis, content).unwrap();

        match out {
            FeatureOutput::Sentiment(s) => {
                assert_eq!(s.sentiment, "negative");
                assert!(s.customer_emotions.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_malformed_and_out_of_range() {
        assert_err!(FeatureOutput::parse(FeatureKind::SentimentAnalysis, "not json"));
        assert_err!(FeatureOutput::parse(FeatureKind::SentimentAnalysis, r#"{"sentiment":"angry","score":0}"#));
        assert_err!(FeatureOutput::parse(FeatureKind::QualityScoring, r#"{"overall_score": 140}"#));
        assert_err!(FeatureOutput::parse(FeatureKind::ChurnPrediction, r#"{"risk_level":"low","probability":1.5}"#));
        assert_err!(FeatureOutput::parse(FeatureKind::CallSummary, r#"{"summary":"  "}"#));
    }

    #[test]
    fn test_text_around_object_is_ignored() {
        let content = "Here you go: {\"summary\": \"Billing question\", \"topic\": null} thanks";
        let out = FeatureOutput::parse(FeatureKind::CallSummary, content).unwrap();
        assert!(matches!(out, FeatureOutput::Summary(ref s) if s.summary == "Billing question"));
    }
}

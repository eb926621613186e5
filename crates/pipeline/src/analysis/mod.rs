//! AI analysis dispatch
//!
//! Runs each tenant-enabled feature over a transcript and stores one typed
//! row per (call, feature). Features are isolated: a failure in one never
//! stops the others, and an existing row means the feature is not run again.

pub mod features;
pub mod llm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callscope_common::config::{AnalysisConfig, LlmConfig};
use callscope_common::db::models::{
    CallSummaryActiveModel, CdrRecord, ChurnActiveModel, QualityScoreActiveModel, SentimentActiveModel,
    Tenant,
};
use callscope_common::errors::{AppError, Result};
use callscope_common::metrics;
use callscope_common::Repository;
use chrono::Utc;
use futures::future::join_all;
use sea_orm::Set;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use features::{ChurnOutput, FeatureKind, FeatureOutput, QualityOutput, SentimentOutput, SummaryOutput};
pub use llm::{create_llm_client, LlmClient, LlmRequest, LlmResponse, MockLlm, OpenAiChatClient};

/// Result of one (call, feature) analysis
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// A row already existed
    Skipped,
    Stored { degraded: bool, cost_usd: f64 },
    /// Nothing stored; the feature can be retried
    Failed(AppError),
}

/// Per-call rollup of all enabled features
#[derive(Debug, Default)]
pub struct AnalysisSummary {
    pub stored: usize,
    pub degraded: usize,
    pub skipped: usize,
    pub failed: Vec<(FeatureKind, String)>,
    pub cost_usd: f64,
}

impl AnalysisSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Audit fields shared by every feature row
struct RowMeta {
    cdr_id: Uuid,
    tenant_id: Uuid,
    degraded: bool,
    model: String,
    cost_usd: f64,
    processing_ms: i64,
}

pub struct AnalysisDispatcher {
    repo: Repository,
    llm: Arc<dyn LlmClient>,
    prompts: HashMap<FeatureKind, String>,
    prompt_price_per_1k: f64,
    completion_price_per_1k: f64,
    timeout: Duration,
}

impl AnalysisDispatcher {
    pub fn new(repo: Repository, llm: Arc<dyn LlmClient>, analysis: &AnalysisConfig, config: &LlmConfig) -> Self {
        let mut prompts = HashMap::new();
        for (slug, text) in &analysis.prompts {
            match FeatureKind::from_slug(slug) {
                Some(kind) => {
                    prompts.insert(kind, text.clone());
                }
                None => warn!(slug = %slug, "Ignoring prompt for unknown feature"),
            }
        }

        Self {
            repo,
            llm,
            prompts,
            prompt_price_per_1k: config.prompt_price_per_1k,
            completion_price_per_1k: config.completion_price_per_1k,
            timeout: Duration::from_secs(config.timeout_secs.saturating_mul(u64::from(config.max_retries) + 1)),
        }
    }

    /// Features the tenant has enabled, in a stable order
    pub fn enabled_features(tenant: &Tenant) -> Vec<FeatureKind> {
        let slugs = tenant.enabled_feature_slugs();
        for slug in &slugs {
            if FeatureKind::from_slug(slug).is_none() {
                warn!(tenant_id = %tenant.id, slug = %slug, "Tenant enables unknown feature");
            }
        }

        FeatureKind::all()
            .into_iter()
            .filter(|kind| slugs.iter().any(|s| s.trim() == kind.slug()))
            .collect()
    }

    /// Run every enabled feature for a call concurrently
    #[instrument(skip(self, tenant, cdr, transcript), fields(cdr_id = %cdr.id, tenant_id = %tenant.id))]
    pub async fn analyze_all(
        &self,
        tenant: &Tenant,
        cdr: &CdrRecord,
        transcript: &str,
        degrade_on_error: bool,
    ) -> AnalysisSummary {
        let kinds = Self::enabled_features(tenant);
        let outcomes = join_all(
            kinds
                .iter()
                .map(|kind| self.analyze(cdr, transcript, *kind, degrade_on_error)),
        )
        .await;

        let mut summary = AnalysisSummary::default();
        for (kind, outcome) in kinds.into_iter().zip(outcomes) {
            match outcome {
                AnalysisOutcome::Skipped => summary.skipped += 1,
                AnalysisOutcome::Stored { degraded, cost_usd } => {
                    summary.stored += 1;
                    summary.cost_usd += cost_usd;
                    if degraded {
                        summary.degraded += 1;
                    }
                }
                AnalysisOutcome::Failed(e) => summary.failed.push((kind, e.to_string())),
            }
        }

        info!(
            stored = summary.stored,
            degraded = summary.degraded,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            cost_usd = summary.cost_usd,
            "Analysis dispatch finished"
        );
        summary
    }

    /// Analyze one call with one feature.
    ///
    /// Unparseable output is stored as a degraded neutral row. A transport
    /// failure stores nothing unless `degrade_on_error` is set.
    #[instrument(skip(self, cdr, transcript), fields(cdr_id = %cdr.id, feature = %kind))]
    pub async fn analyze(
        &self,
        cdr: &CdrRecord,
        transcript: &str,
        kind: FeatureKind,
        degrade_on_error: bool,
    ) -> AnalysisOutcome {
        match self.exists(cdr.id, kind).await {
            Ok(true) => {
                debug!("Feature result already stored");
                return AnalysisOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => return AnalysisOutcome::Failed(e),
        }

        let instruction = self
            .prompts
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_instruction());
        let system = format!(
            "{}\n\nRespond only with a JSON object of this shape:\n{}",
            instruction,
            kind.schema_hint()
        );
        let request = LlmRequest {
            feature: kind.slug(),
            system: &system,
            user: transcript,
        };

        let started = Instant::now();
        let response = match tokio::time::timeout(self.timeout, self.llm.complete_json(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Llm {
                message: format!("no response within {}s", self.timeout.as_secs()),
            }),
        };
        let processing_ms = started.elapsed().as_millis() as i64;

        let (output, degraded, cost_usd) = match response {
            Ok(response) => {
                let cost = self.cost(&response);
                match FeatureOutput::parse(kind, &response.content) {
                    Ok(output) => (output, false, cost),
                    Err(e) => {
                        warn!(error = %e, "Unusable model output, storing neutral result");
                        (FeatureOutput::neutral(kind), true, cost)
                    }
                }
            }
            Err(e) if degrade_on_error => {
                warn!(error = %e, "Analysis failed on final attempt, storing neutral result");
                (FeatureOutput::neutral(kind), true, 0.0)
            }
            Err(e) => {
                warn!(error = %e, "Analysis request failed");
                return AnalysisOutcome::Failed(e);
            }
        };

        let meta = RowMeta {
            cdr_id: cdr.id,
            tenant_id: cdr.tenant_id,
            degraded,
            model: self.llm.model().to_string(),
            cost_usd,
            processing_ms,
        };

        match self.store(output, meta).await {
            Ok(true) => {
                metrics::record_llm_cost(kind.slug(), cost_usd);
                AnalysisOutcome::Stored { degraded, cost_usd }
            }
            Ok(false) => AnalysisOutcome::Skipped,
            Err(e) => AnalysisOutcome::Failed(e),
        }
    }

    fn cost(&self, response: &LlmResponse) -> f64 {
        f64::from(response.prompt_tokens) / 1000.0 * self.prompt_price_per_1k
            + f64::from(response.completion_tokens) / 1000.0 * self.completion_price_per_1k
    }

    async fn exists(&self, cdr_id: Uuid, kind: FeatureKind) -> Result<bool> {
        let rows = self.repo.load_feature_rows(cdr_id).await?;
        Ok(match kind {
            FeatureKind::SentimentAnalysis => rows.sentiment.is_some(),
            FeatureKind::QualityScoring => rows.quality_score.is_some(),
            FeatureKind::ChurnPrediction => rows.churn_prediction.is_some(),
            FeatureKind::CallSummary => rows.call_summary.is_some(),
        })
    }

    async fn store(&self, output: FeatureOutput, meta: RowMeta) -> Result<bool> {
        let now = Utc::now();

        match output {
            FeatureOutput::Sentiment(s) => {
                self.repo
                    .insert_sentiment(SentimentActiveModel {
                        id: Set(Uuid::new_v4()),
                        cdr_id: Set(meta.cdr_id),
                        tenant_id: Set(meta.tenant_id),
                        sentiment: Set(s.sentiment),
                        score: Set(s.score),
                        customer_emotions: Set(json!(s.customer_emotions)),
                        degraded: Set(meta.degraded),
                        model: Set(meta.model),
                        cost_usd: Set(meta.cost_usd),
                        processing_ms: Set(meta.processing_ms),
                        created_at: Set(now.into()),
                    })
                    .await
            }
            FeatureOutput::Quality(q) => {
                self.repo
                    .insert_quality_score(QualityScoreActiveModel {
                        id: Set(Uuid::new_v4()),
                        cdr_id: Set(meta.cdr_id),
                        tenant_id: Set(meta.tenant_id),
                        overall_score: Set(q.overall_score),
                        greeting: Set(q.greeting),
                        empathy: Set(q.empathy),
                        resolution: Set(q.resolution),
                        professionalism: Set(q.professionalism),
                        strengths: Set(json!(q.strengths)),
                        improvements: Set(json!(q.improvements)),
                        degraded: Set(meta.degraded),
                        model: Set(meta.model),
                        cost_usd: Set(meta.cost_usd),
                        processing_ms: Set(meta.processing_ms),
                        created_at: Set(now.into()),
                    })
                    .await
            }
            FeatureOutput::Churn(c) => {
                self.repo
                    .insert_churn_prediction(ChurnActiveModel {
                        id: Set(Uuid::new_v4()),
                        cdr_id: Set(meta.cdr_id),
                        tenant_id: Set(meta.tenant_id),
                        risk_level: Set(c.risk_level),
                        probability: Set(c.probability),
                        signals: Set(json!(c.signals)),
                        recommended_action: Set(c.recommended_action),
                        degraded: Set(meta.degraded),
                        model: Set(meta.model),
                        cost_usd: Set(meta.cost_usd),
                        processing_ms: Set(meta.processing_ms),
                        created_at: Set(now.into()),
                    })
                    .await
            }
            FeatureOutput::Summary(s) => {
                self.repo
                    .insert_call_summary(CallSummaryActiveModel {
                        id: Set(Uuid::new_v4()),
                        cdr_id: Set(meta.cdr_id),
                        tenant_id: Set(meta.tenant_id),
                        summary: Set(s.summary),
                        key_points: Set(json!(s.key_points)),
                        action_items: Set(json!(s.action_items)),
                        topic: Set(s.topic),
                        degraded: Set(meta.degraded),
                        model: Set(meta.model),
                        cost_usd: Set(meta.cost_usd),
                        processing_ms: Set(meta.processing_ms),
                        created_at: Set(now.into()),
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn dispatcher(repo: &Repository, llm: Arc<MockLlm>) -> AnalysisDispatcher {
        AnalysisDispatcher::new(repo.clone(), llm, &AnalysisConfig::default(), &LlmConfig::default())
    }

    #[tokio::test]
    async fn test_malformed_feature_does_not_block_others() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["sentiment-analysis", "quality-scoring"]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let llm = Arc::new(MockLlm::new());
        llm.reply_with("sentiment-analysis", "{ this is not json");

        let summary = dispatcher(&repo, llm.clone())
            .analyze_all(&tenant, &cdr, "Hello, how can I help you", false)
            .await;

        assert!(summary.is_complete());
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.degraded, 1);

        let rows = repo.load_feature_rows(cdr.id).await.unwrap();
        let quality = rows.quality_score.unwrap();
        assert_eq!(quality.overall_score, 82);
        assert!(!quality.degraded);
        let sentiment = rows.sentiment.unwrap();
        assert!(sentiment.degraded);
        assert_eq!(sentiment.sentiment, "neutral");
        assert!(rows.churn_prediction.is_none());
    }

    #[tokio::test]
    async fn test_malformed_output_degrades_on_first_attempt() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["churn-prediction"]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let llm = Arc::new(MockLlm::new());
        llm.reply_with("churn-prediction", "the caller seemed happy");
        let dispatcher = dispatcher(&repo, llm.clone());

        let first = dispatcher.analyze(&cdr, "text", FeatureKind::ChurnPrediction, false).await;
        let again = dispatcher.analyze(&cdr, "text", FeatureKind::ChurnPrediction, false).await;

        assert!(matches!(first, AnalysisOutcome::Stored { degraded: true, .. }));
        assert!(matches!(again, AnalysisOutcome::Skipped));
        assert_eq!(llm.calls_for("churn-prediction"), 1);
        assert!(repo.load_feature_rows(cdr.id).await.unwrap().churn_prediction.unwrap().degraded);
    }

    #[tokio::test]
    async fn test_existing_row_skips_llm() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["call-summary"]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let llm = Arc::new(MockLlm::new());
        let dispatcher = dispatcher(&repo, llm.clone());

        let first = dispatcher.analyze(&cdr, "text", FeatureKind::CallSummary, false).await;
        let second = dispatcher.analyze(&cdr, "text", FeatureKind::CallSummary, false).await;

        assert!(matches!(first, AnalysisOutcome::Stored { degraded: false, .. }));
        assert!(matches!(second, AnalysisOutcome::Skipped));
        assert_eq!(llm.calls_for("call-summary"), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_isolated_and_retryable() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["churn-prediction", "call-summary"]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let llm = Arc::new(MockLlm::new());
        llm.fail_feature("churn-prediction", true);
        let dispatcher = dispatcher(&repo, llm.clone());

        let summary = dispatcher.analyze_all(&tenant, &cdr, "text", false).await;
        assert_eq!(summary.stored, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, FeatureKind::ChurnPrediction);

        // last attempt degrades instead of failing
        let summary = dispatcher.analyze_all(&tenant, &cdr, "text", true).await;
        assert!(summary.is_complete());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.degraded, 1);
        assert!(repo.load_feature_rows(cdr.id).await.unwrap().churn_prediction.unwrap().degraded);
    }

    #[tokio::test]
    async fn test_cost_from_token_usage() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["sentiment-analysis"]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let llm = Arc::new(MockLlm::new());

        let config = LlmConfig {
            prompt_price_per_1k: 0.01,
            completion_price_per_1k: 0.1,
            ..LlmConfig::default()
        };
        let dispatcher = AnalysisDispatcher::new(repo.clone(), llm, &AnalysisConfig::default(), &config);
        dispatcher.analyze(&cdr, "text", FeatureKind::SentimentAnalysis, false).await;

        let row = repo.load_feature_rows(cdr.id).await.unwrap().sentiment.unwrap();
        // 1000 prompt tokens + 100 completion tokens
        assert!((row.cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(row.model, "mock-llm");
    }

    #[tokio::test]
    async fn test_unknown_slugs_are_ignored() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &["lead-scoring", "call-summary"]).await;

        assert_eq!(
            AnalysisDispatcher::enabled_features(&tenant),
            vec![FeatureKind::CallSummary]
        );
    }
}

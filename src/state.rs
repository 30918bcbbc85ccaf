use crate::cache::JsonCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::security::{
    ContentAnalyzer, ModerationPipeline, NoopAnalyzer, OpenAiModerationAnalyzer, RateLimiter,
};
use crate::store::ContentStore;
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Components shared by every request. Built once at startup and cloned
/// into handlers; tests build one per case.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Per-user content creation limiter
    pub content_limiter: RateLimiter,
    /// Per-address limiter with blacklist escalation
    pub ip_limiter: RateLimiter,
    pub moderation: Arc<ModerationPipeline>,
    pub cache: JsonCache,
    pub store: Arc<dyn ContentStore>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Build state, picking the hosted analyzer when an API key is configured.
    pub fn new(config: Config, store: Arc<dyn ContentStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let analyzer: Arc<dyn ContentAnalyzer> = match &config.openai_api_key {
            Some(key) => {
                info!("Using OpenAI moderation analyzer");
                Arc::new(OpenAiModerationAnalyzer::new(key.clone()))
            }
            None => {
                info!("No analyzer key configured, external analysis disabled");
                Arc::new(NoopAnalyzer)
            }
        };
        Self::with_analyzer(config, store, clock, analyzer)
    }

    pub fn with_analyzer(
        config: Config,
        store: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        analyzer: Arc<dyn ContentAnalyzer>,
    ) -> Result<Self> {
        let moderation = ModerationPipeline::new(&config.moderation, analyzer)
            .context("invalid moderation pattern")?;
        let content_limiter = RateLimiter::new("content", config.rate_limit.content_policy(), clock.clone());
        let ip_limiter = RateLimiter::new("ip", config.rate_limit.ip_policy(), clock.clone());
        let cache = JsonCache::new(config.cache.default_ttl(), clock);

        Ok(Self {
            config: Arc::new(config),
            content_limiter,
            ip_limiter,
            moderation: Arc::new(moderation),
            cache,
            store,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Start the cache sweeper and limiter eviction loops.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let rate = &self.config.rate_limit;
        vec![
            self.cache.spawn_sweeper(self.config.cache.sweep_interval()),
            self.ip_limiter
                .spawn_eviction(rate.eviction_interval(), rate.idle_eviction_multiple),
            self.content_limiter
                .spawn_eviction(rate.eviction_interval(), rate.idle_eviction_multiple),
        ]
    }
}

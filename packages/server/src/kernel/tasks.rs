//! The recurring jobs the ingestion server registers at startup.
//!
//! Business logic stays behind collaborator traits: [`ForumCrawler`] does
//! the actual HTTP fetching and row upserts per forum, [`TopicGenerator`]
//! owns the embedding/LLM side. This module only wires them into the
//! scheduler's [`CronTask`] contract and the [`CrawlerManager`] state
//! machine.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::crawler::{CrawlHandle, CrawlerManager};
use super::scheduler::CronTask;

/// Job name for the all-forums crawl, also its lock name.
pub const CRAWL_ALL_FORUMS: &str = "crawl_all_forums";

/// Job name for topic generation.
pub const GENERATE_TOPICS: &str = "generate_topics";

/// Per-source crawling, implemented by the host service.
///
/// `crawl_forum` should report progress through the handle as it pages
/// through the source (that is what feeds stall detection) and poll the
/// cancellation token between requests.
#[async_trait]
pub trait ForumCrawler: Send + Sync {
    /// Names of the forums currently configured for crawling.
    async fn forums(&self) -> Result<Vec<String>>;

    async fn crawl_forum(
        &self,
        forum: &str,
        crawl: &CrawlHandle,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Topic generation over freshly crawled content, implemented by the host
/// service.
#[async_trait]
pub trait TopicGenerator: Send + Sync {
    /// Whether generation can run at all (e.g. the source tables exist and
    /// contain content).
    async fn ready(&self) -> Result<bool> {
        Ok(true)
    }

    /// Generate topics, returning how many were produced.
    async fn generate_topics(&self, cancel: CancellationToken) -> Result<u64>;
}

/// Crawls every configured forum in sequence.
///
/// Individual forum failures are recorded on that forum's `CrawlStatus` and
/// do not abort the rest of the run; the firing itself only fails when every
/// forum failed, so one flaky source does not trigger a full re-crawl storm.
pub struct CrawlAllForumsTask {
    manager: CrawlerManager,
    crawler: Arc<dyn ForumCrawler>,
}

impl CrawlAllForumsTask {
    pub fn new(manager: CrawlerManager, crawler: Arc<dyn ForumCrawler>) -> Self {
        Self { manager, crawler }
    }
}

#[async_trait]
impl CronTask for CrawlAllForumsTask {
    fn name(&self) -> &str {
        CRAWL_ALL_FORUMS
    }

    fn description(&self) -> &str {
        "Crawl all configured forums for new topics and posts"
    }

    fn default_schedule(&self) -> &str {
        // Hourly, at the top of the hour.
        "0 0 * * * *"
    }

    async fn can_run(&self) -> Result<bool> {
        Ok(!self.manager.any_running())
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let forums = self.crawler.forums().await?;
        if forums.is_empty() {
            info!("no forums configured, nothing to crawl");
            return Ok(());
        }

        let total = forums.len();
        let mut failed = 0usize;

        for forum in forums {
            if cancel.is_cancelled() {
                info!("crawl cancelled, stopping between forums");
                break;
            }

            let handle = match self.manager.start(&forum) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!(forum = %forum, error = %e, "skipping forum");
                    continue;
                }
            };

            match self
                .crawler
                .crawl_forum(&forum, &handle, cancel.child_token())
                .await
            {
                Ok(()) => handle.complete(),
                Err(e) => {
                    warn!(forum = %forum, error = %e, "forum crawl failed");
                    handle.fail(&e.to_string());
                    failed += 1;
                }
            }
        }

        if failed == total {
            bail!("all {} forum crawls failed", total);
        }
        Ok(())
    }

    async fn status(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.manager.statuses()).ok()
    }
}

/// Generates discussion topics from crawled content.
pub struct GenerateTopicsTask {
    generator: Arc<dyn TopicGenerator>,
}

impl GenerateTopicsTask {
    pub fn new(generator: Arc<dyn TopicGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl CronTask for GenerateTopicsTask {
    fn name(&self) -> &str {
        GENERATE_TOPICS
    }

    fn description(&self) -> &str {
        "Generate topics from recently crawled forum content"
    }

    fn default_schedule(&self) -> &str {
        // Daily at 03:00, after the overnight crawls.
        "0 0 3 * * *"
    }

    async fn can_run(&self) -> Result<bool> {
        self.generator.ready().await
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<()> {
        let count = self.generator.generate_topics(cancel).await?;
        info!(count, "topic generation finished");
        Ok(())
    }
}

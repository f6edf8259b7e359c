//! Scrape job execution.
//!
//! A job moves `pending → running → {completed, failed}`. While running, the
//! orchestrator pulls batches from an extraction session, drops records it has
//! already seen in this run, normalizes and stores the rest, and bumps the
//! job counter once per newly written row. The session is closed on every exit
//! path before the final status is written. A running job refreshes a
//! heartbeat on its row so other processes can tell it from an abandoned one.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelDirectory, ChannelLocation, ScrapingSettings};
use crate::db::Database;
use crate::error::ScrapeError;
use crate::models::{Channel, JobStatus, Message, RawRecord, ScrapeJob, ScrapeType, Server};
use crate::normalizer::normalize;
use crate::source::{ExtractionSource, SourceRequest, SourceSession};

#[derive(Clone)]
pub struct ScrapeOrchestrator {
    db: Database,
    directory: Arc<dyn ChannelDirectory>,
    source: Arc<dyn ExtractionSource>,
    settings: ScrapingSettings,
}

/// State owned by exactly one job execution. Dropped when the run ends.
struct RunContext {
    job_id: i64,
    channel_id: String,
    /// `(channel_id, message_id)` pairs seen so far in this run.
    seen: HashSet<(String, String)>,
    stored: u64,
    overlapping: u64,
    iterations: u32,
    /// Newest message fetched in this run, whether or not it was already stored.
    newest: Option<(String, DateTime<Utc>)>,
}

impl RunContext {
    fn new(job: &ScrapeJob) -> Self {
        Self {
            job_id: job.id,
            channel_id: job.channel_id.clone(),
            seen: HashSet::new(),
            stored: 0,
            overlapping: 0,
            iterations: 0,
            newest: None,
        }
    }

    fn key(&self, raw: &RawRecord) -> (String, String) {
        (self.channel_id.clone(), raw.id.clone())
    }

    fn observe(&mut self, message: &Message) {
        let is_newer = self
            .newest
            .as_ref()
            .map_or(true, |(_, ts)| message.timestamp > *ts);
        if is_newer {
            self.newest = Some((message.id.clone(), message.timestamp));
        }
    }
}

/// Keeps a running job's heartbeat fresh until dropped.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ScrapeOrchestrator {
    pub fn new(
        db: Database,
        directory: Arc<dyn ChannelDirectory>,
        source: Arc<dyn ExtractionSource>,
        settings: ScrapingSettings,
    ) -> Self {
        Self {
            db,
            directory,
            source,
            settings,
        }
    }

    /// Marks `running` jobs whose heartbeat went stale as `interrupted`. Jobs
    /// owned by a live process, here or elsewhere, are not touched.
    pub async fn recover_stale_jobs(&self) -> Result<usize, ScrapeError> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(self.settings.stale_after())
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let count = self
            .db
            .run_blocking(move |db| db.mark_stale_jobs_interrupted(cutoff))
            .await?;
        if count > 0 {
            warn!("Marked {} abandoned scrape job(s) as interrupted", count);
        }
        Ok(count)
    }

    /// Registers the channel's server and channel rows (if missing) and
    /// creates a `pending` job for it.
    pub async fn create_job(
        &self,
        channel_id: &str,
        scrape_type: ScrapeType,
    ) -> Result<i64, ScrapeError> {
        let location = self.resolve(channel_id)?;
        let job_id = self
            .db
            .run_blocking(move |db| {
                db.insert_server(&Server::new(&location.server_id, &location.server_name))?;
                db.insert_channel(&Channel::new(
                    &location.channel_id,
                    &location.server_id,
                    &location.channel_name,
                ))?;
                db.create_job(&location.channel_id, scrape_type, None)
            })
            .await?;
        info!("Created {} scrape job {} for channel {}", scrape_type, job_id, channel_id);
        Ok(job_id)
    }

    /// Creates a job for `channel_id` and runs it to completion.
    pub async fn start_job(
        &self,
        channel_id: &str,
        scrape_type: ScrapeType,
    ) -> Result<ScrapeJob, ScrapeError> {
        let job_id = self.create_job(channel_id, scrape_type).await?;
        self.execute_job(job_id).await
    }

    /// Starts a new job continuing an `interrupted` one, with the same scrape
    /// type. Rows the interrupted run stored are skipped as duplicates.
    pub async fn resume_job(&self, job_id: i64) -> Result<ScrapeJob, ScrapeError> {
        let previous = self.load_job(job_id).await?;
        if previous.status != JobStatus::Interrupted {
            return Err(ScrapeError::NotResumable {
                id: job_id,
                status: previous.status,
            });
        }

        let channel_id = previous.channel_id.clone();
        let scrape_type = previous.scrape_type;
        let new_id = self
            .db
            .run_blocking(move |db| db.create_job(&channel_id, scrape_type, Some(job_id)))
            .await?;
        info!("Resuming interrupted job {} as job {}", job_id, new_id);
        self.execute_job(new_id).await
    }

    pub async fn execute_job(&self, job_id: i64) -> Result<ScrapeJob, ScrapeError> {
        self.execute_job_with_cancel(job_id, CancellationToken::new())
            .await
    }

    /// Runs a `pending` job. Any failure is recorded on the job row and then
    /// returned. Cancelling `cancel` closes the source and leaves the job
    /// `interrupted` so it can be resumed.
    pub async fn execute_job_with_cancel(
        &self,
        job_id: i64,
        cancel: CancellationToken,
    ) -> Result<ScrapeJob, ScrapeError> {
        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(ScrapeError::InvalidTransition {
                id: job_id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        self.set_status(job_id, JobStatus::Running, None).await?;
        info!(
            "Scrape job {} running ({} scrape of channel {})",
            job_id, job.scrape_type, job.channel_id
        );

        let heartbeat = self.start_heartbeat(job_id);
        let outcome = self.run(&job, &cancel).await;
        drop(heartbeat);

        match outcome {
            Ok(ctx) => {
                self.set_status(job_id, JobStatus::Completed, None).await?;
                info!(
                    job_id,
                    stored = ctx.stored,
                    overlapping = ctx.overlapping,
                    iterations = ctx.iterations,
                    "Scrape job completed"
                );
            }
            Err(ScrapeError::Cancelled) => {
                warn!("Scrape job {} cancelled", job_id);
                let message = ScrapeError::Cancelled.to_string();
                self.set_status(job_id, JobStatus::Interrupted, Some(message))
                    .await?;
                return Err(ScrapeError::Cancelled);
            }
            Err(e) => {
                error!("Scrape job {} failed: {}", job_id, e);
                let message = e.to_string();
                if let Err(status_err) = self
                    .set_status(job_id, JobStatus::Failed, Some(message))
                    .await
                {
                    error!(
                        "Could not record failure of job {}: {}",
                        job_id, status_err
                    );
                }
                return Err(e);
            }
        }

        self.load_job(job_id).await
    }

    async fn run(
        &self,
        job: &ScrapeJob,
        cancel: &CancellationToken,
    ) -> Result<RunContext, ScrapeError> {
        let location = self.resolve(&job.channel_id)?;
        let lower_bound = self.lower_bound(job).await?;
        let request = SourceRequest {
            server_id: location.server_id.clone(),
            channel_id: job.channel_id.clone(),
            scrape_type: job.scrape_type,
            lower_bound,
        };

        debug!(
            "Opening {} source for channel {}",
            self.source.name(),
            job.channel_id
        );
        let mut session = self
            .step("open source", cancel, self.source.open(&request))
            .await?;

        let outcome = self.drain(session.as_mut(), job, &location, cancel).await;

        // Close regardless of how the loop ended; a close failure never
        // replaces the loop's own outcome.
        match tokio::time::timeout(self.settings.step_timeout, session.close()).await {
            Ok(Ok(())) => debug!("Closed source for job {}", job.id),
            Ok(Err(e)) => warn!("Failed to close source for job {}: {}", job.id, e),
            Err(_) => warn!("Closing source for job {} timed out", job.id),
        }

        let ctx = outcome?;
        self.finish_channel(&ctx, &location).await?;
        Ok(ctx)
    }

    async fn drain(
        &self,
        session: &mut dyn SourceSession,
        job: &ScrapeJob,
        location: &ChannelLocation,
        cancel: &CancellationToken,
    ) -> Result<RunContext, ScrapeError> {
        let mut ctx = RunContext::new(job);

        loop {
            ctx.iterations += 1;
            let batch = self.step("next batch", cancel, session.next_batch()).await?;
            let batch_len = batch.len();
            let fresh = self.store_batch(&mut ctx, batch, &location.server_id).await?;
            info!(
                job_id = ctx.job_id,
                iteration = ctx.iterations,
                batch = batch_len,
                new = fresh,
                total = ctx.stored,
                "Scrape progress"
            );

            if ctx.iterations >= self.settings.max_iterations {
                warn!(
                    "Job {} hit the iteration limit ({}); stopping",
                    ctx.job_id, self.settings.max_iterations
                );
                break;
            }
            if !self.advance(session, cancel).await? {
                debug!("Source exhausted for job {}", ctx.job_id);
                break;
            }
        }

        Ok(ctx)
    }

    /// Stores the unseen records of one batch. Returns how many rows were
    /// actually written.
    async fn store_batch(
        &self,
        ctx: &mut RunContext,
        batch: Vec<RawRecord>,
        server_id: &str,
    ) -> Result<u64, ScrapeError> {
        let mut messages = Vec::with_capacity(batch.len());
        for raw in &batch {
            let key = ctx.key(raw);
            if ctx.seen.contains(&key) {
                ctx.overlapping += 1;
                continue;
            }
            let message = normalize(raw, &ctx.channel_id, server_id)?;
            ctx.observe(&message);
            messages.push(message);
            ctx.seen.insert(key);
        }
        if messages.is_empty() {
            return Ok(0);
        }

        let job_id = ctx.job_id;
        let written = self
            .db
            .run_blocking(move |db| {
                let mut written = 0;
                for message in &messages {
                    if db.insert_message(message)? {
                        db.increment_messages_scraped(job_id, 1)?;
                        written += 1;
                    }
                }
                Ok(written)
            })
            .await?;

        ctx.stored += written;
        Ok(written)
    }

    /// Advances the session, retrying failures up to `max_retries` times.
    async fn advance(
        &self,
        session: &mut dyn SourceSession,
        cancel: &CancellationToken,
    ) -> Result<bool, ScrapeError> {
        let mut attempt = 0;
        loop {
            match self.step("advance", cancel, session.advance()).await {
                Ok(has_more) => return Ok(has_more),
                Err(ScrapeError::Cancelled) => return Err(ScrapeError::Cancelled),
                Err(e) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(
                        "Advance failed (attempt {}/{}): {}",
                        attempt, self.settings.max_retries, e
                    );
                    self.pause(cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs one source step under the step timeout, aborting on cancellation.
    async fn step<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, ScrapeError>
    where
        F: Future<Output = Result<T, ScrapeError>>,
    {
        let duration = self.settings.step_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            res = tokio::time::timeout(duration, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ScrapeError::Timeout { operation, duration }),
            },
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), ScrapeError> {
        let delay = Duration::from_millis(self.settings.scroll_delay_ms);
        tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// The channel's last-message marker for incremental jobs. The marker only
    /// moves when a pass completes, so rows left by an unfinished job never
    /// hide the history below them.
    async fn lower_bound(&self, job: &ScrapeJob) -> Result<Option<DateTime<Utc>>, ScrapeError> {
        if job.scrape_type == ScrapeType::Full {
            return Ok(None);
        }
        let channel_id = job.channel_id.clone();
        let bound = self
            .db
            .run_blocking(move |db| {
                Ok(db
                    .get_channel(&channel_id)?
                    .and_then(|c| c.last_message_timestamp))
            })
            .await?;
        debug!("Incremental job {} bounded below by {:?}", job.id, bound);
        Ok(bound)
    }

    async fn finish_channel(
        &self,
        ctx: &RunContext,
        location: &ChannelLocation,
    ) -> Result<(), ScrapeError> {
        let channel_id = ctx.channel_id.clone();
        let server_id = location.server_id.clone();
        let newest = ctx.newest.clone();
        self.db
            .run_blocking(move |db| {
                db.update_channel_after_scrape(
                    &channel_id,
                    newest.as_ref().map(|(id, ts)| (id.as_str(), *ts)),
                )?;
                db.mark_server_scraped(&server_id, Utc::now())
            })
            .await?;
        Ok(())
    }

    fn start_heartbeat(&self, job_id: i64) -> Heartbeat {
        let db = self.db.clone();
        let every = self.settings.heartbeat_interval;
        Heartbeat(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match db
                    .run_blocking(move |db| db.touch_job_heartbeat(job_id, Utc::now()))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("Failed to refresh heartbeat of job {}: {}", job_id, e),
                }
            }
        }))
    }

    fn resolve(&self, channel_id: &str) -> Result<ChannelLocation, ScrapeError> {
        self.directory
            .resolve(channel_id)
            .ok_or_else(|| ScrapeError::Configuration(channel_id.to_string()))
    }

    async fn load_job(&self, job_id: i64) -> Result<ScrapeJob, ScrapeError> {
        self.db
            .run_blocking(move |db| db.get_job(job_id))
            .await?
            .ok_or(ScrapeError::JobNotFound(job_id))
    }

    async fn set_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), ScrapeError> {
        let changed = self
            .db
            .run_blocking(move |db| {
                db.update_job_status(job_id, status, error_message.as_deref())
            })
            .await?;
        if !changed {
            let current = self.load_job(job_id).await?;
            return Err(ScrapeError::InvalidTransition {
                id: job_id,
                from: current.status,
                to: status,
            });
        }
        Ok(())
    }
}

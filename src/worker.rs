use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ServiceData, WorkersConfig};
use crate::error::JobError;
use crate::pipeline::{JobPipeline, JobReport};
use crate::protocol::{JobId, JobRequestMessage, JobResponseMessage, JobStatus};
use crate::queue::{Broker, Delivery};

const PUBLISH_RETRIES: u32 = 3;
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Background consumer of one request/response queue pair
pub struct DispatchWorker {
    service: ServiceData,
    broker: Arc<dyn Broker>,
    pipeline: Arc<JobPipeline>,
    max_in_flight: usize,
    drain_timeout: Duration,
    publish_progress: bool,
}

impl DispatchWorker {
    pub fn new(
        service: ServiceData,
        broker: Arc<dyn Broker>,
        pipeline: Arc<JobPipeline>,
        config: &WorkersConfig,
    ) -> Self {
        Self {
            service,
            broker,
            pipeline,
            max_in_flight: config.max_in_flight.max(1),
            drain_timeout: config.drain_timeout.as_duration(),
            publish_progress: config.publish_progress,
        }
    }

    pub fn name(&self) -> &str {
        &self.service.service_name
    }

    /// Consumes until `token` fires, then drains in-flight jobs for at most
    /// the drain timeout and cancels whatever is left
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let name = self.name().to_string();
        let request_queue = self.service.request_queue_name.clone();
        self.broker.declare_queue(&request_queue).await?;
        self.broker
            .declare_queue(&self.service.response_queue_name)
            .await?;

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let jobs_token = CancellationToken::new();
        let mut in_flight = JoinSet::new();
        log::info!(
            "{name} initialized, consuming from {request_queue} with {} job(s) in flight",
            self.max_in_flight
        );

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    log::error!("{name} job task failed: {e}");
                }
            }

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            let delivery = tokio::select! {
                _ = token.cancelled() => break,
                delivery = self.broker.consume(&request_queue) => match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log::error!("{name} failed to consume from {request_queue}: {e:#}");
                        tokio::time::sleep(CONSUME_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let worker = self.clone();
            let ct = jobs_token.child_token();
            in_flight.spawn(async move {
                worker.handle_delivery(delivery, ct).await;
                drop(permit);
            });
        }

        log::info!(
            "{name} received shutdown signal, draining {} in-flight job(s)",
            in_flight.len()
        );
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "{name} drain timed out, cancelling {} job(s)",
                in_flight.len()
            );
            jobs_token.cancel();
            while in_flight.join_next().await.is_some() {}
        }

        log::info!("{name} has shut down gracefully");
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery, ct: CancellationToken) {
        let name = self.name();
        let request: JobRequestMessage = match serde_json::from_slice(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("{name} received a malformed job request: {e}");
                match extract_job_id(&delivery.body) {
                    Some(job_id) => {
                        let error = JobError::invalid_argument(format!("Malformed job request: {e}"));
                        let response = JobResponseMessage::terminal(job_id, None, Err(error));
                        self.settle(&delivery, &response).await;
                    }
                    None => {
                        // unanswerable, drop it
                        if let Err(e) = self.broker.nack(&self.service.request_queue_name, delivery.tag, false).await {
                            log::error!("{name} failed to reject message {}: {e:#}", delivery.tag);
                        }
                    }
                }
                return;
            }
        };

        let job_id = request.job_id;
        if delivery.redelivered {
            log::info!("{name} received redelivered job {job_id}");
        }
        log::info!(
            "{name} got job {job_id} ({:?}) from queue",
            request.payload.kind()
        );

        let report = if self.publish_progress {
            self.run_with_progress(job_id, request, &ct).await
        } else {
            self.pipeline.execute(job_id, request.payload, None, &ct).await
        };

        let response = JobResponseMessage::terminal(job_id, report.vm_id, report.result);
        match &response.error {
            Some(error) => log::info!(
                "{name} finished job {job_id} with {:?} ({})",
                response.status,
                error.error
            ),
            None => log::info!("{name} finished job {job_id} with {:?}", response.status),
        }
        self.settle(&delivery, &response).await;
    }

    /// Runs the job while forwarding its non-terminal statuses to the
    /// response queue; all of them go out before the terminal one
    async fn run_with_progress(
        &self,
        job_id: JobId,
        request: JobRequestMessage,
        ct: &CancellationToken,
    ) -> JobReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = async move {
            let tx = tx;
            self.pipeline
                .execute(job_id, request.payload, Some(&tx), ct)
                .await
        };
        let forward = async {
            self.publish_status(job_id, JobStatus::Queued).await;
            while let Some(status) = rx.recv().await {
                self.publish_status(job_id, status).await;
            }
        };
        let (report, ()) = tokio::join!(run, forward);
        report
    }

    async fn publish_status(&self, job_id: JobId, status: JobStatus) {
        let message = JobResponseMessage::progress(job_id, status);
        let Ok(body) = serde_json::to_vec(&message) else {
            return;
        };
        if let Err(e) = self
            .broker
            .publish(&self.service.response_queue_name, &body)
            .await
        {
            log::warn!("{} failed to publish {status:?} for job {job_id}: {e:#}", self.name());
        }
    }

    /// Publishes the terminal response, then acks; a delivery whose response
    /// could not be published is requeued
    async fn settle(&self, delivery: &Delivery, response: &JobResponseMessage) {
        let name = self.name();
        let queue = &self.service.request_queue_name;

        if self.publish_with_retry(response).await {
            if let Err(e) = self.broker.ack(queue, delivery.tag).await {
                log::error!("{name} failed to ack job {}: {e:#}", response.job_id);
            }
        } else {
            log::error!(
                "{name} could not publish result of job {}, requeueing it",
                response.job_id
            );
            if let Err(e) = self.broker.nack(queue, delivery.tag, true).await {
                log::error!("{name} failed to nack job {}: {e:#}", response.job_id);
            }
        }
    }

    async fn publish_with_retry(&self, response: &JobResponseMessage) -> bool {
        let body = match serde_json::to_vec(response) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to serialize response of job {}: {e}", response.job_id);
                return false;
            }
        };

        let mut attempt = 0;
        loop {
            match self
                .broker
                .publish(&self.service.response_queue_name, &body)
                .await
            {
                Ok(()) => return true,
                Err(e) if attempt < PUBLISH_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    log::warn!(
                        "Retry {attempt} publishing job {} after {}ms due to: {e:#}",
                        response.job_id,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Publishing job {} failed: {e:#}", response.job_id);
                    return false;
                }
            }
        }
    }
}

/// Best-effort `JobId` of a request that failed to deserialize
fn extract_job_id(body: &[u8]) -> Option<JobId> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("JobId")?.as_str()?.parse().ok()
}

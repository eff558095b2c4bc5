//! Per-envelope stage sequencing
//!
//! The orchestrator is the only code that changes an envelope's status,
//! retry count or destinations. Each envelope runs its stages strictly in
//! order. A transient failure re-enters the stage that failed, so a send
//! retry never re-parses or re-validates.

use super::dead_letter::{DeadLetterKind, DeadLetterRecord, DeadLetterStore, QuarantineNotifier};
use super::intake::{DeliveryOutcome, InboundUnit, Intake, ProcessingOutcome};
use super::parse;
use super::retry::RetryPolicy;
use super::stage::Stage;
use crate::config::{NoMatchPolicy, RouteConfig};
use crate::connectors::{ConnectorRegistry, Delivery, EntryFailure};
use crate::envelope::{Content, MessageEnvelope, MessageStatus, Namespace};
use crate::error::{Error, FailureClass, Result, StageError};
use crate::metrics;
use crate::plugins::{
    PluginRegistry, RouteDecision, Router, StageContext, Transformed, Transformer, Validator,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// A configured route with its plugins resolved.
pub struct RouteHandle {
    name: String,
    validators: Vec<Arc<dyn Validator>>,
    transformers: Vec<Arc<dyn Transformer>>,
    router: Option<Arc<dyn Router>>,
    destinations: Vec<String>,
    schema: Option<String>,
    on_no_match: NoMatchPolicy,
    retry: RetryPolicy,
}

impl RouteHandle {
    pub fn resolve(
        config: &RouteConfig,
        plugins: &PluginRegistry,
        default_retry: &RetryPolicy,
    ) -> Result<Self> {
        let validators = config
            .validators
            .iter()
            .map(|name| plugins.validator(name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let transformers = config
            .transformers
            .iter()
            .map(|name| plugins.transformer(name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let router = config
            .router
            .as_deref()
            .map(|name| plugins.router(name))
            .transpose()?;

        Ok(Self {
            name: config.name.clone(),
            validators,
            transformers,
            router,
            destinations: config.destinations.clone(),
            schema: config.schema.clone(),
            on_no_match: config.on_no_match,
            retry: config.retry.clone().unwrap_or_else(|| default_retry.clone()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            route: &self.name,
            schema: self.schema.as_deref(),
        }
    }
}

/// Where an in-flight envelope stands: its last recorded status and the
/// stage it resumes at.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightEntry {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub route: String,
    pub status: MessageStatus,
    pub stage: Stage,
    pub retry_count: u32,
    pub received_at: DateTime<Utc>,
}

enum Resolution {
    Deliver(Vec<String>),
    Drop(&'static str),
}

enum Disposition {
    Retry,
    Finished(ProcessingOutcome),
}

pub struct Orchestrator {
    routes: HashMap<String, Arc<RouteHandle>>,
    connectors: ConnectorRegistry,
    dead_letters: Arc<dyn DeadLetterStore>,
    notifier: Arc<dyn QuarantineNotifier>,
    in_flight: Mutex<HashMap<Uuid, InFlightEntry>>,
    drain: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        routes: &[RouteConfig],
        default_retry: &RetryPolicy,
        plugins: &PluginRegistry,
        connectors: ConnectorRegistry,
        dead_letters: Arc<dyn DeadLetterStore>,
        notifier: Arc<dyn QuarantineNotifier>,
    ) -> Result<Self> {
        let mut handles = HashMap::new();
        for config in routes {
            if let Some(missing) = config
                .destinations
                .iter()
                .find(|d| !connectors.contains(d))
            {
                return Err(Error::Config(format!(
                    "route '{}' references unknown destination '{}'",
                    config.name, missing
                )));
            }
            let handle = RouteHandle::resolve(config, plugins, default_retry)?;
            handles.insert(config.name.clone(), Arc::new(handle));
        }

        Ok(Self {
            routes: handles,
            connectors,
            dead_letters,
            notifier,
            in_flight: Mutex::new(HashMap::new()),
            drain: CancellationToken::new(),
        })
    }

    pub fn route(&self, name: &str) -> Option<&Arc<RouteHandle>> {
        self.routes.get(name)
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    /// Snapshot of the envelopes currently being processed.
    pub fn in_flight(&self) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> = self.table().values().cloned().collect();
        entries.sort_by_key(|e| e.received_at);
        entries
    }

    /// Run one inbound unit to a terminal outcome and report it to the
    /// listener if it asked for one.
    pub async fn process(&self, mut unit: InboundUnit) -> ProcessingOutcome {
        let reply = unit.reply.take();
        let outcome = self.run_unit(unit).await;
        if let Some(reply) = reply {
            // The listener may have stopped waiting.
            let _ = reply.send(outcome.clone());
        }
        outcome
    }

    /// Pull units off the intake queue onto at most `workers` concurrent
    /// tasks until the queue closes or `shutdown` fires. In-flight envelopes
    /// then get `drain_timeout` to finish before they are abandoned in their
    /// last recorded status.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InboundUnit>,
        workers: usize,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        tracing::info!(workers, "Dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Pipeline task failed");
                    }
                }
                unit = rx.recv() => {
                    let Some(unit) = unit else { break };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let orchestrator = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        orchestrator.process(unit).await;
                    });
                }
            }
        }

        rx.close();
        let mut refused = 0usize;
        while rx.try_recv().is_ok() {
            refused += 1;
        }
        if refused > 0 {
            tracing::warn!(refused, "Discarded queued messages that never started processing");
        }

        // Pending retries stop waiting from here on.
        self.drain.cancel();
        tracing::info!(
            in_flight = tasks.len(),
            timeout_secs = drain_timeout.as_secs(),
            "Draining pipeline"
        );

        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Pipeline task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            for entry in self.in_flight() {
                tracing::warn!(
                    message_id = %entry.message_id,
                    correlation_id = %entry.correlation_id,
                    route = %entry.route,
                    status = %entry.status,
                    stage = %entry.stage,
                    "Abandoning in-flight envelope"
                );
            }
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Remove a dead-letter or quarantine record and run its raw content
    /// again under the original route and correlation id. The replay is a
    /// new envelope starting at `RECEIVED`.
    pub async fn replay(&self, record_id: Uuid, intake: &Intake) -> Result<ProcessingOutcome> {
        let record = self
            .dead_letters
            .take(record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead-letter record {}", record_id)))?;

        let envelope = &record.envelope;
        let content_type = envelope
            .metadata()
            .get_in(Namespace::Parser, "content_type")
            .map(str::to_string);
        let (unit, reply) = InboundUnit::new(
            record.route.clone(),
            envelope.header().source(),
            Bytes::clone(envelope.body().raw_content()),
        )
        .content_type(content_type)
        .correlation_id(Some(envelope.correlation_id()))
        .annotate("replay_of", record_id.to_string())
        .with_reply();

        if let Err(e) = intake.submit(unit).await {
            self.dead_letters.store(record).await?;
            return Err(e.into());
        }
        tracing::info!(record_id = %record_id, route = %record.route, "Replaying dead-letter record");

        reply
            .await
            .map_err(|_| Error::Internal("replay was abandoned before completion".to_string()))
    }

    async fn run_unit(&self, unit: InboundUnit) -> ProcessingOutcome {
        let started = Instant::now();
        let InboundUnit {
            route,
            source,
            payload,
            content_type,
            correlation_id,
            annotations,
            ..
        } = unit;

        let mut envelope = MessageEnvelope::receive(payload, source, content_type, correlation_id);
        envelope
            .metadata_mut()
            .extend_namespaced(Namespace::Listener, annotations.iter());
        let message_id = envelope.message_id();

        let span = tracing::info_span!(
            "envelope",
            message_id = %message_id,
            correlation_id = %envelope.correlation_id(),
            route = %route,
        );

        let outcome = match self.routes.get(&route).cloned() {
            Some(handle) => self.drive(&handle, envelope).instrument(span).await,
            None => {
                async {
                    self.track(&envelope, &route, Stage::Parse);
                    self.set_status(&mut envelope, MessageStatus::ParseFailed);
                    let error = StageError::permanent(format!("no route named '{}'", route));
                    self.dead_letter(&route, &mut envelope, Stage::Parse, &error)
                        .await
                }
                .instrument(span)
                .await
            }
        };

        self.untrack(message_id);
        let status_label = if outcome.abandoned {
            "ABANDONED"
        } else {
            outcome.status.as_str()
        };
        metrics::MESSAGES_COMPLETED
            .with_label_values(&[&route, status_label])
            .inc();
        metrics::PROCESSING_DURATION_SECONDS
            .with_label_values(&[&route])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn drive(&self, route: &RouteHandle, mut envelope: MessageEnvelope) -> ProcessingOutcome {
        let mut stage = Stage::Parse;

        let resolution = loop {
            self.track(&envelope, route.name(), stage);
            let result = match stage {
                Stage::Parse => self.parse_stage(&mut envelope).map(|()| None),
                Stage::Validate => self.validate_stage(route, &mut envelope).await.map(|()| None),
                Stage::Transform => self
                    .transform_stage(route, &mut envelope)
                    .await
                    .map(|()| None),
                Stage::Route | Stage::Send => self.route_stage(route, &envelope).await.map(Some),
            };

            match result {
                Ok(Some(resolution)) => break resolution,
                Ok(None) => {
                    self.set_status(&mut envelope, stage.success_status());
                    if let Some(next) = stage.next() {
                        stage = next;
                    }
                }
                Err(error) => match self.handle_failure(route, &mut envelope, stage, error).await {
                    Disposition::Retry => {}
                    Disposition::Finished(outcome) => return outcome,
                },
            }
        };

        match resolution {
            Resolution::Drop(reason) => {
                self.set_status(&mut envelope, MessageStatus::Routed);
                envelope
                    .metadata_mut()
                    .insert(Namespace::Pipeline, "dropped", "true");
                self.set_status(&mut envelope, MessageStatus::Acknowledged);
                tracing::info!(reason, "Message dropped without delivery");
                ProcessingOutcome::from_envelope(&envelope, Some(reason.to_string()))
            }
            Resolution::Deliver(destinations) if destinations.len() == 1 => {
                envelope.set_destinations(destinations);
                self.set_status(&mut envelope, MessageStatus::Routed);
                self.deliver(route, envelope).await
            }
            Resolution::Deliver(destinations) => {
                envelope.set_destinations(destinations.clone());
                self.set_status(&mut envelope, MessageStatus::Routed);
                self.fan_out(route, envelope, destinations).await
            }
        }
    }

    fn parse_stage(&self, envelope: &mut MessageEnvelope) -> std::result::Result<(), StageError> {
        let declared = Some(envelope.body().content_type()).filter(|ct| !ct.is_empty());
        let parsed = parse::parse(envelope.body().raw_content(), declared)?;

        let metadata = envelope.metadata_mut();
        metadata.insert(Namespace::Parser, "content_type", parsed.content_type.clone());
        if let Some(message_type) = &parsed.message_type {
            metadata.insert(Namespace::Parser, "message_type", message_type.clone());
        }
        envelope.set_message_type(parsed.message_type);
        envelope.set_content(parsed.content_type, parsed.content);
        Ok(())
    }

    async fn validate_stage(
        &self,
        route: &RouteHandle,
        envelope: &mut MessageEnvelope,
    ) -> std::result::Result<(), StageError> {
        let ctx = route.context();
        for validator in &route.validators {
            let annotations = validator
                .validate(envelope, &ctx)
                .await
                .map_err(|e| attributed(validator.name(), e))?;
            if let Some(schema_id) = annotations.get("schema_id") {
                envelope.set_schema_id(schema_id.clone());
            }
            envelope
                .metadata_mut()
                .extend_namespaced(Namespace::Validator, annotations.iter());
        }
        Ok(())
    }

    async fn transform_stage(
        &self,
        route: &RouteHandle,
        envelope: &mut MessageEnvelope,
    ) -> std::result::Result<(), StageError> {
        let ctx = route.context();
        for transformer in &route.transformers {
            let Transformed {
                content,
                schema_id,
                attachments,
                annotations,
            } = transformer
                .transform(envelope, &ctx)
                .await
                .map_err(|e| attributed(transformer.name(), e))?;

            if let Some((content_type, content)) = content {
                envelope.set_content(content_type, content);
            }
            if let Some(schema_id) = schema_id {
                envelope.set_schema_id(schema_id);
            }
            for attachment in attachments {
                envelope.push_attachment(attachment);
            }
            envelope
                .metadata_mut()
                .extend_namespaced(Namespace::Transformer, annotations.iter());
        }
        Ok(())
    }

    async fn route_stage(
        &self,
        route: &RouteHandle,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<Resolution, StageError> {
        let decision = match &route.router {
            Some(router) => router
                .route(envelope, &route.context())
                .await
                .map_err(|e| attributed(router.name(), e))?,
            None => RouteDecision::Destinations(route.destinations.clone()),
        };

        let destinations = match decision {
            RouteDecision::Drop => return Ok(Resolution::Drop("filtered by router")),
            RouteDecision::Destinations(d) if !d.is_empty() => d,
            RouteDecision::Destinations(_) | RouteDecision::NoMatch => {
                return match route.on_no_match {
                    NoMatchPolicy::Drop => Ok(Resolution::Drop("no routing rule matched")),
                    NoMatchPolicy::Error => Err(StageError::permanent("no routing rule matched")
                        .with_rules(["route.matched"])),
                };
            }
        };

        let mut unique: Vec<String> = Vec::with_capacity(destinations.len());
        for destination in destinations {
            if !unique.contains(&destination) {
                unique.push(destination);
            }
        }
        if let Some(unknown) = unique.iter().find(|d| !self.connectors.contains(d)) {
            return Err(
                StageError::permanent(format!("unknown destination '{}'", unknown))
                    .with_rules(["destination.exists"]),
            );
        }
        Ok(Resolution::Deliver(unique))
    }

    /// Send loop for an envelope in `ROUTED` with exactly one destination.
    async fn deliver(&self, route: &RouteHandle, mut envelope: MessageEnvelope) -> ProcessingOutcome {
        let destination = envelope
            .header()
            .destination()
            .first()
            .cloned()
            .unwrap_or_default();

        loop {
            self.track(&envelope, route.name(), Stage::Send);
            match self.send_stage(route, &mut envelope, &destination).await {
                Ok(()) => {
                    self.set_status(&mut envelope, MessageStatus::Acknowledged);
                    tracing::info!(destination = %destination, retry_count = envelope.retry_count(), "Message acknowledged");
                    return ProcessingOutcome::from_envelope(&envelope, None);
                }
                Err(error) => match self
                    .handle_failure(route, &mut envelope, Stage::Send, error)
                    .await
                {
                    Disposition::Retry => {}
                    Disposition::Finished(outcome) => return outcome,
                },
            }
        }
    }

    async fn send_stage(
        &self,
        route: &RouteHandle,
        envelope: &mut MessageEnvelope,
        destination: &str,
    ) -> std::result::Result<(), StageError> {
        let started = Instant::now();
        let delivery = self.connectors.send(envelope, destination).await;
        metrics::SEND_DURATION_SECONDS
            .with_label_values(&[destination])
            .observe(started.elapsed().as_secs_f64());

        match delivery {
            Err(err) => {
                tracing::debug!(destination, error = %err, "Delivery attempt failed");
                Err(err.into())
            }
            Ok(Delivery::Ack { detail }) => {
                self.set_status(envelope, MessageStatus::Sent);
                if let Some(detail) = detail {
                    envelope
                        .metadata_mut()
                        .insert(Namespace::Connector, "detail", detail);
                }
                Ok(())
            }
            Ok(Delivery::Nak { reason, class }) => {
                self.set_status(envelope, MessageStatus::Sent);
                envelope
                    .metadata_mut()
                    .insert(Namespace::Connector, "nak", reason.clone());
                Err(StageError::new(
                    class,
                    format!("'{}' rejected the message: {}", destination, reason),
                ))
            }
            Ok(Delivery::Partial { accepted, failures }) => {
                self.set_status(envelope, MessageStatus::Sent);
                let metadata = envelope.metadata_mut();
                metadata.insert(Namespace::Connector, "accepted_entries", accepted.to_string());
                metadata.insert(Namespace::Connector, "failed_entries", failures.len().to_string());
                tracing::warn!(
                    destination,
                    accepted,
                    failed = failures.len(),
                    "Batch partially accepted"
                );
                for failure in failures {
                    self.dead_letter_entry(route, envelope, destination, failure)
                        .await;
                }
                Ok(())
            }
        }
    }

    /// Dead-letter one rejected batch entry as its own child envelope.
    async fn dead_letter_entry(
        &self,
        route: &RouteHandle,
        parent: &MessageEnvelope,
        destination: &str,
        failure: EntryFailure,
    ) {
        let content_type = parent.body().content_type().to_string();
        let mut child =
            parent.split_with_content(destination, &content_type, Content::Json(failure.entry));
        let metadata = child.metadata_mut();
        metadata.insert(Namespace::Connector, "entry_index", failure.index.to_string());
        metadata.insert(Namespace::Connector, "entry_status", failure.status.clone());

        self.set_status(&mut child, MessageStatus::SendFailed);
        let error = StageError::permanent(format!(
            "batch entry {} rejected with status {}: {}",
            failure.index, failure.status, failure.reason
        ));
        self.dead_letter(route.name(), &mut child, Stage::Send, &error)
            .await;
    }

    /// Deliver one child per destination concurrently. The parent stays
    /// `ROUTED`; the reported outcome is acknowledged only if every child
    /// was.
    async fn fan_out(
        &self,
        route: &RouteHandle,
        mut parent: MessageEnvelope,
        destinations: Vec<String>,
    ) -> ProcessingOutcome {
        let children: Vec<MessageEnvelope> = destinations
            .iter()
            .map(|destination| parent.split_for(destination))
            .collect();
        parent
            .metadata_mut()
            .insert(Namespace::Pipeline, "split_into", children.len().to_string());
        tracing::info!(children = children.len(), "Envelope split across destinations");

        let results = futures::future::join_all(children.into_iter().map(|child| async move {
            let child_id = child.message_id();
            let destination = child
                .header()
                .destination()
                .first()
                .cloned()
                .unwrap_or_default();
            let outcome = self.deliver(route, child).await;
            self.untrack(child_id);
            (destination, outcome)
        }))
        .await;

        let mut outcome = ProcessingOutcome::from_envelope(&parent, None);
        let mut failed = 0usize;
        for (destination, child) in results {
            if !child.is_acknowledged() {
                failed += 1;
            }
            outcome.abandoned |= child.abandoned;
            outcome.retry_count = outcome.retry_count.max(child.retry_count);
            outcome.deliveries.push(DeliveryOutcome {
                message_id: child.message_id,
                destination,
                status: child.status,
                retry_count: child.retry_count,
                reason: child.reason,
            });
        }

        outcome.status = if failed == 0 {
            MessageStatus::Acknowledged
        } else {
            MessageStatus::DeadLetter
        };
        if failed > 0 {
            outcome.reason = Some(format!(
                "{} of {} deliveries failed",
                failed,
                outcome.deliveries.len()
            ));
        }
        outcome
    }

    async fn handle_failure(
        &self,
        route: &RouteHandle,
        envelope: &mut MessageEnvelope,
        stage: Stage,
        mut error: StageError,
    ) -> Disposition {
        // Only raw input can be poison; later stages work on parsed content.
        if error.class == FailureClass::Poison && stage != Stage::Parse {
            error.class = FailureClass::Permanent;
        }
        metrics::STAGE_FAILURES
            .with_label_values(&[stage.as_str(), &error.class.to_string()])
            .inc();

        match error.class {
            FailureClass::Poison => {
                Disposition::Finished(self.quarantine(route.name(), envelope, stage, &error).await)
            }
            FailureClass::Permanent => {
                self.set_status(envelope, stage.failure_status());
                Disposition::Finished(self.dead_letter(route.name(), envelope, stage, &error).await)
            }
            FailureClass::Transient => {
                self.set_status(envelope, stage.failure_status());
                let attempt = envelope.increment_retry();
                if route.retry.is_exhausted(attempt) {
                    let error = StageError {
                        message: format!(
                            "retries exhausted after {} attempts: {}",
                            attempt, error.message
                        ),
                        ..error
                    };
                    return Disposition::Finished(
                        self.dead_letter(route.name(), envelope, stage, &error).await,
                    );
                }

                let delay = route.retry.backoff(attempt);
                metrics::RETRIES_TOTAL
                    .with_label_values(&[stage.as_str()])
                    .inc();
                self.track(envelope, route.name(), stage);
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.message,
                    "Transient failure, retrying"
                );

                tokio::select! {
                    _ = self.drain.cancelled() => {
                        tracing::warn!(status = %envelope.status(), "Retry abandoned by shutdown");
                        return Disposition::Finished(ProcessingOutcome::abandoned(envelope));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                self.set_status(envelope, stage.entry_status());
                Disposition::Retry
            }
        }
    }

    async fn dead_letter(
        &self,
        route: &str,
        envelope: &mut MessageEnvelope,
        stage: Stage,
        error: &StageError,
    ) -> ProcessingOutcome {
        self.set_status(envelope, MessageStatus::DeadLetter);
        let record = DeadLetterRecord::new(DeadLetterKind::DeadLetter, route, envelope, stage, error);
        if let Err(e) = self.dead_letters.store(record).await {
            tracing::error!(error = %e, "Failed to persist dead-letter record");
        }
        tracing::warn!(
            message_id = %envelope.message_id(),
            stage = %stage,
            class = %error.class,
            retry_count = envelope.retry_count(),
            reason = %error.describe(),
            "Message dead-lettered"
        );
        ProcessingOutcome::from_envelope(envelope, Some(error.describe()))
    }

    async fn quarantine(
        &self,
        route: &str,
        envelope: &mut MessageEnvelope,
        stage: Stage,
        error: &StageError,
    ) -> ProcessingOutcome {
        self.set_status(envelope, MessageStatus::Quarantined);
        let record = DeadLetterRecord::new(DeadLetterKind::Quarantine, route, envelope, stage, error);
        if let Err(e) = self.dead_letters.store(record.clone()).await {
            tracing::error!(error = %e, "Failed to persist quarantine record");
        }
        self.notifier.notify(&record).await;
        ProcessingOutcome::from_envelope(envelope, Some(error.describe()))
    }

    fn set_status(&self, envelope: &mut MessageEnvelope, to: MessageStatus) {
        let from = envelope.status();
        match envelope.transition(to) {
            Ok(()) => {
                tracing::debug!(
                    message_id = %envelope.message_id(),
                    correlation_id = %envelope.correlation_id(),
                    from = %from,
                    to = %to,
                    "Status changed"
                );
                if let Some(entry) = self.table().get_mut(&envelope.message_id()) {
                    entry.status = to;
                    entry.retry_count = envelope.retry_count();
                }
            }
            Err(e) => {
                tracing::error!(message_id = %envelope.message_id(), error = %e, "Refusing illegal status change");
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, InFlightEntry>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, envelope: &MessageEnvelope, route: &str, stage: Stage) {
        let mut table = self.table();
        table.insert(
            envelope.message_id(),
            InFlightEntry {
                message_id: envelope.message_id(),
                correlation_id: envelope.correlation_id(),
                route: route.to_string(),
                status: envelope.status(),
                stage,
                retry_count: envelope.retry_count(),
                received_at: envelope.header().timestamp(),
            },
        );
        metrics::IN_FLIGHT.set(table.len() as i64);
    }

    fn untrack(&self, message_id: Uuid) {
        let mut table = self.table();
        table.remove(&message_id);
        metrics::IN_FLIGHT.set(table.len() as i64);
    }
}

fn attributed(plugin: &str, error: StageError) -> StageError {
    StageError {
        message: format!("{}: {}", plugin, error.message),
        ..error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpSourceConfig, SourceConfig};
    use crate::connectors::{Connector, ConnectorError};
    use crate::pipeline::dead_letter::InMemoryDeadLetterStore;
    use crate::plugins::{Plugin, PluginRegistryBuilder, PluginSettings};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ADT: &str = "MSH|^~\\&|SEND|FAC|RECV|FAC|20240101120000||ADT^A01^ADT_A01|MSG0001|P|2.5\rPID|1||12345^^^HOSP^MR||DOE^JOHN||19800101|M\r";

    #[derive(Default)]
    struct Scripted {
        destination: String,
        script: Mutex<VecDeque<std::result::Result<Delivery, ConnectorError>>>,
        sent: Mutex<Vec<Uuid>>,
    }

    impl Scripted {
        fn new(destination: &str) -> Arc<Self> {
            Arc::new(Self {
                destination: destination.to_string(),
                ..Self::default()
            })
        }

        fn then(self: &Arc<Self>, result: std::result::Result<Delivery, ConnectorError>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn sent(&self) -> Vec<Uuid> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        fn destination(&self) -> &str {
            &self.destination
        }

        async fn send(
            &self,
            envelope: &MessageEnvelope,
        ) -> std::result::Result<Delivery, ConnectorError> {
            self.sent.lock().unwrap().push(envelope.message_id());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Delivery::Ack { detail: None }))
        }
    }

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl Plugin for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[async_trait]
    impl Router for Fixed {
        async fn route(
            &self,
            _envelope: &MessageEnvelope,
            _ctx: &StageContext<'_>,
        ) -> std::result::Result<RouteDecision, StageError> {
            Ok(RouteDecision::Destinations(
                self.0.iter().map(|d| d.to_string()).collect(),
            ))
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl QuarantineNotifier for CountingNotifier {
        async fn notify(&self, _record: &DeadLetterRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn route(name: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            source: SourceConfig::Http(HttpSourceConfig {
                path: format!("/{}", name),
                sync_wait_ms: 1000,
            }),
            validators: Vec::new(),
            transformers: Vec::new(),
            router: None,
            destinations: vec!["D1".to_string()],
            schema: None,
            on_no_match: NoMatchPolicy::Error,
            retry: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 5,
            jitter_ratio: 0.0,
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<InMemoryDeadLetterStore>,
        notifier: Arc<CountingNotifier>,
    }

    async fn harness(
        routes: &[RouteConfig],
        plugins: PluginRegistryBuilder,
        connectors: &[Arc<Scripted>],
    ) -> Harness {
        let registry = plugins.initialize().await.unwrap();
        let mut connector_registry = ConnectorRegistry::new();
        for connector in connectors {
            connector_registry.insert(connector.clone());
        }
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let orchestrator = Orchestrator::new(
            routes,
            &fast_retry(),
            &registry,
            connector_registry,
            store.clone(),
            notifier.clone(),
        )
        .unwrap();
        Harness {
            orchestrator,
            store,
            notifier,
        }
    }

    fn unit(route: &str, payload: &'static [u8]) -> InboundUnit {
        InboundUnit::new(route, "test-listener", Bytes::from_static(payload))
    }

    fn assert_legal_path(envelope: &MessageEnvelope) {
        let mut status = MessageStatus::Received;
        for transition in envelope.transitions() {
            assert_eq!(transition.from, status);
            assert!(
                transition.from.can_transition_to(transition.to),
                "illegal {} -> {}",
                transition.from,
                transition.to
            );
            status = transition.to;
        }
        assert_eq!(status, envelope.status());
    }

    #[tokio::test]
    async fn test_happy_path_acknowledges() {
        let d1 = Scripted::new("D1");
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[d1.clone()]).await;

        let (unit, reply) = unit("adt", ADT.as_bytes()).with_reply();
        let outcome = h.orchestrator.process(unit).await;

        assert!(outcome.is_acknowledged());
        assert_eq!(outcome.message_type.as_deref(), Some("ADT_A01"));
        assert_eq!(reply.await.unwrap().message_id, outcome.message_id);
        assert_eq!(d1.sent(), vec![outcome.message_id]);
        assert!(h.orchestrator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhaust_into_dead_letter() {
        let d1 = Scripted::new("D1");
        for _ in 0..3 {
            d1.then(Err(ConnectorError::Timeout {
                operation: "acknowledgement",
                elapsed: Duration::from_millis(10),
            }));
        }
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[d1.clone()]).await;

        let outcome = h.orchestrator.process(unit("adt", ADT.as_bytes())).await;

        assert!(outcome.is_dead_letter());
        assert_eq!(outcome.retry_count, 3);
        assert_eq!(d1.sent().len(), 3);

        let record = h.store.get(outcome.message_id).await.unwrap().unwrap();
        assert_eq!(record.failure_class, FailureClass::Transient);
        assert_eq!(record.failed_stage, Stage::Send);
        assert_eq!(record.envelope.body().raw_content().as_ref(), ADT.as_bytes());
        assert_eq!(record.envelope.retry_count(), 3);
        assert_legal_path(&record.envelope);
    }

    #[tokio::test]
    async fn test_nak_after_write_is_retried() {
        let d1 = Scripted::new("D1");
        d1.then(Ok(Delivery::Nak {
            reason: "AE: busy".into(),
            class: FailureClass::Transient,
        }));
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[d1.clone()]).await;

        let outcome = h.orchestrator.process(unit("adt", ADT.as_bytes())).await;
        assert!(outcome.is_acknowledged());
        assert_eq!(outcome.retry_count, 1);
        assert_eq!(d1.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_poison_is_quarantined_without_retry() {
        let d1 = Scripted::new("D1");
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[d1.clone()]).await;

        let outcome = h
            .orchestrator
            .process(unit("adt", b"\x00\x01 not a message"))
            .await;

        assert!(outcome.is_quarantined());
        assert_eq!(outcome.retry_count, 0);
        assert!(d1.sent().is_empty());
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 1);

        let records = h.store.list(Some(DeadLetterKind::Quarantine)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_class, FailureClass::Poison);
        assert_legal_path(&records[0].envelope);
    }

    #[tokio::test]
    async fn test_split_gives_children_fresh_ids_and_shared_correlation() {
        let (d1, d2, d3) = (Scripted::new("D1"), Scripted::new("D2"), Scripted::new("D3"));
        let mut config = route("fanout");
        config.router = Some("fixed".into());
        config.destinations.clear();
        let plugins = PluginRegistryBuilder::new()
            .router(Fixed(vec!["D1", "D2", "D3", "D2"]), PluginSettings::new())
            .unwrap();
        let h = harness(&[config], plugins, &[d1.clone(), d2.clone(), d3.clone()]).await;

        let correlation = Uuid::new_v4();
        let outcome = h
            .orchestrator
            .process(unit("fanout", ADT.as_bytes()).correlation_id(Some(correlation)))
            .await;

        assert!(outcome.is_acknowledged());
        assert_eq!(outcome.correlation_id, correlation);
        assert_eq!(outcome.deliveries.len(), 3);

        let mut ids: Vec<Uuid> = outcome.deliveries.iter().map(|d| d.message_id).collect();
        ids.push(outcome.message_id);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(d2.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_split_failure_is_isolated_per_destination() {
        let (d1, d2) = (Scripted::new("D1"), Scripted::new("D2"));
        d2.then(Ok(Delivery::Nak {
            reason: "rejected".into(),
            class: FailureClass::Permanent,
        }));
        let mut config = route("fanout");
        config.router = Some("fixed".into());
        let plugins = PluginRegistryBuilder::new()
            .router(Fixed(vec!["D1", "D2"]), PluginSettings::new())
            .unwrap();
        let h = harness(&[config], plugins, &[d1.clone(), d2.clone()]).await;

        let outcome = h.orchestrator.process(unit("fanout", ADT.as_bytes())).await;

        assert_eq!(outcome.status, MessageStatus::DeadLetter);
        let by_destination: HashMap<_, _> = outcome
            .deliveries
            .iter()
            .map(|d| (d.destination.as_str(), d.status))
            .collect();
        assert_eq!(by_destination["D1"], MessageStatus::Acknowledged);
        assert_eq!(by_destination["D2"], MessageStatus::DeadLetter);

        let records = h.store.list(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].envelope.header().destination(), ["D2".to_string()]);
    }

    #[tokio::test]
    async fn test_no_match_policies() {
        let d1 = Scripted::new("D1");
        let mut unroutable = route("strict");
        unroutable.destinations.clear();
        let mut dropping = route("lenient");
        dropping.destinations.clear();
        dropping.on_no_match = NoMatchPolicy::Drop;
        let h = harness(
            &[unroutable, dropping],
            PluginRegistryBuilder::new(),
            &[d1.clone()],
        )
        .await;

        let strict = h.orchestrator.process(unit("strict", ADT.as_bytes())).await;
        assert!(strict.is_dead_letter());
        let record = h.store.get(strict.message_id).await.unwrap().unwrap();
        assert_eq!(record.failed_stage, Stage::Route);
        assert_eq!(record.rules, vec!["route.matched".to_string()]);

        let lenient = h.orchestrator.process(unit("lenient", ADT.as_bytes())).await;
        assert!(lenient.is_acknowledged());
        assert!(d1.sent().is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_dead_letters_failed_entries() {
        let d1 = Scripted::new("D1");
        d1.then(Ok(Delivery::Partial {
            accepted: 1,
            failures: vec![EntryFailure {
                index: 1,
                status: "422".into(),
                reason: "subject required".into(),
                entry: json!({"resource": {"resourceType": "Observation"}}),
            }],
        }));
        let h = harness(&[route("fhir")], PluginRegistryBuilder::new(), &[d1.clone()]).await;

        let bundle = br#"{"resourceType":"Bundle","type":"batch","entry":[{},{}]}"#;
        let outcome = h.orchestrator.process(unit("fhir", bundle)).await;
        assert!(outcome.is_acknowledged());

        let records = h.store.list(Some(DeadLetterKind::DeadLetter)).await.unwrap();
        assert_eq!(records.len(), 1);
        let child = &records[0].envelope;
        assert_ne!(child.message_id(), outcome.message_id);
        assert_eq!(child.correlation_id(), outcome.correlation_id);
        assert_eq!(
            child.body().content().as_json().unwrap()["resource"]["resourceType"],
            "Observation"
        );
        assert_legal_path(child);
    }

    #[tokio::test]
    async fn test_unknown_route_is_dead_lettered() {
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[Scripted::new("D1")]).await;
        let outcome = h.orchestrator.process(unit("missing", ADT.as_bytes())).await;
        assert!(outcome.is_dead_letter());
        assert!(outcome.reason.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_replay_resubmits_raw_content() {
        let d1 = Scripted::new("D1");
        d1.then(Ok(Delivery::Nak {
            reason: "rejected".into(),
            class: FailureClass::Permanent,
        }));
        let h = harness(&[route("adt")], PluginRegistryBuilder::new(), &[d1.clone()]).await;
        let orchestrator = Arc::new(h.orchestrator);

        let failed = orchestrator.process(unit("adt", ADT.as_bytes())).await;
        assert!(failed.is_dead_letter());

        let (intake, rx) = Intake::channel(4, Duration::from_millis(100));
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(orchestrator.clone().run(
            rx,
            2,
            shutdown.clone(),
            Duration::from_secs(1),
        ));

        let replayed = orchestrator.replay(failed.message_id, &intake).await.unwrap();
        assert!(replayed.is_acknowledged());
        assert_ne!(replayed.message_id, failed.message_id);
        assert_eq!(replayed.correlation_id, failed.correlation_id);
        assert!(h.store.get(failed.message_id).await.unwrap().is_none());

        shutdown.cancel();
        dispatcher.await.unwrap();
    }

    struct Stalled;

    #[async_trait]
    impl Connector for Stalled {
        fn destination(&self) -> &str {
            "D1"
        }

        async fn send(
            &self,
            _envelope: &MessageEnvelope,
        ) -> std::result::Result<Delivery, ConnectorError> {
            std::future::pending().await
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_drain_abandons_envelope_waiting_to_retry() {
        let d1 = Scripted::new("D1");
        d1.then(Err(ConnectorError::Timeout {
            operation: "acknowledgement",
            elapsed: Duration::from_millis(10),
        }));
        let mut slow = route("adt");
        slow.retry = Some(RetryPolicy {
            max_retries: 3,
            base_delay_ms: 60_000,
            multiplier: 1.0,
            max_delay_ms: 60_000,
            jitter_ratio: 0.0,
        });
        let h = harness(&[slow], PluginRegistryBuilder::new(), &[d1.clone()]).await;
        let orchestrator = Arc::new(h.orchestrator);

        let (intake, rx) = Intake::channel(4, Duration::from_millis(100));
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(orchestrator.clone().run(
            rx,
            2,
            shutdown.clone(),
            Duration::from_secs(5),
        ));

        let (unit, reply) = unit("adt", ADT.as_bytes()).with_reply();
        intake.submit(unit).await.unwrap();
        wait_for(|| orchestrator.in_flight().first().is_some_and(|e| e.retry_count == 1)).await;
        let waiting = orchestrator.in_flight();
        assert_eq!(waiting[0].status, MessageStatus::SendFailed);
        assert_eq!(waiting[0].stage, Stage::Send);

        shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.abandoned);
        assert_eq!(outcome.status, MessageStatus::SendFailed);
        assert_eq!(outcome.retry_count, 1);
        assert!(!outcome.is_dead_letter());

        // Well inside the drain deadline: the backoff did not hold it up.
        tokio::time::timeout(Duration::from_secs(2), dispatcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d1.sent().len(), 1);
        assert!(h.store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_deadline_aborts_stuck_sends() {
        let registry = PluginRegistryBuilder::new().initialize().await.unwrap();
        let mut connectors = ConnectorRegistry::new();
        connectors.insert(Arc::new(Stalled));
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let orchestrator = Arc::new(
            Orchestrator::new(
                &[route("adt")],
                &fast_retry(),
                &registry,
                connectors,
                store.clone(),
                Arc::new(CountingNotifier::default()),
            )
            .unwrap(),
        );

        let (intake, rx) = Intake::channel(4, Duration::from_millis(100));
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(orchestrator.clone().run(
            rx,
            2,
            shutdown.clone(),
            Duration::from_millis(100),
        ));

        let (unit, reply) = unit("adt", ADT.as_bytes()).with_reply();
        intake.submit(unit).await.unwrap();
        wait_for(|| orchestrator.in_flight().first().is_some_and(|e| e.stage == Stage::Send)).await;

        let started = Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), dispatcher)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));

        // The task was aborted, so no outcome was ever sent.
        assert!(reply.await.is_err());
        assert!(store.list(None).await.unwrap().is_empty());
    }
}

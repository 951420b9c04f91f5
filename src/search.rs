//! The search state machine: draw candidates, filter them by serving
//! location, measure the survivors and stop once enough qualify.

use crate::config::SearchParams;
use crate::error::{Result, ScoutError};
use crate::sampler::AddressSampler;
use crate::traits::{EndpointProbe, PersistSummary, ResultSink};
use crate::types::{CandidateEndpoint, EndpointStatus, ProbeResult, SpeedSample, ThroughputReport};
use futures::stream::{self, StreamExt};
use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Progress published by the worker for whoever renders it.
#[derive(Debug, Clone)]
pub enum SearchEvent {
    Status {
        address: IpAddr,
        status: EndpointStatus,
        result: ProbeResult,
    },
    Speed {
        address: IpAddr,
        sample: SpeedSample,
    },
    Progress {
        completed: usize,
        total: usize,
        qualified: usize,
    },
    Finished {
        reason: StopReason,
    },
}

pub type EventSender = mpsc::UnboundedSender<SearchEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SearchEvent>;
pub type SharedResults = Arc<Mutex<Vec<CandidateEndpoint>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Enough endpoints qualified
    Satisfied,
    Cancelled,
    /// Too many batches in a row produced no new address
    Exhausted,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub reason: StopReason,
    pub qualified: Vec<CandidateEndpoint>,
    /// Only set when the run was satisfied
    pub persisted: Option<PersistSummary>,
}

pub struct SearchController<P, S> {
    params: SearchParams,
    subnets: Vec<IpNet>,
    sampler: AddressSampler,
    rng: StdRng,
    probe: P,
    sink: S,
    results: SharedResults,
    events: EventSender,
    receiver: Option<EventReceiver>,
    cancel: CancellationToken,
}

impl<P: EndpointProbe, S: ResultSink> SearchController<P, S> {
    pub fn new(params: SearchParams, subnets: Vec<IpNet>, probe: P, sink: S) -> Result<Self> {
        let family = params.address_family;
        let subnets: Vec<IpNet> = subnets
            .into_iter()
            .filter(|net| family.matches(&net.network()))
            .collect();
        if subnets.is_empty() {
            return Err(ScoutError::NoSubnets { family });
        }
        let (events, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            params,
            subnets,
            sampler: AddressSampler::new(),
            rng: StdRng::from_entropy(),
            probe,
            sink,
            results: Arc::new(Mutex::new(Vec::new())),
            events,
            receiver: Some(receiver),
            cancel: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    fn with_seed(mut self, seed: u64) -> Self {
        self.sampler = AddressSampler::with_seed(seed);
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Receiver for progress events. Can only be taken once.
    pub fn events(&mut self) -> Option<EventReceiver> {
        self.receiver.take()
    }

    pub fn results(&self) -> SharedResults {
        self.results.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until satisfied, cancelled or out of fresh addresses.
    pub async fn run(mut self) -> Result<SearchOutcome> {
        // Nobody took the receiver: do not let events pile up
        self.receiver = None;
        tracing::info!(
            subnets = self.subnets.len(),
            family = %self.params.address_family,
            location = %self.params.target_location,
            min_mbps = self.params.min_bandwidth_mbps,
            desired = self.params.desired_count,
            "Search started"
        );

        let mut idle_batches = 0;
        let reason = loop {
            if let Some(reason) = self.should_stop().await {
                break reason;
            }

            let batch = self.draw_batch();
            if batch.is_empty() {
                idle_batches += 1;
                if idle_batches >= self.params.max_idle_batches {
                    tracing::warn!(idle_batches, "No fresh addresses left in the subnet list");
                    break StopReason::Exhausted;
                }
                tokio::task::yield_now().await;
                continue;
            }
            idle_batches = 0;

            let passed = self.check_locations(batch).await?;
            if let Some(reason) = self.test_throughput(passed).await? {
                break reason;
            }
        };

        self.finish(reason).await
    }

    /// The single stop predicate. Quota wins over cancellation so a satisfied
    /// run still gets persisted.
    async fn should_stop(&self) -> Option<StopReason> {
        if self.qualified().await.len() >= self.params.desired_count {
            return Some(StopReason::Satisfied);
        }
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        None
    }

    /// Completed candidates meeting the bandwidth floor, recomputed on demand.
    async fn qualified(&self) -> Vec<CandidateEndpoint> {
        let results = self.results.lock().await;
        results
            .iter()
            .filter(|c| c.is_qualified(self.params.min_bandwidth_mbps))
            .cloned()
            .collect()
    }

    /// 随机选择子网并生成候选 IP
    fn draw_batch(&mut self) -> Vec<IpAddr> {
        let mut batch = Vec::with_capacity(self.params.batch_size);
        let mut tried = HashSet::new();
        let attempts = self.params.subnet_draws.min(self.subnets.len());

        for _ in 0..attempts {
            let Some(subnet) = self.subnets.choose(&mut self.rng).copied() else {
                break;
            };
            if !tried.insert(subnet) {
                continue;
            }
            if let Some(addr) = self.sampler.next(&subnet, self.params.address_family) {
                batch.push(addr);
                if batch.len() >= self.params.batch_size {
                    break;
                }
            }
        }
        tracing::debug!(drawn = batch.len(), issued = self.sampler.issued(), "Drew candidate batch");
        batch
    }

    /// Location phase for a whole batch. Returns indices of the candidates
    /// that passed the filter, in draw order.
    async fn check_locations(&self, batch: Vec<IpAddr>) -> Result<Vec<usize>> {
        let checked: Vec<Result<Option<usize>>> = stream::iter(batch)
            .map(|addr| self.check_location(addr))
            .buffered(self.params.location_concurrency)
            .collect()
            .await;

        let mut passed = Vec::new();
        for outcome in checked {
            if let Some(idx) = outcome? {
                passed.push(idx);
            }
        }
        Ok(passed)
    }

    async fn check_location(&self, addr: IpAddr) -> Result<Option<usize>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let idx = {
            let mut results = self.results.lock().await;
            results.push(CandidateEndpoint::new(addr));
            results.len() - 1
        };
        let _ = self.events.send(SearchEvent::Status {
            address: addr,
            status: EndpointStatus::Pending,
            result: ProbeResult::default(),
        });
        self.transition(idx, EndpointStatus::LocationCheck, |_| {}).await?;

        let report = self
            .probe
            .probe_location(addr, self.params.use_tls, self.params.probe_timeout)
            .await;
        let accepted = self.params.target_location.accepts(&report.location_code);

        if accepted {
            self.update(idx, |c| {
                c.result.latency_ms = report.latency_ms;
                c.result.location_code = report.location_code.clone();
            })
            .await;
            tracing::debug!(%addr, location = %report.location_code, "Location accepted");
            Ok(Some(idx))
        } else {
            self.transition(idx, EndpointStatus::Skipped, |c| {
                c.result.latency_ms = report.latency_ms;
                c.result.location_code = report.location_code.clone();
            })
            .await?;
            tracing::debug!(%addr, location = %report.location_code, "Location rejected");
            Ok(None)
        }
    }

    /// Throughput phase, strictly sequential. The stop predicate is checked
    /// before every probe and after every completion.
    async fn test_throughput(&self, passed: Vec<usize>) -> Result<Option<StopReason>> {
        for idx in passed {
            if let Some(reason) = self.should_stop().await {
                return Ok(Some(reason));
            }

            let addr = self.transition(idx, EndpointStatus::Testing, |_| {}).await?;
            let report: ThroughputReport = self
                .probe
                .probe_throughput(
                    addr,
                    self.params.use_tls,
                    self.params.probe_timeout,
                    self.params.throughput_window,
                    Some(&self.events),
                )
                .await;

            self.transition(idx, EndpointStatus::Completed, |c| {
                c.result.avg_speed_mbps = report.avg_speed_mbps;
                c.result.peak_speed_mbps = report.peak_speed_mbps;
            })
            .await?;
            tracing::info!(
                %addr,
                avg_mbps = report.avg_speed_mbps,
                peak_mbps = report.peak_speed_mbps,
                "Endpoint measured"
            );
            self.publish_progress().await;

            if let Some(reason) = self.should_stop().await {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Apply `edit` and move candidate `idx` to `next`, then publish it.
    async fn transition<F>(&self, idx: usize, next: EndpointStatus, edit: F) -> Result<IpAddr>
    where
        F: FnOnce(&mut CandidateEndpoint),
    {
        let snapshot = {
            let mut results = self.results.lock().await;
            let candidate = results
                .get_mut(idx)
                .ok_or_else(|| ScoutError::Custom(format!("no candidate at index {}", idx)))?;
            edit(candidate);
            candidate.advance(next)?;
            candidate.clone()
        };
        let _ = self.events.send(SearchEvent::Status {
            address: snapshot.address,
            status: snapshot.status,
            result: snapshot.result,
        });
        Ok(snapshot.address)
    }

    async fn update<F>(&self, idx: usize, edit: F)
    where
        F: FnOnce(&mut CandidateEndpoint),
    {
        let snapshot = {
            let mut results = self.results.lock().await;
            match results.get_mut(idx) {
                Some(candidate) => {
                    edit(candidate);
                    candidate.clone()
                }
                None => return,
            }
        };
        let _ = self.events.send(SearchEvent::Status {
            address: snapshot.address,
            status: snapshot.status,
            result: snapshot.result,
        });
    }

    async fn publish_progress(&self) {
        let (completed, total, qualified) = {
            let results = self.results.lock().await;
            let completed = results
                .iter()
                .filter(|c| c.status == EndpointStatus::Completed)
                .count();
            let qualified = results
                .iter()
                .filter(|c| c.is_qualified(self.params.min_bandwidth_mbps))
                .count();
            (completed, results.len(), qualified)
        };
        let _ = self.events.send(SearchEvent::Progress {
            completed,
            total,
            qualified,
        });
    }

    async fn finish(self, reason: StopReason) -> Result<SearchOutcome> {
        let qualified = self.qualified().await;
        tracing::info!(?reason, qualified = qualified.len(), "Search stopped");

        let persisted = if reason == StopReason::Satisfied {
            match self.sink.persist(&qualified, &self.params).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to persist qualifying endpoints");
                    let _ = self.events.send(SearchEvent::Finished { reason });
                    return Err(e);
                }
            }
        } else {
            None
        };

        let _ = self.events.send(SearchEvent::Finished { reason });
        Ok(SearchOutcome {
            reason,
            qualified,
            persisted,
        })
    }
}

use crate::config::SearchParams;
use crate::error::Result;
use crate::search::EventSender;
use crate::types::{CandidateEndpoint, LocationReport, ThroughputReport};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// EndpointProbe: 对单个地址进行两阶段测量
///
/// Neither phase fails: transport errors and timeouts come back as a
/// timeout / zero-speed report for that address.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Phase one: trace request yielding latency and serving location.
    async fn probe_location(&self, addr: IpAddr, use_tls: bool, timeout: Duration) -> LocationReport;

    /// Phase two: bounded streaming download.
    ///
    /// Reads for at most `min(window, timeout)`. Live samples are published on
    /// `live` when a channel is given.
    async fn probe_throughput(
        &self,
        addr: IpAddr,
        use_tls: bool,
        timeout: Duration,
        window: Duration,
        live: Option<&EventSender>,
    ) -> ThroughputReport;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// ResultSink: 持久化合格的端点
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store every endpoint not already present.
    ///
    /// Failing to open the store is an error; a failed individual record is
    /// counted in the summary and the rest are still written.
    async fn persist(&self, qualified: &[CandidateEndpoint], params: &SearchParams) -> Result<PersistSummary>;
}

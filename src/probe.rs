use crate::config::ProbeSettings;
use crate::search::{EventSender, SearchEvent};
use crate::sources::vhost::VirtualHost;
use crate::traits::EndpointProbe;
use crate::types::{LocationReport, SpeedSample, ThroughputReport};
use crate::utils::{round2, to_mbps};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::{self, Instant};

/// Extract the `colo=` value from a trace body.
pub fn parse_location(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.trim().strip_prefix("colo="))
        .map(|code| code.trim().to_string())
        .filter(|code| !code.is_empty())
}

/// Sliding-window throughput accumulator.
///
/// Every time at least `sample_interval` has passed since the previous sample,
/// the instantaneous speed over that interval is pushed into a window of the
/// last `window_samples` samples. The peak is the highest window average seen,
/// so a single bursty read cannot inflate it.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    window_samples: usize,
    sample_interval: Duration,
    total_bytes: u64,
    sampled_bytes: u64,
    last_sample_at: Duration,
    window: VecDeque<f64>,
    peak: Option<f64>,
}

impl ThroughputMeter {
    pub fn new(window_samples: usize, sample_interval: Duration) -> Self {
        let window_samples = window_samples.max(1);
        Self {
            window_samples,
            sample_interval,
            total_bytes: 0,
            sampled_bytes: 0,
            last_sample_at: Duration::ZERO,
            window: VecDeque::with_capacity(window_samples),
            peak: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Account for `bytes` received `elapsed` after the download started.
    pub fn record(&mut self, bytes: usize, elapsed: Duration) -> Option<SpeedSample> {
        self.total_bytes += bytes as u64;

        let since = elapsed.saturating_sub(self.last_sample_at);
        if since < self.sample_interval || since.is_zero() {
            return None;
        }

        let current = to_mbps(self.total_bytes - self.sampled_bytes, since.as_secs_f64());
        self.sampled_bytes = self.total_bytes;
        self.last_sample_at = elapsed;

        if self.window.len() == self.window_samples {
            self.window.pop_front();
        }
        self.window.push_back(current);
        let windowed = self.window.iter().sum::<f64>() / self.window.len() as f64;

        let peak = self.peak.map_or(windowed, |p| p.max(windowed));
        self.peak = Some(peak);

        Some(SpeedSample {
            current_mbps: current,
            windowed_mbps: windowed,
            peak_mbps: peak,
        })
    }

    /// Final report for a download that ran `elapsed` in total.
    pub fn finish(&self, elapsed: Duration) -> ThroughputReport {
        let secs = elapsed.as_secs_f64();
        let avg = if self.total_bytes > 0 && secs > 0.0 {
            round2(to_mbps(self.total_bytes, secs))
        } else {
            0.0
        };
        // 最后一次采样之后到达的字节作为一个较短的采样进入窗口
        let mut peak = self.peak;
        let tail = elapsed.saturating_sub(self.last_sample_at);
        let unsampled = self.total_bytes - self.sampled_bytes;
        if peak.is_some() && unsampled > 0 && !tail.is_zero() {
            let mut window = self.window.clone();
            if window.len() == self.window_samples {
                window.pop_front();
            }
            window.push_back(to_mbps(unsampled, tail.as_secs_f64()));
            let windowed = window.iter().sum::<f64>() / window.len() as f64;
            peak = peak.map(|p| p.max(windowed));
        }
        // 下载太短没有采样时, 峰值退化为平均值; 峰值永远不低于平均值
        let peak = peak.map_or(avg, |p| round2(p).max(avg));
        ThroughputReport {
            avg_speed_mbps: avg,
            peak_speed_mbps: peak,
        }
    }
}

/// Probes an address over HTTP(S), presenting the configured virtual host.
///
/// A fresh client is built per probe and the virtual host is resolved to the
/// address under test, so both the Host header and TLS SNI name the domain
/// while the connection goes to the literal IP.
pub struct HttpProbe {
    vhost: VirtualHost,
    settings: ProbeSettings,
}

impl HttpProbe {
    pub fn new(vhost: VirtualHost, settings: ProbeSettings) -> Self {
        Self { vhost, settings }
    }

    fn scheme_and_port(&self, use_tls: bool) -> (&'static str, u16) {
        if use_tls {
            ("https", self.settings.https_port)
        } else {
            ("http", self.settings.http_port)
        }
    }

    fn url(&self, scheme: &str, port: u16, path: &str) -> String {
        format!("{}://{}:{}/{}", scheme, self.vhost.host, port, path)
    }

    fn client_for(&self, addr: IpAddr, port: u16, connect_timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .resolve(&self.vhost.host, SocketAddr::new(addr, port))
            .no_proxy()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(self.settings.accept_invalid_certs)
            .build()
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn probe_location(&self, addr: IpAddr, use_tls: bool, timeout: Duration) -> LocationReport {
        let (scheme, port) = self.scheme_and_port(use_tls);
        let client = match self.client_for(addr, port, timeout) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "Failed to build HTTP client");
                return LocationReport::timeout();
            }
        };
        let url = self.url(scheme, port, &self.settings.trace_path);

        let start = Instant::now();
        let resp = match client.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "Trace request failed");
                return LocationReport::timeout();
            }
        };
        let latency_ms = round2(start.elapsed().as_secs_f64() * 1000.0);

        if resp.status() != StatusCode::OK {
            tracing::debug!(%addr, status = %resp.status(), "Trace returned non-200");
            return LocationReport::timeout();
        }

        match resp.text().await {
            Ok(body) => LocationReport {
                latency_ms: Some(latency_ms),
                location_code: parse_location(&body).unwrap_or_default(),
            },
            Err(e) => {
                tracing::debug!(%addr, error = %e, "Trace body unreadable");
                LocationReport::timeout()
            }
        }
    }

    async fn probe_throughput(
        &self,
        addr: IpAddr,
        use_tls: bool,
        timeout: Duration,
        window: Duration,
        live: Option<&EventSender>,
    ) -> ThroughputReport {
        let budget_end = Instant::now() + timeout;
        let (scheme, port) = self.scheme_and_port(use_tls);
        let client = match self.client_for(addr, port, timeout) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "Failed to build HTTP client");
                return ThroughputReport::default();
            }
        };
        let url = self.url(scheme, port, &self.vhost.path);

        let mut resp = match time::timeout_at(budget_end, client.get(&url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp,
            Ok(Ok(resp)) => {
                tracing::debug!(%addr, status = %resp.status(), "Download refused");
                return ThroughputReport::default();
            }
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "Download request failed");
                return ThroughputReport::default();
            }
            Err(_) => {
                tracing::debug!(%addr, "Download request timed out");
                return ThroughputReport::default();
            }
        };

        let started = Instant::now();
        let deadline = (started + window).min(budget_end);
        let mut meter = ThroughputMeter::new(self.settings.window_samples, self.settings.sample_interval);

        loop {
            match time::timeout_at(deadline, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    if let Some(sample) = meter.record(chunk.len(), started.elapsed()) {
                        if let Some(tx) = live {
                            let _ = tx.send(SearchEvent::Speed { address: addr, sample });
                        }
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    // 中途断流: 保留已经测得的数据
                    tracing::warn!(%addr, bytes = meter.total_bytes(), error = %e, "Download interrupted");
                    break;
                }
                Err(_) => break,
            }
        }
        let elapsed = started.elapsed();
        drop(resp);

        let report = meter.finish(elapsed);
        tracing::debug!(%addr, bytes = meter.total_bytes(), ?elapsed, ?report, "Download finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const HOST: &str = "speed.example.test";

    /// Minimal HTTP/1.1 server: each connection gets `reply(request_head)`
    /// written part by part with `gap` in between, then the socket closes.
    async fn spawn_server<F>(reply: F, gap: Duration) -> u16
    where
        F: Fn(&str) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reply = Arc::new(reply);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).to_lowercase();
                    for part in reply(&head) {
                        if sock.write_all(&part).await.is_err() {
                            return;
                        }
                        if !gap.is_zero() {
                            time::sleep(gap).await;
                        }
                    }
                    let _ = sock.shutdown().await;
                });
            }
        });
        port
    }

    fn response(status: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status, content_length
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn probe_on(port: u16, path: &str) -> HttpProbe {
        let vhost = VirtualHost {
            host: HOST.to_string(),
            path: path.to_string(),
        };
        let settings = ProbeSettings {
            http_port: port,
            ..ProbeSettings::default()
        };
        HttpProbe::new(vhost, settings)
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("colo=SJC\nother=x"), Some("SJC".to_string()));
        assert_eq!(
            parse_location("fl=1f\nh=speed.example.test\nip=1.2.3.4\ncolo=HKG\r\nloc=HK\n"),
            Some("HKG".to_string())
        );
        assert_eq!(parse_location("colo=\n"), None);
        assert_eq!(parse_location("nothing here"), None);
    }

    #[test]
    fn test_meter_partial_download() {
        // 500000 bytes over 2.0s, then the stream broke
        let mut meter = ThroughputMeter::new(5, Duration::from_millis(500));
        for i in 1..=5 {
            meter.record(100_000, Duration::from_millis(400 * i));
        }
        let report = meter.finish(Duration::from_secs(2));
        assert_eq!(report.avg_speed_mbps, round2((500000.0 / 1024.0 / 2.0) / 128.0));
        assert_eq!(report.avg_speed_mbps, 1.91);
        assert!(report.peak_speed_mbps >= report.avg_speed_mbps);
    }

    #[test]
    fn test_meter_samples_on_interval() {
        let mut meter = ThroughputMeter::new(5, Duration::from_millis(500));
        assert!(meter.record(1_000, Duration::from_millis(100)).is_none());
        assert!(meter.record(1_000, Duration::from_millis(300)).is_none());
        let sample = meter.record(62_000, Duration::from_millis(500)).expect("sample");
        // 64000 bytes in 0.5s
        assert!((sample.current_mbps - to_mbps(64_000, 0.5)).abs() < 1e-9);
        assert_eq!(sample.windowed_mbps, sample.current_mbps);
        assert_eq!(sample.peak_mbps, sample.current_mbps);
        assert_eq!(meter.total_bytes(), 64_000);
    }

    #[test]
    fn test_meter_peak_uses_window_average() {
        let mut meter = ThroughputMeter::new(5, Duration::from_millis(500));
        let mut samples = Vec::new();
        // steady 1 MiB per half second, with one 10x burst in the middle
        for i in 1..=10u64 {
            let bytes = if i == 5 { 10 * 1024 * 1024 } else { 1024 * 1024 };
            if let Some(s) = meter.record(bytes, Duration::from_millis(500 * i)) {
                samples.push(s);
            }
        }
        let max_instant = samples.iter().map(|s| s.current_mbps).fold(0.0, f64::max);
        let max_windowed = samples.iter().map(|s| s.windowed_mbps).fold(0.0, f64::max);
        let report = meter.finish(Duration::from_secs(5));

        assert_eq!(samples.len(), 10);
        assert!(report.peak_speed_mbps < max_instant, "burst was not smoothed");
        for s in &samples {
            assert!(report.peak_speed_mbps + 0.005 >= s.windowed_mbps);
        }
        assert!((report.peak_speed_mbps - round2(max_windowed)).abs() < 1e-9);
        assert!(report.avg_speed_mbps <= report.peak_speed_mbps);
    }

    #[test]
    fn test_meter_counts_bytes_after_last_sample() {
        // Slow start, then a fast tail that ends before the next sample is due
        let mut meter = ThroughputMeter::new(5, Duration::from_millis(500));
        let first = meter.record(64 * 1024, Duration::from_millis(500)).expect("sample");
        assert_eq!(first.peak_mbps, 1.0);
        assert!(meter.record(8 * 1024 * 1024, Duration::from_millis(950)).is_none());

        let report = meter.finish(Duration::from_millis(950));
        assert_eq!(report.avg_speed_mbps, 67.89);
        assert!(
            report.peak_speed_mbps >= report.avg_speed_mbps,
            "peak {} below average {}",
            report.peak_speed_mbps,
            report.avg_speed_mbps
        );
        // The tail joins the window alongside the slow first sample
        let tail = to_mbps(8 * 1024 * 1024, 0.45);
        assert_eq!(report.peak_speed_mbps, round2((1.0 + tail) / 2.0));
    }

    #[test]
    fn test_meter_empty() {
        let meter = ThroughputMeter::new(5, Duration::from_millis(500));
        assert_eq!(meter.finish(Duration::from_secs(1)), ThroughputReport::default());
        assert_eq!(meter.finish(Duration::ZERO), ThroughputReport::default());
    }

    #[tokio::test]
    async fn test_location_probe_reads_colo() {
        let port = spawn_server(
            |head| {
                let ok = head.starts_with("get /cdn-cgi/trace") && head.contains(HOST);
                if ok {
                    vec![response("200 OK", 16, b"colo=SJC\nother=x")]
                } else {
                    vec![response("400 Bad Request", 0, b"")]
                }
            },
            Duration::ZERO,
        )
        .await;

        let probe = probe_on(port, "");
        let report = probe.probe_location(localhost(), false, Duration::from_secs(3)).await;
        assert_eq!(report.location_code, "SJC");
        assert!(report.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_location_probe_non_200_is_timeout() {
        let port = spawn_server(|_| vec![response("404 Not Found", 8, b"colo=LAX")], Duration::ZERO).await;
        let probe = probe_on(port, "");
        let report = probe.probe_location(localhost(), false, Duration::from_secs(3)).await;
        assert_eq!(report, LocationReport::timeout());
    }

    #[tokio::test]
    async fn test_location_probe_unreachable() {
        // Grab a free port, then close it again
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = probe_on(port, "");
        let report = probe.probe_location(localhost(), false, Duration::from_secs(2)).await;
        assert_eq!(report.latency_ms, None);
        assert_eq!(report.location_code, "");
    }

    #[tokio::test]
    async fn test_throughput_full_download() {
        let body = vec![7u8; 256 * 1024];
        let port = spawn_server(
            move |head| {
                // Refuse unless the download names the resource and the virtual host
                if head.starts_with("get /big.bin") && head.contains(&format!("host: {}", HOST)) {
                    vec![response("200 OK", body.len(), &body)]
                } else {
                    vec![response("400 Bad Request", 0, b"")]
                }
            },
            Duration::ZERO,
        )
        .await;

        let probe = probe_on(port, "big.bin");
        let report = probe
            .probe_throughput(localhost(), false, Duration::from_secs(5), Duration::from_secs(3), None)
            .await;
        assert!(report.avg_speed_mbps > 0.0);
        assert!(report.peak_speed_mbps >= report.avg_speed_mbps);
    }

    #[tokio::test]
    async fn test_throughput_keeps_partial_result() {
        // Promise 1 MB, deliver 500000 bytes, hang up
        let port = spawn_server(
            |_| vec![response("200 OK", 1_000_000, &vec![1u8; 500_000])],
            Duration::ZERO,
        )
        .await;

        let probe = probe_on(port, "big.bin");
        let report = probe
            .probe_throughput(localhost(), false, Duration::from_secs(5), Duration::from_secs(3), None)
            .await;
        assert!(report.avg_speed_mbps > 0.0, "partial bytes were discarded");
    }

    #[tokio::test]
    async fn test_throughput_stops_at_window() {
        // 40 parts, 100ms apart: about four seconds of trickle
        let port = spawn_server(
            |_| {
                let mut parts = vec![format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    40 * 8192
                )
                .into_bytes()];
                parts.extend((0..40).map(|_| vec![0u8; 8192]));
                parts
            },
            Duration::from_millis(100),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = probe_on(port, "slow.bin");
        let start = Instant::now();
        let report = probe
            .probe_throughput(
                localhost(),
                false,
                Duration::from_secs(10),
                Duration::from_millis(1200),
                Some(&tx),
            )
            .await;

        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(report.avg_speed_mbps > 0.0);

        drop(tx);
        let mut speed_events = 0;
        while let Some(event) = rx.recv().await {
            if let SearchEvent::Speed { address, sample } = event {
                assert_eq!(address, localhost());
                assert!(sample.peak_mbps >= sample.windowed_mbps);
                speed_events += 1;
            }
        }
        assert!(speed_events >= 1);
    }

    #[tokio::test]
    async fn test_throughput_refused() {
        let port = spawn_server(|_| vec![response("403 Forbidden", 0, b"")], Duration::ZERO).await;
        let probe = probe_on(port, "big.bin");
        let report = probe
            .probe_throughput(localhost(), false, Duration::from_secs(3), Duration::from_secs(1), None)
            .await;
        assert_eq!(report, ThroughputReport::default());
    }
}

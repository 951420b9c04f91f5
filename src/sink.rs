use crate::config::SearchParams;
use crate::error::{Result, ScoutError};
use crate::sources::locations::LocationTable;
use crate::traits::{PersistSummary, ResultSink};
use crate::types::CandidateEndpoint;
use crate::utils::now_timestamp;
use async_trait::async_trait;
use regex::Regex;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const RECORD_SEPARATOR: &str = "--------------------";

/// Whether `content` already holds a record for exactly `addr`.
pub fn already_recorded(content: &str, addr: IpAddr) -> Result<bool> {
    // 使用正则精确匹配, 避免 1.2.3.4 误判 1.2.3.45
    let re = Regex::new(&format!(r"(?m)^IP: {}\s*$", regex::escape(&addr.to_string())))?;
    Ok(re.is_match(content))
}

/// Append-only text file of qualifying endpoints, one block per address.
pub struct FileSink {
    path: PathBuf,
    locations: LocationTable,
    tls_ports: String,
    plain_ports: String,
}

impl FileSink {
    pub fn new(path: PathBuf, locations: LocationTable, tls_ports: &str, plain_ports: &str) -> Self {
        Self {
            path,
            locations,
            tls_ports: tls_ports.to_string(),
            plain_ports: plain_ports.to_string(),
        }
    }

    fn format_record(&self, endpoint: &CandidateEndpoint, params: &SearchParams, timestamp: &str) -> String {
        let r = &endpoint.result;
        let ports = if params.use_tls {
            &self.tls_ports
        } else {
            &self.plain_ports
        };
        format!(
            "[{}] min bandwidth {} Mbps\n\
             IP: {}\n\
             Latency: {}\n\
             Average speed: {:.2}Mbps\n\
             Peak speed: {:.2}Mbps\n\
             Location: {}\n\
             Ports: {}\n\
             {}\n",
            timestamp,
            params.min_bandwidth_mbps,
            endpoint.address,
            r.latency_display(),
            r.avg_speed_mbps,
            r.peak_speed_mbps,
            self.locations.describe(&r.location_code),
            ports,
            RECORD_SEPARATOR,
        )
    }
}

#[async_trait]
impl ResultSink for FileSink {
    async fn persist(&self, qualified: &[CandidateEndpoint], params: &SearchParams) -> Result<PersistSummary> {
        let store_err = |source: std::io::Error| ScoutError::Store {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(store_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(store_err)?;

        let mut existing = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Cannot read existing results, duplicates possible");
                String::new()
            }
        };

        let mut summary = PersistSummary::default();
        let timestamp = now_timestamp();
        for endpoint in qualified {
            if already_recorded(&existing, endpoint.address)? {
                tracing::info!(address = %endpoint.address, "Already recorded, skipping");
                summary.skipped += 1;
                continue;
            }

            let record = self.format_record(endpoint, params, &timestamp);
            match file.write_all(record.as_bytes()).await {
                Ok(()) => {
                    existing.push_str(&record);
                    summary.written += 1;
                }
                Err(e) => {
                    tracing::error!(address = %endpoint.address, error = %e, "Failed to write record");
                    summary.failed += 1;
                }
            }
        }

        if let Err(e) = file.flush().await {
            tracing::error!(path = ?self.path, error = %e, "Failed to flush results");
        }
        tracing::info!(path = ?self.path, ?summary, "Results persisted");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::EndpointStatus;
    use tempfile::tempdir;

    fn endpoint(addr: &str, avg: f64, code: &str) -> CandidateEndpoint {
        let mut c = CandidateEndpoint::new(addr.parse().unwrap());
        c.status = EndpointStatus::Completed;
        c.result.latency_ms = Some(12.5);
        c.result.location_code = code.to_string();
        c.result.avg_speed_mbps = avg;
        c.result.peak_speed_mbps = avg + 1.0;
        c
    }

    fn sink(path: PathBuf) -> FileSink {
        let table = LocationTable::parse("North America/San Jose,San Jose(SJC)\n");
        FileSink::new(path, table, "443,8443", "80,8080")
    }

    #[test]
    fn test_already_recorded_is_exact() -> Result<()> {
        let content = "IP: 1.2.3.45\nLatency: 1ms\n";
        assert!(!already_recorded(content, "1.2.3.4".parse().unwrap())?);
        assert!(already_recorded(content, "1.2.3.45".parse().unwrap())?);
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("find.txt");
        let sink = sink(path.clone());
        let params = Config::default().search_params();

        let batch = vec![endpoint("203.0.113.7", 7.2, "SJC")];
        let first = sink.persist(&batch, &params).await?;
        assert_eq!(first.written, 1);

        let second = sink.persist(&batch, &params).await?;
        assert_eq!(second.written, 0);
        assert_eq!(second.skipped, 1);

        let content = fs::read_to_string(&path).await?;
        assert_eq!(content.matches("IP: 203.0.113.7\n").count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_contents() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("find.txt");
        let sink = sink(path.clone());
        let mut params = Config::default().search_params();
        params.use_tls = false;

        let batch = vec![
            endpoint("203.0.113.7", 7.2, "SJC"),
            endpoint("2606:4700::1", 12.0, "LAX"),
            // same address twice in one batch
            endpoint("203.0.113.7", 7.2, "SJC"),
        ];
        let summary = sink.persist(&batch, &params).await?;
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 1);

        let content = fs::read_to_string(&path).await?;
        assert!(content.contains("min bandwidth 5 Mbps"));
        assert!(content.contains("Latency: 12.50ms"));
        assert!(content.contains("Average speed: 7.20Mbps"));
        assert!(content.contains("Peak speed: 8.20Mbps"));
        assert!(content.contains("Location: North America/San Jose,San Jose(SJC)"));
        // Unknown code is written raw
        assert!(content.contains("Location: LAX"));
        assert!(content.contains("Ports: 80,8080"));
        assert!(!content.contains("443,8443"));
        assert_eq!(content.matches(RECORD_SEPARATOR).count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() -> Result<()> {
        let dir = tempdir()?;
        // The destination is a directory, so it cannot be opened for appending
        let sink = sink(dir.path().to_path_buf());
        let params = Config::default().search_params();
        let err = sink
            .persist(&[endpoint("203.0.113.9", 9.0, "SJC")], &params)
            .await
            .unwrap_err();
        assert!(matches!(err, ScoutError::Store { .. }));
        Ok(())
    }
}

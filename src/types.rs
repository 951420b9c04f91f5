use crate::error::{Result, ScoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// 地址族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_))
        )
    }

    /// Name of the subnet list file for this family inside the data dir.
    pub fn list_file(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ips-v4.txt",
            AddressFamily::V6 => "ips-v6.txt",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Which serving locations are acceptable for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationFilter {
    Any,
    Code(String),
}

impl LocationFilter {
    /// "any" (in any case) or an empty string accepts every location.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("any") {
            LocationFilter::Any
        } else {
            LocationFilter::Code(raw.to_ascii_uppercase())
        }
    }

    pub fn accepts(&self, location_code: &str) -> bool {
        match self {
            LocationFilter::Any => true,
            LocationFilter::Code(code) => {
                !location_code.is_empty() && location_code.to_ascii_uppercase() == *code
            }
        }
    }
}

impl fmt::Display for LocationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationFilter::Any => write!(f, "any"),
            LocationFilter::Code(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    Pending,
    LocationCheck,
    Skipped,
    Testing,
    Completed,
}

impl EndpointStatus {
    /// Status only moves forward: Pending -> LocationCheck -> {Skipped | Testing} -> Completed.
    pub fn can_advance_to(self, next: EndpointStatus) -> bool {
        use EndpointStatus::*;
        matches!(
            (self, next),
            (Pending, LocationCheck)
                | (LocationCheck, Skipped)
                | (LocationCheck, Testing)
                | (Testing, Completed)
        )
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Pending => "pending",
            EndpointStatus::LocationCheck => "location-check",
            EndpointStatus::Skipped => "skipped",
            EndpointStatus::Testing => "testing",
            EndpointStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of the cheap trace request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationReport {
    /// Round trip in milliseconds, `None` when the endpoint timed out or was unusable
    pub latency_ms: Option<f64>,
    /// 空字符串表示未知
    pub location_code: String,
}

impl LocationReport {
    pub fn timeout() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThroughputReport {
    pub avg_speed_mbps: f64,
    pub peak_speed_mbps: f64,
}

/// One live measurement emitted while a download is running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub current_mbps: f64,
    pub windowed_mbps: f64,
    pub peak_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeResult {
    pub latency_ms: Option<f64>,
    pub location_code: String,
    pub avg_speed_mbps: f64,
    pub peak_speed_mbps: f64,
}

impl ProbeResult {
    pub fn merge(location: LocationReport, throughput: ThroughputReport) -> Self {
        Self {
            latency_ms: location.latency_ms,
            location_code: location.location_code,
            avg_speed_mbps: throughput.avg_speed_mbps,
            peak_speed_mbps: throughput.peak_speed_mbps,
        }
    }

    pub fn latency_display(&self) -> String {
        match self.latency_ms {
            Some(ms) => format!("{:.2}ms", ms),
            None => "Timeout".to_string(),
        }
    }
}

/// A single drawn address and everything measured about it so far.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateEndpoint {
    pub address: IpAddr,
    pub status: EndpointStatus,
    pub result: ProbeResult,
}

impl CandidateEndpoint {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            status: EndpointStatus::Pending,
            result: ProbeResult::default(),
        }
    }

    pub fn advance(&mut self, next: EndpointStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(ScoutError::IllegalTransition {
                address: self.address,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_qualified(&self, min_bandwidth_mbps: f64) -> bool {
        self.status == EndpointStatus::Completed && self.result.avg_speed_mbps >= min_bandwidth_mbps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() -> Result<()> {
        let mut c = CandidateEndpoint::new("203.0.113.1".parse().unwrap());
        c.advance(EndpointStatus::LocationCheck)?;
        c.advance(EndpointStatus::Testing)?;
        c.advance(EndpointStatus::Completed)?;

        // Completed is terminal, including a retry
        assert!(c.advance(EndpointStatus::Testing).is_err());
        assert!(c.advance(EndpointStatus::Pending).is_err());
        assert_eq!(c.status, EndpointStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_skipped_is_terminal() {
        let mut c = CandidateEndpoint::new("203.0.113.2".parse().unwrap());
        c.advance(EndpointStatus::LocationCheck).unwrap();
        c.advance(EndpointStatus::Skipped).unwrap();
        assert!(c.advance(EndpointStatus::Testing).is_err());
        assert!(c.advance(EndpointStatus::Completed).is_err());
    }

    #[test]
    fn test_qualification_requires_completion() {
        let mut c = CandidateEndpoint::new("203.0.113.3".parse().unwrap());
        c.result.avg_speed_mbps = 50.0;
        assert!(!c.is_qualified(5.0));

        c.status = EndpointStatus::Completed;
        assert!(c.is_qualified(5.0));
        assert!(c.is_qualified(50.0));
        assert!(!c.is_qualified(50.01));
    }

    #[test]
    fn test_location_filter() {
        assert_eq!(LocationFilter::parse("ANY"), LocationFilter::Any);
        assert_eq!(LocationFilter::parse(""), LocationFilter::Any);
        assert!(LocationFilter::Any.accepts(""));

        let sjc = LocationFilter::parse(" sjc ");
        assert_eq!(sjc, LocationFilter::Code("SJC".to_string()));
        assert!(sjc.accepts("SJC"));
        assert!(!sjc.accepts("LAX"));
        assert!(!sjc.accepts(""));
    }
}

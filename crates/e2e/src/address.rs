//! Live-server address specs: `host:ranges`
//!
//! `ranges` is a comma-separated list of single ports (`8080`) or inclusive
//! ranges (`8000-8010`), e.g. `localhost:8000-8010,8080,9200-9300`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{E2eError, E2eResult};

/// Address used when nothing is configured
pub const DEFAULT_ADDRESS: &str = "localhost:9000-9200";

/// Inclusive port range; `low == high` for a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { low: port, high: port }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}-{}", self.low, self.high)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub host: String,
    pub ranges: Vec<PortRange>,
}

impl AddressSpec {
    pub fn parse(spec: &str) -> E2eResult<Self> {
        let invalid = || E2eError::Configuration(format!("Invalid address (\"{}\") for live server.", spec));

        let mut parts = spec.split(':');
        let (host, port_ranges) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(ranges), None) => (host.trim(), ranges),
            _ => return Err(invalid()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let mut ranges = Vec::new();
        for token in port_ranges.split(',') {
            let extremes = token
                .split('-')
                .map(|bound| bound.trim().parse::<u16>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid())?;
            let range = match extremes.as_slice() {
                [port] => PortRange::single(*port),
                [low, high] if low <= high => PortRange { low: *low, high: *high },
                _ => return Err(invalid()),
            };
            ranges.push(range);
        }

        Ok(Self {
            host: host.to_string(),
            ranges,
        })
    }

    /// Ports to try, in listed order, each at most once
    pub fn candidates(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        self.ranges
            .iter()
            .flat_map(|range| range.low..=range.high)
            .filter(|port| seen.insert(*port))
            .collect()
    }
}

impl Default for AddressSpec {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ranges: vec![PortRange { low: 9000, high: 9200 }],
        }
    }
}

impl FromStr for AddressSpec {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.ranges.iter().map(ToString::to_string).collect();
        write!(f, "{}:{}", self.host, ranges.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("localhost:8000-8002,9000", &[8000, 8001, 8002, 9000] ; "range then single")]
    #[test_case("localhost:8081", &[8081] ; "single port")]
    #[test_case("127.0.0.1:9000,8000-8001", &[9000, 8000, 8001] ; "listed order kept")]
    #[test_case("localhost:8000-8002,8001,8002-8003", &[8000, 8001, 8002, 8003] ; "duplicates dropped")]
    #[test_case("localhost: 8000 - 8001", &[8000, 8001] ; "whitespace tolerated")]
    fn test_candidates(spec: &str, expected: &[u16]) {
        assert_eq!(AddressSpec::parse(spec).unwrap().candidates(), expected);
    }

    #[test_case("localhost" ; "no ports")]
    #[test_case("localhost:8000:9000" ; "extra colon")]
    #[test_case(":8000" ; "empty host")]
    #[test_case("localhost:abc" ; "not a number")]
    #[test_case("localhost:8000-8001-8002" ; "three bounds")]
    #[test_case("localhost:8000," ; "empty token")]
    #[test_case("localhost:9000-8000" ; "descending range")]
    #[test_case("localhost:70000" ; "port out of range")]
    fn test_invalid_specs(spec: &str) {
        let err = AddressSpec::parse(spec).unwrap_err();
        assert!(matches!(err, E2eError::Configuration(_)));
        assert!(err.to_string().contains(spec));
    }

    #[test]
    fn test_default_matches_constant() {
        let parsed: AddressSpec = DEFAULT_ADDRESS.parse().unwrap();
        assert_eq!(parsed, AddressSpec::default());
        assert_eq!(parsed.to_string(), DEFAULT_ADDRESS);
        assert_eq!(parsed.candidates().len(), 201);
    }
}

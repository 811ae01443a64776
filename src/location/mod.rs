//! Host location resolution
//!
//! A location (environment + data center, plus zone/OS detail) comes
//! either from an explicit pair or decoded from a structured hostname:
//! characters 0-1 name the data center, 2 the availability zone, 3 the
//! security zone, 4 the operating system, and 5 the environment.

use std::fmt;

/// Hostname prefix codes for data centers
pub const DATA_CENTER_TABLE: &[(&str, &str)] = &[
    ("c1", "AM1"),
    ("s2", "AM2"),
    ("a1", "AW1"),
    ("a2", "AW2"),
    ("l1", "EM1"),
    ("l2", "EM2"),
    ("h1", "AP1"),
    ("h2", "AP2"),
];

pub const AVAILABILITY_ZONE_TABLE: &[(&str, &str)] = &[("a", "A"), ("b", "B")];

pub const SECURITY_ZONE_TABLE: &[(&str, &str)] = &[("i", "IDMZ"), ("z", "DMZ"), ("b", "Back End")];

pub const OS_TABLE: &[(&str, &str)] = &[("c", "centos"), ("w", "Windows")];

pub const ENVIRONMENT_TABLE: &[(&str, &str)] = &[("d", "dev"), ("t", "qa"), ("p", "prod")];

/// Errors raised while resolving a location
#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("hostname '{hostname}' is too short to carry location fields")]
    HostnameTooShort { hostname: String },

    #[error(
        "failed to read {field} from hostname '{hostname}': '{code}' is not a valid code \
         (valid codes: [{valid}])"
    )]
    UnknownCode {
        field: &'static str,
        hostname: String,
        code: String,
        valid: String,
    },
}

/// A resolved host location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    hostname: Option<String>,
    environment: String,
    data_center: String,
    availability_zone: String,
    security_zone: String,
    os: String,
}

impl Location {
    /// Build a location from an explicit environment and data center
    pub fn from_pair(environment: impl Into<String>, data_center: impl Into<String>) -> Self {
        Self {
            hostname: None,
            environment: environment.into(),
            data_center: data_center.into(),
            availability_zone: String::new(),
            security_zone: String::new(),
            os: String::new(),
        }
    }

    /// Decode a location from a structured hostname
    pub fn from_hostname(hostname: impl Into<String>) -> Result<Self, LocationError> {
        let hostname = hostname.into();
        if hostname.len() < 6 {
            return Err(LocationError::HostnameTooShort { hostname });
        }

        let data_center = lookup(&hostname[0..2], DATA_CENTER_TABLE, "data_center", &hostname)?;
        let availability_zone =
            lookup(&hostname[2..3], AVAILABILITY_ZONE_TABLE, "availability_zone", &hostname)?;
        let security_zone = lookup(&hostname[3..4], SECURITY_ZONE_TABLE, "security_zone", &hostname)?;
        let os = lookup(&hostname[4..5], OS_TABLE, "os", &hostname)?;
        let environment = lookup(&hostname[5..6], ENVIRONMENT_TABLE, "environment", &hostname)?;

        Ok(Self {
            hostname: Some(hostname),
            environment,
            data_center,
            availability_zone,
            security_zone,
            os,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    pub fn availability_zone(&self) -> &str {
        &self.availability_zone
    }

    pub fn security_zone(&self) -> &str {
        &self.security_zone
    }

    pub fn os(&self) -> &str {
        &self.os
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"environment": "{}", "data_center": "{}""#,
            self.environment, self.data_center
        )?;
        if !self.availability_zone.is_empty() {
            write!(f, r#", "availability_zone": "{}""#, self.availability_zone)?;
        }
        if !self.security_zone.is_empty() {
            write!(f, r#", "security_zone": "{}""#, self.security_zone)?;
        }
        if !self.os.is_empty() {
            write!(f, r#", "os": "{}""#, self.os)?;
        }
        if let Some(hostname) = &self.hostname {
            write!(f, r#", "hostname": "{}""#, hostname)?;
        }
        f.write_str("}")
    }
}

fn lookup(
    code: &str,
    table: &[(&str, &str)],
    field: &'static str,
    hostname: &str,
) -> Result<String, LocationError> {
    table
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| LocationError::UnknownCode {
            field,
            hostname: hostname.to_string(),
            code: code.to_string(),
            valid: table
                .iter()
                .map(|(key, _)| *key)
                .collect::<Vec<_>>()
                .join(", "),
        })
}

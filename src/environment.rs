//! Core data model for provisioned environments.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Identity of an environment: namespace plus name, unique within the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentId {
    /// Namespace the environment lives in
    pub namespace: String,
    /// Environment name, also the name of its workload and route
    pub name: String,
}

impl EnvironmentId {
    /// Creates a new identity from its parts.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle states of an environment.
///
/// Expiry is not a state — it is enforced externally by the sweeper addon
/// reading the expiry metadata off the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    /// Build accepted, provisioning not yet started
    Requested,
    /// Cluster resources are being created
    Provisioning,
    /// All resources were created successfully
    Ready,
    /// A resource creation failed; partial resources remain until destroyed
    Failed,
    /// Resources are being deleted
    Destroying,
    /// Terminal; the identity is free again
    Destroyed,
}

impl EnvironmentState {
    /// Whether the environment still occupies its identity.
    pub fn is_active(self) -> bool {
        !matches!(self, EnvironmentState::Destroyed)
    }

    /// Legal transitions of the lifecycle state machine.
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;

        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Destroying)
                | (Failed, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnvironmentState::Requested => "requested",
            EnvironmentState::Provisioning => "provisioning",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Failed => "failed",
            EnvironmentState::Destroying => "destroying",
            EnvironmentState::Destroyed => "destroyed",
        };

        write!(f, "{}", label)
    }
}

/// Orchestrator-side view of one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentRecord {
    /// Identity the record belongs to
    pub id: EnvironmentId,
    /// Current lifecycle state
    pub state: EnvironmentState,
    /// Failure detail, set when the state is [`EnvironmentState::Failed`]
    pub message: Option<String>,
    /// Instant the build request was accepted
    pub created_at: DateTime<Utc>,
    /// Requested time-to-live
    pub ttl: Ttl,
}

/// A parsed time-to-live.
///
/// Keeps the verbatim request string so the stamped metadata round-trips
/// exactly what the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ttl {
    raw: String,
    duration: Duration,
}

impl Ttl {
    /// Creates a TTL from a number of seconds.
    pub fn from_secs(seconds: u64) -> Self {
        Self {
            raw: format!("{}s", seconds),
            duration: Duration::from_secs(seconds),
        }
    }

    /// The parsed duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The TTL exactly as it was requested.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Failure to interpret a time-to-live string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TtlParseError {
    /// Empty input
    #[error("ttl must not be empty")]
    Empty,
    /// Anything that is not `<number>[s|m|h|d]`
    #[error("invalid ttl `{0}`, expected e.g. 30s, 45m, 24h or 7d")]
    Invalid(String),
}

impl FromStr for Ttl {
    type Err = TtlParseError;

    /// Parses duration strings of the form `30s`, `45m`, `24h`, `7d` or bare seconds.
    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let trimmed = src.trim();

        if trimmed.is_empty() {
            return Err(TtlParseError::Empty);
        }

        let (value, multiplier) = match trimmed.char_indices().last() {
            Some((index, 's')) => (&trimmed[..index], 1),
            Some((index, 'm')) => (&trimmed[..index], 60),
            Some((index, 'h')) => (&trimmed[..index], 3600),
            Some((index, 'd')) => (&trimmed[..index], 86400),
            _ => (trimmed, 1),
        };

        let count = value
            .parse::<u64>()
            .map_err(|_| TtlParseError::Invalid(trimmed.to_owned()))?;

        let seconds = count
            .checked_mul(multiplier)
            .ok_or_else(|| TtlParseError::Invalid(trimmed.to_owned()))?;

        Ok(Self {
            raw: trimmed.to_owned(),
            duration: Duration::from_secs(seconds),
        })
    }
}

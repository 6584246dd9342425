//! Expiry metadata contract between the orchestrator and the sweeper addon.
//!
//! Every environment workload carries its creation timestamp, requested
//! time-to-live and owning environment as queryable metadata. The external
//! sweeper periodically lists workloads, computes `now - createdAt > ttl` and
//! deletes matches directly against the cluster API. It trusts these values
//! unconditionally, so an omitted or malformed stamp is a correctness bug:
//! an environment that never expires.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::constants::{CREATED_AT_ANNOTATION, OWNER_LABEL, TTL_ANNOTATION};
use crate::environment::Ttl;

/// The `{createdAt, ttl, owner}` stamp attached to every environment workload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryMetadata {
    /// Instant the build request was accepted
    pub created_at: DateTime<Utc>,
    /// Time-to-live, verbatim as requested
    pub ttl: Ttl,
    /// Name of the owning environment
    pub owner: String,
}

/// Failure to read the stamp back off a workload.
#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    /// A required key is absent
    #[error("workload is missing the `{0}` stamp")]
    Missing(&'static str),
    /// A key is present but does not parse
    #[error("workload carries a malformed `{0}` stamp")]
    Malformed(&'static str),
}

impl ExpiryMetadata {
    /// Creates a stamp for an environment accepted at `created_at`.
    pub fn new(owner: &str, ttl: Ttl, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            ttl,
            owner: owner.to_owned(),
        }
    }

    /// Annotation set carrying the timestamp and time-to-live.
    ///
    /// Annotations rather than labels because RFC 3339 timestamps contain
    /// characters that are not valid in label values.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            CREATED_AT_ANNOTATION.to_owned(),
            self.created_at.to_rfc3339(),
        );
        annotations.insert(TTL_ANNOTATION.to_owned(), self.ttl.as_str().to_owned());
        annotations
    }

    /// Label set carrying the owner reference.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_owned(), self.owner.clone());
        labels
    }

    /// Reads a stamp back from workload metadata.
    pub fn from_workload_metadata(
        annotations: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, MetadataError> {
        let created_at = annotations
            .get(CREATED_AT_ANNOTATION)
            .ok_or(MetadataError::Missing(CREATED_AT_ANNOTATION))?;
        let created_at = DateTime::parse_from_rfc3339(created_at)
            .map_err(|_| MetadataError::Malformed(CREATED_AT_ANNOTATION))?
            .with_timezone(&Utc);

        let ttl = annotations
            .get(TTL_ANNOTATION)
            .ok_or(MetadataError::Missing(TTL_ANNOTATION))?
            .parse::<Ttl>()
            .map_err(|_| MetadataError::Malformed(TTL_ANNOTATION))?;

        let owner = labels
            .get(OWNER_LABEL)
            .ok_or(MetadataError::Missing(OWNER_LABEL))?
            .clone();

        Ok(Self {
            created_at,
            ttl,
            owner,
        })
    }

    /// Instant after which the sweeper considers the environment expired.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = Duration::from_std(self.ttl.duration()).unwrap_or_else(|_| Duration::max_value());
        self.created_at + ttl
    }

    /// Whether the environment is expired relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExpiryMetadata {
        ExpiryMetadata::new("pr-42", "24h".parse().unwrap(), Utc::now())
    }

    #[test]
    fn stamp_round_trips() {
        let stamp = sample();
        let parsed =
            ExpiryMetadata::from_workload_metadata(&stamp.annotations(), &stamp.labels()).unwrap();

        assert_eq!(parsed.owner, "pr-42");
        assert_eq!(parsed.ttl.as_str(), "24h");
        // RFC 3339 keeps sub-second precision, so the timestamp survives exactly.
        assert_eq!(parsed.created_at, stamp.created_at);
    }

    #[test]
    fn missing_keys_are_reported() {
        let stamp = sample();

        let err =
            ExpiryMetadata::from_workload_metadata(&BTreeMap::new(), &stamp.labels()).unwrap_err();
        assert_eq!(err, MetadataError::Missing(CREATED_AT_ANNOTATION));

        let err = ExpiryMetadata::from_workload_metadata(&stamp.annotations(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err, MetadataError::Missing(OWNER_LABEL));
    }

    #[test]
    fn malformed_values_are_reported() {
        let stamp = sample();
        let mut annotations = stamp.annotations();
        annotations.insert(CREATED_AT_ANNOTATION.to_owned(), "yesterday".to_owned());

        let err =
            ExpiryMetadata::from_workload_metadata(&annotations, &stamp.labels()).unwrap_err();
        assert_eq!(err, MetadataError::Malformed(CREATED_AT_ANNOTATION));
    }

    #[test]
    fn expiry_is_created_at_plus_ttl() {
        let stamp = sample();

        assert!(!stamp.is_expired(stamp.created_at));
        assert!(!stamp.is_expired(stamp.created_at + Duration::hours(23)));
        assert!(stamp.is_expired(stamp.created_at + Duration::hours(25)));
    }
}

//! Failure taxonomy and classification.
//!
//! Every non-success outcome maps to exactly one [`FailureReason`]. Reasons are
//! aggregated per space and per customer into a [`FailureHistogram`] that is
//! persisted next to the progress rows, so triage does not need the logs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::MigrationError;
use crate::machine::{MigrationStep, VerificationReport};

/// Closed set of reasons an upload did not migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    UnknownError,
    AnalysisFailed,
    IndexGenerationFailed,
    LocationClaimFailed,
    GatewayAuthFailed,
    /// Space has no delegation chain to an account. Expected for legacy spaces.
    MissingDelegation,
    IndexMissing,
    LocationClaimsMissing,
    SpaceInfoMissing,
    VerificationFailed,
    /// Upload has neither shards nor an index. Unrecoverable.
    NoShardsNoIndex,
    /// Indexing service outage. The upload is skipped, not failed.
    #[serde(rename = "INDEXING_SERVICE_500")]
    IndexingService500,
}

impl FailureReason {
    pub const ALL: [FailureReason; 12] = [
        FailureReason::UnknownError,
        FailureReason::AnalysisFailed,
        FailureReason::IndexGenerationFailed,
        FailureReason::LocationClaimFailed,
        FailureReason::GatewayAuthFailed,
        FailureReason::MissingDelegation,
        FailureReason::IndexMissing,
        FailureReason::LocationClaimsMissing,
        FailureReason::SpaceInfoMissing,
        FailureReason::VerificationFailed,
        FailureReason::NoShardsNoIndex,
        FailureReason::IndexingService500,
    ];

    /// Stable upper-snake name, as stored in histograms.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownError => "UNKNOWN_ERROR",
            FailureReason::AnalysisFailed => "ANALYSIS_FAILED",
            FailureReason::IndexGenerationFailed => "INDEX_GENERATION_FAILED",
            FailureReason::LocationClaimFailed => "LOCATION_CLAIM_FAILED",
            FailureReason::GatewayAuthFailed => "GATEWAY_AUTH_FAILED",
            FailureReason::MissingDelegation => "MISSING_DELEGATION",
            FailureReason::IndexMissing => "INDEX_MISSING",
            FailureReason::LocationClaimsMissing => "LOCATION_CLAIMS_MISSING",
            FailureReason::SpaceInfoMissing => "SPACE_INFO_MISSING",
            FailureReason::VerificationFailed => "VERIFICATION_FAILED",
            FailureReason::NoShardsNoIndex => "NO_SHARDS_NO_INDEX",
            FailureReason::IndexingService500 => "INDEXING_SERVICE_500",
        }
    }

    /// Whether an outcome with this reason counts against the space.
    ///
    /// Indexing outages skip the upload so they don't poison the failure count.
    pub fn is_hard_failure(&self) -> bool {
        !matches!(self, FailureReason::IndexingService500)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error raised while `step` was executing.
pub fn classify_step_error(step: MigrationStep, err: &MigrationError) -> FailureReason {
    if err.is_indexing_outage() {
        return FailureReason::IndexingService500;
    }
    match step {
        MigrationStep::Analyze => FailureReason::AnalysisFailed,
        MigrationStep::IndexGeneration => FailureReason::IndexGenerationFailed,
        MigrationStep::LocationClaims => FailureReason::LocationClaimFailed,
        MigrationStep::GatewayAuth => FailureReason::GatewayAuthFailed,
        MigrationStep::Verify => FailureReason::VerificationFailed,
    }
}

/// Classify a failed verification, picking the most specific gap.
///
/// Returns `None` when the report passed.
pub fn classify_verification(report: &VerificationReport) -> Option<FailureReason> {
    if report.passed() {
        return None;
    }
    let reason = if !report.index_present {
        FailureReason::IndexMissing
    } else if !report.shards_without_location.is_empty() {
        FailureReason::LocationClaimsMissing
    } else if !report.shards_without_space.is_empty() {
        FailureReason::SpaceInfoMissing
    } else if report.gateway_skipped && report.gateway_required {
        FailureReason::MissingDelegation
    } else {
        FailureReason::VerificationFailed
    };
    Some(reason)
}

/// Reason → count, serialised as a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureHistogram(BTreeMap<FailureReason, u64>);

impl FailureHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of `reason`.
    pub fn record(&mut self, reason: FailureReason) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    /// Add every count of `other` into this histogram.
    pub fn merge(&mut self, other: &FailureHistogram) {
        for (reason, count) in &other.0 {
            *self.0.entry(*reason).or_insert(0) += count;
        }
    }

    /// Occurrences of `reason`; 0 when never recorded.
    pub fn count(&self, reason: FailureReason) -> u64 {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries sorted by count, largest first.
    pub fn ranked(&self) -> Vec<(FailureReason, u64)> {
        let mut entries: Vec<_> = self.0.iter().map(|(r, c)| (*r, *c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }

    /// Percentage of the histogram total taken by `reason`.
    pub fn percentage(&self, reason: FailureReason) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.count(reason) as f64 * 100.0 / total as f64
    }

    /// Serialize as a `{"REASON": count}` object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a persisted histogram. Free-text error fields yield `None`.
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> VerificationReport {
        VerificationReport {
            index_present: true,
            shards_without_location: vec![],
            shards_without_space: vec![],
            gateway_required: false,
            gateway_ok: true,
            gateway_skipped: false,
        }
    }

    #[test]
    fn test_every_step_error_is_classified() {
        let err = MigrationError::collaborator("op", "boom");
        let steps = [
            (MigrationStep::Analyze, FailureReason::AnalysisFailed),
            (MigrationStep::IndexGeneration, FailureReason::IndexGenerationFailed),
            (MigrationStep::LocationClaims, FailureReason::LocationClaimFailed),
            (MigrationStep::GatewayAuth, FailureReason::GatewayAuthFailed),
            (MigrationStep::Verify, FailureReason::VerificationFailed),
        ];
        for (step, expected) in steps {
            assert_eq!(classify_step_error(step, &err), expected);
        }
    }

    #[test]
    fn test_indexing_outage_wins_over_step() {
        let err = MigrationError::IndexingService {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(
            classify_step_error(MigrationStep::Analyze, &err),
            FailureReason::IndexingService500
        );
        assert!(!FailureReason::IndexingService500.is_hard_failure());
        assert!(FailureReason::MissingDelegation.is_hard_failure());
    }

    #[test]
    fn test_verification_specific_gaps() {
        assert_eq!(classify_verification(&report()), None);

        let mut r = report();
        r.index_present = false;
        r.shards_without_location = vec!["bag1".into()];
        assert_eq!(classify_verification(&r), Some(FailureReason::IndexMissing));

        let mut r = report();
        r.shards_without_location = vec!["bag1".into()];
        assert_eq!(
            classify_verification(&r),
            Some(FailureReason::LocationClaimsMissing)
        );

        let mut r = report();
        r.shards_without_space = vec!["bag1".into()];
        assert_eq!(classify_verification(&r), Some(FailureReason::SpaceInfoMissing));

        let mut r = report();
        r.gateway_required = true;
        r.gateway_ok = false;
        r.gateway_skipped = true;
        assert_eq!(
            classify_verification(&r),
            Some(FailureReason::MissingDelegation)
        );

        let mut r = report();
        r.gateway_required = true;
        r.gateway_ok = false;
        assert_eq!(
            classify_verification(&r),
            Some(FailureReason::VerificationFailed)
        );
    }

    #[test]
    fn test_histogram_json_uses_taxonomy_names() {
        let mut hist = FailureHistogram::new();
        hist.record(FailureReason::MissingDelegation);
        hist.record(FailureReason::MissingDelegation);
        hist.record(FailureReason::IndexingService500);

        let json = hist.to_json();
        assert!(json.contains("\"MISSING_DELEGATION\":2"));
        assert!(json.contains("\"INDEXING_SERVICE_500\":1"));

        let parsed = FailureHistogram::from_json(&json).unwrap();
        assert_eq!(parsed, hist);
        assert_eq!(parsed.total(), 3);
        assert!((parsed.percentage(FailureReason::MissingDelegation) - 66.666).abs() < 0.01);
        assert_eq!(parsed.ranked()[0], (FailureReason::MissingDelegation, 2));
        assert!(FailureHistogram::from_json("connection reset").is_none());
    }

    #[test]
    fn test_as_str_matches_serde_names() {
        for reason in FailureReason::ALL {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }
}

//! Position is how far consumption has progressed for one or more partitioned streams. Every
//! branch of the graph may report its own Position for the same partition, and those reports are
//! reconciled with [merge] before the source is asked to acknowledge anything.
//!
//! Reconciliation works on two axes:
//! - [Origin] decides first. An entry reported by a stage that already committed upstream beats
//!   one reported by a processing stage, which beats the one attached when the data was read.
//! - [MergePolicy] only breaks ties between entries of the same origin.
//!
//! ```text
//! (source) --{p:0@7 Source}--> (processor) --> (fast sink)  mark {p:0@7 Processing}
//!                                   |
//!                                   +--------> (slow sink)  mark {p:0@4 Processing}
//!
//! Lossless         => p:0@4
//! DuplicateAverse  => p:0@7
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Position for partitioned logs, a list of `(stream, partition) -> offset` entries.
mod log;
pub use log::{LogPosition, PartitionOffset};

/// Origin of a Position entry. The declaration order is the precedence order used while merging,
/// [Origin::Committer] being the strongest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    /// attached by the source when the envelope was read.
    #[default]
    Source,
    /// attached or overwritten by a downstream stage doing its own bookkeeping.
    Processing,
    /// already accepted by an upstream commit operation.
    Committer,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Source => write!(f, "source"),
            Origin::Processing => write!(f, "processing"),
            Origin::Committer => write!(f, "committer"),
        }
    }
}

/// Tie-break rule for two entries of the same key and the same [Origin].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MergePolicy {
    /// keep the lower offset, never skip unacknowledged data (favors re-delivery).
    #[default]
    Lossless,
    /// keep the higher offset, favors forward progress over avoiding duplicates.
    DuplicateAverse,
}

impl MergePolicy {
    /// Picks the winning offset of two same-origin entries.
    pub fn pick(self, incoming: i64, base: i64) -> i64 {
        match self {
            MergePolicy::Lossless => incoming.min(base),
            MergePolicy::DuplicateAverse => incoming.max(base),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Lossless => write!(f, "lossless"),
            MergePolicy::DuplicateAverse => write!(f, "duplicate-averse"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lossless" => Ok(MergePolicy::Lossless),
            "duplicate-averse" | "duplicateaverse" | "dupless" => Ok(MergePolicy::DuplicateAverse),
            other => Err(Error::Config(format!(
                "unknown merge policy {other:?}, expected one of lossless, duplicate-averse"
            ))),
        }
    }
}

/// A Position is opaque to the runtime. Adapters pick the concrete entry representation; the
/// runtime only merges contributions and hands the result back to the source on commit.
pub trait Position: Clone + fmt::Debug + Send + Sync + 'static {
    /// Merges `self` (the incoming contribution) over `base`. An absent `base` is the identity.
    ///
    /// Implementations must keep at most one entry per key, give [Origin] absolute precedence,
    /// use `policy` only between same-origin entries, and order the result as: entries only in
    /// `base` (in `base` order) followed by the entries of `self` (in `self` order).
    fn merge(&self, base: Option<&Self>, policy: MergePolicy) -> Self;

    /// Re-tags every entry with `origin`.
    fn with_origin(self, origin: Origin) -> Self;

    /// Whether the Position carries no entry at all.
    fn is_empty(&self) -> bool;
}

/// Merges two optional Positions. Absent operands are the identity element on either side.
pub fn merge<P: Position>(incoming: Option<&P>, base: Option<&P>, policy: MergePolicy) -> Option<P> {
    match (incoming, base) {
        (Some(incoming), base) => Some(incoming.merge(base, policy)),
        (None, Some(base)) => Some(base.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_precedence_order() {
        assert!(Origin::Committer > Origin::Processing);
        assert!(Origin::Processing > Origin::Source);
        assert_eq!(Origin::default(), Origin::Source);
    }

    #[test]
    fn test_merge_policy_pick() {
        assert_eq!(MergePolicy::Lossless.pick(3, 2), 2);
        assert_eq!(MergePolicy::DuplicateAverse.pick(3, 2), 3);
        assert_eq!(MergePolicy::default(), MergePolicy::Lossless);
    }

    #[test]
    fn test_merge_policy_from_str() {
        assert_eq!(
            "Lossless".parse::<MergePolicy>().unwrap(),
            MergePolicy::Lossless
        );
        assert_eq!(
            "duplicate-averse".parse::<MergePolicy>().unwrap(),
            MergePolicy::DuplicateAverse
        );
        assert_eq!(
            " dupless ".parse::<MergePolicy>().unwrap(),
            MergePolicy::DuplicateAverse
        );

        let err = "newest".parse::<MergePolicy>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_merge_absent_operands() {
        let p = LogPosition::single("t", 0, 5, Origin::Source);

        assert_eq!(
            merge(Some(&p), None, MergePolicy::Lossless),
            Some(p.clone())
        );
        assert_eq!(
            merge(None, Some(&p), MergePolicy::DuplicateAverse),
            Some(p.clone())
        );
        assert_eq!(merge::<LogPosition>(None, None, MergePolicy::Lossless), None);
    }
}

use std::fmt;
use std::hash::{Hash, Hasher};

use tokio_postgres::types::PgLsn;

/// A position in the replication log.
///
/// Offsets are totally ordered. The maximum representable offset doubles as
/// the "no stopping" sentinel used as the ending offset of a streaming split
/// that tails the log indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogOffset(PgLsn);

// PgLsn implements Ord but not Hash, so hash the raw u64 form
impl Hash for LogOffset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        u64::from(self.0).hash(state);
    }
}

impl LogOffset {
    pub fn new(lsn: PgLsn) -> LogOffset {
        LogOffset(lsn)
    }

    /// The open upper bound of a live streaming split.
    pub fn no_stopping() -> LogOffset {
        LogOffset(PgLsn::from(u64::MAX))
    }

    pub fn is_no_stopping(&self) -> bool {
        u64::from(self.0) == u64::MAX
    }

    pub fn lsn(&self) -> PgLsn {
        self.0
    }
}

impl From<PgLsn> for LogOffset {
    fn from(lsn: PgLsn) -> LogOffset {
        LogOffset(lsn)
    }
}

impl From<u64> for LogOffset {
    fn from(value: u64) -> LogOffset {
        LogOffset(PgLsn::from(value))
    }
}

impl From<LogOffset> for u64 {
    fn from(offset: LogOffset) -> u64 {
        offset.0.into()
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

use serde::Serialize;

/// UNIX timestamp in whole seconds.
pub type UnixTime = i64;

/// Mutable failure state for one identity. Owned by the registry; callers
/// only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailRecord {
    pub identity: String,
    pub retry_count: u32,
    pub last_reset_time: UnixTime,
    pub last_failure_time: UnixTime,
    pub matched_lines: Vec<String>,
}

impl FailRecord {
    pub(crate) fn new(identity: String, timestamp: UnixTime, lines: Vec<String>) -> Self {
        let mut record = Self {
            identity,
            retry_count: 0,
            last_reset_time: timestamp,
            last_failure_time: timestamp,
            matched_lines: Vec::new(),
        };
        record.inc(lines);
        record
    }

    /// Add one batch of matched lines to the count
    pub(crate) fn inc(&mut self, lines: Vec<String>) {
        self.retry_count = self.retry_count.saturating_add(lines.len() as u32);
        self.matched_lines.extend(lines);
    }

    /// Discard accumulated failures and start a new window at `timestamp`
    pub(crate) fn reset(&mut self, timestamp: UnixTime) {
        self.retry_count = 0;
        self.matched_lines.clear();
        self.last_reset_time = timestamp;
    }

    pub(crate) fn into_ticket(self) -> FailTicket {
        FailTicket {
            identity: self.identity,
            timestamp: self.last_failure_time,
            attempt_count: self.retry_count,
            matched_lines: self.matched_lines,
        }
    }
}

/// A qualified ban candidate handed to the ban-execution side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailTicket {
    identity: String,
    timestamp: UnixTime,
    attempt_count: u32,
    matched_lines: Vec<String>,
}

impl FailTicket {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Time of the last contributing failure
    pub fn timestamp(&self) -> UnixTime {
        self.timestamp
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn matched_lines(&self) -> &[String] {
        &self.matched_lines
    }
}

impl std::fmt::Display for FailTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} attempts, last at {})",
            self.identity, self.attempt_count, self.timestamp
        )
    }
}

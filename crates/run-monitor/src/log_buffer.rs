use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub sequence_no: u64,
    #[serde(serialize_with = "serialize_time")]
    pub received_at: SystemTime,
    pub text: String,
}

impl LogEntry {
    pub fn received_at_rfc3339(&self) -> String {
        humantime::format_rfc3339_millis(self.received_at).to_string()
    }
}

/// Append-only log of one run in receipt order. Sequence numbers are local
/// and start at 1; redelivered lines are kept as separate entries.
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: Vec<LogEntry>,
    next_sequence: u64,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, text: impl Into<String>) -> LogEntry {
        self.next_sequence += 1;
        let entry = LogEntry {
            sequence_no: self.next_sequence,
            received_at: SystemTime::now(),
            text: text.into(),
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries appended after `sequence_no`.
    pub fn since(&self, sequence_no: u64) -> &[LogEntry] {
        let start = self
            .entries
            .partition_point(|entry| entry.sequence_no <= sequence_no);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all entries. Numbering restarts so a fresh run begins at 1.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_sequence = 0;
    }
}

fn serialize_time<S: serde::Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_rfc3339_millis(*time))
}

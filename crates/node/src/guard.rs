use cellsync_protocol::{content_hash, AlertNotice, ChunkRecord};

/// Outcome of checking an incoming STORE on a Guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject { actual_hash: String, alert: AlertNotice },
}

/// Recomputes the payload hash and compares it with the declared one.
/// A mismatch produces the alert naming `sender` as the culprit.
pub fn inspect(record: &ChunkRecord, sender: u16) -> Verdict {
    let actual_hash = content_hash(&record.data);
    if actual_hash == record.hash {
        return Verdict::Accept;
    }
    Verdict::Reject {
        actual_hash,
        alert: AlertNotice {
            culprit: sender,
            chunk: record.id.clone(),
        },
    }
}

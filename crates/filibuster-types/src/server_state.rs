use std::collections::BTreeSet;

use crate::request::RequestLogEntry;

/// Mutable state scoped to a single test execution.
///
/// Created fresh at the start of each iteration and discarded at the end;
/// the request log is append-only and `generated_id`s are issued densely
/// from 0 in arrival order, which is a total order consistent with the
/// vector-clock partial order.
#[derive(Debug, Default)]
pub struct ServerState {
    pub service_request_log: Vec<RequestLogEntry>,
    seen_first_request_from: BTreeSet<String>,
    next_generated_id: u64,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next dense id and append the entry under it.
    pub fn append(&mut self, mut entry: RequestLogEntry) -> u64 {
        let generated_id = self.next_generated_id;
        self.next_generated_id += 1;
        entry.generated_id = generated_id;
        self.service_request_log.push(entry);
        generated_id
    }

    /// First sighting of `service` during this execution returns true and
    /// marks it seen. Services poll this to learn a new execution has
    /// begun and reset their local clock and index maps.
    pub fn first_request_from(&mut self, service: &str) -> bool {
        self.seen_first_request_from.insert(service.to_string())
    }

    pub fn entry(&self, generated_id: u64) -> Option<&RequestLogEntry> {
        self.service_request_log
            .iter()
            .find(|entry| entry.generated_id == generated_id)
    }

    pub fn entry_mut(&mut self, generated_id: u64) -> Option<&mut RequestLogEntry> {
        self.service_request_log
            .iter_mut()
            .find(|entry| entry.generated_id == generated_id)
    }

    /// The deepest call observed so far, if any.
    pub fn last_entry(&self) -> Option<&RequestLogEntry> {
        self.service_request_log.last()
    }

    pub fn len(&self) -> usize {
        self.service_request_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.service_request_log.is_empty()
    }
}

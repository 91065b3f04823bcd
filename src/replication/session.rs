//! Copy session state

use crate::storage::CompletedPart;

/// Lifecycle of one chunked copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    NotStarted,
    /// The store issued an upload ID; no parts yet
    SessionOpen,
    /// `n` parts accepted by the store so far
    PartsInFlight(u32),
    Completed,
    Aborted,
}

impl CopyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CopyState::Completed | CopyState::Aborted)
    }
}

/// State owned by a single replication call
#[derive(Debug)]
pub(crate) struct CopySession {
    destination: String,
    upload_id: Option<String>,
    state: CopyState,
    parts: Vec<CompletedPart>,
}

impl CopySession {
    pub(crate) fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            upload_id: None,
            state: CopyState::NotStarted,
            parts: Vec::new(),
        }
    }

    pub(crate) fn open(&mut self, upload_id: String) {
        debug_assert_eq!(self.state, CopyState::NotStarted);
        self.upload_id = Some(upload_id);
        self.state = CopyState::SessionOpen;
    }

    pub(crate) fn record(&mut self, part: CompletedPart) {
        debug_assert!(self.upload_id.is_some() && !self.state.is_terminal());
        self.parts.push(part);
        self.state = CopyState::PartsInFlight(self.parts.len() as u32);
    }

    /// Accepted parts, sorted ascending by part number
    pub(crate) fn completion_list(&mut self) -> &[CompletedPart] {
        self.parts.sort_by_key(|part| part.part_number);
        &self.parts
    }

    pub(crate) fn mark_completed(&mut self) {
        self.state = CopyState::Completed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = CopyState::Aborted;
    }

    pub(crate) fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub(crate) fn state(&self) -> CopyState {
        self.state
    }

    pub(crate) fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }
}

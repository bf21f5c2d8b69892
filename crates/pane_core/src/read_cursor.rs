use shared::domain::MessageId;

/// Per-channel read position, reconciled with the server on a timer.
#[derive(Debug)]
pub struct ReadCursor {
    last_read_id: Option<MessageId>,
    /// Last id acknowledged to the server; advanced optimistically when a
    /// receipt goes out.
    last_reported_id: Option<MessageId>,
    reporting_enabled: bool,
}

/// Decision for one timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTick {
    /// Issue a read receipt for this id.
    Report(MessageId),
    /// Nothing new locally but the external unread counter disagrees;
    /// request a corrective resync of that counter.
    Resync,
    Idle,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self {
            last_read_id: None,
            last_reported_id: None,
            reporting_enabled: true,
        }
    }

    /// Adopt the externally tracked cursor on channel open. The adopted id
    /// counts as already reported so the loop does not re-ack old state.
    pub fn adopt(&mut self, last_read: Option<MessageId>) {
        self.last_read_id = last_read;
        self.last_reported_id = last_read;
    }

    pub fn last_read_id(&self) -> Option<MessageId> {
        self.last_read_id
    }

    pub fn last_reported_id(&self) -> Option<MessageId> {
        self.last_reported_id
    }

    /// Decide what this tick should do. Pure: callers apply the decision
    /// and feed back the result via [`ReadCursor::note_reported`] or
    /// [`ReadCursor::disable_reporting`].
    pub fn tick(&self, newest: Option<MessageId>, focused: bool, external_unread: u64) -> ReadTick {
        if !self.reporting_enabled {
            return ReadTick::Idle;
        }
        let unreported = match (newest, self.last_reported_id) {
            (Some(id), Some(reported)) => (id > reported).then_some(id),
            (Some(id), None) => Some(id),
            (None, _) => None,
        };
        match unreported {
            None => {
                if external_unread > 0 {
                    // Tracking drift: the two counters are eventually
                    // consistent, never merged.
                    ReadTick::Resync
                } else {
                    ReadTick::Idle
                }
            }
            Some(id) if focused => ReadTick::Report(id),
            Some(_) => ReadTick::Idle,
        }
    }

    /// Advance the cursor optimistically when a receipt is issued.
    pub fn note_reported(&mut self, id: MessageId) {
        self.last_reported_id = Some(id);
        self.last_read_id = Some(id);
    }

    /// Receipt failure: stop automatic reporting for the rest of the
    /// session. The cursor itself is not reverted.
    pub fn disable_reporting(&mut self) {
        self.reporting_enabled = false;
    }

    pub fn reporting_enabled(&self) -> bool {
        self.reporting_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_newer_message_when_focused() {
        let mut cursor = ReadCursor::new();
        cursor.adopt(Some(MessageId(10)));
        assert_eq!(
            cursor.tick(Some(MessageId(12)), true, 0),
            ReadTick::Report(MessageId(12))
        );
    }

    #[test]
    fn holds_receipt_while_unfocused() {
        let cursor = ReadCursor::new();
        assert_eq!(cursor.tick(Some(MessageId(12)), false, 0), ReadTick::Idle);
    }

    #[test]
    fn already_reported_id_is_idle() {
        let mut cursor = ReadCursor::new();
        cursor.note_reported(MessageId(12));
        assert_eq!(cursor.tick(Some(MessageId(12)), true, 0), ReadTick::Idle);
        assert_eq!(cursor.tick(Some(MessageId(11)), true, 0), ReadTick::Idle);
    }

    #[test]
    fn drifted_external_counter_requests_resync() {
        let mut cursor = ReadCursor::new();
        cursor.adopt(Some(MessageId(12)));
        assert_eq!(cursor.tick(Some(MessageId(12)), true, 3), ReadTick::Resync);
        assert_eq!(cursor.tick(None, false, 3), ReadTick::Resync);
    }

    #[test]
    fn disabled_reporting_goes_quiet() {
        let mut cursor = ReadCursor::new();
        cursor.disable_reporting();
        assert_eq!(cursor.tick(Some(MessageId(99)), true, 5), ReadTick::Idle);
    }

    #[test]
    fn cursor_is_not_reverted_by_failure() {
        let mut cursor = ReadCursor::new();
        cursor.note_reported(MessageId(42));
        cursor.disable_reporting();
        assert_eq!(cursor.last_reported_id(), Some(MessageId(42)));
    }
}

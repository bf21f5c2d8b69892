use shared::domain::{CorrelationKey, MessageId};

/// Composer-side session state: the correlation-key allocator, the
/// one-send-at-a-time guard, and the reply/edit targets that reset after
/// every completed send.
#[derive(Debug, Default)]
pub struct ComposeState {
    next_correlation_key: u64,
    sending: bool,
    reply_to: Option<MessageId>,
    editing: Option<MessageId>,
}

impl ComposeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation key; keys are monotonic and never
    /// reused within a session.
    pub fn allocate_key(&mut self) -> CorrelationKey {
        self.next_correlation_key += 1;
        CorrelationKey(self.next_correlation_key)
    }

    /// Claim the send slot; `false` while another send is in flight.
    pub fn begin_send(&mut self) -> bool {
        if self.sending {
            return false;
        }
        self.sending = true;
        true
    }

    pub fn finish_send(&mut self) {
        self.sending = false;
    }

    pub fn set_reply_to(&mut self, target: Option<MessageId>) {
        if target.is_some() {
            self.editing = None;
        }
        self.reply_to = target;
    }

    pub fn reply_to(&self) -> Option<MessageId> {
        self.reply_to
    }

    pub fn start_editing(&mut self, target: MessageId) {
        self.editing = Some(target);
        self.reply_to = None;
    }

    pub fn editing(&self) -> Option<MessageId> {
        self.editing
    }

    pub fn cancel_editing(&mut self) {
        self.editing = None;
    }

    /// Clear reply/edit targets once a send or edit request went out.
    pub fn reset_after_send(&mut self) {
        self.reply_to = None;
        self.editing = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_keys_are_monotonic_and_unique() {
        let mut compose = ComposeState::new();
        let a = compose.allocate_key();
        let b = compose.allocate_key();
        assert!(b > a);
    }

    #[test]
    fn send_slot_is_exclusive() {
        let mut compose = ComposeState::new();
        assert!(compose.begin_send());
        assert!(!compose.begin_send());
        compose.finish_send();
        assert!(compose.begin_send());
    }

    #[test]
    fn reply_target_clears_editing_and_resets_after_send() {
        let mut compose = ComposeState::new();
        compose.start_editing(MessageId(4));
        compose.set_reply_to(Some(MessageId(9)));
        assert_eq!(compose.editing(), None);
        assert_eq!(compose.reply_to(), Some(MessageId(9)));

        compose.reset_after_send();
        assert_eq!(compose.reply_to(), None);
    }
}

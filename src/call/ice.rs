use crate::media::CandidatePayload;

/// Gate between the counterpart's append-only candidate list and the peer
/// connection. Candidates observed before the remote description is applied
/// are held back; once the gate opens they drain in list order and every
/// later observation passes straight through. Each list position is handed
/// out at most once.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    consumed: usize,
    pending: Vec<CandidatePayload>,
    ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer whose gate is already open, for the side that applies the
    /// remote description before it can observe any candidates.
    pub fn ready() -> Self {
        Self {
            consumed: 0,
            pending: Vec::new(),
            ready: true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Feed the latest full remote candidate list. Returns the candidates
    /// that should be applied now; unseen entries stay queued while the
    /// gate is closed.
    pub fn observe(&mut self, remote: &[CandidatePayload]) -> Vec<CandidatePayload> {
        if remote.len() <= self.consumed {
            return Vec::new();
        }
        let fresh: Vec<CandidatePayload> = remote[self.consumed..].to_vec();
        self.consumed = remote.len();
        if self.ready {
            fresh
        } else {
            self.pending.extend(fresh);
            Vec::new()
        }
    }

    /// Single-candidate variant for the local direction, where candidates
    /// trickle in one at a time from the peer connection.
    pub fn push(&mut self, candidate: CandidatePayload) -> Option<CandidatePayload> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Open the gate. Returns everything queued so far, in observation
    /// order.
    pub fn mark_ready(&mut self) -> Vec<CandidatePayload> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn holds_candidates_until_ready() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.observe(&[json!("a"), json!("b")]).is_empty());
        assert!(buffer.observe(&[json!("a"), json!("b"), json!("c")]).is_empty());
        assert_eq!(
            buffer.mark_ready(),
            vec![json!("a"), json!("b"), json!("c")]
        );
    }

    #[test]
    fn passes_through_after_ready() {
        let mut buffer = CandidateBuffer::new();
        buffer.observe(&[json!("a")]);
        assert_eq!(buffer.mark_ready(), vec![json!("a")]);
        assert_eq!(
            buffer.observe(&[json!("a"), json!("b")]),
            vec![json!("b")]
        );
    }

    #[test]
    fn never_replays_a_position() {
        let mut buffer = CandidateBuffer::ready();
        assert_eq!(buffer.observe(&[json!("a")]), vec![json!("a")]);
        assert!(buffer.observe(&[json!("a")]).is_empty());
        // A shorter list than already consumed yields nothing either.
        assert!(buffer.observe(&[]).is_empty());
    }

    #[test]
    fn push_queues_until_ready() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.push(json!("a")).is_none());
        assert_eq!(buffer.mark_ready(), vec![json!("a")]);
        assert_eq!(buffer.push(json!("b")), Some(json!("b")));
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let mut buffer = CandidateBuffer::new();
        buffer.observe(&[json!("a")]);
        assert_eq!(buffer.mark_ready(), vec![json!("a")]);
        assert!(buffer.mark_ready().is_empty());
    }
}

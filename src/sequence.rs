use candle_core::Tensor;

/// Identifier correlating one sequence group across pipeline stages.
pub type SequenceId = u64;

/// Lifecycle of a sequence group within a stage.
///
/// `Inbound -> Admitted -> Ready -> Running -> Completed`; transitions only
/// move forward. On the first stage, admission moves inbound work straight to
/// ready; on later stages a group becomes ready when its activation arrives
/// from the previous stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Inbound,
    Admitted,
    Ready,
    Running,
    Completed,
}

/// Per-sequence-group bookkeeping carried between steps.
#[derive(Debug, Clone)]
pub struct SequenceGroupMeta {
    pub sequence_id: SequenceId,
    /// Decode step counter; 0 is the prompt step.
    pub step: usize,
    pub past_seq_len: usize,
    pub input_seq_len: usize,
    /// Cache slot assigned to this group on the local stage.
    pub slot: usize,
    /// Hidden states received from the previous stage, when any.
    pub activation: Option<Tensor>,
    pub status: SequenceStatus,
    /// Token ids for the pending step (empty on non-first stages).
    pub token_ids: Vec<u32>,
}

impl SequenceGroupMeta {
    pub fn new(sequence_id: SequenceId, token_ids: Vec<u32>, slot: usize) -> Self {
        Self {
            sequence_id,
            step: 0,
            past_seq_len: 0,
            input_seq_len: token_ids.len(),
            slot,
            activation: None,
            status: SequenceStatus::Inbound,
            token_ids,
        }
    }

    pub fn is_prompt(&self) -> bool {
        self.step == 0
    }

    /// Advance bookkeeping after a completed step: the emitted token becomes
    /// the next step's single-token input.
    pub fn advance(&mut self, next_token: u32) {
        self.past_seq_len += self.input_seq_len;
        self.input_seq_len = 1;
        self.token_ids = vec![next_token];
        self.step += 1;
    }
}

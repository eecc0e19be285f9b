//! Per-link block state machine.

use bn_primitives::encoding::{DecodeError, Decoder, Encoder};

/// Validation progress of the block at a header link. States advance left to
/// right; a reorganization may re-enter `BlockValid` after a pop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockState {
    /// Header archived, no body yet.
    Unassociated,
    /// Body associated, not yet validated.
    Unvalidated,
    /// Context validated; carries the block fees for confirmation.
    BlockValid { fees: u64 },
    /// Confirmation check passed.
    BlockConfirmable,
    /// Failed validation or confirmation. Terminal for the branch.
    BlockUnconfirmable,
}

const TAG_UNASSOCIATED: u8 = 0;
const TAG_UNVALIDATED: u8 = 1;
const TAG_BLOCK_VALID: u8 = 2;
const TAG_BLOCK_CONFIRMABLE: u8 = 3;
const TAG_BLOCK_UNCONFIRMABLE: u8 = 4;

const FLAG_STRONG: u8 = 1 << 0;

/// State tag plus the strong flag, as persisted per link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StateEntry {
    pub state: BlockState,
    pub strong: bool,
}

impl StateEntry {
    pub fn new(state: BlockState) -> Self {
        Self {
            state,
            strong: false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(10);
        let (tag, fees) = match self.state {
            BlockState::Unassociated => (TAG_UNASSOCIATED, 0),
            BlockState::Unvalidated => (TAG_UNVALIDATED, 0),
            BlockState::BlockValid { fees } => (TAG_BLOCK_VALID, fees),
            BlockState::BlockConfirmable => (TAG_BLOCK_CONFIRMABLE, 0),
            BlockState::BlockUnconfirmable => (TAG_BLOCK_UNCONFIRMABLE, 0),
        };
        encoder.write_u8(tag);
        encoder.write_u8(if self.strong { FLAG_STRONG } else { 0 });
        encoder.write_u64_le(fees);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.read_u8()?;
        let flags = decoder.read_u8()?;
        let fees = decoder.read_u64_le()?;
        let state = match tag {
            TAG_UNASSOCIATED => BlockState::Unassociated,
            TAG_UNVALIDATED => BlockState::Unvalidated,
            TAG_BLOCK_VALID => BlockState::BlockValid { fees },
            TAG_BLOCK_CONFIRMABLE => BlockState::BlockConfirmable,
            TAG_BLOCK_UNCONFIRMABLE => BlockState::BlockUnconfirmable,
            _ => return Err(DecodeError::InvalidData("unknown block state tag")),
        };
        Ok(Self {
            state,
            strong: (flags & FLAG_STRONG) != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let states = [
            BlockState::Unassociated,
            BlockState::Unvalidated,
            BlockState::BlockValid { fees: 12_345 },
            BlockState::BlockConfirmable,
            BlockState::BlockUnconfirmable,
        ];
        for state in states {
            for strong in [false, true] {
                let entry = StateEntry { state, strong };
                assert_eq!(StateEntry::decode(&entry.encode()).expect("decode"), entry);
            }
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut bytes = StateEntry::new(BlockState::Unvalidated).encode();
        bytes[0] = 0x7f;
        assert!(StateEntry::decode(&bytes).is_err());
    }
}

//! Session demuxer
//!
//! One transport carries both channels; consumers claim disjoint opcode
//! sets and each sees only its own subsequence of the packet stream.

use std::collections::VecDeque;

use crate::{OpCode, ProtocolError, Result, SessionPacket};

/// Handle identifying a registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerId(usize);

struct Consumer {
    opcodes: Vec<OpCode>,
    queue: VecDeque<SessionPacket>,
}

/// Routes incoming session packets to per-consumer queues by opcode
#[derive(Default)]
pub struct SessionDemux {
    consumers: Vec<Consumer>,
}

impl SessionDemux {
    /// Create an empty demuxer
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a set of opcodes
    ///
    /// Fails with `OpcodeAlreadyRegistered` if any is already claimed.
    pub fn register(&mut self, opcodes: &[OpCode]) -> Result<ConsumerId> {
        for opcode in opcodes {
            if self.consumers.iter().any(|c| c.opcodes.contains(opcode)) {
                return Err(ProtocolError::OpcodeAlreadyRegistered(*opcode));
            }
        }
        self.consumers.push(Consumer {
            opcodes: opcodes.to_vec(),
            queue: VecDeque::new(),
        });
        Ok(ConsumerId(self.consumers.len() - 1))
    }

    /// Route one packet to its consumer's queue
    ///
    /// A packet whose opcode nobody claimed is an `UnknownOpcode` error.
    pub fn dispatch(&mut self, packet: SessionPacket) -> Result<()> {
        let opcode = packet.opcode();
        match self
            .consumers
            .iter_mut()
            .find(|c| c.opcodes.contains(&opcode))
        {
            Some(consumer) => {
                consumer.queue.push_back(packet);
                Ok(())
            }
            None => Err(ProtocolError::UnknownOpcode(opcode as u8)),
        }
    }

    /// Pop the next packet queued for a consumer
    pub fn pop(&mut self, id: ConsumerId) -> Option<SessionPacket> {
        self.consumers.get_mut(id.0)?.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ControlHeader, DataHeader, SessionPacketHeader};
    use crate::KeyId;
    use bytes::Bytes;

    fn control_packet(opcode: OpCode, marker: u8) -> SessionPacket {
        SessionPacket {
            header: SessionPacketHeader::Control(ControlHeader {
                opcode,
                key_id: KeyId::new(0),
                session_id: [0; 8],
                acks: vec![],
                remote_session_id: None,
                message_id: Some(0),
            }),
            payload: Bytes::copy_from_slice(&[marker]),
        }
    }

    fn data_packet(marker: u8) -> SessionPacket {
        SessionPacket {
            header: SessionPacketHeader::Data(DataHeader {
                opcode: OpCode::DataV2,
                key_id: KeyId::new(0),
                peer_id: Some(1),
            }),
            payload: Bytes::copy_from_slice(&[marker]),
        }
    }

    #[test]
    fn test_consumers_see_only_their_subsequence() {
        let mut demux = SessionDemux::new();
        let control = demux
            .register(&[OpCode::ControlV1, OpCode::AckV1, OpCode::HardResetServerV2])
            .unwrap();
        let data = demux.register(&[OpCode::DataV1, OpCode::DataV2]).unwrap();

        demux.dispatch(control_packet(OpCode::ControlV1, 1)).unwrap();
        demux.dispatch(data_packet(2)).unwrap();
        demux.dispatch(control_packet(OpCode::AckV1, 3)).unwrap();
        demux.dispatch(data_packet(4)).unwrap();

        let control_seen: Vec<u8> = std::iter::from_fn(|| demux.pop(control))
            .map(|p| p.payload[0])
            .collect();
        let data_seen: Vec<u8> = std::iter::from_fn(|| demux.pop(data))
            .map(|p| p.payload[0])
            .collect();

        assert_eq!(control_seen, vec![1, 3]);
        assert_eq!(data_seen, vec![2, 4]);
    }

    #[test]
    fn test_double_registration_fails() {
        let mut demux = SessionDemux::new();
        demux.register(&[OpCode::ControlV1]).unwrap();
        assert!(matches!(
            demux.register(&[OpCode::AckV1, OpCode::ControlV1]),
            Err(ProtocolError::OpcodeAlreadyRegistered(OpCode::ControlV1))
        ));
    }

    #[test]
    fn test_unclaimed_opcode_is_error() {
        let mut demux = SessionDemux::new();
        demux.register(&[OpCode::ControlV1]).unwrap();
        assert!(matches!(
            demux.dispatch(data_packet(1)),
            Err(ProtocolError::UnknownOpcode(9))
        ));
    }
}

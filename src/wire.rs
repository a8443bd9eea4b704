//! # Wire Messages and Immediate-Data Encoding
//!
//! Bit-exact message layouts and the 32-bit RDMA-write immediate-data
//! encoding from spec.md §6. Endianness matches the host (multi-host
//! deployments are assumed same-endian, per spec.md); all integers are
//! encoded with `to_ne_bytes`/`from_ne_bytes` rather than a portable
//! serialization format, since the wire format here is a fixed,
//! hand-rolled layout rather than a `serde`-driven one — the same reason
//! the teacher's own `Message::to_bytes` reaches for a fixed encoder
//! (there, `bincode`) instead of hand parsing, except here the layout
//! itself is part of the specification and must match exactly, which
//! rules out a self-describing format.

use crate::error::TransportError;

/// Upper bound on rails per endpoint, bounded by the 4-bit segment-count
/// field in the RDMA-write immediate (see [`SEG_BITS`]) and chosen large
/// enough for any realistic multi-NIC host (SPEC_FULL.md §2.1).
pub const MAX_RAILS: usize = 16;

/// Fixed-width encoding of a fabric endpoint address/name.
pub const MAX_ENDPOINT_NAME: usize = 64;

/// Upper bound on the scatter-array receive API (spec.md §4.7); the RDMA
/// core itself only ever handles `n == 1`.
pub const MAX_RECVS: usize = 4;

pub const SEQ_BITS: u32 = 10;
pub const COMM_BITS: u32 = 18;
pub const SEG_BITS: u32 = 4;

pub const SEQ_MASK: u32 = (1 << SEQ_BITS) - 1;
pub const COMM_MASK: u32 = (1 << COMM_BITS) - 1;
pub const SEG_MASK: u32 = (1 << SEG_BITS) - 1;

/// Maximum value of a 10-bit sequence number / size of the sequence space
/// (spec.md §3: "sequence numbers are consumed ... modulo 2^10").
pub const SEQ_SPACE: u32 = 1 << SEQ_BITS;

/// Pack `(comm_id, seq, num_segments)` into a 32-bit RDMA-write immediate:
/// `[4-bit segments | 18-bit comm-id | 10-bit seq-num]`, LSB = seq-num.
pub fn encode_write_immediate(comm_id: u32, seq: u16, num_segments: u8) -> u32 {
    let comm_id = comm_id & COMM_MASK;
    let seq = seq as u32 & SEQ_MASK;
    let segs = num_segments as u32 & SEG_MASK;
    (segs << (SEQ_BITS + COMM_BITS)) | (comm_id << SEQ_BITS) | seq
}

/// Inverse of [`encode_write_immediate`]: `(comm_id, seq, num_segments)`.
pub fn decode_write_immediate(imm: u32) -> (u32, u16, u8) {
    let seq = (imm & SEQ_MASK) as u16;
    let comm_id = (imm >> SEQ_BITS) & COMM_MASK;
    let segs = ((imm >> (SEQ_BITS + COMM_BITS)) & SEG_MASK) as u8;
    (comm_id, seq, segs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageTag {
    Conn = 0,
    ConnResp = 1,
    Ctrl = 2,
}

impl MessageTag {
    fn from_u16(v: u16) -> Result<Self, TransportError> {
        match v {
            0 => Ok(MessageTag::Conn),
            1 => Ok(MessageTag::ConnResp),
            2 => Ok(MessageTag::Ctrl),
            other => Err(TransportError::Protocol(format!(
                "unrecognized wire message tag {other}"
            ))),
        }
    }
}

/// Fixed-width endpoint address, as handed to a remote peer during the
/// handshake and resolved locally via the fabric's address-vector insert.
pub type EndpointName = [u8; MAX_ENDPOINT_NAME];

fn empty_name() -> EndpointName {
    [0u8; MAX_ENDPOINT_NAME]
}

/// `CONN` / `CONN_RESP` — identical layout, distinguished by `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMessage {
    pub tag: MessageTag,
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub num_rails: u16,
    pub endpoint_names: [EndpointName; MAX_RAILS],
}

impl ConnMessage {
    pub fn new(
        tag: MessageTag,
        local_comm_id: u32,
        remote_comm_id: u32,
        names: &[EndpointName],
    ) -> Result<Self, TransportError> {
        if names.len() > MAX_RAILS {
            return Err(TransportError::InvalidArgument(format!(
                "num_rails {} exceeds MAX_RAILS {MAX_RAILS}",
                names.len()
            )));
        }
        let mut endpoint_names = [empty_name(); MAX_RAILS];
        endpoint_names[..names.len()].copy_from_slice(names);
        Ok(Self {
            tag,
            local_comm_id,
            remote_comm_id,
            num_rails: names.len() as u16,
            endpoint_names,
        })
    }

    pub const WIRE_SIZE: usize = 2 + 2 + 4 + 4 + 2 + 2 + MAX_RAILS * MAX_ENDPOINT_NAME;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&(self.tag as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // pad
        buf.extend_from_slice(&self.local_comm_id.to_ne_bytes());
        buf.extend_from_slice(&self.remote_comm_id.to_ne_bytes());
        buf.extend_from_slice(&self.num_rails.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // pad
        for name in &self.endpoint_names {
            buf.extend_from_slice(name);
        }
        debug_assert_eq!(buf.len(), Self::WIRE_SIZE);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(TransportError::Protocol("truncated CONN message".into()));
        }
        let tag = MessageTag::from_u16(u16::from_ne_bytes(bytes[0..2].try_into().unwrap()))?;
        let local_comm_id = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        let remote_comm_id = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
        let num_rails = u16::from_ne_bytes(bytes[12..14].try_into().unwrap());
        if num_rails as usize > MAX_RAILS {
            return Err(TransportError::Protocol(format!(
                "CONN message claims {num_rails} rails, exceeds MAX_RAILS {MAX_RAILS}"
            )));
        }
        let mut endpoint_names = [empty_name(); MAX_RAILS];
        let names_start = 16;
        for (i, name) in endpoint_names.iter_mut().enumerate() {
            let start = names_start + i * MAX_ENDPOINT_NAME;
            let end = start + MAX_ENDPOINT_NAME;
            name.copy_from_slice(&bytes[start..end]);
        }
        Ok(Self {
            tag,
            local_comm_id,
            remote_comm_id,
            num_rails,
            endpoint_names,
        })
    }

    pub fn rail_names(&self) -> &[EndpointName] {
        &self.endpoint_names[..self.num_rails as usize]
    }
}

/// `CTRL` — names the receiver's buffer for a rendezvous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlMessage {
    pub remote_comm_id: u32,
    pub msg_seq_num: u16,
    pub buff_addr: u64,
    pub buff_len: u64,
    pub buff_mr_key: [u64; MAX_RAILS],
}

impl CtrlMessage {
    pub const WIRE_SIZE: usize = 2 + 2 + 4 + 2 + 6 + 8 + 8 + MAX_RAILS * 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&(MessageTag::Ctrl as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // pad
        buf.extend_from_slice(&self.remote_comm_id.to_ne_bytes());
        buf.extend_from_slice(&self.msg_seq_num.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 6]); // pad to 8-byte alignment for the u64s
        buf.extend_from_slice(&self.buff_addr.to_ne_bytes());
        buf.extend_from_slice(&self.buff_len.to_ne_bytes());
        for key in &self.buff_mr_key {
            buf.extend_from_slice(&key.to_ne_bytes());
        }
        debug_assert_eq!(buf.len(), Self::WIRE_SIZE);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(TransportError::Protocol("truncated CTRL message".into()));
        }
        let tag = MessageTag::from_u16(u16::from_ne_bytes(bytes[0..2].try_into().unwrap()))?;
        if tag != MessageTag::Ctrl {
            return Err(TransportError::Protocol(format!(
                "expected CTRL tag, got {tag:?}"
            )));
        }
        let remote_comm_id = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        let msg_seq_num = u16::from_ne_bytes(bytes[8..10].try_into().unwrap());
        let buff_addr = u64::from_ne_bytes(bytes[16..24].try_into().unwrap());
        let buff_len = u64::from_ne_bytes(bytes[24..32].try_into().unwrap());
        let mut buff_mr_key = [0u64; MAX_RAILS];
        for (i, key) in buff_mr_key.iter_mut().enumerate() {
            let start = 32 + i * 8;
            *key = u64::from_ne_bytes(bytes[start..start + 8].try_into().unwrap());
        }
        Ok(Self {
            remote_comm_id,
            msg_seq_num,
            buff_addr,
            buff_len,
            buff_mr_key,
        })
    }
}

/// Read just the leading tag from an arbitrary bounce-buffer payload, used
/// by the progress engine to dispatch a `RECV` completion without
/// remote-CQ-data (spec.md §4.4: "message type taken from the first two
/// payload bytes").
pub fn peek_tag(bytes: &[u8]) -> Result<MessageTag, TransportError> {
    if bytes.len() < 2 {
        return Err(TransportError::Protocol("payload too short for a tag".into()));
    }
    MessageTag::from_u16(u16::from_ne_bytes(bytes[0..2].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_round_trip_is_bit_exact_across_the_space() {
        for seq in [0u16, 1, 511, 1023] {
            for comm in [0u32, 1, 131_071, 262_143] {
                for nseg in 0u8..16 {
                    let imm = encode_write_immediate(comm & COMM_MASK, seq, nseg);
                    let (c, s, n) = decode_write_immediate(imm);
                    assert_eq!(c, comm & COMM_MASK);
                    assert_eq!(s, seq);
                    assert_eq!(n, nseg);
                }
            }
        }
    }

    #[test]
    fn immediate_fields_do_not_overlap() {
        let imm = encode_write_immediate(COMM_MASK, SEQ_MASK as u16, SEG_MASK as u8);
        assert_eq!(imm, u32::MAX);
    }

    #[test]
    fn conn_message_round_trips_through_bytes() {
        let mut name = [0u8; MAX_ENDPOINT_NAME];
        name[0..4].copy_from_slice(b"rail");
        let msg = ConnMessage::new(MessageTag::Conn, 7, 0, &[name, name]).unwrap();
        let bytes = msg.to_bytes();
        let back = ConnMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
        assert_eq!(back.rail_names().len(), 2);
    }

    #[test]
    fn conn_message_rejects_too_many_rails() {
        let name = [0u8; MAX_ENDPOINT_NAME];
        let names = vec![name; MAX_RAILS + 1];
        assert!(ConnMessage::new(MessageTag::Conn, 0, 0, &names).is_err());
    }

    #[test]
    fn ctrl_message_round_trips_through_bytes() {
        let mut buff_mr_key = [0u64; MAX_RAILS];
        buff_mr_key[0] = 0xdead_beef;
        let msg = CtrlMessage {
            remote_comm_id: 3,
            msg_seq_num: 42,
            buff_addr: 0x1000,
            buff_len: 4096,
            buff_mr_key,
        };
        let bytes = msg.to_bytes();
        let back = CtrlMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn peek_tag_identifies_ctrl_without_full_parse() {
        let msg = CtrlMessage {
            remote_comm_id: 0,
            msg_seq_num: 0,
            buff_addr: 0,
            buff_len: 0,
            buff_mr_key: [0; MAX_RAILS],
        };
        let bytes = msg.to_bytes();
        assert_eq!(peek_tag(&bytes).unwrap(), MessageTag::Ctrl);
    }
}

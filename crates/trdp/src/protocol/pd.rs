// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PD frame codec.
//!
//! Frame geometry (octets, all integers network byte order):
//!
//! ```text
//! 0        4        8        12       16       20       24
//! +--------+---+----+--------+--------+--------+--------+
//! | seqCnt |ver|type| comId  | etbTopo| opTopo | dsLen  |
//! +--------+---+----+--------+--------+--------+--------+
//! 24       28       32       36       40
//! +--------+--------+--------+--------+~~~~~~~~+--------+
//! | resvd  |replyCom|replyIp | hdrCRC | payload| dataCRC|
//! +--------+--------+--------+--------+~~~~~~~~+--------+
//! ```
//!
//! The payload is zero-padded to a 4-octet boundary before its CRC; an
//! empty payload carries no data CRC at all.

use std::net::Ipv4Addr;

use super::constants::{
    is_pd_msg_type, padded, MAX_PD_DATA_SIZE, MSG_PD, PD_HEADER_SIZE, PROTOCOL_VERSION,
};
use super::crc::crc32;
use super::cursor::{Cursor, CursorMut};
use crate::api::{Error, Result};

/// Parsed or to-be-packed PD frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdHeader {
    /// Monotonically increasing per publisher.
    pub sequence_counter: u32,
    /// Major/minor protocol version.
    pub protocol_version: u16,
    /// One of `MSG_PD`, `MSG_PP`, `MSG_PR`, `MSG_PE`.
    pub msg_type: u16,
    /// Telegram identifier.
    pub com_id: u32,
    /// ETB inauguration generation.
    pub etb_topo_cnt: u32,
    /// Operational train inauguration generation.
    pub op_trn_topo_cnt: u32,
    /// Unpadded payload length; set by `pack`.
    pub dataset_length: u32,
    /// Reserved, transmitted as zero.
    pub reserved: u32,
    /// Pull requests: ComID the reply shall be published on.
    pub reply_com_id: u32,
    /// Pull requests: address the reply shall be sent to.
    pub reply_ip: Ipv4Addr,
}

impl PdHeader {
    /// Header for an ordinary `Pd` data frame.
    pub fn data(com_id: u32, sequence_counter: u32, topo: (u32, u32)) -> Self {
        PdHeader {
            sequence_counter,
            protocol_version: PROTOCOL_VERSION,
            msg_type: MSG_PD,
            com_id,
            etb_topo_cnt: topo.0,
            op_trn_topo_cnt: topo.1,
            dataset_length: 0,
            reserved: 0,
            reply_com_id: 0,
            reply_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Assemble the wire frame: header with its CRC, padded payload, data
    /// CRC. `dataset_length` is taken from `payload`, not from `self`.
    pub fn pack(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PD_DATA_SIZE {
            return Err(Error::Param(format!(
                "PD payload {} exceeds {} octets",
                payload.len(),
                MAX_PD_DATA_SIZE
            )));
        }
        let body = padded(payload.len());
        let total = PD_HEADER_SIZE + body + if payload.is_empty() { 0 } else { 4 };
        let mut frame = vec![0u8; total];

        {
            let mut w = CursorMut::new(&mut frame);
            w.write_u32(self.sequence_counter)?;
            w.write_u16(self.protocol_version)?;
            w.write_u16(self.msg_type)?;
            w.write_u32(self.com_id)?;
            w.write_u32(self.etb_topo_cnt)?;
            w.write_u32(self.op_trn_topo_cnt)?;
            w.write_u32(payload.len() as u32)?;
            w.write_u32(self.reserved)?;
            w.write_u32(self.reply_com_id)?;
            w.write_u32(u32::from(self.reply_ip))?;
        }
        let hdr_crc = crc32(&frame[..PD_HEADER_SIZE - 4]);
        frame[PD_HEADER_SIZE - 4..PD_HEADER_SIZE].copy_from_slice(&hdr_crc.to_be_bytes());

        if !payload.is_empty() {
            frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
            let data_crc = crc32(&frame[PD_HEADER_SIZE..PD_HEADER_SIZE + body]);
            frame[PD_HEADER_SIZE + body..].copy_from_slice(&data_crc.to_be_bytes());
        }
        Ok(frame)
    }

    /// Parse and verify a received frame.
    ///
    /// `local_topo` is the session's expected pair; a non-zero local value
    /// rejects any non-zero, differing frame value as `Topo` (zero on the
    /// frame is the wildcard). Returns the header and the unpadded payload.
    pub fn parse(buf: &[u8], local_topo: (u32, u32)) -> Result<(PdHeader, &[u8])> {
        if buf.len() < PD_HEADER_SIZE {
            return Err(Error::Wire);
        }
        let mut r = Cursor::new(buf);
        let header = PdHeader {
            sequence_counter: r.read_u32()?,
            protocol_version: r.read_u16()?,
            msg_type: r.read_u16()?,
            com_id: r.read_u32()?,
            etb_topo_cnt: r.read_u32()?,
            op_trn_topo_cnt: r.read_u32()?,
            dataset_length: r.read_u32()?,
            reserved: r.read_u32()?,
            reply_com_id: r.read_u32()?,
            reply_ip: Ipv4Addr::from(r.read_u32()?),
        };
        let hdr_crc = r.read_u32()?;

        if header.protocol_version >> 8 != PROTOCOL_VERSION >> 8
            || !is_pd_msg_type(header.msg_type)
        {
            return Err(Error::Wire);
        }
        if hdr_crc != crc32(&buf[..PD_HEADER_SIZE - 4]) {
            return Err(Error::Crc);
        }

        let ds_len = header.dataset_length as usize;
        if ds_len > MAX_PD_DATA_SIZE {
            return Err(Error::Wire);
        }
        if ds_len > 0 {
            let body = padded(ds_len);
            if buf.len() < PD_HEADER_SIZE + body + 4 {
                return Err(Error::Wire);
            }
            let stored = u32::from_be_bytes(
                buf[PD_HEADER_SIZE + body..PD_HEADER_SIZE + body + 4]
                    .try_into()
                    .map_err(|_| Error::Wire)?,
            );
            if stored != crc32(&buf[PD_HEADER_SIZE..PD_HEADER_SIZE + body]) {
                return Err(Error::Crc);
            }
        }

        check_topo(header.etb_topo_cnt, local_topo.0)?;
        check_topo(header.op_trn_topo_cnt, local_topo.1)?;

        Ok((header, &buf[PD_HEADER_SIZE..PD_HEADER_SIZE + ds_len]))
    }
}

pub(super) fn check_topo(frame: u32, local: u32) -> Result<()> {
    if local != 0 && frame != 0 && frame != local {
        return Err(Error::Topo);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PdHeader {
        let mut h = PdHeader::data(1000, 7, (0x11, 0x22));
        h.reply_com_id = 0;
        h
    }

    #[test]
    fn pack_parse_round_trip() {
        let h = sample_header();
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let frame = h.pack(&payload).expect("pack");
        assert_eq!(frame.len(), PD_HEADER_SIZE + 4 + 4);

        let (parsed, body) = PdHeader::parse(&frame, (0x11, 0x22)).expect("parse");
        assert_eq!(parsed.com_id, 1000);
        assert_eq!(parsed.sequence_counter, 7);
        assert_eq!(parsed.dataset_length, 4);
        assert_eq!(body, &payload);
    }

    #[test]
    fn unpadded_payload_is_padded_before_crc() {
        let h = sample_header();
        let frame = h.pack(&[1, 2, 3, 4, 5]).expect("pack");
        // 40 header + 8 padded body + 4 data CRC
        assert_eq!(frame.len(), 52);
        assert_eq!(frame[PD_HEADER_SIZE + 5..PD_HEADER_SIZE + 8], [0, 0, 0]);
        let (parsed, body) = PdHeader::parse(&frame, (0, 0)).expect("parse");
        assert_eq!(parsed.dataset_length, 5);
        assert_eq!(body, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_payload_has_no_data_crc() {
        let frame = sample_header().pack(&[]).expect("pack");
        assert_eq!(frame.len(), PD_HEADER_SIZE);
        let (parsed, body) = PdHeader::parse(&frame, (0, 0)).expect("parse");
        assert_eq!(parsed.dataset_length, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn corrupt_header_crc_is_rejected() {
        let mut frame = sample_header().pack(&[9, 9, 9, 9]).expect("pack");
        frame[8] ^= 0x01; // comId byte
        assert!(matches!(
            PdHeader::parse(&frame, (0, 0)),
            Err(Error::Crc)
        ));
    }

    #[test]
    fn corrupt_payload_crc_is_rejected() {
        let mut frame = sample_header().pack(&[9, 9, 9, 9]).expect("pack");
        frame[PD_HEADER_SIZE] ^= 0x80;
        assert!(matches!(
            PdHeader::parse(&frame, (0, 0)),
            Err(Error::Crc)
        ));
    }

    #[test]
    fn version_and_msg_type_gate() {
        let mut bad_ver = sample_header();
        bad_ver.protocol_version = 0x0200;
        let frame = bad_ver.pack(&[1, 2, 3, 4]).expect("pack");
        assert!(matches!(PdHeader::parse(&frame, (0, 0)), Err(Error::Wire)));

        let mut bad_type = sample_header();
        bad_type.msg_type = 0x4D72; // 'Mr' is not a PD shape
        let frame = bad_type.pack(&[1, 2, 3, 4]).expect("pack");
        assert!(matches!(PdHeader::parse(&frame, (0, 0)), Err(Error::Wire)));
    }

    #[test]
    fn topo_mismatch_is_rejected_nonzero_only() {
        let h = PdHeader::data(1000, 1, (5, 6));
        let frame = h.pack(&[1, 2, 3, 4]).expect("pack");
        assert!(PdHeader::parse(&frame, (5, 6)).is_ok());
        // local expects different generation
        assert!(matches!(PdHeader::parse(&frame, (7, 6)), Err(Error::Topo)));
        // local zero = no expectation
        assert!(PdHeader::parse(&frame, (0, 0)).is_ok());
        // frame zero = wildcard
        let wild = PdHeader::data(1000, 1, (0, 0)).pack(&[1, 2, 3, 4]).expect("pack");
        assert!(PdHeader::parse(&wild, (7, 6)).is_ok());
    }

    #[test]
    fn truncated_frame_is_wire_error() {
        let frame = sample_header().pack(&[1, 2, 3, 4]).expect("pack");
        assert!(matches!(
            PdHeader::parse(&frame[..frame.len() - 3], (0, 0)),
            Err(Error::Wire)
        ));
        assert!(matches!(PdHeader::parse(&frame[..10], (0, 0)), Err(Error::Wire)));
    }

    #[test]
    fn oversized_payload_rejected_at_pack() {
        let big = vec![0u8; MAX_PD_DATA_SIZE + 1];
        assert!(matches!(
            sample_header().pack(&big),
            Err(Error::Param(_))
        ));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MD frame codec and TCP stream reassembly.
//!
//! The MD header shares the 24-octet common prefix with PD, then carries
//! the transaction fields:
//!
//! ```text
//! 0   seqCnt(4) ver(2) type(2) comId(4) etbTopo(4) opTopo(4) dsLen(4)
//! 24  replyStatus(4)
//! 28  sessionId(16)
//! 44  replyTimeout(4)
//! 48  srcURI(32, zero padded)
//! 80  destURI(32, zero padded)
//! 112 hdrCRC(4)
//! 116 payload (padded to 4) + dataCRC(4, only when dsLen > 0)
//! ```
//!
//! On TCP the same frames flow back-to-back over the stream;
//! [`StreamAssembler`] accumulates bytes until `dsLen` says a frame is
//! complete, then hands it out for the ordinary `parse`.

use super::constants::{
    is_md_msg_type, padded, MAX_MD_DATA_SIZE, MD_HEADER_SIZE, MSG_MR, PROTOCOL_VERSION,
};
use super::crc::crc32;
use super::cursor::{Cursor, CursorMut};
use super::pd::check_topo;
use crate::api::{Error, Result};
use crate::vos::uuid::Uuid;

/// Longest user URI (31 characters + terminating zero on the wire).
pub const MAX_URI_USER_LEN: usize = 31;

const URI_FIELD_LEN: usize = 32;

/// Parsed or to-be-packed MD frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdHeader {
    /// Per-transaction frame counter.
    pub sequence_counter: u32,
    /// Major/minor protocol version.
    pub protocol_version: u16,
    /// One of the `MSG_M*` codes.
    pub msg_type: u16,
    /// Telegram identifier.
    pub com_id: u32,
    /// ETB inauguration generation.
    pub etb_topo_cnt: u32,
    /// Operational train inauguration generation.
    pub op_trn_topo_cnt: u32,
    /// Unpadded payload length; set by `pack`.
    pub dataset_length: u32,
    /// Signed status word (see `api::ReplyStatus`).
    pub reply_status: i32,
    /// Transaction UUID.
    pub session_id: Uuid,
    /// Reply timeout granted to the replier, microseconds.
    pub reply_timeout: u32,
    /// Source user URI.
    pub src_uri: String,
    /// Destination user URI.
    pub dest_uri: String,
}

impl MdHeader {
    /// Header template for a new transaction frame.
    pub fn new(msg_type: u16, com_id: u32, session_id: Uuid, topo: (u32, u32)) -> Self {
        MdHeader {
            sequence_counter: 0,
            protocol_version: PROTOCOL_VERSION,
            msg_type,
            com_id,
            etb_topo_cnt: topo.0,
            op_trn_topo_cnt: topo.1,
            dataset_length: 0,
            reply_status: 0,
            session_id,
            reply_timeout: 0,
            src_uri: String::new(),
            dest_uri: String::new(),
        }
    }

    /// Assemble the wire frame. `dataset_length` is taken from `payload`.
    pub fn pack(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_MD_DATA_SIZE {
            return Err(Error::Param(format!(
                "MD payload {} exceeds {} octets",
                payload.len(),
                MAX_MD_DATA_SIZE
            )));
        }
        if self.src_uri.len() > MAX_URI_USER_LEN || self.dest_uri.len() > MAX_URI_USER_LEN {
            return Err(Error::Param("URI exceeds 31 characters".into()));
        }
        let body = padded(payload.len());
        let total = MD_HEADER_SIZE + body + if payload.is_empty() { 0 } else { 4 };
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
            w.write_i32(self.reply_status)?;
            w.write_bytes(self.session_id.as_bytes())?;
            w.write_u32(self.reply_timeout)?;
            write_uri(&mut w, &self.src_uri)?;
            write_uri(&mut w, &self.dest_uri)?;
        }
        let hdr_crc = crc32(&frame[..MD_HEADER_SIZE - 4]);
        frame[MD_HEADER_SIZE - 4..MD_HEADER_SIZE].copy_from_slice(&hdr_crc.to_be_bytes());

        if !payload.is_empty() {
            frame[MD_HEADER_SIZE..MD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
            let data_crc = crc32(&frame[MD_HEADER_SIZE..MD_HEADER_SIZE + body]);
            frame[MD_HEADER_SIZE + body..].copy_from_slice(&data_crc.to_be_bytes());
        }
        Ok(frame)
    }

    /// Parse and verify a received frame; same reject taxonomy as the PD
    /// codec. Returns the header and the unpadded payload.
    pub fn parse(buf: &[u8], local_topo: (u32, u32)) -> Result<(MdHeader, &[u8])> {
        if buf.len() < MD_HEADER_SIZE {
            return Err(Error::Wire);
        }
        let mut r = Cursor::new(buf);
        let sequence_counter = r.read_u32()?;
        let protocol_version = r.read_u16()?;
        let msg_type = r.read_u16()?;
        let com_id = r.read_u32()?;
        let etb_topo_cnt = r.read_u32()?;
        let op_trn_topo_cnt = r.read_u32()?;
        let dataset_length = r.read_u32()?;
        let reply_status = r.read_i32()?;
        let mut session = [0u8; 16];
        session.copy_from_slice(r.read_bytes(16)?);
        let reply_timeout = r.read_u32()?;
        let src_uri = read_uri(r.read_bytes(URI_FIELD_LEN)?);
        let dest_uri = read_uri(r.read_bytes(URI_FIELD_LEN)?);
        let hdr_crc = r.read_u32()?;

        if protocol_version >> 8 != PROTOCOL_VERSION >> 8 || !is_md_msg_type(msg_type) {
            return Err(Error::Wire);
        }
        if hdr_crc != crc32(&buf[..MD_HEADER_SIZE - 4]) {
            return Err(Error::Crc);
        }

        let ds_len = dataset_length as usize;
        if ds_len > MAX_MD_DATA_SIZE {
            return Err(Error::Wire);
        }
        if ds_len > 0 {
            let body = padded(ds_len);
            if buf.len() < MD_HEADER_SIZE + body + 4 {
                return Err(Error::Wire);
            }
            let stored = u32::from_be_bytes(
                buf[MD_HEADER_SIZE + body..MD_HEADER_SIZE + body + 4]
                    .try_into()
                    .map_err(|_| Error::Wire)?,
            );
            if stored != crc32(&buf[MD_HEADER_SIZE..MD_HEADER_SIZE + body]) {
                return Err(Error::Crc);
            }
        }

        check_topo(etb_topo_cnt, local_topo.0)?;
        check_topo(op_trn_topo_cnt, local_topo.1)?;

        Ok((
            MdHeader {
                sequence_counter,
                protocol_version,
                msg_type,
                com_id,
                etb_topo_cnt,
                op_trn_topo_cnt,
                dataset_length,
                reply_status,
                session_id: Uuid::from(session),
                reply_timeout,
                src_uri,
                dest_uri,
            },
            &buf[MD_HEADER_SIZE..MD_HEADER_SIZE + ds_len],
        ))
    }
}

fn write_uri(w: &mut CursorMut<'_>, uri: &str) -> Result<()> {
    w.write_bytes(uri.as_bytes())?;
    w.write_zeroes(URI_FIELD_LEN - uri.len())
}

fn read_uri(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ============================================================================
// TCP stream reassembly
// ============================================================================

/// Accumulates stream bytes until a complete MD frame is present.
///
/// Length framing comes from `datasetLength` in the header; a frame is
/// complete at `MD header + padded payload + data CRC` octets.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buf: Vec<u8>,
}

impl StreamAssembler {
    /// Empty assembler for a fresh connection.
    pub fn new() -> Self {
        StreamAssembler::default()
    }

    /// Append received stream bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain the next complete frame, if one is buffered.
    ///
    /// `Err(Wire)` means the stream is corrupt (the advertised length is
    /// impossible); the caller must drop the connection.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < MD_HEADER_SIZE {
            return Ok(None);
        }
        let ds_len = u32::from_be_bytes(
            self.buf[20..24].try_into().map_err(|_| Error::Wire)?,
        ) as usize;
        if ds_len > MAX_MD_DATA_SIZE {
            return Err(Error::Wire);
        }
        let total = MD_HEADER_SIZE + padded(ds_len) + if ds_len > 0 { 4 } else { 0 };
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        let frame = std::mem::replace(&mut self.buf, rest);
        Ok(Some(frame))
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

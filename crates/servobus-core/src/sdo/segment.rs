//! Segmented download/upload.
//!
//! Each segment after the initiate carries up to 7 data bytes (byte 0 is
//! the command/toggle/continuation byte) with an alternating toggle bit;
//! mismatched toggle or multiplexor aborts the transfer immediately.

use super::{cs, SdoChannel, SdoEngine};
use crate::error::{Error, SdoError};

const SEGMENT_DATA_MAX: usize = 7;

pub(super) fn segmented_download<C: SdoChannel>(
    engine: &SdoEngine<C>,
    index: u16,
    sub: u8,
    data: &[u8],
) -> Result<(), Error> {
    // Initiate, declaring the full length (s=1, e=0).
    let mut init = [0u8; 8];
    init[0] = cs::INITIATE_DOWNLOAD | 0x01;
    init[1..3].copy_from_slice(&index.to_le_bytes());
    init[3] = sub;
    init[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    let reply = engine.request(&init)?;
    if reply[0] & 0xE0 != cs::INITIATE_DOWNLOAD_RESP
        || u16::from_le_bytes([reply[1], reply[2]]) != index
        || reply[3] != sub
    {
        engine.send_abort(index, sub, SdoError::BadScs);
        return Err(Error::Sdo(SdoError::BadScs));
    }

    let mut toggle = false;
    let mut offset = 0usize;
    while offset < data.len() {
        let remaining = data.len() - offset;
        let chunk_len = remaining.min(SEGMENT_DATA_MAX);
        let is_last = chunk_len == remaining;
        let padded = SEGMENT_DATA_MAX - chunk_len;
        let mut frame = [0u8; 8];
        frame[0] = cs::DOWNLOAD_SEGMENT_BASE
            | ((toggle as u8) << 4)
            | ((padded as u8) << 1)
            | (is_last as u8);
        frame[1..1 + chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
        let reply = engine.request(&frame)?;
        let expected_cs = cs::DOWNLOAD_SEGMENT_RESP_BASE | ((toggle as u8) << 4);
        if reply[0] != expected_cs {
            engine.send_abort(index, sub, SdoError::Togglebit);
            return Err(Error::Sdo(SdoError::Togglebit));
        }
        offset += chunk_len;
        toggle = !toggle;
    }
    Ok(())
}

/// Tries expedited first (single round trip), then falls back to a
/// segmented upload when the initiate response declares `e=0`.
pub(super) fn segmented_or_expedited_upload<C: SdoChannel>(
    engine: &SdoEngine<C>,
    index: u16,
    sub: u8,
) -> Result<Vec<u8>, Error> {
    let mut init = [0u8; 8];
    init[0] = cs::INITIATE_UPLOAD_REQ;
    init[1..3].copy_from_slice(&index.to_le_bytes());
    init[3] = sub;
    let reply = engine.request(&init)?;
    if reply[0] & 0xE0 != cs::INITIATE_UPLOAD_RESP
        || u16::from_le_bytes([reply[1], reply[2]]) != index
        || reply[3] != sub
    {
        engine.send_abort(index, sub, SdoError::BadScs);
        return Err(Error::Sdo(SdoError::BadScs));
    }

    let e = reply[0] & 0x02 != 0;
    let s = reply[0] & 0x01 != 0;
    if e {
        let len = if s { 4 - ((reply[0] >> 2) & 0x03) as usize } else { 4 };
        return Ok(reply[4..4 + len].to_vec());
    }

    let total_len = if s {
        Some(u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]) as usize)
    } else {
        None
    };

    let mut out = Vec::with_capacity(total_len.unwrap_or(0));
    let mut toggle = false;
    loop {
        let mut frame = [0u8; 8];
        frame[0] = cs::UPLOAD_SEGMENT_REQ_BASE | ((toggle as u8) << 4);
        let reply = engine.request(&frame)?;
        let expected_cs = cs::UPLOAD_SEGMENT_RESP_BASE | ((toggle as u8) << 4);
        if reply[0] & 0xF0 != expected_cs {
            engine.send_abort(index, sub, SdoError::Togglebit);
            return Err(Error::Sdo(SdoError::Togglebit));
        }
        let padded = ((reply[0] >> 1) & 0x07) as usize;
        let is_last = reply[0] & 0x01 != 0;
        let chunk_len = SEGMENT_DATA_MAX - padded;
        out.extend_from_slice(&reply[1..1 + chunk_len]);
        toggle = !toggle;
        if is_last {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::sdo::SdoEngine;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted {
        replies: RefCell<VecDeque<Vec<u8>>>,
    }

    impl SdoChannel for Scripted {
        fn transfer(&self, _req: &[u8], _timeout: Duration) -> Result<Vec<u8>, Error> {
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or(Error::Transport(TransportError::Timeout))
        }
    }

    #[test]
    fn segmented_download_of_100_bytes_alternates_toggle() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut init_reply = [0u8; 8];
        init_reply[0] = cs::INITIATE_DOWNLOAD_RESP;
        init_reply[1..3].copy_from_slice(&0x2000u16.to_le_bytes());

        // 100 bytes / 7 per segment = 15 segments (14 full + 1 of 2 bytes)
        let mut replies = vec![init_reply.to_vec()];
        let mut toggle = false;
        for _ in 0..15 {
            let mut r = [0u8; 8];
            r[0] = cs::DOWNLOAD_SEGMENT_RESP_BASE | ((toggle as u8) << 4);
            replies.push(r.to_vec());
            toggle = !toggle;
        }
        let scripted = Scripted {
            replies: RefCell::new(replies.into()),
        };
        let engine = SdoEngine::new(scripted);
        engine.download_bytes(0x2000, 0, &data).unwrap();
    }
}

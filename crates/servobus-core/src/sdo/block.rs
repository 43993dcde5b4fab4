//! Block transfer. CAN-only in this implementation, and only
//! used when the payload is at least [`BLOCK_THRESHOLD_BYTES`] and the
//! channel reports [`SdoChannel::supports_block`].

use super::{cs, SdoChannel, SdoEngine};
use crate::error::{Error, SdoError};

pub const BLOCK_THRESHOLD_BYTES: usize = 300;
pub const BLOCK_SIZE_MAX: u8 = 127;
const BLOCK_SEGMENT_DATA: usize = 7;

fn check_block_supported<C: SdoChannel>(engine: &SdoEngine<C>) -> Result<(), Error> {
    if !engine.channel.supports_block() {
        return Err(Error::Sdo(SdoError::NoBlkXfers));
    }
    Ok(())
}

pub(super) fn block_download<C: SdoChannel>(
    engine: &SdoEngine<C>,
    index: u16,
    sub: u8,
    data: &[u8],
) -> Result<(), Error> {
    check_block_supported(engine)?;

    let mut init = [0u8; 8];
    init[0] = cs::BLOCK_DOWNLOAD; // cs=0 (initiate)
    init[1..3].copy_from_slice(&index.to_le_bytes());
    init[3] = sub;
    init[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    let reply = engine.request(&init)?;
    if reply[0] & 0xE0 != cs::BLOCK_DOWNLOAD {
        engine.send_abort(index, sub, SdoError::BlockSize);
        return Err(Error::Sdo(SdoError::BlockSize));
    }
    let mut blk_size = reply[4].clamp(1, BLOCK_SIZE_MAX);

    let chunks: Vec<&[u8]> = data.chunks(BLOCK_SEGMENT_DATA).collect();
    let mut sent = 0usize;
    while sent < chunks.len() {
        let sub_block = &chunks[sent..(sent + blk_size as usize).min(chunks.len())];
        for (i, chunk) in sub_block.iter().enumerate() {
            let seq = (i + 1) as u8;
            let is_last_overall = sent + i + 1 == chunks.len();
            let mut frame = [0u8; 8];
            frame[0] = if is_last_overall { 0x80 | seq } else { seq };
            frame[1..1 + chunk.len()].copy_from_slice(chunk);
            // Segments are fire-and-forget until the sub-block ack, except
            // the transport must still deliver them; we use the same
            // request/reply channel but ignore replies until the ack.
            let _ = engine.channel.transfer(&frame, engine.timeouts().timeout());
        }
        let ack = engine.request(&[0u8; 8])?;
        if ack[0] & 0xE0 != cs::BLOCK_DOWNLOAD {
            engine.send_abort(index, sub, SdoError::BlockSeq);
            return Err(Error::Sdo(SdoError::BlockSeq));
        }
        let ack_seq = ack[1];
        if ack_seq as usize != sub_block.len() {
            engine.send_abort(index, sub, SdoError::BlockSeq);
            return Err(Error::Sdo(SdoError::BlockSeq));
        }
        blk_size = ack[2].clamp(1, BLOCK_SIZE_MAX);
        sent += sub_block.len();
    }

    let mut end = [0u8; 8];
    end[0] = cs::BLOCK_DOWNLOAD | 0x01; // cs=1 (end block)
    let reply = engine.request(&end)?;
    if reply[0] & 0xE0 != cs::BLOCK_DOWNLOAD {
        engine.send_abort(index, sub, SdoError::BlockCrc);
        return Err(Error::Sdo(SdoError::BlockCrc));
    }
    Ok(())
}

pub(super) fn block_upload<C: SdoChannel>(
    engine: &SdoEngine<C>,
    index: u16,
    sub: u8,
    blk_size: u8,
) -> Result<Vec<u8>, Error> {
    check_block_supported(engine)?;
    let blk_size = blk_size.clamp(1, BLOCK_SIZE_MAX);

    let mut init = [0u8; 8];
    init[0] = cs::BLOCK_UPLOAD; // cs=0 (initiate)
    init[1..3].copy_from_slice(&index.to_le_bytes());
    init[3] = sub;
    init[4] = blk_size;
    let reply = engine.request(&init)?;
    if reply[0] & 0xE0 != cs::BLOCK_UPLOAD {
        engine.send_abort(index, sub, SdoError::BlockSize);
        return Err(Error::Sdo(SdoError::BlockSize));
    }
    let total_len = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]) as usize;

    let mut out = Vec::with_capacity(total_len);
    let mut blk_size = blk_size;
    loop {
        let mut last_seq = 0u8;
        let mut done = false;
        for expected_seq in 1..=blk_size {
            let seg = engine
                .channel
                .transfer(&[0u8; 8], engine.timeouts().timeout())?;
            if seg.len() != 8 {
                engine.send_abort(index, sub, SdoError::BlockSeq);
                return Err(Error::Sdo(SdoError::BlockSeq));
            }
            let seq = seg[0] & 0x7F;
            let is_last = seg[0] & 0x80 != 0;
            if seq != expected_seq {
                // gap: ack what we actually got and let the server retransmit
                break;
            }
            out.extend_from_slice(&seg[1..8]);
            last_seq = seq;
            if is_last {
                done = true;
                break;
            }
        }
        let mut ack = [0u8; 8];
        ack[0] = cs::BLOCK_UPLOAD | 0x02; // cs=2 (sub-block ack)
        ack[1] = last_seq;
        ack[2] = blk_size;
        if done {
            break;
        }
        let resp = engine.request(&ack)?;
        blk_size = resp[4].clamp(1, BLOCK_SIZE_MAX);
    }

    // trim padding on the final segment down to the declared total length
    out.truncate(total_len);

    let mut end = [0u8; 8];
    end[0] = cs::BLOCK_UPLOAD | 0x01; // cs=1 (end block)
    let _ = engine.request(&end)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
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
                .ok_or(Error::Sdo(SdoError::Timeout))
        }
        fn supports_block(&self) -> bool {
            true
        }
    }

    #[test]
    fn block_upload_reassembles_short_payload() {
        let total_len = 10u32;
        let mut init_reply = [0u8; 8];
        init_reply[0] = cs::BLOCK_UPLOAD;
        init_reply[4..8].copy_from_slice(&total_len.to_le_bytes());

        let mut seg1 = [0u8; 8];
        seg1[0] = 1;
        seg1[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);

        let mut seg2 = [0u8; 8];
        seg2[0] = 0x80 | 2;
        seg2[1..8].copy_from_slice(&[8, 9, 10, 0, 0, 0, 0]);

        let mut end_reply = [0u8; 8];
        end_reply[0] = cs::BLOCK_UPLOAD | 0x01;

        let scripted = Scripted {
            replies: RefCell::new(
                vec![
                    init_reply.to_vec(),
                    seg1.to_vec(),
                    seg2.to_vec(),
                    end_reply.to_vec(),
                ]
                .into(),
            ),
        };
        let engine = SdoEngine::new(scripted);
        let data = block_upload(&engine, 0x2000, 0, 127).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }
}

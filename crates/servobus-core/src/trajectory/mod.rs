//! PVT/PT trajectory streaming: segment encoding, the resend cache, and the
//! Start/Prime/Run state machine that keeps a drive's onboard buffer fed
//! from either a live generator or the cache.
//!
//! Segments are not SDO objects: they
//! ride a dedicated fire-and-forget channel (a CAN COB-ID of their own, or
//! an Ethernet RPDO slot) so a full buffer never blocks on SDO arbitration.
//! [`SegmentChannel`] is that channel's abstraction.

pub mod cache;
pub mod wire;

use std::sync::Mutex;

use crate::error::{Error, TrajectoryError};
use cache::PvtCache;
use wire::{BufferStatus, Sample};

const PVT_BUFFER_DEPTH_DEFAULT: u8 = 16;
const PVT_MIN_FREE_SLOTS: u8 = 2;

/// Supplies samples to the streamer. `None` means "nothing ready yet" —
/// distinct from a terminal sample (`time_ms == 0`), which ends the move.
pub trait TrajectorySource: Send {
    fn next_segment(&mut self) -> Option<Sample>;
}

/// The node-facing side of the PVT channel: send one 8-byte segment, or
/// read back the buffer status word. A CAN fabric backs this with a
/// dedicated COB-ID; an Ethernet fabric backs it with an RPDO/TPDO pair.
pub trait SegmentChannel: Send {
    fn send_segment(&self, bytes: &[u8; wire::SEGMENT_LEN]) -> Result<(), Error>;
    fn read_status(&self) -> Result<BufferStatus, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Priming,
    Running,
    Draining,
    Faulted,
}

struct Inner {
    state: StreamState,
    cache: PvtCache,
    next_seg_id: u16,
    pos_last: i32,
    source_exhausted: bool,
}

/// Drives one node's PVT buffer. Owns the resend cache and the seg-id
/// counter; callers supply the sample source and the channel on each call
/// rather than storing them, so one streamer can be reused across
/// reconnects.
pub struct PvtStreamer {
    inner: Mutex<Inner>,
    buffer_depth: u8,
}

impl PvtStreamer {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StreamState::Idle,
                cache: PvtCache::new(cache_capacity),
                next_seg_id: 0,
                pos_last: 0,
                source_exhausted: false,
            }),
            buffer_depth: PVT_BUFFER_DEPTH_DEFAULT,
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    pub fn set_buffer_depth(&mut self, depth: u8) {
        self.buffer_depth = depth;
    }

    /// Starts a move: checks the drive's actually reported buffer status,
    /// flushing first if it isn't already empty, then clears the buffer and
    /// error flags, seeds the initial absolute position, and primes as many
    /// segments as the smaller of the configured depth and the drive's
    /// reported free slots allows.
    pub fn start(
        &self,
        channel: &dyn SegmentChannel,
        source: &mut dyn TrajectorySource,
        initial_pos: i32,
    ) -> Result<(), Error> {
        let mut status = channel.read_status()?;
        if !status.empty {
            channel.send_segment(&wire::flush_segment())?;
            status = channel.read_status()?;
        }
        if status.free_slots < PVT_MIN_FREE_SLOTS {
            return Err(Error::Trajectory(TrajectoryError::BufferNotReady));
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.cache.clear();
            inner.next_seg_id = 0;
            inner.pos_last = initial_pos;
            inner.source_exhausted = false;
            inner.state = StreamState::Priming;
        }
        channel.send_segment(&wire::clear_errors_segment(0x7F))?;
        channel.send_segment(&wire::set_initial_position_segment(0, initial_pos))?;
        let prime_count = (self.buffer_depth as u16).min(status.free_slots as u16) as usize;
        self.fill(channel, source, prime_count)?;
        self.inner.lock().unwrap().state = StreamState::Running;
        Ok(())
    }

    /// Reads the buffer status and tops it back up — from the resend cache
    /// first, then the live source — per the credit formula below. Call
    /// this periodically (e.g. from a cyclic PDO hook or a polling thread).
    pub fn refill(&self, channel: &dyn SegmentChannel, source: &mut dyn TrajectorySource) -> Result<(), Error> {
        if matches!(self.state(), StreamState::Idle | StreamState::Faulted) {
            return Err(Error::Trajectory(TrajectoryError::NotPrimed));
        }
        let status = channel.read_status()?;

        if status.underflow() {
            self.inner.lock().unwrap().state = StreamState::Faulted;
            return Err(Error::Trajectory(TrajectoryError::BufferUnderflow));
        }

        if status.sequence_error() {
            self.resend_from(channel, status.next_expected)?;
            return Ok(());
        }

        let outstanding = {
            let inner = self.inner.lock().unwrap();
            inner.next_seg_id.wrapping_sub(status.next_expected)
        };
        self.inner.lock().unwrap().cache.retire_before(status.next_expected);

        let credit = credit_available(status.free_slots, outstanding);
        if credit == 0 {
            return Ok(());
        }
        let done = self.fill(channel, source, credit as usize)?;
        if done && status.empty {
            self.inner.lock().unwrap().state = StreamState::Draining;
        }
        Ok(())
    }

    pub fn abort(&self, channel: &dyn SegmentChannel) -> Result<(), Error> {
        channel.send_segment(&wire::flush_segment())?;
        let mut inner = self.inner.lock().unwrap();
        inner.state = StreamState::Idle;
        inner.cache.clear();
        Ok(())
    }

    /// Generates and sends up to `count` fresh segments, returning `true`
    /// once the source reports it has nothing left (a terminal sample was
    /// seen).
    fn fill(&self, channel: &dyn SegmentChannel, source: &mut dyn TrajectorySource, count: usize) -> Result<bool, Error> {
        for _ in 0..count {
            if self.inner.lock().unwrap().source_exhausted {
                return Ok(true);
            }
            let Some(sample) = source.next_segment() else {
                return Ok(false);
            };
            let terminal = sample.time_ms == 0;
            let (seg_id, pos_last) = {
                let inner = self.inner.lock().unwrap();
                (inner.next_seg_id, inner.pos_last)
            };
            let (wire_seg, new_pos_last) = wire::encode_segment(seg_id, sample, pos_last)?;
            channel.send_segment(&wire_seg.bytes)?;
            let mut inner = self.inner.lock().unwrap();
            inner.cache.push(seg_id, wire_seg);
            inner.next_seg_id = seg_id.wrapping_add(1);
            inner.pos_last = new_pos_last;
            if terminal {
                inner.source_exhausted = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resends cached segments starting at `from_id` — answers the drive's
    /// sequence-error report without touching the generator.
    fn resend_from(&self, channel: &dyn SegmentChannel, from_id: u16) -> Result<(), Error> {
        let mut id = from_id;
        loop {
            let cached = self.inner.lock().unwrap().cache.get(id);
            let Some(wire_seg) = cached else { break };
            channel.send_segment(&wire_seg.bytes)?;
            id = id.wrapping_add(1);
        }
        Ok(())
    }
}

/// Computes how many fresh segments may be sent given the drive's reported
/// free-slot count and the number of segments already in flight
/// (`next_seg_id - next_expected`, both mod 0x10000). Both operands wrap at
/// 16 bits, matching the on-wire counters — so the subtraction must use
/// `u16::wrapping_sub` rather than signed arithmetic, or a generator that
/// outruns a slow link by more than 32768 segments would compute a negative
/// "outstanding" count and over-fill the buffer.
fn credit_available(free_slots: u8, outstanding: u16) -> u16 {
    (free_slots as u16).saturating_sub(outstanding)
}

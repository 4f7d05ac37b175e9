//! Parallel asynchronous-serial receiver.
//!
//! Demodulates up to 32 independent 8-N-1 UART channels from one
//! wide-sampled digital input stream: bit `c` of each input word carries the
//! raw level of channel `c` at that sample tick, and one transmitted bit
//! spans [`OVERSAMPLE_RATE`] consecutive words.

mod filter;
pub mod traits;
mod wheel;


use crate::filter::GlitchFilter;
use crate::traits::{RxSink, ERROR_FRAMING};
use crate::wheel::TimingWheel;
use bincode::{Decode, Encode};
use uartrx_common::num::{GetBit, SetBits};

pub const CHANNELS: u32 = 32;

/// Input samples per transmitted bit.
pub const OVERSAMPLE_RATE: u32 = 8;

pub const WHEEL_SIZE: usize = 16;

/// Ticks from a filtered falling edge to the start-bit confirmation sample.
///
/// The filter lags the raw stream by one sample, so the effective sampling
/// point is `START_CHECK_OFFSET + 1` samples after the edge in the raw
/// domain; well within the oversampling tolerance.
pub const START_CHECK_OFFSET: u32 = OVERSAMPLE_RATE / 2;

/// Mid-bit to mid-bit spacing, i.e. one bit time.
pub const NEXT_BIT_OFFSET: u32 = OVERSAMPLE_RATE;

const _: () = assert!(CHANNELS == u32::BITS);
const _: () = assert!(WHEEL_SIZE.is_power_of_two());
const _: () = assert!(START_CHECK_OFFSET > 0 && (START_CHECK_OFFSET as usize) < WHEEL_SIZE);
const _: () = assert!(NEXT_BIT_OFFSET > 0 && (NEXT_BIT_OFFSET as usize) < WHEEL_SIZE);

// Idle is high on every line
const IDLE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct ChannelState {
    current_byte: u8,
    // 0 = start-bit confirmation, 1-8 = data bit N (LSB first), 9 = stop bit
    bit_counter: u8,
}

/// The receiver engine: one instance per input stream.
///
/// All state lives here; a host driving multiple streams (e.g. one per DMA
/// bank) creates one `Receiver` each. The engine performs no allocation and
/// never blocks, so it may run inside an interrupt or DMA-completion context
/// as long as nothing else touches the same instance.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Receiver {
    channels: [ChannelState; CHANNELS as usize],
    wheel: TimingWheel,
    filter: GlitchFilter,
    active_mask: u32,
    last_voted: u32,
}

impl Receiver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: [ChannelState::default(); CHANNELS as usize],
            wheel: TimingWheel::new(),
            filter: GlitchFilter::new(),
            active_mask: 0,
            last_voted: IDLE,
        }
    }

    /// Consumes `buffer` one sample word at a time, pushing decoded bytes and
    /// framing errors to `sink` as frames complete.
    ///
    /// State persists across calls: back-to-back calls on two halves of a
    /// capture behave exactly like one call on the whole capture.
    pub fn process<S: RxSink>(&mut self, buffer: &[u32], sink: &mut S) {
        for &raw in buffer {
            let voted = self.filter.vote(raw);

            // Edge scan must run before the scheduled work: a channel armed
            // on this tick fires START_CHECK_OFFSET > 0 ticks later, never on
            // the same tick.
            self.scan_edges(voted);
            self.run_due(voted, sink);

            self.last_voted = voted;
            self.wheel.advance();
        }
    }

    /// Bitmask of channels currently inside a frame.
    #[must_use]
    pub fn active_mask(&self) -> u32 {
        self.active_mask
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active_mask == 0
    }

    // Falling edges in the filtered domain arm idle channels. Edges on
    // channels already inside a frame are ignored; mid-frame level changes
    // are the scheduled sampler's business.
    #[inline]
    fn scan_edges(&mut self, voted: u32) {
        let falling_edges = self.last_voted & !voted;
        let new_starts = falling_edges & !self.active_mask;
        if new_starts == 0 {
            return;
        }

        self.active_mask |= new_starts;
        self.wheel.schedule(START_CHECK_OFFSET, new_starts);
        for ch in SetBits(new_starts) {
            self.channels[ch as usize] = ChannelState::default();
            log::trace!("Channel {ch}: falling edge, start check in {START_CHECK_OFFSET} ticks");
        }
    }

    #[inline]
    fn run_due<S: RxSink>(&mut self, voted: u32, sink: &mut S) {
        for ch in SetBits(self.wheel.drain()) {
            self.clock_channel(ch, voted.bit(ch as u8), sink);
        }
    }

    // One scheduled mid-bit sample for one channel. `level` comes from the
    // filtered word of the current tick.
    #[inline]
    fn clock_channel<S: RxSink>(&mut self, ch: u32, level: bool, sink: &mut S) {
        let mut state = self.channels[ch as usize];

        match state.bit_counter {
            0 => {
                if !level {
                    // Start bit still low at mid-bit; frame confirmed
                    state.bit_counter = 1;
                    self.wheel.schedule(NEXT_BIT_OFFSET, 1 << ch);
                } else {
                    // Glitch: release the channel so the next genuine falling
                    // edge can re-arm it. Not surfaced as an error.
                    log::trace!("Channel {ch}: start bit glitch");
                    self.active_mask &= !(1 << ch);
                }
            }
            counter @ 1..=8 => {
                if level {
                    state.current_byte |= 1 << (counter - 1);
                }
                state.bit_counter = counter + 1;
                self.wheel.schedule(NEXT_BIT_OFFSET, 1 << ch);
            }
            _ => {
                if level {
                    log::trace!("Channel {ch}: received {:02X}", state.current_byte);
                    sink.push_byte(ch as u8, state.current_byte);
                } else {
                    log::trace!("Channel {ch}: framing error");
                    sink.push_error(ch as u8, ERROR_FRAMING);
                }
                self.active_mask &= !(1 << ch);
            }
        }

        self.channels[ch as usize] = state;
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

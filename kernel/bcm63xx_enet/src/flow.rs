//! Hardware flow control of a receive channel.
//!
//! The DMA controller counts the receive buffers software has handed it
//! (through the BUFALLOC register) and stops fetching frames from the MAC once
//! fewer than the low threshold remain, until the count climbs back to the high
//! threshold. The controller here programs those thresholds and keeps a software
//! mirror of the resulting hysteresis state, derived from the ring's `live_count`.

use core::sync::atomic::{AtomicBool, Ordering};
use iudma_regs::{FlowRegs, RegisterBlock, SharedRegisters};
use crate::{DmaError, FlowThresholds};

/// Whether the hardware is currently (believed to be) throttling reception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Open,
    Throttled,
}

pub struct FlowController {
    regs: FlowRegs,
    low: usize,
    high: usize,
    throttled: AtomicBool,
}

impl FlowController {
    pub fn new(regs: FlowRegs, rx_capacity: usize, thresholds: FlowThresholds) -> Result<FlowController, DmaError> {
        thresholds.validate()?;
        let (low, high) = thresholds.for_capacity(rx_capacity);
        if low >= high {
            return Err(DmaError::InvalidConfig("rx ring is too small for distinct flow-control thresholds"));
        }
        Ok(FlowController { regs, low, high, throttled: AtomicBool::new(true) })
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Writes the thresholds into the hardware.
    pub fn program<R: RegisterBlock>(&self, regs: &SharedRegisters<R>) {
        regs.write(self.regs.low, self.low as u32);
        regs.write(self.regs.high, self.high as u32);
    }

    /// Turns flow control on for this channel in the shared config register.
    pub fn enable<R: RegisterBlock>(&self, regs: &SharedRegisters<R>) {
        let bit = self.regs.enable_bit;
        regs.modify(self.regs.config, |v| v | bit);
    }

    pub fn disable<R: RegisterBlock>(&self, regs: &SharedRegisters<R>) {
        let bit = self.regs.enable_bit;
        regs.modify(self.regs.config, |v| v & !bit);
        self.throttled.store(true, Ordering::Release);
    }

    /// Updates the mirrored state from the number of receive buffers posted to the hardware.
    pub fn update(&self, rx_live: usize) -> FlowState {
        let throttled = self.throttled.load(Ordering::Acquire);
        if throttled && rx_live >= self.high {
            self.throttled.store(false, Ordering::Release);
            debug!("FlowController: {} rx buffers posted, reception resumes", rx_live);
            FlowState::Open
        } else if !throttled && rx_live < self.low {
            self.throttled.store(true, Ordering::Release);
            debug!("FlowController: only {} rx buffers posted, reception throttled", rx_live);
            FlowState::Throttled
        } else {
            self.state()
        }
    }

    pub fn state(&self) -> FlowState {
        if self.throttled.load(Ordering::Acquire) {
            FlowState::Throttled
        } else {
            FlowState::Open
        }
    }
}

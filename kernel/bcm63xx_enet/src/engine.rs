//! The DMA engine: owns the controller's register regions and its channels.

use alloc::{sync::Arc, vec::Vec};
use iudma_regs::{Geometry, RegLoc, Region, RegisterBlock, SharedRegisters, DMA_CFG_EN};
use nic_buffers::BufferAllocator;
use crate::{
    Buf, Channel, ChannelCause, ChannelConfig, DmaError, EngineConfig, PacketSink,
    StatsSnapshot, Timer, DisableReport,
};

/// The memory-mapped regions of one DMA controller.
/// `dmas` is only needed on chips whose geometry keeps channel state in DMA SRAM.
pub struct DmaRegions<R: RegisterBlock> {
    pub dma: R,
    pub dmac: R,
    pub dmas: Option<R>,
}

/// What one call to [`DmaEngine::dispatch()`] accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub channels_serviced: usize,
    pub rx_harvested: usize,
    pub tx_reclaimed: usize,
    /// At least one channel ran out of receive budget.
    pub more_pending: bool,
}

pub struct DmaEngine<R: RegisterBlock, A: BufferAllocator, T: Timer> {
    geometry: Geometry,
    config: EngineConfig,
    regs: Arc<SharedRegisters<R>>,
    allocator: Arc<A>,
    timer: Arc<T>,
    channels: Vec<Option<Channel<R, A, T>>>,
}

impl<R: RegisterBlock, A: BufferAllocator, T: Timer> DmaEngine<R, A, T> {
    /// Takes over a DMA controller: validates `geometry` against the regions provided,
    /// masks every channel interrupt and enables the controller.
    pub fn new(regions: DmaRegions<R>, geometry: Geometry, allocator: Arc<A>, timer: Arc<T>, config: EngineConfig) -> Result<DmaEngine<R, A, T>, DmaError> {
        geometry.validate().map_err(DmaError::GeometryMismatch)?;
        config.validate()?;
        let needs_dmas = geometry.sram_state.is_some() || geometry.rstart.region == Region::Dmas;
        if needs_dmas && regions.dmas.is_none() {
            return Err(DmaError::GeometryMismatch("geometry uses the DMA SRAM region, but it was not provided"));
        }

        let regs = Arc::new(SharedRegisters::new(regions.dma, regions.dmac, regions.dmas));
        if let Some(irq) = geometry.global_irq {
            regs.write(RegLoc { region: Region::Dma, offset: irq.mask }, 0);
        }
        for hw_chan in 0..geometry.num_hw_channels {
            let irmask = geometry.irmask.at(hw_chan);
            regs.write(irmask, 0);
        }
        if let Some(offset) = geometry.global_config {
            regs.modify(RegLoc { region: Region::Dma, offset }, |v| v | DMA_CFG_EN);
        }

        let mut channels = Vec::with_capacity(geometry.num_channel_pairs());
        channels.resize_with(geometry.num_channel_pairs(), || None);
        info!("bcm63xx_enet: DMA engine up, {} geometry with {} channel pairs",
            geometry.name, geometry.num_channel_pairs());
        Ok(DmaEngine { geometry, config, regs, allocator, timer, channels })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gives access to the raw registers, e.g. for diagnostics.
    pub fn registers(&self) -> &SharedRegisters<R> {
        &self.regs
    }

    /// Creates channel `id`, which uses hardware channels `2 * id` (receive) and `2 * id + 1` (transmit).
    /// The channel starts out disabled.
    pub fn create_channel(&mut self, id: usize, config: ChannelConfig) -> Result<&Channel<R, A, T>, DmaError> {
        let slot = self.channels.get_mut(id).ok_or(DmaError::InvalidChannel)?;
        if slot.is_some() {
            return Err(DmaError::InvalidConfig("channel already exists"));
        }
        let channel = Channel::new(
            id,
            &self.geometry,
            config,
            self.config,
            Arc::clone(&self.regs),
            Arc::clone(&self.allocator),
            Arc::clone(&self.timer),
        )?;
        Ok(slot.insert(channel))
    }

    pub fn channel(&self, id: usize) -> Option<&Channel<R, A, T>> {
        self.channels.get(id).and_then(Option::as_ref)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel<R, A, T>> {
        self.channels.iter().flatten()
    }

    /// Disables channel `id` and frees its rings.
    pub fn remove_channel<S: PacketSink<Buf<A>>>(&mut self, id: usize, sink: &mut S) -> Result<DisableReport, DmaError> {
        let report = self.channel(id).ok_or(DmaError::InvalidChannel)?.disable(sink)?;
        if let Some(slot) = self.channels.get_mut(id) {
            *slot = None;
        }
        debug!("bcm63xx_enet: removed channel {}", id);
        Ok(report)
    }

    /// Reads which hardware channels have an interrupt pending, one bit per hardware channel.
    ///
    /// Chips without a global status register get the same bits built from each channel's IR register.
    pub fn read_global_cause(&self) -> u32 {
        match self.geometry.global_irq {
            Some(irq) => self.regs.read(RegLoc { region: Region::Dma, offset: irq.status }),
            None => (0..self.geometry.num_hw_channels)
                .filter(|&hw_chan| self.regs.read(self.geometry.ir.at(hw_chan)) != 0)
                .fold(0, |cause, hw_chan| cause | self.geometry.global_irq_bit(hw_chan)),
        }
    }

    /// Services every channel flagged in `global_cause`, as read with [`DmaEngine::read_global_cause()`].
    ///
    /// Every flagged channel is serviced even if an earlier one fails;
    /// the first error is returned.
    pub fn dispatch<S: PacketSink<Buf<A>>>(&self, global_cause: u32, budget: usize, sink: &mut S) -> Result<DispatchOutcome, DmaError> {
        let mut outcome = DispatchOutcome::default();
        let mut first_error = None;
        let mut claimed = 0;
        for channel in self.channels() {
            let bits = channel.global_irq_bits();
            claimed |= bits;
            if global_cause & bits == 0 {
                continue;
            }
            let cause: ChannelCause = channel.read_cause();
            match channel.handle_interrupt(cause, budget, sink) {
                Ok(serviced) => {
                    outcome.channels_serviced += 1;
                    outcome.rx_harvested += serviced.rx_harvested;
                    outcome.tx_reclaimed += serviced.tx_reclaimed;
                    outcome.more_pending |= serviced.more_pending;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if global_cause & !claimed != 0 {
            warn!("bcm63xx_enet: interrupt for hardware channels {:#X} that have no driver channel", global_cause & !claimed);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Forwards a scheduled refill retry to channel `id`.
    pub fn retry_refill(&self, id: usize) -> Result<usize, DmaError> {
        self.channel(id).ok_or(DmaError::InvalidChannel)?.retry_refill()
    }

    pub fn reset_channel<S: PacketSink<Buf<A>>>(&self, id: usize, sink: &mut S) -> Result<DisableReport, DmaError> {
        self.channel(id).ok_or(DmaError::InvalidChannel)?.reset(sink)
    }

    pub fn channel_stats(&self, id: usize) -> Option<StatsSnapshot> {
        self.channel(id).map(Channel::stats)
    }

    /// The counters of every channel, added up.
    pub fn stats(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for channel in self.channels() {
            total += channel.stats();
        }
        total
    }

    /// Disables every channel and then the controller itself.
    /// Every channel is disabled even if an earlier one fails; the first error is returned.
    pub fn teardown<S: PacketSink<Buf<A>>>(mut self, sink: &mut S) -> Result<(), DmaError> {
        let mut first_error = None;
        for slot in self.channels.iter_mut() {
            if let Some(channel) = slot.take() {
                if let Err(e) = channel.disable(sink) {
                    error!("bcm63xx_enet: failed to disable channel {}: {}", channel.id(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(irq) = self.geometry.global_irq {
            self.regs.write(RegLoc { region: Region::Dma, offset: irq.mask }, 0);
        }
        if let Some(offset) = self.geometry.global_config {
            self.regs.modify(RegLoc { region: Region::Dma, offset }, |v| v & !DMA_CFG_EN);
        }
        info!("bcm63xx_enet: DMA engine shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

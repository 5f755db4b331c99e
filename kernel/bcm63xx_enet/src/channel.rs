//! A driver channel: one receive and one transmit iuDMA channel working as a pair.
//!
//! Each ring has its own lock, held only while the ring's cursors are updated
//! and while the simple register stores that go with a post are made.
//! Buffers are allocated, released and delivered outside of those locks.
//!
//! The channel moves through `Disabled -> Enabling -> Active -> Quiescing -> Disabled`.
//! Only an `Active` channel accepts posts and services interrupts.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use spin::Mutex;
use iudma_descriptors::{DescriptorLayout, RxStatus, DESC_LENGTH_MAX};
use iudma_regs::{
    Geometry, HwChannelRegs, RegLoc, Region, RegisterBlock, SharedRegisters,
    CHANCFG_EN, CHANCFG_FLOWC_EN, DMA_BUFALLOC_FORCE, IR_ALL, IR_NOTOWNER,
};
use nic_buffers::{BufferAllocator, DmaBuffer};
use nic_queues::{Ring, RingFull};
use crate::{
    ChannelConfig, ChannelStats, DesyncKind, Direction, DmaError, EngineConfig,
    FlowController, FlowState, PacketSink, Rejected, StatsSnapshot, Timer,
    DEFAULT_FC_THRESHOLD, ETH_FCS_LEN, stats::bump,
};

/// The buffer type handed out by allocator `A`.
pub type Buf<A> = <A as BufferAllocator>::Buffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disabled  = 0,
    Enabling  = 1,
    Active    = 2,
    Quiescing = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> ChannelState {
        match value {
            1 => ChannelState::Enabling,
            2 => ChannelState::Active,
            3 => ChannelState::Quiescing,
            _ => ChannelState::Disabled,
        }
    }
}

/// The interrupt status bits of a channel's receive and transmit hardware channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelCause {
    pub rx: u32,
    pub tx: u32,
}

impl ChannelCause {
    pub fn is_empty(&self) -> bool {
        self.rx == 0 && self.tx == 0
    }
}

/// What one round of servicing a channel accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub rx_harvested: usize,
    pub tx_reclaimed: usize,
    /// The receive budget ran out; more completions are probably waiting to be polled.
    pub more_pending: bool,
}

/// What disabling a channel had to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisableReport {
    /// Frames received while quiescing and handed to the sink.
    pub delivered: usize,
    /// Receive buffers taken back from the hardware unused.
    pub forced_rx: usize,
    /// Transmit buffers taken back from the hardware before it sent them.
    pub forced_tx: usize,
    /// The transmit ring did not drain, or the hardware did not halt, in time.
    pub timed_out: bool,
    /// A desync found while draining. The buffers were still released.
    pub desync: Option<DmaError>,
}

/// A snapshot of one ring's cursors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingStatus {
    pub capacity: usize,
    pub live_count: usize,
    pub head: usize,
    pub tail: usize,
}

struct RefillOutcome {
    posted: usize,
    short: bool,
}

pub struct Channel<R: RegisterBlock, A: BufferAllocator, T: Timer> {
    id: usize,
    rx_regs: HwChannelRegs,
    tx_regs: HwChannelRegs,
    layout: DescriptorLayout,
    /// Written to CHANCFG to start or kick a hardware channel.
    enable_mask: u32,
    /// Written to IRMASK to unmask a hardware channel.
    irq_mask: u32,
    /// This channel's bits in the global interrupt mask register, if there is one.
    global_irq_mask: Option<(RegLoc, u32)>,
    global_irq_bits: u32,
    config: ChannelConfig,
    engine_config: EngineConfig,
    rx_ring: Mutex<Ring<Buf<A>>>,
    tx_ring: Mutex<Ring<Buf<A>>>,
    rx_table_bus: AtomicU32,
    tx_table_bus: AtomicU32,
    state: AtomicU8,
    fault: Mutex<Option<DmaError>>,
    refill_pending: AtomicBool,
    flow: Option<FlowController>,
    stats: ChannelStats,
    regs: Arc<SharedRegisters<R>>,
    allocator: Arc<A>,
    timer: Arc<T>,
}

impl<R: RegisterBlock, A: BufferAllocator, T: Timer> Channel<R, A, T> {
    /// Allocates both rings and programs the hardware to use them.
    /// The channel starts out `Disabled` with its interrupts masked.
    pub(crate) fn new(
        id: usize,
        geometry: &Geometry,
        config: ChannelConfig,
        engine_config: EngineConfig,
        regs: Arc<SharedRegisters<R>>,
        allocator: Arc<A>,
        timer: Arc<T>,
    ) -> Result<Channel<R, A, T>, DmaError> {
        config.validate()?;
        let rx_regs = geometry.resolve(2 * id).map_err(|_| DmaError::InvalidChannel)?;
        let tx_regs = geometry.resolve(2 * id + 1).map_err(|_| DmaError::InvalidChannel)?;
        let layout = geometry.descriptor_layout()
            .ok_or(DmaError::GeometryMismatch("descriptor shift out of range"))?;
        for hw in [&rx_regs, &tx_regs] {
            if hw.sram_state.is_some() && !regs.has_region(Region::Dmas) {
                return Err(DmaError::GeometryMismatch("channel needs the DMA SRAM region, which is not mapped"));
            }
        }

        let flow = match (config.flow_control, rx_regs.flow) {
            (true, Some(flow_regs)) => Some(FlowController::new(flow_regs, config.rx_ring_size, config.flow_thresholds)?),
            _ => None,
        };
        let global_irq_bits = geometry.global_irq_bit(rx_regs.hw_chan) | geometry.global_irq_bit(tx_regs.hw_chan);
        let global_irq_mask = geometry.global_irq
            .map(|irq| (RegLoc { region: Region::Dma, offset: irq.mask }, global_irq_bits));
        let (rx_ring, tx_ring) = new_rings(&config, layout)?;
        let enable_mask = match config.flow_control {
            true => geometry.chan_enable_mask,
            false => geometry.chan_enable_mask & !CHANCFG_FLOWC_EN,
        };

        let channel = Channel {
            id,
            rx_regs,
            tx_regs,
            layout,
            enable_mask,
            irq_mask: geometry.chan_int_mask | IR_NOTOWNER,
            global_irq_mask,
            global_irq_bits,
            config,
            engine_config,
            rx_ring: Mutex::new(rx_ring),
            tx_ring: Mutex::new(tx_ring),
            rx_table_bus: AtomicU32::new(0),
            tx_table_bus: AtomicU32::new(0),
            state: AtomicU8::new(ChannelState::Disabled as u8),
            fault: Mutex::new(None),
            refill_pending: AtomicBool::new(false),
            flow,
            stats: ChannelStats::default(),
            regs,
            allocator,
            timer,
        };
        channel.program_rings()?;
        debug!("bcm63xx_enet: created channel {} (hw rx {}, hw tx {}), {} rx / {} tx descriptors",
            id, channel.rx_regs.hw_chan, channel.tx_regs.hw_chan, config.rx_ring_size, config.tx_ring_size);
        Ok(channel)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The hardware channel numbers used for receive and transmit.
    pub fn hw_channels(&self) -> (usize, usize) {
        (self.rx_regs.hw_chan, self.tx_regs.hw_chan)
    }

    /// This channel's bits in the engine-wide interrupt cause.
    pub fn global_irq_bits(&self) -> u32 {
        self.global_irq_bits
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The desync that stopped this channel, if any. Cleared only by `reset()`.
    pub fn fault(&self) -> Option<DmaError> {
        *self.fault.lock()
    }

    pub fn is_refill_pending(&self) -> bool {
        self.refill_pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The mirrored flow-control state, if this channel uses flow control.
    pub fn flow_state(&self) -> Option<FlowState> {
        self.flow.as_ref().map(FlowController::state)
    }

    pub fn flow_controller(&self) -> Option<&FlowController> {
        self.flow.as_ref()
    }

    pub fn ring_status(&self, direction: Direction) -> RingStatus {
        let ring = match direction {
            Direction::Rx => self.rx_ring.lock(),
            Direction::Tx => self.tx_ring.lock(),
        };
        RingStatus {
            capacity: ring.capacity(),
            live_count: ring.live_count(),
            head: ring.head(),
            tail: ring.tail(),
        }
    }

    /// The host address of a ring's descriptor table, for diagnostics.
    pub fn descriptor_table_address(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => self.rx_ring.lock().table().host_address(),
            Direction::Tx => self.tx_ring.lock().table().host_address(),
        }
    }

    /// Reads (without acknowledging) the pending interrupt causes.
    pub fn read_cause(&self) -> ChannelCause {
        ChannelCause {
            rx: self.regs.read(self.rx_regs.ir),
            tx: self.regs.read(self.tx_regs.ir),
        }
    }

    /// Looks up where the device sees both descriptor tables and points the hardware at them.
    fn program_rings(&self) -> Result<(), DmaError> {
        let rx_host = self.rx_ring.lock().table().host_address();
        let tx_host = self.tx_ring.lock().table().host_address();
        let rx_bus = self.allocator.bus_address_of(rx_host)
            .ok_or(DmaError::InvalidConfig("rx descriptor table is not addressable by the DMA engine"))?;
        let tx_bus = self.allocator.bus_address_of(tx_host)
            .ok_or(DmaError::InvalidConfig("tx descriptor table is not addressable by the DMA engine"))?;
        self.rx_table_bus.store(rx_bus, Ordering::Release);
        self.tx_table_bus.store(tx_bus, Ordering::Release);
        self.write_ring_registers();
        Ok(())
    }

    /// Returns the per-channel hardware state to what a freshly created ring expects.
    fn write_ring_registers(&self) {
        let rings = [
            (&self.rx_regs, self.rx_table_bus.load(Ordering::Acquire), self.config.rx_ring_size),
            (&self.tx_regs, self.tx_table_bus.load(Ordering::Acquire), self.config.tx_ring_size),
        ];
        for (hw, table_bus, len) in rings {
            self.regs.write(hw.irmask, 0);
            self.regs.write(hw.rstart, table_bus);
            if let Some(sram_state) = hw.sram_state {
                for loc in sram_state {
                    self.regs.write(loc, 0);
                }
            }
            if let Some(len_reg) = hw.len {
                self.regs.write(len_reg, len as u32);
            }
            self.regs.write(hw.maxburst, self.config.max_burst);
        }
        // restart the count of buffers the hardware may fill
        self.regs.write(self.rx_regs.bufalloc, DMA_BUFALLOC_FORCE);
        if let Some(flow) = &self.flow {
            flow.program(&self.regs);
        }
        if let (Some(fc), true) = (self.rx_regs.fc, self.config.flow_control) {
            self.regs.write(fc, DEFAULT_FC_THRESHOLD);
        }
    }

    fn mask_irqs(&self) {
        self.regs.write(self.rx_regs.irmask, 0);
        self.regs.write(self.tx_regs.irmask, 0);
    }

    fn unmask_irqs(&self) {
        self.regs.write(self.rx_regs.irmask, self.irq_mask);
        self.regs.write(self.tx_regs.irmask, self.irq_mask);
    }

    fn ack(&self, cause: ChannelCause) {
        if cause.rx != 0 {
            self.regs.write(self.rx_regs.ir, cause.rx);
        }
        if cause.tx != 0 {
            self.regs.write(self.tx_regs.ir, cause.tx);
        }
    }

    /// Records a desync, stops the channel's interrupts, and returns the error to escalate.
    fn desync(&self, direction: Direction, reason: DesyncKind) -> DmaError {
        let error = DmaError::RingDesync { channel: self.id, direction, reason };
        bump(&self.stats.desync_events, 1);
        self.mask_irqs();
        self.fault.lock().get_or_insert(error);
        error!("bcm63xx_enet: {}; the channel must be reset", error);
        error
    }

    /// Returns an error unless the channel is taking new transmissions.
    fn check_accepting(&self) -> Result<(), DmaError> {
        match self.state() {
            ChannelState::Active => match self.fault() {
                Some(error) => Err(error),
                None => Ok(()),
            },
            ChannelState::Quiescing => Err(DmaError::ChannelQuiescing),
            ChannelState::Disabled | ChannelState::Enabling => Err(DmaError::ChannelInactive),
        }
    }

    /// Starts the channel: fills the receive ring, unmasks interrupts and starts reception.
    ///
    /// Fails with `BufferAllocationFailed`, leaving the channel disabled,
    /// if not a single receive buffer could be allocated.
    pub fn enable(&self) -> Result<(), DmaError> {
        if let Some(error) = self.fault() {
            return Err(error);
        }
        let from = ChannelState::Disabled as u8;
        let to = ChannelState::Enabling as u8;
        if let Err(current) = self.state.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire) {
            return match ChannelState::from_u8(current) {
                ChannelState::Active => Ok(()),
                ChannelState::Quiescing => Err(DmaError::ChannelQuiescing),
                _ => Err(DmaError::ChannelInactive),
            };
        }

        self.refill();
        let rx_live = self.rx_ring.lock().live_count();
        if rx_live == 0 {
            self.refill_pending.store(false, Ordering::Release);
            self.set_state(ChannelState::Disabled);
            error!("bcm63xx_enet: channel {}: could not allocate any rx buffers, not enabling", self.id);
            return Err(DmaError::BufferAllocationFailed);
        }

        self.set_state(ChannelState::Active);
        self.regs.write(self.rx_regs.ir, IR_ALL);
        self.regs.write(self.tx_regs.ir, IR_ALL);
        if let Some(flow) = &self.flow {
            flow.enable(&self.regs);
            flow.update(rx_live);
        }
        if let Some((loc, bits)) = self.global_irq_mask {
            self.regs.modify(loc, |v| v | bits);
        }
        self.regs.write(self.rx_regs.chancfg, self.enable_mask);
        self.unmask_irqs();
        debug!("bcm63xx_enet: channel {} enabled with {} rx buffers posted", self.id, rx_live);
        Ok(())
    }

    /// Posts receive buffers while the channel may take them.
    /// Returns how many were posted and the ring's resulting live count;
    /// buffers that could not be posted go back to the allocator.
    fn post_rx_buffers(&self, buffers: Vec<Buf<A>>) -> (usize, usize) {
        let mut buffers = buffers.into_iter();
        let mut posted = 0;
        let mut rejected = None;
        let live = {
            let mut ring = self.rx_ring.lock();
            let state = self.state();
            if state == ChannelState::Active || state == ChannelState::Enabling {
                for buffer in buffers.by_ref() {
                    match ring.post_rx(buffer) {
                        Ok(()) => {
                            posted += 1;
                            self.regs.write(self.rx_regs.bufalloc, 1);
                        }
                        Err(RingFull(buffer)) => {
                            rejected = Some(buffer);
                            break;
                        }
                    }
                }
            }
            ring.live_count()
        };
        for buffer in rejected.into_iter().chain(buffers) {
            self.allocator.release(buffer);
        }
        (posted, live)
    }

    /// Tops up the receive ring. Never blocks: if the allocator runs dry,
    /// the shortfall is recorded and a retry is scheduled with the timer.
    fn refill(&self) -> RefillOutcome {
        let needed = self.rx_ring.lock().free_count();
        let mut fresh = Vec::with_capacity(needed);
        while fresh.len() < needed {
            match self.allocator.allocate(self.config.rx_buffer_size) {
                Some(buffer) => fresh.push(buffer),
                None => break,
            }
        }
        let short = fresh.len() < needed;
        let (posted, live) = self.post_rx_buffers(fresh);
        if let Some(flow) = &self.flow {
            flow.update(live);
        }

        if short {
            bump(&self.stats.alloc_failures, 1);
            if !self.refill_pending.swap(true, Ordering::AcqRel) {
                warn!("bcm63xx_enet: channel {}: rx refill is {} buffers short, retrying in {} ms",
                    self.id, needed - posted, self.engine_config.refill_retry_ms);
                self.timer.schedule_refill(self.id, self.engine_config.refill_retry_ms);
            }
        } else {
            self.refill_pending.store(false, Ordering::Release);
        }
        RefillOutcome { posted, short }
    }

    /// The entry point for the timer scheduled by a short refill.
    ///
    /// Returns the number of buffers posted, or `BufferAllocationFailed`
    /// if the ring is still not full (another retry has then been scheduled).
    pub fn retry_refill(&self) -> Result<usize, DmaError> {
        if !self.refill_pending.swap(false, Ordering::AcqRel) {
            return Ok(0);
        }
        bump(&self.stats.refill_retries, 1);
        if self.state() != ChannelState::Active {
            return Ok(0);
        }
        let outcome = self.refill();
        if outcome.posted > 0 {
            self.regs.write(self.rx_regs.chancfg, self.enable_mask);
        }
        if outcome.short {
            Err(DmaError::BufferAllocationFailed)
        } else {
            Ok(outcome.posted)
        }
    }

    /// Decides what to do with a completed receive.
    /// Returns the length to deliver, or `None` if the frame must be dropped.
    fn accept_rx(&self, status: &RxStatus) -> Option<u16> {
        if status.has_errors() {
            bump(&self.stats.rx_errors, 1);
            debug!("bcm63xx_enet: channel {}: rx error, status {:#X}", self.id, status.errors);
            return None;
        }
        if !status.is_whole_frame() {
            bump(&self.stats.rx_dropped, 1);
            warn!("bcm63xx_enet: channel {}: dropping {}-byte frame that spans descriptors", self.id, status.length);
            return None;
        }
        let length = if self.config.strip_fcs {
            status.length.saturating_sub(ETH_FCS_LEN)
        } else {
            status.length
        };
        if length == 0 {
            bump(&self.stats.rx_dropped, 1);
            warn!("bcm63xx_enet: channel {}: dropping runt frame of {} bytes", self.id, status.length);
            return None;
        }
        bump(&self.stats.rx_packets, 1);
        bump(&self.stats.rx_bytes, length as usize);
        Some(length)
    }

    /// Harvests up to `budget` completed receives and delivers the good ones.
    /// Buffers of bad frames are posted again if `repost` is set, otherwise released.
    ///
    /// Returns the number of descriptors harvested.
    fn harvest<S: PacketSink<Buf<A>>>(&self, budget: usize, sink: &mut S, repost: bool) -> Result<usize, DmaError> {
        let mut completed = Vec::with_capacity(budget.min(self.config.rx_ring_size));
        let desync = {
            let mut ring = self.rx_ring.lock();
            let mut desync = None;
            while completed.len() < budget {
                match ring.harvest_rx() {
                    Ok(Some(c)) => completed.push(c),
                    Ok(None) => break,
                    Err(e) => {
                        desync = Some(e);
                        break;
                    }
                }
            }
            desync
        };

        let harvested = completed.len();
        let mut recycled = Vec::new();
        for (buffer, status) in completed {
            match self.accept_rx(&status) {
                Some(length) => sink.deliver(self.id, buffer, length),
                None => recycled.push(buffer),
            }
        }
        if repost {
            self.post_rx_buffers(recycled);
        } else {
            for buffer in recycled {
                self.allocator.release(buffer);
            }
        }

        match desync {
            Some(e) => Err(self.desync(Direction::Rx, DesyncKind::Descriptor(e))),
            None => Ok(harvested),
        }
    }

    /// Takes back every transmit buffer the hardware has finished with,
    /// and returns them to the allocator.
    pub fn reclaim_tx(&self) -> Result<usize, DmaError> {
        let mut done = Vec::with_capacity(self.config.tx_ring_size);
        let desync = {
            let mut ring = self.tx_ring.lock();
            let mut desync = None;
            loop {
                match ring.reclaim_tx() {
                    Ok(Some(buffer)) => done.push(buffer),
                    Ok(None) => break,
                    Err(e) => {
                        desync = Some(e);
                        break;
                    }
                }
            }
            desync
        };

        let reclaimed = done.len();
        for buffer in done {
            self.allocator.release(buffer);
        }
        match desync {
            Some(e) => Err(self.desync(Direction::Tx, DesyncKind::Descriptor(e))),
            None => Ok(reclaimed),
        }
    }

    /// Reclaims transmit completions, then harvests receive completions and refills the ring.
    fn service<S: PacketSink<Buf<A>>>(&self, do_rx: bool, do_tx: bool, budget: usize, sink: &mut S) -> Result<ServiceOutcome, DmaError> {
        let mut outcome = ServiceOutcome::default();
        if do_tx {
            outcome.tx_reclaimed = self.reclaim_tx()?;
        }
        if do_rx {
            outcome.rx_harvested = self.harvest(budget, sink, true)?;
            outcome.more_pending = budget > 0 && outcome.rx_harvested == budget;
            if self.refill().posted > 0 {
                // kick rx dma
                self.regs.write(self.rx_regs.chancfg, self.enable_mask);
            }
        }
        Ok(outcome)
    }

    /// Services the interrupt causes `cause`, which the caller read with [`Channel::read_cause()`].
    ///
    /// The channel's interrupts are masked for the duration and unmasked on the way out,
    /// unless the channel stopped being active or hit a desync.
    /// At most `budget` received frames are harvested; if the budget ran out,
    /// the returned outcome says so and the rest can be picked up with [`Channel::poll()`].
    pub fn handle_interrupt<S: PacketSink<Buf<A>>>(&self, cause: ChannelCause, budget: usize, sink: &mut S) -> Result<ServiceOutcome, DmaError> {
        self.mask_irqs();
        self.ack(cause);
        if self.state() != ChannelState::Active {
            // `enable()` unmasks again
            return Ok(ServiceOutcome::default());
        }
        if let Some(error) = self.fault() {
            return Err(error);
        }
        if cause.tx & IR_NOTOWNER != 0 {
            self.check_not_owner(Direction::Tx)?;
        }
        if cause.rx & IR_NOTOWNER != 0 {
            self.check_not_owner(Direction::Rx)?;
        }

        let outcome = self.service(cause.rx != 0, cause.tx != 0, budget, sink)?;
        if self.state() == ChannelState::Active && self.fault().is_none() {
            self.unmask_irqs();
            // a concurrent `disable()` or desync may have masked in between
            if self.state() != ChannelState::Active || self.fault().is_some() {
                self.mask_irqs();
            }
        }
        Ok(outcome)
    }

    /// Decides whether a NOTOWNER interrupt agrees with the ring's bookkeeping.
    ///
    /// The hardware raises it when it walks past the descriptors it was given,
    /// which is ordinary backpressure once it has completed at least the oldest one.
    /// It is a desync if nothing was posted at all, or if the oldest posted
    /// descriptor is still owned by the hardware.
    fn check_not_owner(&self, direction: Direction) -> Result<(), DmaError> {
        let inconsistent = {
            let ring = match direction {
                Direction::Rx => self.rx_ring.lock(),
                Direction::Tx => self.tx_ring.lock(),
            };
            ring.live_count() == 0
                || ring.table().get(ring.head()).map_or(false, |d| d.owned_by_hardware())
        };
        if inconsistent {
            return Err(self.desync(direction, DesyncKind::NotOwnerInterrupt));
        }
        debug!("bcm63xx_enet: channel {}: {:?} ran out of descriptors", self.id, direction);
        Ok(())
    }

    /// Services both rings from caller context, without touching the interrupt registers.
    pub fn poll<S: PacketSink<Buf<A>>>(&self, budget: usize, sink: &mut S) -> Result<ServiceOutcome, DmaError> {
        self.check_accepting()?;
        self.service(true, true, budget, sink)
    }

    /// Queues `length` bytes of `buffer` for transmission and kicks the transmit channel.
    ///
    /// `sop` and `eop` mark the first and last fragment of a packet;
    /// a packet in a single buffer sets both.
    pub fn post_tx(&self, buffer: Buf<A>, length: u16, sop: bool, eop: bool) -> Result<(), Rejected<Buf<A>>> {
        if let Err(error) = self.check_accepting() {
            return Err(Rejected::new(error, buffer));
        }
        if length == 0 || length > buffer.capacity() || length > DESC_LENGTH_MAX {
            return Err(Rejected::new(DmaError::InvalidLength, buffer));
        }
        let result = {
            let mut ring = self.tx_ring.lock();
            if self.state() != ChannelState::Active {
                Err((DmaError::ChannelQuiescing, buffer))
            } else {
                match ring.post_tx(buffer, length, sop, eop) {
                    Ok(()) => {
                        self.regs.write(self.tx_regs.chancfg, self.enable_mask);
                        Ok(())
                    }
                    Err(RingFull(buffer)) => Err((DmaError::RingFull, buffer)),
                }
            }
        };
        match result {
            Ok(()) => {
                if eop {
                    bump(&self.stats.tx_packets, 1);
                }
                bump(&self.stats.tx_bytes, length as usize);
                Ok(())
            }
            Err((error, buffer)) => Err(Rejected::new(error, buffer)),
        }
    }

    /// Transmits a packet that fits in one buffer.
    pub fn transmit(&self, buffer: Buf<A>, length: u16) -> Result<(), Rejected<Buf<A>>> {
        self.post_tx(buffer, length, true, true)
    }

    /// Transmits a packet split over several buffers, given with the length used from each.
    /// Either the whole packet is queued or none of it is.
    pub fn transmit_fragments(&self, fragments: Vec<(Buf<A>, u16)>) -> Result<(), Rejected<Vec<(Buf<A>, u16)>>> {
        if let Err(error) = self.check_accepting() {
            return Err(Rejected::new(error, fragments));
        }
        let bad_length = fragments.iter()
            .any(|(buffer, length)| *length == 0 || *length > buffer.capacity() || *length > DESC_LENGTH_MAX);
        if fragments.is_empty() || bad_length {
            return Err(Rejected::new(DmaError::InvalidLength, fragments));
        }
        let total: usize = fragments.iter().map(|(_, length)| *length as usize).sum();
        let result = {
            let mut ring = self.tx_ring.lock();
            if self.state() != ChannelState::Active {
                Err((DmaError::ChannelQuiescing, fragments))
            } else {
                match ring.post_tx_packet(fragments) {
                    Ok(()) => {
                        self.regs.write(self.tx_regs.chancfg, self.enable_mask);
                        Ok(())
                    }
                    Err(RingFull(fragments)) => Err((DmaError::RingFull, fragments)),
                }
            }
        };
        match result {
            Ok(()) => {
                bump(&self.stats.tx_packets, 1);
                bump(&self.stats.tx_bytes, total);
                Ok(())
            }
            Err((error, fragments)) => Err(Rejected::new(error, fragments)),
        }
    }

    /// One pass over both rings while quiescing. Received frames are delivered but not replaced.
    fn drain_once<S: PacketSink<Buf<A>>>(&self, sink: &mut S, report: &mut DisableReport) {
        let delivered_before = self.stats.rx_packets.load(Ordering::Relaxed);
        if let Err(e) = self.reclaim_tx() {
            report.desync.get_or_insert(e);
        }
        if let Err(e) = self.harvest(self.config.rx_ring_size, sink, false) {
            report.desync.get_or_insert(e);
        }
        report.delivered += self.stats.rx_packets.load(Ordering::Relaxed) - delivered_before;
    }

    /// Stops both hardware channels and waits for them to report that they have.
    fn halt(&self) -> bool {
        self.regs.write(self.rx_regs.chancfg, 0);
        self.regs.write(self.tx_regs.chancfg, 0);
        let mut waited = 0;
        loop {
            let running = (self.regs.read(self.rx_regs.chancfg) | self.regs.read(self.tx_regs.chancfg)) & CHANCFG_EN;
            if running == 0 {
                return true;
            }
            if waited >= self.engine_config.quiesce_timeout_us {
                warn!("bcm63xx_enet: channel {} did not halt within {} us", self.id, waited);
                return false;
            }
            self.timer.delay_us(self.engine_config.quiesce_poll_us);
            waited += self.engine_config.quiesce_poll_us;
        }
    }

    /// Audits every descriptor of both rings against their bookkeeping.
    fn verify_rings(&self) -> Result<(), DmaError> {
        let rx = self.rx_ring.lock().verify();
        if let Err(e) = rx {
            return Err(self.desync(Direction::Rx, DesyncKind::Descriptor(e)));
        }
        let tx = self.tx_ring.lock().verify();
        if let Err(e) = tx {
            return Err(self.desync(Direction::Tx, DesyncKind::Descriptor(e)));
        }
        Ok(())
    }

    /// Takes every buffer out of both rings and gives them back to the allocator.
    fn release_all(&self) -> (usize, usize) {
        let mut rx_buffers = Vec::with_capacity(self.config.rx_ring_size);
        let mut tx_buffers = Vec::with_capacity(self.config.tx_ring_size);
        let forced_rx = self.rx_ring.lock().force_release(&mut rx_buffers);
        let forced_tx = self.tx_ring.lock().force_release(&mut tx_buffers);
        for buffer in rx_buffers.into_iter().chain(tx_buffers) {
            self.allocator.release(buffer);
        }
        (forced_rx, forced_tx)
    }

    /// Stops the channel.
    ///
    /// New posts are refused from the moment this is called. In-flight transmissions
    /// get a bounded time to finish, and frames received meanwhile are handed to `sink`.
    /// Then the hardware is halted, every buffer still in a ring is released,
    /// and the hardware's ring state is reset.
    pub fn disable<S: PacketSink<Buf<A>>>(&self, sink: &mut S) -> Result<DisableReport, DmaError> {
        let from = ChannelState::Active as u8;
        let to = ChannelState::Quiescing as u8;
        if let Err(current) = self.state.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire) {
            return match ChannelState::from_u8(current) {
                ChannelState::Disabled => Ok(DisableReport::default()),
                _ => Err(DmaError::ChannelQuiescing),
            };
        }
        debug!("bcm63xx_enet: channel {} quiescing", self.id);
        self.mask_irqs();
        if let Some((loc, bits)) = self.global_irq_mask {
            self.regs.modify(loc, |v| v & !bits);
        }
        if let Some(flow) = &self.flow {
            flow.disable(&self.regs);
        }

        let mut report = DisableReport::default();
        let faulted = self.fault().is_some();
        let mut waited = 0;
        loop {
            if !faulted {
                self.drain_once(sink, &mut report);
            }
            if faulted || report.desync.is_some() || self.tx_ring.lock().is_empty() {
                break;
            }
            if waited >= self.engine_config.quiesce_timeout_us {
                warn!("bcm63xx_enet: channel {}: tx ring did not drain within {} us", self.id, waited);
                report.timed_out = true;
                break;
            }
            self.timer.delay_us(self.engine_config.quiesce_poll_us);
            waited += self.engine_config.quiesce_poll_us;
        }

        if !self.halt() {
            report.timed_out = true;
        }
        if !faulted && report.desync.is_none() {
            self.drain_once(sink, &mut report);
        }
        if let Err(e) = self.verify_rings() {
            report.desync.get_or_insert(e);
        }

        let (forced_rx, forced_tx) = self.release_all();
        report.forced_rx = forced_rx;
        report.forced_tx = forced_tx;
        bump(&self.stats.forced_reclaims, forced_rx + forced_tx);
        if forced_tx > 0 {
            warn!("bcm63xx_enet: channel {}: dropped {} unsent tx buffers", self.id, forced_tx);
        }

        self.write_ring_registers();
        self.refill_pending.store(false, Ordering::Release);
        self.set_state(ChannelState::Disabled);
        debug!("bcm63xx_enet: channel {} disabled: {:?}", self.id, report);
        Ok(report)
    }

    /// Recovers from a desync: disables the channel, replaces both rings with
    /// freshly allocated ones, clears the fault and enables the channel again.
    pub fn reset<S: PacketSink<Buf<A>>>(&self, sink: &mut S) -> Result<DisableReport, DmaError> {
        warn!("bcm63xx_enet: resetting channel {} (fault: {:?})", self.id, self.fault());
        let report = self.disable(sink)?;

        let (rx_ring, tx_ring) = new_rings(&self.config, self.layout)?;
        let old_rx = core::mem::replace(&mut *self.rx_ring.lock(), rx_ring);
        let old_tx = core::mem::replace(&mut *self.tx_ring.lock(), tx_ring);
        drop(old_rx);
        drop(old_tx);
        self.program_rings()?;

        *self.fault.lock() = None;
        self.enable()?;
        Ok(report)
    }
}

fn new_rings<B: DmaBuffer>(config: &ChannelConfig, layout: DescriptorLayout) -> Result<(Ring<B>, Ring<B>), DmaError> {
    let rx = Ring::new(config.rx_ring_size, layout).map_err(DmaError::InvalidConfig)?;
    let tx = Ring::new(config.tx_ring_size, layout).map_err(DmaError::InvalidConfig)?;
    Ok((rx, tx))
}

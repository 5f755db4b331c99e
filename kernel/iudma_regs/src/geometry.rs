//! Per-chip register geometry tables.

use iudma_descriptors::DescriptorLayout;
use crate::{CHANCFG_CHAINING, CHANCFG_EN, CHANCFG_FLOWC_EN, CHANCFG_WRAP_EN, IR_BUFDONE, IR_PKTDONE, dma_cfg_flowc_enable};

/// One of the memory-mapped regions of the DMA controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Dma,
    Dmac,
    Dmas,
}

/// The fully resolved location of one 32-bit register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegLoc {
    pub region: Region,
    pub offset: usize,
}

/// A register that exists once per hardware channel,
/// at `offset + hw_chan * stride` within `region`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChanReg {
    pub region: Region,
    pub offset: usize,
    pub stride: usize,
}

impl ChanReg {
    pub const fn at(&self, hw_chan: usize) -> RegLoc {
        RegLoc { region: self.region, offset: self.offset + hw_chan * self.stride }
    }
}

/// Flow-control threshold registers, present only on chips with on-chip DMA SRAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowLayout {
    pub low: ChanReg,
    pub high: ChanReg,
}

/// The controller-wide interrupt status and mask registers in the `Dma` region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalIrqLayout {
    pub status: usize,
    pub mask: usize,
}

/// Describes how the iuDMA registers of one chip family are laid out.
///
/// This is pure data; a value is selected once, validated, and then used
/// to resolve every register a channel needs via [`Geometry::resolve()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub name: &'static str,
    /// The chip ids that use this layout.
    pub chip_ids: &'static [u16],
    /// The number of hardware DMA channels; a driver channel uses an rx/tx pair.
    pub num_hw_channels: usize,
    /// The distance between two channels' blocks in the `Dmac` region.
    pub chan_width: usize,
    /// How far the EOP, SOP and WRAP descriptor bits are shifted down.
    pub desc_shift: u32,

    pub chancfg: ChanReg,
    pub ir: ChanReg,
    pub irmask: ChanReg,
    pub maxburst: ChanReg,
    pub rstart: ChanReg,
    /// The ring length register, only needed when the chip has no SRAM state.
    pub len: Option<ChanReg>,
    pub bufalloc: ChanReg,
    /// The three SRAM state words that must be cleared before a channel starts.
    pub sram_state: Option<[ChanReg; 3]>,
    pub flow: Option<FlowLayout>,
    /// The single buffer threshold register of chips that have no FLOWCL/FLOWCH pair.
    /// It takes effect only when CHANCFG sets `CHANCFG_FLOWC_EN`.
    pub fc: Option<ChanReg>,
    /// Offset of the global config register in the `Dma` region.
    pub global_config: Option<usize>,
    pub global_irq: Option<GlobalIrqLayout>,

    /// The value written to CHANCFG to start (or kick) a channel.
    pub chan_enable_mask: u32,
    /// The completion interrupt this chip raises per channel.
    pub chan_int_mask: u32,
}

const fn dmac(offset: usize, width: usize) -> ChanReg {
    ChanReg { region: Region::Dmac, offset, stride: width }
}

const fn dmas(offset: usize) -> ChanReg {
    ChanReg { region: Region::Dmas, offset, stride: DMAS_CHAN_WIDTH }
}

const fn dma(offset: usize, stride: usize) -> ChanReg {
    ChanReg { region: Region::Dma, offset, stride }
}

/// The per-channel width of the `Dmac` region on every chip except the BCM6345.
pub const DMAC_CHAN_WIDTH:              usize = 0x10;
/// The per-channel width of the `Dmac` region on the BCM6345.
pub const DMAC_6345_CHAN_WIDTH:         usize = 0x40;
/// The per-channel width of the `Dmas` region.
pub const DMAS_CHAN_WIDTH:              usize = 0x10;
/// The FLOWCL/FLOWCH/BUFALLOC registers of consecutive channels are 6 bytes apart.
const DMA_FLOW_STRIDE:                  usize = 6;

/// BCM6345: one rx/tx pair, wide per-channel blocks, no SRAM, shifted descriptor flags.
/// Flow control uses the per-channel FC threshold register instead of FLOWCL/FLOWCH.
pub const BCM6345: Geometry = Geometry {
    name: "bcm6345",
    chip_ids: &[0x6345],
    num_hw_channels: 2,
    chan_width: DMAC_6345_CHAN_WIDTH,
    desc_shift: 3,
    chancfg:  dmac(0x00, DMAC_6345_CHAN_WIDTH),
    maxburst: dmac(0x04, DMAC_6345_CHAN_WIDTH),
    rstart:   dmac(0x08, DMAC_6345_CHAN_WIDTH),
    len:      Some(dmac(0x0c, DMAC_6345_CHAN_WIDTH)),
    ir:       dmac(0x14, DMAC_6345_CHAN_WIDTH),
    irmask:   dmac(0x18, DMAC_6345_CHAN_WIDTH),
    fc:       Some(dmac(0x1c, DMAC_6345_CHAN_WIDTH)),
    bufalloc: dmac(0x20, DMAC_6345_CHAN_WIDTH),
    sram_state: None,
    flow: None,
    global_config: None,
    global_irq: None,
    chan_enable_mask: CHANCFG_EN | CHANCFG_CHAINING | CHANCFG_WRAP_EN | CHANCFG_FLOWC_EN,
    chan_int_mask: IR_BUFDONE,
};

/// BCM6338, BCM6348 and BCM6358: SRAM state words and flow-control thresholds.
pub const BCM6348: Geometry = Geometry {
    name: "bcm6348",
    chip_ids: &[0x6338, 0x6348, 0x6358],
    num_hw_channels: 4,
    chan_width: DMAC_CHAN_WIDTH,
    desc_shift: 0,
    chancfg:  dmac(0x0, DMAC_CHAN_WIDTH),
    ir:       dmac(0x4, DMAC_CHAN_WIDTH),
    irmask:   dmac(0x8, DMAC_CHAN_WIDTH),
    maxburst: dmac(0xc, DMAC_CHAN_WIDTH),
    rstart:   dmas(0x0),
    len:      None,
    bufalloc: dma(0xc, DMA_FLOW_STRIDE),
    sram_state: Some([dmas(0x4), dmas(0x8), dmas(0xc)]),
    flow: Some(FlowLayout {
        low:  dma(0x4, DMA_FLOW_STRIDE),
        high: dma(0x8, DMA_FLOW_STRIDE),
    }),
    fc: None,
    global_config: Some(0x0),
    global_irq: None,
    chan_enable_mask: CHANCFG_EN,
    chan_int_mask: IR_PKTDONE,
};

/// BCM6328, BCM6362 and BCM6368: as the BCM6348, plus global interrupt status and mask.
pub const BCM6368: Geometry = Geometry {
    name: "bcm6368",
    chip_ids: &[0x6328, 0x6362, 0x6368],
    num_hw_channels: 8,
    global_irq: Some(GlobalIrqLayout { status: 0x40, mask: 0x44 }),
    ..BCM6348
};

/// Every geometry this driver knows about.
pub static GEOMETRIES: &[&Geometry] = &[&BCM6345, &BCM6348, &BCM6368];


/// The registers of one hardware channel, resolved from a [`Geometry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwChannelRegs {
    pub hw_chan: usize,
    pub chancfg: RegLoc,
    pub ir: RegLoc,
    pub irmask: RegLoc,
    pub maxburst: RegLoc,
    pub rstart: RegLoc,
    pub len: Option<RegLoc>,
    pub bufalloc: RegLoc,
    pub sram_state: Option<[RegLoc; 3]>,
    pub flow: Option<FlowRegs>,
    pub fc: Option<RegLoc>,
}

/// The resolved flow-control registers of one hardware channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowRegs {
    pub config: RegLoc,
    pub enable_bit: u32,
    pub low: RegLoc,
    pub high: RegLoc,
}

impl Geometry {
    /// Returns the geometry used by the given chip, e.g. `0x6368`.
    pub fn for_chip(chip_id: u16) -> Option<&'static Geometry> {
        GEOMETRIES.iter()
            .find(|g| g.chip_ids.contains(&chip_id))
            .copied()
    }

    /// The descriptor flag layout that goes with this geometry.
    pub fn descriptor_layout(&self) -> Option<DescriptorLayout> {
        DescriptorLayout::new(self.desc_shift)
    }

    /// The number of rx/tx channel pairs.
    pub const fn num_channel_pairs(&self) -> usize {
        self.num_hw_channels / 2
    }

    pub const fn has_flow_control(&self) -> bool {
        self.flow.is_some()
    }

    pub const fn has_sram_state(&self) -> bool {
        self.sram_state.is_some()
    }

    pub const fn has_global_irq(&self) -> bool {
        self.global_irq.is_some()
    }

    /// The bit that represents `hw_chan` in the global interrupt status and mask registers.
    pub const fn global_irq_bit(&self, hw_chan: usize) -> u32 {
        1 << hw_chan
    }

    /// Checks that this geometry is internally consistent.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_hw_channels == 0 || self.num_hw_channels % 2 != 0 {
            return Err("geometry must describe a non-zero, even number of hardware channels");
        }
        if self.num_hw_channels > 32 {
            return Err("geometry describes more hardware channels than a 32-bit cause register holds");
        }
        if self.chan_width < 4 || self.chan_width % 4 != 0 {
            return Err("geometry channel width must be a non-zero multiple of 4 bytes");
        }
        if self.descriptor_layout().is_none() {
            return Err("geometry descriptor shift would move flags onto the ownership bit");
        }
        for reg in [self.chancfg, self.ir, self.irmask, self.maxburst] {
            if reg.region != Region::Dmac || reg.offset + 4 > self.chan_width {
                return Err("geometry places a channel control register outside its channel block");
            }
        }
        if let Some(fc) = self.fc {
            if fc.region != Region::Dmac || fc.offset + 4 > self.chan_width {
                return Err("geometry places the flow-control threshold register outside its channel block");
            }
        }
        if self.chan_enable_mask & CHANCFG_FLOWC_EN != 0 && self.fc.is_none() {
            return Err("geometry enables channel flow control but has no threshold register");
        }
        if self.flow.is_some() && self.global_config.is_none() {
            return Err("geometry has flow-control thresholds but no global config register");
        }
        if self.rstart.region == Region::Dmas && self.sram_state.is_none() {
            return Err("geometry places the ring start in SRAM but has no SRAM state words");
        }
        if self.len.is_none() && self.sram_state.is_none() {
            return Err("geometry has neither a ring length register nor SRAM state");
        }
        if let (Some(flow), Some(irq)) = (self.flow, self.global_irq) {
            for hw_chan in 0..self.num_hw_channels {
                for reg in [flow.low.at(hw_chan), flow.high.at(hw_chan), self.bufalloc.at(hw_chan)] {
                    if reg.region == Region::Dma && (reg.offset == irq.status || reg.offset == irq.mask) {
                        return Err("geometry flow-control registers overlap the global interrupt registers");
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves every register of hardware channel `hw_chan`.
    pub fn resolve(&self, hw_chan: usize) -> Result<HwChannelRegs, &'static str> {
        if hw_chan >= self.num_hw_channels {
            return Err("hardware channel number is beyond what the geometry describes");
        }
        let flow = match (self.flow, self.global_config) {
            (Some(flow), Some(config)) => Some(FlowRegs {
                config: RegLoc { region: Region::Dma, offset: config },
                enable_bit: dma_cfg_flowc_enable(hw_chan),
                low: flow.low.at(hw_chan),
                high: flow.high.at(hw_chan),
            }),
            _ => None,
        };
        Ok(HwChannelRegs {
            hw_chan,
            chancfg:    self.chancfg.at(hw_chan),
            ir:         self.ir.at(hw_chan),
            irmask:     self.irmask.at(hw_chan),
            maxburst:   self.maxburst.at(hw_chan),
            rstart:     self.rstart.at(hw_chan),
            len:        self.len.map(|r| r.at(hw_chan)),
            bufalloc:   self.bufalloc.at(hw_chan),
            sram_state: self.sram_state.map(|regs| regs.map(|r| r.at(hw_chan))),
            flow,
            fc:         self.fc.map(|r| r.at(hw_chan)),
        })
    }
}

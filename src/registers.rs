use bitflags::bitflags;

/// AX5043 register addresses, per Table 22 of the programming manual.
///
/// Addresses below [`LONG_ADDR_THRESHOLD`] are reachable with the short
/// (single command byte) SPI form; everything at or above it needs the
/// two-byte long form.
#[allow(dead_code)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    Revision = 0x000,        // Silicon revision.
    Scratch = 0x001,         // Scratch register, used by the self-test.
    PwrMode = 0x002,         // Power mode / reset.
    PowStat = 0x003,         // Power management status.
    IrqMask1 = 0x006,        // IRQ mask, high byte.
    IrqMask0 = 0x007,        // IRQ mask, low byte.
    RadioEventMask1 = 0x008, // Radio event mask, high byte.
    RadioEventMask0 = 0x009, // Radio event mask, low byte.
    IrqRequest1 = 0x00C,     // Pending IRQs, high byte.
    IrqRequest0 = 0x00D,     // Pending IRQs, low byte.
    RadioEventReq1 = 0x00E,  // Pending radio events, high byte.
    RadioEventReq0 = 0x00F,  // Pending radio events, low byte (REVRDONE).
    Modulation = 0x010,      // Modulation scheme.
    Encoding = 0x011,        // Encoder/decoder settings.
    Framing = 0x012,         // Framing mode.
    RadioState = 0x01C,      // Radio controller state, 0 = idle.
    XtalStatus = 0x01D,      // Crystal oscillator status, bit 0 = running.
    FifoStat = 0x028,        // FIFO status (read) / FIFO commands (write).
    FifoData = 0x029,        // FIFO data port.
    FifoCount1 = 0x02A,      // FIFO fill level, high byte.
    FifoCount0 = 0x02B,      // FIFO fill level, low byte.
    FifoFree1 = 0x02C,       // FIFO free bytes, high byte.
    FifoFree0 = 0x02D,       // FIFO free bytes, low byte.
    FifoThresh1 = 0x02E,     // FIFO threshold, high byte.
    FifoThresh0 = 0x02F,     // FIFO threshold, low byte.
    PllLoop = 0x030,         // PLL loop filter settings.
    PllCpi = 0x031,          // PLL charge pump current.
    PllVcoDiv = 0x032,       // PLL divider settings.
    PllRangingA = 0x033,     // PLL autoranging, synthesizer A.
    FreqA3 = 0x034,          // Carrier frequency A, bits 31..24.
    FreqA2 = 0x035,          // Carrier frequency A, bits 23..16.
    FreqA1 = 0x036,          // Carrier frequency A, bits 15..8.
    FreqA0 = 0x037,          // Carrier frequency A, bits 7..0.
    PllRangingB = 0x03B,     // PLL autoranging, synthesizer B.
    Rssi = 0x040,            // Received signal strength.

    // Long-form addresses start here.
    RxParamSets = 0x117,  // Receiver parameter set mapping.
    AgcGain3 = 0x150,     // AGC speed, parameter set 3.
    FreqDev13 = 0x15C,    // Receiver FSK deviation, set 3, high byte.
    FreqDev03 = 0x15D,    // Receiver FSK deviation, set 3, low byte.
    ModCfgF = 0x160,      // TX frequency shaping.
    FskDev2 = 0x161,      // FSK deviation, bits 23..16.
    FskDev1 = 0x162,      // FSK deviation, bits 15..8.
    FskDev0 = 0x163,      // FSK deviation, bits 7..0.
    ModCfgA = 0x164,      // TX amplitude shaping.
    TxRate2 = 0x165,      // TX bitrate, bits 23..16.
    TxRate1 = 0x166,      // TX bitrate, bits 15..8.
    TxRate0 = 0x167,      // TX bitrate, bits 7..0.
    TxPwrCoeffB1 = 0x16A, // TX power coefficient B, high byte.
    TxPwrCoeffB0 = 0x16B, // TX power coefficient B, low byte.
    PllVcoI = 0x180,      // VCO current.
    PllRngClk = 0x183,    // PLL autoranging clock.
    BbTune = 0x188,       // Baseband tuning.
    PktAddrCfg = 0x200,   // Packet address config, bit 7 = MSB first.
    PktLenCfg = 0x201,    // Packet length config.
    PktLenOffset = 0x202, // Packet length offset.
    PktMaxLen = 0x203,    // Maximum packet length.
    PktAddr3 = 0x204,     // Local address, byte 3.
    PktAddr2 = 0x205,     // Local address, byte 2.
    PktAddr1 = 0x206,     // Local address, byte 1.
    PktAddr0 = 0x207,     // Local address, byte 0.
    PktAddrMask3 = 0x208, // Local address mask, byte 3.
    PktAddrMask2 = 0x209, // Local address mask, byte 2.
    PktAddrMask1 = 0x20A, // Local address mask, byte 1.
    PktAddrMask0 = 0x20B, // Local address mask, byte 0.
    RssiReference = 0x22C, // RSSI offset correction.
}

impl Register {
    #[inline]
    pub fn addr(self) -> u16 {
        self as u16
    }
}

/// Registers at or above this address use the 16-bit long SPI form.
pub const LONG_ADDR_THRESHOLD: u16 = 0x070;

/// Sentinel register id terminating every register value table.
pub const REG_END: u16 = 0xFFFF;

// PWRMODE register: bits 3..0 select the mode, upper bits are control flags.
pub const PWRMODE_POWERDOWN: u8 = 0x00;
pub const PWRMODE_STANDBY: u8 = 0x05;
pub const PWRMODE_FIFO_ENABLED: u8 = 0x07;
pub const PWRMODE_FULL_RX: u8 = 0x09;
pub const PWRMODE_FULL_TX: u8 = 0x0D;
pub const PWRMODE_RST_BIT: u8 = 0x80;
pub const PWRMODE_REF_EN_BIT: u8 = 0x40;
pub const PWRMODE_OSC_EN_BIT: u8 = 0x20;

// FIFO chunk commands, low 5 bits of the chunk header byte. The top 3 bits
// carry the payload length, 7 meaning "explicit length byte follows".
pub const FIFOCMD_DATA: u8 = 0x01;
pub const FIFOCMD_REPEATDATA: u8 = 0x02;
pub const FIFOCMD_RSSI: u8 = 0x11;
pub const FIFOCMD_FREQOFFS: u8 = 0x12;
pub const FIFOCMD_RFFREQOFFS: u8 = 0x13;

// FIFOSTAT write commands.
pub const FIFO_CLEAR_DATA_FLAGS: u8 = 3;
pub const FIFO_COMMIT: u8 = 4;

// FIFOSTAT read bits.
pub const FIFOSTAT_EMPTY: u8 = 0x01;

// XTALSTATUS bits.
pub const XTALSTATUS_RUNNING: u8 = 0x01;

// PLLRANGINGA/B bits.
pub const PLLRANGING_START: u8 = 0x10;
pub const PLLRANGING_RNGERR: u8 = 0x20;

bitflags! {
    /// The 16-bit status word the chip clocks out during every SPI command
    /// phase. Short-form accesses only see the high byte.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Status: u16 {
        const READY            = 0x8000;
        const PLL_LOCK         = 0x4000;
        const FIFO_OVER        = 0x2000;
        const FIFO_UNDER       = 0x1000;
        const THRESHOLD_FREE   = 0x0800;
        const THRESHOLD_COUNT  = 0x0400;
        const FIFO_FULL        = 0x0200;
        const FIFO_EMPTY       = 0x0100;
        const PWR_GOOD         = 0x0080;
        const PWR_INTERRUPT    = 0x0040;
        const RADIO_EVENT      = 0x0020;
        const XTAL_OSC_RUNNING = 0x0010;
        const WAKEUP_INTERRUPT = 0x0008;
        const LPOSC_INTERRUPT  = 0x0004;
        const GPADC_INTERRUPT  = 0x0002;
        const UNDEFINED        = 0x0001;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_addresses() {
        assert!(Register::FifoData.addr() < LONG_ADDR_THRESHOLD);
        assert!(Register::PllVcoI.addr() >= LONG_ADDR_THRESHOLD);
        assert!(Register::PktAddrCfg.addr() >= LONG_ADDR_THRESHOLD);
    }

    #[test]
    fn status_from_raw_word() {
        let status = Status::from_bits_retain(0x8010);
        assert!(status.contains(Status::READY));
        assert!(status.contains(Status::XTAL_OSC_RUNNING));
        assert!(!status.contains(Status::FIFO_FULL));
    }
}

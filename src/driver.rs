use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

use crate::config::{
    Mode, Profile, RegGroup, CFG_FREQUENCY, CFG_PLL_RANGE, CFG_PLL_RANGE_INIT, CFG_RSSI_REFERENCE,
    CFG_VCOI_INIT,
};
use crate::registers::{
    Register, Status, FIFO_CLEAR_DATA_FLAGS, LONG_ADDR_THRESHOLD, PLLRANGING_RNGERR,
    PLLRANGING_START, PWRMODE_FIFO_ENABLED, PWRMODE_FULL_RX, PWRMODE_OSC_EN_BIT,
    PWRMODE_POWERDOWN, PWRMODE_REF_EN_BIT, PWRMODE_RST_BIT, PWRMODE_STANDBY, REG_END,
    XTALSTATUS_RUNNING,
};

/// Interval between polls of a chip status bit.
pub(crate) const POLL_INTERVAL_MS: u32 = 1;
/// Bound on crystal-ready polling; the oscillator settles in a few ms.
pub(crate) const XTAL_POLL_ATTEMPTS: u32 = 1000;
/// Bound on PLL autoranging completion polling.
pub(crate) const PLL_POLL_ATTEMPTS: u32 = 1000;
/// Bound on waiting for the radio controller to return to idle after TX.
pub(crate) const RADIO_IDLE_ATTEMPTS: u32 = 5000;

/// Entries kept in the dropped-byte log of discarded FIFO chunks.
pub(crate) const DROP_LOG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ax5043Error {
    /// The SPI transaction itself failed.
    Spi,
    /// Caller-supplied data violates a size or format constraint.
    Invalid,
    /// The scratch-register round-trip failed; the chip is absent or dead.
    SelfTestFailed,
    /// Register id not present in the mission profile table.
    RegisterNotFound,
    /// Named parameter not present in the mission profile table.
    ConfigNotFound,
    /// A receive FIFO chunk's length did not match its declared type.
    FifoChunkShapeMismatch,
    /// A receive FIFO chunk carried a command this driver does not know.
    UnknownFifoCommand,
    /// The state machine reached a case with no defined transition.
    UnexpectedState,
    /// PLL autoranging reported the carrier outside the VCO range.
    PllRangingOutOfBounds,
    /// A bounded poll loop ran out of attempts.
    Timeout,
}

/// Driver state. TX sub-states track which part of the frame is currently
/// being streamed into the chip FIFO; `RxLoop` marks an in-progress drain
/// as opposed to the idle receive-armed `Rx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ax5043State {
    Stopped,
    PllRangeDone,
    Tx,
    TxLongPreamble,
    TxShortPreamble,
    TxPacket,
    Rx,
    RxLoop,
    Cw,
}

/// One AX5043 transceiver. Exactly one owner drives the lifecycle; the
/// `&mut self` receivers make concurrent use a compile error rather than a
/// race.
pub struct Ax5043<'a, SPI, D> {
    pub spi: SPI,
    pub delay: D,
    pub(crate) profile: Profile<'a>,
    pub(crate) state: Ax5043State,
    pub(crate) last_error: Option<Ax5043Error>,
    pub(crate) status: Status,
    pub(crate) rssi: i8,
    pub(crate) freq_offset: [u8; 3],
    pub(crate) dropped: [u8; DROP_LOG_LEN],
    pub(crate) dropped_len: usize,
}

impl<'a, SPI, D> Ax5043<'a, SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Creates a stopped driver bound to a transport and a mission profile.
    pub fn new(spi: SPI, delay: D, profile: Profile<'a>) -> Self {
        Ax5043 {
            spi,
            delay,
            profile,
            state: Ax5043State::Stopped,
            last_error: None,
            status: Status::empty(),
            rssi: 0,
            freq_offset: [0; 3],
            dropped: [0; DROP_LOG_LEN],
            dropped_len: 0,
        }
    }

    pub fn state(&self) -> Ax5043State {
        self.state
    }

    /// Error recorded by the most recent fail-soft step, if any. Cleared on
    /// `start`.
    pub fn last_error(&self) -> Option<Ax5043Error> {
        self.last_error
    }

    /// Status word clocked out by the most recent SPI exchange.
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn rssi(&self) -> i8 {
        self.rssi
    }

    /// Raw frequency-offset bytes from the most recent offset chunk.
    pub fn freq_offset(&self) -> [u8; 3] {
        self.freq_offset
    }

    /// Bytes discarded from malformed or unknown FIFO chunks.
    pub fn dropped(&self) -> &[u8] {
        &self.dropped[..self.dropped_len]
    }

    pub fn get_config(&self, name: &str) -> Result<u32, Ax5043Error> {
        self.profile.get(name)
    }

    pub fn set_config(&mut self, name: &str, val: u32) -> Result<(), Ax5043Error> {
        self.profile.set(name, val)
    }

    /// Gives the bus and delay back to the caller.
    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }

    // --- Transport access layer -------------------------------------------

    pub(crate) fn read_register(&mut self, reg: Register) -> Result<u8, Ax5043Error> {
        self.read_reg_addr(reg.addr())
    }

    pub(crate) fn read_reg_addr(&mut self, addr: u16) -> Result<u8, Ax5043Error> {
        if addr < LONG_ADDR_THRESHOLD {
            let mut buf = [addr as u8, 0x00];
            self.spi
                .transfer_in_place(&mut buf)
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from(buf[0]) << 8);
            Ok(buf[1])
        } else {
            let mut buf = [0x70 | (addr >> 8) as u8, addr as u8, 0x00];
            self.spi
                .transfer_in_place(&mut buf)
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from_be_bytes([buf[0], buf[1]]));
            Ok(buf[2])
        }
    }

    pub(crate) fn write_register(&mut self, reg: Register, val: u8) -> Result<(), Ax5043Error> {
        self.write_reg_addr(reg.addr(), val)
    }

    pub(crate) fn write_reg_addr(&mut self, addr: u16, val: u8) -> Result<(), Ax5043Error> {
        if addr < LONG_ADDR_THRESHOLD {
            let mut buf = [0x80 | addr as u8, val];
            self.spi
                .transfer_in_place(&mut buf)
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from(buf[0]) << 8);
        } else {
            let mut buf = [0xF0 | (addr >> 8) as u8, addr as u8, val];
            self.spi
                .transfer_in_place(&mut buf)
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from_be_bytes([buf[0], buf[1]]));
        }
        Ok(())
    }

    /// Burst write, used for FIFO payload chunks.
    pub(crate) fn write_block(&mut self, reg: Register, data: &[u8]) -> Result<(), Ax5043Error> {
        let addr = reg.addr();
        if addr < LONG_ADDR_THRESHOLD {
            let mut hdr = [0x80 | addr as u8];
            self.spi
                .transaction(&mut [
                    Operation::TransferInPlace(&mut hdr),
                    Operation::Write(data),
                ])
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from(hdr[0]) << 8);
        } else {
            let mut hdr = [0xF0 | (addr >> 8) as u8, addr as u8];
            self.spi
                .transaction(&mut [
                    Operation::TransferInPlace(&mut hdr),
                    Operation::Write(data),
                ])
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from_be_bytes(hdr));
        }
        Ok(())
    }

    /// Burst read, used for FIFO payload chunks.
    pub(crate) fn read_block(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), Ax5043Error> {
        let addr = reg.addr();
        if addr < LONG_ADDR_THRESHOLD {
            let mut hdr = [addr as u8];
            self.spi
                .transaction(&mut [Operation::TransferInPlace(&mut hdr), Operation::Read(buf)])
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from(hdr[0]) << 8);
        } else {
            let mut hdr = [0x70 | (addr >> 8) as u8, addr as u8];
            self.spi
                .transaction(&mut [Operation::TransferInPlace(&mut hdr), Operation::Read(buf)])
                .map_err(|_| Ax5043Error::Spi)?;
            self.status = Status::from_bits_retain(u16::from_be_bytes(hdr));
        }
        Ok(())
    }

    /// Zero-payload exchange that clocks out only the 16-bit status word.
    pub fn get_status(&mut self) -> Result<Status, Ax5043Error> {
        let mut buf = [0x70, 0x00];
        self.spi
            .transfer_in_place(&mut buf)
            .map_err(|_| Ax5043Error::Spi)?;
        self.status = Status::from_bits_retain(u16::from_be_bytes(buf));
        Ok(self.status)
    }

    // --- Shared primitives ------------------------------------------------

    /// Polls `done` every `interval_ms` until it reports true, at most
    /// `attempts` times. Sleeping between polls yields the processor to the
    /// scheduler instead of spinning on the bus.
    pub(crate) fn poll_until<F>(
        &mut self,
        interval_ms: u32,
        attempts: u32,
        mut done: F,
    ) -> Result<(), Ax5043Error>
    where
        F: FnMut(&mut Self) -> Result<bool, Ax5043Error>,
    {
        for _ in 0..attempts {
            if done(self)? {
                return Ok(());
            }
            self.delay.delay_ms(interval_ms);
        }
        Err(Ax5043Error::Timeout)
    }

    /// Rewrites the PWRMODE mode bits, preserving the control flags.
    pub(crate) fn set_pwrmode(&mut self, mode: u8) -> Result<(), Ax5043Error> {
        let current = self.read_register(Register::PwrMode)?;
        self.write_register(Register::PwrMode, (current & 0xF0) | mode)
    }

    pub(crate) fn note_error(&mut self, err: Ax5043Error) {
        self.last_error = Some(err);
    }

    pub(crate) fn log_dropped(&mut self, byte: u8) {
        if self.dropped_len < DROP_LOG_LEN {
            self.dropped[self.dropped_len] = byte;
            self.dropped_len += 1;
        }
    }

    /// Bring-up tolerates transient calibration failures; they are recorded
    /// on the handle and the sequence continues. Transport and table-lookup
    /// errors still abort.
    fn fail_soft(&mut self, res: Result<(), Ax5043Error>) -> Result<(), Ax5043Error> {
        match res {
            Err(
                err @ (Ax5043Error::SelfTestFailed
                | Ax5043Error::Timeout
                | Ax5043Error::PllRangingOutOfBounds),
            ) => {
                self.note_error(err);
                Ok(())
            }
            other => other,
        }
    }

    // --- Register table application ---------------------------------------

    /// Writes every table entry tagged with `group`, in table order, and
    /// returns the status word of the last write issued.
    pub fn apply_group(&mut self, group: RegGroup) -> Result<Status, Ax5043Error> {
        let mut i = 0;
        while let Some(entry) = self.profile.registers.get(i).copied() {
            if entry.reg == REG_END {
                break;
            }
            if entry.group == group {
                self.write_reg_addr(entry.reg, entry.val)?;
            }
            i += 1;
        }
        Ok(self.status)
    }

    fn set_local_addr(&mut self) -> Result<(), Ax5043Error> {
        let local = self.profile.local_addr;
        self.write_register(Register::PktAddr0, local.addr[0])?;
        self.write_register(Register::PktAddr1, local.addr[1])?;
        self.write_register(Register::PktAddr2, local.addr[2])?;
        self.write_register(Register::PktAddr3, local.addr[3])?;
        self.write_register(Register::PktAddrMask0, local.mask[0])?;
        self.write_register(Register::PktAddrMask1, local.mask[1])?;
        self.write_register(Register::PktAddrMask2, local.mask[2])?;
        self.write_register(Register::PktAddrMask3, local.mask[3])?;
        Ok(())
    }

    // --- Calibration & initialization sequencer ---------------------------

    /// Resets the chip through the power-mode register and verifies it is
    /// alive with a scratch-register round-trip.
    fn reset_and_self_test(&mut self) -> Result<(), Ax5043Error> {
        // Two chip-select pulses wake the SPI interface from deep sleep.
        self.spi
            .transaction(&mut [])
            .map_err(|_| Ax5043Error::Spi)?;
        self.delay.delay_us(5);
        self.spi
            .transaction(&mut [])
            .map_err(|_| Ax5043Error::Spi)?;
        self.delay.delay_us(5);

        self.write_register(Register::PwrMode, PWRMODE_RST_BIT)?;
        self.delay.delay_ms(1);
        self.read_register(Register::PwrMode)?;
        self.write_register(
            Register::PwrMode,
            PWRMODE_OSC_EN_BIT | PWRMODE_REF_EN_BIT | PWRMODE_POWERDOWN,
        )?;

        self.write_register(Register::Scratch, 0xAA)?;
        let first = self.read_register(Register::Scratch)?;
        self.write_register(Register::Scratch, 0x55)?;
        let second = self.read_register(Register::Scratch)?;
        if first != 0xAA || second != 0x55 {
            #[cfg(feature = "defmt")]
            defmt::warn!("scratch round-trip failed: {=u8:#x} {=u8:#x}", first, second);
            return Err(Ax5043Error::SelfTestFailed);
        }
        Ok(())
    }

    fn wait_for_xtal(&mut self) -> Result<(), Ax5043Error> {
        self.poll_until(POLL_INTERVAL_MS, XTAL_POLL_ATTEMPTS, |dev| {
            Ok(dev.read_register(Register::XtalStatus)? & XTALSTATUS_RUNNING != 0)
        })
    }

    /// Programs the carrier frequency registers, little-endian.
    fn program_carrier(&mut self) -> Result<(), Ax5043Error> {
        let f = self.profile.get(CFG_FREQUENCY)?;
        self.write_register(Register::FreqA0, f as u8)?;
        self.write_register(Register::FreqA1, (f >> 8) as u8)?;
        self.write_register(Register::FreqA2, (f >> 16) as u8)?;
        self.write_register(Register::FreqA3, (f >> 24) as u8)?;
        Ok(())
    }

    /// PLL autoranging: seeds the ranging register, waits for the busy bit
    /// to clear and persists the captured range into the profile.
    pub(crate) fn pll_ranging(&mut self) -> Result<(), Ax5043Error> {
        let seed = match self.profile.get(CFG_PLL_RANGE_INIT) {
            // A seed without high bits is a usable start value.
            Ok(v) if v & 0xF0 == 0 => v as u8 | PLLRANGING_START,
            _ => 0x18,
        };
        self.write_register(Register::PllRangingA, seed)?;
        self.delay.delay_ms(1);
        self.poll_until(POLL_INTERVAL_MS, PLL_POLL_ATTEMPTS, |dev| {
            Ok(dev.read_register(Register::PllRangingA)? & PLLRANGING_START == 0)
        })?;
        let rng = self.read_register(Register::PllRangingA)?;
        self.profile.set(CFG_PLL_RANGE, u32::from(rng))?;
        self.state = Ax5043State::PllRangeDone;
        #[cfg(feature = "defmt")]
        defmt::debug!("PLL ranging done: {=u8:#x}", rng);
        if rng & PLLRANGING_RNGERR != 0 {
            return Err(Ax5043Error::PllRangingOutOfBounds);
        }
        Ok(())
    }

    /// VCO current for the calibrated range: adjusts the configured seed by
    /// the captured-vs-seeded range delta when a fixed start value is in
    /// use, otherwise reads the chip's own estimate back.
    fn pll_vcoi(&mut self) -> Result<u8, Ax5043Error> {
        let init = self.profile.get(CFG_VCOI_INIT)? as u8;
        if init & 0x80 != 0 {
            let rng_init = self.profile.get(CFG_PLL_RANGE_INIT)? as u8;
            if rng_init & 0xF0 == 0 {
                let rng = self.profile.get(CFG_PLL_RANGE)? as u8;
                let mut vcoi = init.wrapping_add((rng & 0x0F).wrapping_sub(rng_init & 0x0F));
                vcoi &= 0x3F;
                vcoi |= 0x80;
                return Ok(vcoi);
            }
            return Ok(init);
        }
        self.read_register(Register::PllVcoI)
    }

    /// Re-seeds the synthesizer with the calibrated range and VCO current.
    /// PLLLOOP bit 7 selects which synthesizer the chip is using.
    pub(crate) fn init_registers_common(&mut self) -> Result<(), Ax5043Error> {
        let rng = self.profile.get(CFG_PLL_RANGE)? as u8;
        if rng & PLLRANGING_RNGERR != 0 {
            self.note_error(Ax5043Error::PllRangingOutOfBounds);
        }
        if self.read_register(Register::PllLoop)? & 0x80 != 0 {
            self.write_register(Register::PllRangingB, rng & 0x0F)?;
        } else {
            self.write_register(Register::PllRangingA, rng & 0x0F)?;
        }
        let vcoi = self.pll_vcoi()?;
        if vcoi & 0x80 != 0 {
            self.write_register(Register::PllVcoI, vcoi)?;
        }
        Ok(())
    }

    // --- Lifecycle --------------------------------------------------------

    /// Runs the calibration/initialization sequence, then arms the mode the
    /// profile selects. Individual calibration steps are fail-soft: they
    /// record `last_error` and the sequence continues, matching the
    /// tolerance of the hardware bring-up procedure. Check `last_error`
    /// after this returns.
    pub fn start(&mut self) -> Result<(), Ax5043Error> {
        self.last_error = None;

        let res = self.reset_and_self_test();
        self.fail_soft(res)?;

        self.apply_group(RegGroup::Common)?;
        self.apply_group(RegGroup::Tx)?;
        self.write_register(Register::PllLoop, 0x09)?;
        self.write_register(Register::PllCpi, 0x08)?;
        self.set_pwrmode(PWRMODE_STANDBY)?;

        // Ranging needs an unmodulated carrier: plain FSK, zero deviation.
        self.write_register(Register::Modulation, 0x08)?;
        self.write_register(Register::FskDev2, 0x00)?;
        self.write_register(Register::FskDev1, 0x00)?;
        self.write_register(Register::FskDev0, 0x00)?;

        let res = self.wait_for_xtal();
        self.fail_soft(res)?;

        self.program_carrier()?;

        let res = self.pll_ranging();
        self.fail_soft(res)?;

        self.set_pwrmode(PWRMODE_POWERDOWN)?;
        self.apply_group(RegGroup::Common)?;
        self.apply_group(RegGroup::Rx)?;
        self.init_registers_common()?;
        self.program_carrier()?;
        self.apply_group(RegGroup::LocalAddress)?;
        self.set_local_addr()?;

        match self.profile.mode {
            Mode::Tx => self.prepare_tx(),
            Mode::Cw => self.prepare_cw(),
            Mode::Rx => self.prepare_rx(),
            Mode::Off => {
                self.set_pwrmode(PWRMODE_POWERDOWN)?;
                self.state = Ax5043State::Stopped;
                Ok(())
            }
        }
    }

    pub(crate) fn prepare_tx(&mut self) -> Result<(), Ax5043Error> {
        self.set_pwrmode(PWRMODE_STANDBY)?;
        self.set_pwrmode(PWRMODE_FIFO_ENABLED)?;
        self.apply_group(RegGroup::Tx)?;
        self.init_registers_common()?;
        self.write_register(Register::FifoThresh1, 0x00)?;
        self.write_register(Register::FifoThresh0, 0x80)?;
        self.write_register(Register::IrqMask0, 0x00)?;
        self.write_register(Register::IrqMask1, 0x01)?;
        let res = self.wait_for_xtal();
        self.fail_soft(res)?;
        self.state = Ax5043State::Tx;
        Ok(())
    }

    pub(crate) fn prepare_rx(&mut self) -> Result<(), Ax5043Error> {
        self.apply_group(RegGroup::Rx)?;
        self.init_registers_common()?;
        let rssi_ref = self.profile.get(CFG_RSSI_REFERENCE)? as u8;
        self.write_register(Register::RssiReference, rssi_ref)?;
        self.apply_group(RegGroup::RxContinuous)?;
        self.write_register(Register::FifoStat, FIFO_CLEAR_DATA_FLAGS)?;
        self.set_pwrmode(PWRMODE_FULL_RX)?;
        self.write_register(Register::FifoThresh1, 0x00)?;
        self.write_register(Register::FifoThresh0, 0x80)?;
        self.write_register(Register::IrqMask0, 0x01)?;
        self.write_register(Register::IrqMask1, 0x00)?;
        self.state = Ax5043State::Rx;
        Ok(())
    }

    /// Powers the chip down and returns to `Stopped`.
    pub fn stop(&mut self) -> Result<(), Ax5043Error> {
        self.set_pwrmode(PWRMODE_POWERDOWN)?;
        self.state = Ax5043State::Stopped;
        Ok(())
    }
}

use crate::driver::Ax5043Error;
use crate::registers::{Register, REG_END};

/// Largest framed packet (MAC header + payload) the driver will buffer.
pub const MAX_PACKET_LEN: usize = 256;

/// Register groups partitioning a value table. One register id may carry
/// different values in different groups.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegGroup {
    Common,
    Tx,
    Rx,
    RxContinuous,
    LocalAddress,
}

/// One (register, group, value) triple of a mission profile table.
///
/// Tables end with a [`RegisterEntry::END`] sentinel; scans never run past
/// it, even when the backing slice is longer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterEntry {
    pub reg: u16,
    pub group: RegGroup,
    pub val: u8,
}

impl RegisterEntry {
    pub const END: RegisterEntry = RegisterEntry {
        reg: REG_END,
        group: RegGroup::Common,
        val: 0,
    };

    pub const fn new(reg: Register, group: RegGroup, val: u8) -> Self {
        RegisterEntry {
            reg: reg as u16,
            group,
            val,
        }
    }
}

/// A named tunable parameter. Runtime code looks these up by name instead of
/// embedding magic numbers; a lookup miss is an error, never a silent zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigValue {
    pub name: &'static str,
    pub val: u32,
}

impl ConfigValue {
    pub const fn new(name: &'static str, val: u32) -> Self {
        ConfigValue { name, val }
    }
}

// Parameter names shared by the driver and the mission profiles.
pub const CFG_FREQUENCY: &str = "frequency";
pub const CFG_PLL_RANGE_INIT: &str = "pll-range-init";
pub const CFG_PLL_RANGE: &str = "pll-range";
pub const CFG_VCOI_INIT: &str = "vcoi-init";
pub const CFG_RSSI_REFERENCE: &str = "rssi-reference";
pub const CFG_PREAMBLE_LONGLEN: &str = "preamble-longlen";
pub const CFG_PREAMBLE_LEN: &str = "preamble-len";
pub const CFG_PREAMBLE_BYTE: &str = "preamble-byte";
pub const CFG_PREAMBLE_FLAGS: &str = "preamble-flags";
pub const CFG_PREAMBLE_APPENDBITS: &str = "preamble-appendbits";
pub const CFG_PREAMBLE_APPENDPATTERN: &str = "preamble-appendpattern";
pub const CFG_INNER_FREQ_LOOP: &str = "inner-freq-loop";
pub const CFG_MACLEN: &str = "maclen";
pub const CFG_ADDRLEN: &str = "addrlen";
pub const CFG_DESTADDRPOS: &str = "destaddrpos";
pub const CFG_SOURCEADDRPOS: &str = "sourceaddrpos";
pub const CFG_LENPOS: &str = "lenpos";
pub const CFG_LENOFFS: &str = "lenoffs";
pub const CFG_LENMASK: &str = "lenmask";
pub const CFG_SYNCLEN: &str = "synclen";
pub const CFG_SYNCWORD: &str = "syncword";
pub const CFG_SYNCFLAGS: &str = "syncflags";

/// Position value meaning "this framing field is absent".
pub const FIELD_ABSENT: u32 = 0xFF;

/// Destination or source station address: four value bytes and four mask
/// bytes, inserted into the MAC header at the configured offsets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressMask {
    pub addr: [u8; 4],
    pub mask: [u8; 4],
}

/// Operating mode selected by a mission profile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Off,
    Rx,
    Tx,
    Cw,
}

/// What `receive_loop` reports when one drain cycle carries several DATA
/// chunks. The flight heritage behavior is `Replace` (only the most recent
/// chunk is returned); `Accumulate` concatenates them in arrival order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataChunkPolicy {
    Replace,
    Accumulate,
}

/// A complete mission profile: register table, named parameters, local
/// station address and the operating mode to enter on `start`.
///
/// Profiles are plain data owned by the caller, so several simulated or
/// physical radios can run side by side with independent tables.
pub struct Profile<'a> {
    pub registers: &'a [RegisterEntry],
    pub params: &'a mut [ConfigValue],
    pub local_addr: AddressMask,
    pub mode: Mode,
    pub data_policy: DataChunkPolicy,
}

impl Profile<'_> {
    /// Looks up a named parameter; stops at the table end, reports a miss.
    pub fn get(&self, name: &str) -> Result<u32, Ax5043Error> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.val)
            .ok_or(Ax5043Error::ConfigNotFound)
    }

    /// Updates a named parameter in place.
    pub fn set(&mut self, name: &str, val: u32) -> Result<(), Ax5043Error> {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.val = val;
                Ok(())
            }
            None => Err(Ax5043Error::ConfigNotFound),
        }
    }

    /// Table entries up to (excluding) the sentinel.
    pub fn register_entries(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.registers.iter().take_while(|e| e.reg != REG_END)
    }

    /// Value of a register id in the table, first match wins.
    pub fn register_value(&self, reg: u16) -> Result<u8, Ax5043Error> {
        self.register_entries()
            .find(|e| e.reg == reg)
            .map(|e| e.val)
            .ok_or(Ax5043Error::RegisterNotFound)
    }
}

/// Finds the first entry for `reg` and rewrites its value. Mission tables
/// are immutable at runtime except through this setter.
pub fn set_register_value(
    table: &mut [RegisterEntry],
    reg: u16,
    val: u8,
) -> Result<(), Ax5043Error> {
    match table
        .iter_mut()
        .take_while(|e| e.reg != REG_END)
        .find(|e| e.reg == reg)
    {
        Some(e) => {
            e.val = val;
            Ok(())
        }
        None => Err(Ax5043Error::RegisterNotFound),
    }
}

// UHF mission profile: 435.5 MHz carrier, 50 kbit/s FSK, values generated
// with AX RadioLab for the flight configuration.
pub static UHF_REGISTERS: &[RegisterEntry] = &[
    RegisterEntry::new(Register::Modulation, RegGroup::Common, 0x08),
    RegisterEntry::new(Register::Encoding, RegGroup::Common, 0x00),
    RegisterEntry::new(Register::Framing, RegGroup::Common, 0x26),
    RegisterEntry::new(Register::PllVcoDiv, RegGroup::Common, 0x24),
    RegisterEntry::new(Register::PktAddrCfg, RegGroup::Common, 0x80),
    RegisterEntry::new(Register::PktLenCfg, RegGroup::Common, 0x00),
    RegisterEntry::new(Register::PktLenOffset, RegGroup::Common, 0x09),
    RegisterEntry::new(Register::PktMaxLen, RegGroup::Common, 0xF0),
    RegisterEntry::new(Register::ModCfgF, RegGroup::Tx, 0x03),
    RegisterEntry::new(Register::FskDev2, RegGroup::Tx, 0x00),
    RegisterEntry::new(Register::FskDev1, RegGroup::Tx, 0x04),
    RegisterEntry::new(Register::FskDev0, RegGroup::Tx, 0x5E),
    RegisterEntry::new(Register::ModCfgA, RegGroup::Tx, 0x05),
    RegisterEntry::new(Register::TxRate2, RegGroup::Tx, 0x00),
    RegisterEntry::new(Register::TxRate1, RegGroup::Tx, 0x11),
    RegisterEntry::new(Register::TxRate0, RegGroup::Tx, 0x7A),
    RegisterEntry::new(Register::TxPwrCoeffB1, RegGroup::Tx, 0x0F),
    RegisterEntry::new(Register::TxPwrCoeffB0, RegGroup::Tx, 0xFF),
    RegisterEntry::new(Register::RxParamSets, RegGroup::Rx, 0xF4),
    RegisterEntry::new(Register::BbTune, RegGroup::Rx, 0x03),
    RegisterEntry::new(Register::RxParamSets, RegGroup::RxContinuous, 0xFF),
    RegisterEntry::new(Register::FreqDev13, RegGroup::RxContinuous, 0x00),
    RegisterEntry::new(Register::FreqDev03, RegGroup::RxContinuous, 0x00),
    RegisterEntry::new(Register::AgcGain3, RegGroup::RxContinuous, 0xB5),
    RegisterEntry::END,
];

/// Named parameters of the UHF profile. Callers keep this array in their
/// own storage so `set_config` can persist calibration results into it.
pub const fn uhf_params() -> [ConfigValue; 22] {
    [
        ConfigValue::new(CFG_FREQUENCY, 0x0912_AAAB),
        ConfigValue::new(CFG_PLL_RANGE_INIT, 0x0A),
        ConfigValue::new(CFG_PLL_RANGE, 0x00),
        ConfigValue::new(CFG_VCOI_INIT, 0x98),
        ConfigValue::new(CFG_RSSI_REFERENCE, 0x39),
        ConfigValue::new(CFG_PREAMBLE_LONGLEN, 0),
        ConfigValue::new(CFG_PREAMBLE_LEN, 72),
        ConfigValue::new(CFG_PREAMBLE_BYTE, 0x7E),
        ConfigValue::new(CFG_PREAMBLE_FLAGS, 0x38),
        ConfigValue::new(CFG_PREAMBLE_APPENDBITS, 0),
        ConfigValue::new(CFG_PREAMBLE_APPENDPATTERN, 0x00),
        ConfigValue::new(CFG_INNER_FREQ_LOOP, 0),
        ConfigValue::new(CFG_MACLEN, 3),
        ConfigValue::new(CFG_ADDRLEN, 1),
        ConfigValue::new(CFG_DESTADDRPOS, 0),
        ConfigValue::new(CFG_SOURCEADDRPOS, FIELD_ABSENT),
        ConfigValue::new(CFG_LENPOS, 2),
        ConfigValue::new(CFG_LENOFFS, 0),
        ConfigValue::new(CFG_LENMASK, 0xFF),
        ConfigValue::new(CFG_SYNCLEN, 32),
        ConfigValue::new(CFG_SYNCWORD, 0xCCAA_CCAA),
        ConfigValue::new(CFG_SYNCFLAGS, 0x38),
    ]
}

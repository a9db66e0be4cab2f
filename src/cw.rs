//! Continuous-wave keying. The modulator is parked at zero deviation and
//! minimal bitrate; dots and dashes are timed bursts of repeated FIFO data
//! with the carrier keyed through the power mode register.

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;

use crate::driver::{Ax5043, Ax5043Error, Ax5043State};
use crate::registers::{
    Register, FIFOCMD_REPEATDATA, FIFO_CLEAR_DATA_FLAGS, FIFO_COMMIT, PWRMODE_FULL_TX,
    PWRMODE_STANDBY,
};

// RAW | UNENC | NOCRC: the burst goes on air unframed.
const CW_CHUNK_FLAGS: u8 = 0x38;

/// Element and gap durations for a words-per-minute rate, derived from the
/// standard PARIS convention: one dot is 1200 ms divided by the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MorseTiming {
    pub dot_ms: u32,
    pub dash_ms: u32,
    pub element_gap_ms: u32,
    pub letter_gap_ms: u32,
    pub word_gap_ms: u32,
}

impl MorseTiming {
    pub const fn from_wpm(wpm: u32) -> MorseTiming {
        let dot = 1200 / wpm;
        MorseTiming {
            dot_ms: dot,
            dash_ms: 3 * dot,
            element_gap_ms: dot,
            letter_gap_ms: 3 * dot,
            word_gap_ms: 7 * dot,
        }
    }
}

/// Dots and dashes for a character, or `None` for anything unkeyable
/// (treated as a word break by [`Ax5043::send_cw`]).
pub fn morse_code(c: char) -> Option<&'static str> {
    Some(match c.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        _ => return None,
    })
}

impl<SPI, D> Ax5043<'_, SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Parks the modulator for CW: zero deviation, minimal bitrate, a
    /// repeat chunk queued so keying up produces a clean carrier.
    pub(crate) fn prepare_cw(&mut self) -> Result<(), Ax5043Error> {
        self.write_register(Register::FskDev2, 0x00)?;
        self.write_register(Register::FskDev1, 0x00)?;
        self.write_register(Register::FskDev0, 0x00)?;
        self.write_register(Register::TxRate2, 0x00)?;
        self.write_register(Register::TxRate1, 0x00)?;
        self.write_register(Register::TxRate0, 0x01)?;
        self.write_register(Register::FifoStat, FIFO_CLEAR_DATA_FLAGS)?;
        self.queue_carrier_burst()?;
        self.write_register(Register::FifoStat, FIFO_COMMIT)?;
        self.set_pwrmode(PWRMODE_STANDBY)?;
        self.state = Ax5043State::Cw;
        Ok(())
    }

    /// Keys the carrier for `duration_ms`, then returns to standby.
    pub fn morse_dot_dash(&mut self, duration_ms: u32) -> Result<(), Ax5043Error> {
        self.set_pwrmode(PWRMODE_FULL_TX)?;
        self.queue_carrier_burst()?;
        self.write_register(Register::FifoStat, FIFO_COMMIT)?;
        self.delay.delay_ms(duration_ms);
        self.set_pwrmode(PWRMODE_STANDBY)?;
        Ok(())
    }

    /// Keys `message` in Morse at `wpm` words per minute. Characters with
    /// no Morse encoding act as word breaks.
    pub fn send_cw(&mut self, wpm: u32, message: &str) -> Result<(), Ax5043Error> {
        if wpm == 0 {
            return Err(Ax5043Error::Invalid);
        }
        let timing = MorseTiming::from_wpm(wpm);
        let mut pending_gap = None;
        for c in message.chars() {
            match morse_code(c) {
                Some(code) => {
                    if let Some(gap) = pending_gap {
                        self.delay.delay_ms(gap);
                    }
                    for (i, element) in code.chars().enumerate() {
                        if i > 0 {
                            self.delay.delay_ms(timing.element_gap_ms);
                        }
                        let duration = if element == '-' {
                            timing.dash_ms
                        } else {
                            timing.dot_ms
                        };
                        self.morse_dot_dash(duration)?;
                    }
                    pending_gap = Some(timing.letter_gap_ms);
                }
                None => {
                    // Word break, subsuming the inter-letter gap.
                    self.delay.delay_ms(timing.word_gap_ms);
                    pending_gap = None;
                }
            }
        }
        Ok(())
    }

    fn queue_carrier_burst(&mut self) -> Result<(), Ax5043Error> {
        self.write_register(Register::FifoData, FIFOCMD_REPEATDATA | (3 << 5))?;
        self.write_register(Register::FifoData, CW_CHUNK_FLAGS)?;
        self.write_register(Register::FifoData, 0xFF)?;
        self.write_register(Register::FifoData, 0x00)?;
        Ok(())
    }
}

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;

use crate::config::{DataChunkPolicy, CFG_INNER_FREQ_LOOP};
use crate::driver::{Ax5043, Ax5043Error, Ax5043State};
use crate::registers::{
    Register, FIFOCMD_DATA, FIFOCMD_FREQOFFS, FIFOCMD_RFFREQOFFS, FIFOCMD_RSSI, FIFOSTAT_EMPTY,
};

/// Bound on chunk headers consumed per drain. The hardware FIFO holds 256
/// bytes, so a healthy chip can never deliver anywhere near this many.
const RX_CHUNK_LIMIT: u32 = 512;

impl<SPI, D> Ax5043<'_, SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Drains every chunk currently in the receive FIFO and returns the
    /// number of payload bytes placed in `buf`.
    ///
    /// DATA chunks carry packet payload; RSSI and frequency-offset chunks
    /// update the handle's telemetry fields. Malformed or unknown chunks
    /// are consumed to keep the stream aligned, their bytes routed to the
    /// dropped-byte log and the error recorded on the handle.
    pub fn receive_loop(&mut self, buf: &mut [u8]) -> Result<usize, Ax5043Error> {
        // Clear the pending radio event so the next packet re-asserts it.
        self.read_register(Register::RadioEventReq0)?;
        self.state = Ax5043State::RxLoop;
        let inner_freq_loop = self.profile.get(CFG_INNER_FREQ_LOOP)? != 0;

        let mut copied = 0usize;
        let mut chunks = 0u32;

        while self.read_register(Register::FifoStat)? & FIFOSTAT_EMPTY == 0 {
            chunks += 1;
            if chunks > RX_CHUNK_LIMIT {
                self.state = Ax5043State::Rx;
                return Err(Ax5043Error::Timeout);
            }

            let header = self.read_register(Register::FifoData)?;
            let mut len = usize::from((header & 0xE0) >> 5);
            if len == 7 {
                len = usize::from(self.read_register(Register::FifoData)?);
            }

            match header & 0x1F {
                FIFOCMD_DATA => {
                    if len == 0 {
                        continue;
                    }
                    self.read_register(Register::FifoData)?; // discard flags
                    let n = len - 1;
                    let offset = match self.profile.data_policy {
                        DataChunkPolicy::Replace => 0,
                        DataChunkPolicy::Accumulate => copied,
                    };
                    if offset + n > buf.len() {
                        self.drop_chunk(n, Ax5043Error::Invalid)?;
                        continue;
                    }
                    self.read_block(Register::FifoData, &mut buf[offset..offset + n])?;
                    copied = offset + n;
                }

                FIFOCMD_RFFREQOFFS => {
                    // Only meaningful when the outer frequency loop is in
                    // use, and always three bytes.
                    if inner_freq_loop || len != 3 {
                        self.drop_chunk(len, Ax5043Error::FifoChunkShapeMismatch)?;
                        continue;
                    }
                    let mut high = self.read_register(Register::FifoData)? & 0x0F;
                    // Sign-extend the 4-bit top nibble.
                    if high & 0x08 != 0 {
                        high |= 0xF8;
                    }
                    let mid = self.read_register(Register::FifoData)?;
                    let low = self.read_register(Register::FifoData)?;
                    self.freq_offset = [high, mid, low];
                }

                FIFOCMD_FREQOFFS => {
                    if !inner_freq_loop || len != 2 {
                        self.drop_chunk(len, Ax5043Error::FifoChunkShapeMismatch)?;
                        continue;
                    }
                    let mid = self.read_register(Register::FifoData)?;
                    let low = self.read_register(Register::FifoData)?;
                    self.freq_offset = [0, mid, low];
                }

                FIFOCMD_RSSI => {
                    if len != 1 {
                        self.drop_chunk(len, Ax5043Error::FifoChunkShapeMismatch)?;
                        continue;
                    }
                    self.rssi = self.read_register(Register::FifoData)? as i8;
                }

                _ => {
                    self.drop_chunk(len, Ax5043Error::UnknownFifoCommand)?;
                }
            }
        }

        self.state = Ax5043State::Rx;
        Ok(copied)
    }

    /// Consumes `len` bytes to realign the chunk stream, logging them.
    fn drop_chunk(&mut self, len: usize, err: Ax5043Error) -> Result<(), Ax5043Error> {
        #[cfg(feature = "defmt")]
        defmt::warn!("discarding FIFO chunk: {} bytes", len);
        self.note_error(err);
        for _ in 0..len {
            let byte = self.read_register(Register::FifoData)?;
            self.log_dropped(byte);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{uhf_params, UHF_REGISTERS};
    use crate::driver::tests::{check_expectations, setup};
    use embedded_hal_mock::eh1::spi::Transaction as SpiTransaction;

    fn short_read(reg: u8, val: u8) -> [SpiTransaction<u8>; 3] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::transfer_in_place(vec![reg, 0x00], vec![0x80, val]),
            SpiTransaction::transaction_end(),
        ]
    }

    fn data_chunk(payload: &[u8]) -> Vec<SpiTransaction<u8>> {
        let mut v = Vec::new();
        v.extend(short_read(0x28, 0x00)); // FIFO not empty
        v.extend(short_read(0x29, 0xE1)); // DATA, explicit length
        v.extend(short_read(0x29, payload.len() as u8 + 1));
        v.extend(short_read(0x29, 0x03)); // flags, discarded
        v.push(SpiTransaction::transaction_start());
        v.push(SpiTransaction::transfer_in_place(vec![0x29], vec![0x80]));
        v.push(SpiTransaction::read_vec(payload.to_vec()));
        v.push(SpiTransaction::transaction_end());
        v
    }

    fn drained() -> Vec<SpiTransaction<u8>> {
        short_read(0x28, 0x01).to_vec()
    }

    #[test]
    fn data_chunk_lands_in_caller_buffer() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(data_chunk(&[0x42, 0x00, 0x08, 0xAA, 0xBB]));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let mut buf = [0u8; 64];
        let n = dev.receive_loop(&mut buf).unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[0x42, 0x00, 0x08, 0xAA, 0xBB]);
        assert_eq!(dev.state(), Ax5043State::Rx);

        check_expectations(&mut dev);
    }

    #[test]
    fn rssi_chunk_updates_handle_with_one_extra_read() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, FIFOCMD_RSSI | (1 << 5)));
        ex.extend(short_read(0x29, 0xB2)); // -78 dBm
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let n = dev.receive_loop(&mut [0u8; 8]).unwrap();

        assert_eq!(n, 0);
        assert_eq!(dev.rssi(), -78);
        assert_eq!(dev.last_error(), None);

        check_expectations(&mut dev);
    }

    #[test]
    fn malformed_rssi_chunk_is_dropped_whole() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, FIFOCMD_RSSI | (2 << 5))); // bad shape
        ex.extend(short_read(0x29, 0x11));
        ex.extend(short_read(0x29, 0x22));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let n = dev.receive_loop(&mut [0u8; 8]).unwrap();

        assert_eq!(n, 0);
        assert_eq!(dev.last_error(), Some(Ax5043Error::FifoChunkShapeMismatch));
        assert_eq!(dev.dropped(), &[0x11, 0x22]);

        check_expectations(&mut dev);
    }

    #[test]
    fn unknown_command_consumes_declared_length() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, 0x0A | (1 << 5)));
        ex.extend(short_read(0x29, 0x77));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        dev.receive_loop(&mut [0u8; 8]).unwrap();

        assert_eq!(dev.last_error(), Some(Ax5043Error::UnknownFifoCommand));
        assert_eq!(dev.dropped(), &[0x77]);

        check_expectations(&mut dev);
    }

    #[test]
    fn rf_freq_offset_sign_extends_top_nibble() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, FIFOCMD_RFFREQOFFS | (3 << 5)));
        ex.extend(short_read(0x29, 0x0C)); // bit 3 set: negative
        ex.extend(short_read(0x29, 0x34));
        ex.extend(short_read(0x29, 0x56));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        dev.receive_loop(&mut [0u8; 8]).unwrap();

        assert_eq!(dev.freq_offset(), [0xFC, 0x34, 0x56]);

        check_expectations(&mut dev);
    }

    #[test]
    fn freq_offset_chunk_requires_inner_loop() {
        // With the outer loop configured, a FREQOFFS chunk is malformed.
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, FIFOCMD_FREQOFFS | (2 << 5)));
        ex.extend(short_read(0x29, 0x12));
        ex.extend(short_read(0x29, 0x34));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        dev.receive_loop(&mut [0u8; 8]).unwrap();

        assert_eq!(dev.last_error(), Some(Ax5043Error::FifoChunkShapeMismatch));
        assert_eq!(dev.freq_offset(), [0, 0, 0]);

        check_expectations(&mut dev);
    }

    #[test]
    fn multiple_data_chunks_replace_by_default() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(data_chunk(&[0x01, 0x02, 0x03]));
        ex.extend(data_chunk(&[0x0A, 0x0B]));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let mut buf = [0u8; 8];
        let n = dev.receive_loop(&mut buf).unwrap();

        // Only the most recent chunk is reported.
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[0x0A, 0x0B]);

        check_expectations(&mut dev);
    }

    #[test]
    fn multiple_data_chunks_accumulate_when_configured() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        dev.profile.data_policy = DataChunkPolicy::Accumulate;

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(data_chunk(&[0x01, 0x02, 0x03]));
        ex.extend(data_chunk(&[0x0A, 0x0B]));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let mut buf = [0u8; 8];
        let n = dev.receive_loop(&mut buf).unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[0x01, 0x02, 0x03, 0x0A, 0x0B]);

        check_expectations(&mut dev);
    }

    #[test]
    fn oversized_data_chunk_spills_to_drop_log() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);

        let mut ex = short_read(0x0F, 0x00).to_vec();
        ex.extend(short_read(0x28, 0x00));
        ex.extend(short_read(0x29, 0xE1));
        ex.extend(short_read(0x29, 4)); // 3 payload bytes + flag byte
        ex.extend(short_read(0x29, 0x03));
        ex.extend(short_read(0x29, 0xAA));
        ex.extend(short_read(0x29, 0xBB));
        ex.extend(short_read(0x29, 0xCC));
        ex.extend(drained());
        dev.spi.update_expectations(&ex);

        let mut buf = [0u8; 2]; // too small for the chunk
        let n = dev.receive_loop(&mut buf).unwrap();

        assert_eq!(n, 0);
        assert_eq!(dev.last_error(), Some(Ax5043Error::Invalid));
        assert_eq!(dev.dropped(), &[0xAA, 0xBB, 0xCC]);

        check_expectations(&mut dev);
    }
}

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;

use crate::config::{
    CFG_ADDRLEN, CFG_DESTADDRPOS, CFG_LENMASK, CFG_LENOFFS, CFG_LENPOS, CFG_MACLEN,
    CFG_PREAMBLE_APPENDBITS, CFG_PREAMBLE_APPENDPATTERN, CFG_PREAMBLE_BYTE, CFG_PREAMBLE_FLAGS,
    CFG_PREAMBLE_LEN, CFG_PREAMBLE_LONGLEN, CFG_SOURCEADDRPOS, CFG_SYNCFLAGS, CFG_SYNCLEN,
    CFG_SYNCWORD, FIELD_ABSENT, MAX_PACKET_LEN,
};
use crate::driver::{Ax5043, Ax5043Error, Ax5043State, POLL_INTERVAL_MS, RADIO_IDLE_ATTEMPTS};
use crate::registers::{
    Register, FIFOCMD_DATA, FIFOCMD_REPEATDATA, FIFO_CLEAR_DATA_FLAGS, FIFO_COMMIT,
    PWRMODE_FULL_TX,
};

/// Bound on commit-and-retry cycles while waiting for FIFO space. At the
/// slowest configured bitrate the modulator frees a chunk's worth of space
/// well within this many milliseconds.
const TX_FIFO_RETRIES: u32 = 1000;

// FIFO free-space floors before the next chunk of each kind fits.
const MIN_FREE_PREAMBLE: u8 = 4;
const MIN_FREE_SYNC: u8 = 15;
const MIN_FREE_PACKET: u8 = 11;
// A packet DATA chunk spends three bytes on header, length and flags.
const PACKET_CHUNK_OVERHEAD: u8 = 3;

const FLAG_PKT_START: u8 = 0x01;
const FLAG_PKT_END: u8 = 0x02;
// RAW | NOCRC flags for sub-byte preamble chunks.
const FLAG_RAW_NOCRC: u8 = 0x1C;

/// Folds a stop bit into a partial byte of `bits` valid bits. PKTADDRCFG
/// bit 7 decides which end of the byte goes on air first.
fn stop_bit_fold(byte: u8, bits: u8, msb_first: bool) -> u8 {
    if msb_first {
        (byte & (0xFFu8 << (8 - bits))) | (0x80 >> bits)
    } else {
        (byte & (0xFFu8 >> (8 - bits))) | (1 << bits)
    }
}

impl<SPI, D> Ax5043<'_, SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Frames and transmits one packet, blocking until the radio controller
    /// reports the packet is out.
    ///
    /// The frame is the MAC header (destination/source address and length
    /// byte at the configured offsets) followed by the payload. Oversized
    /// packets are rejected before any bus traffic.
    pub fn transmit_packet(
        &mut self,
        dest: &crate::config::AddressMask,
        payload: &[u8],
    ) -> Result<(), Ax5043Error> {
        let mut frame = [0u8; MAX_PACKET_LEN];
        let total = self.build_frame(dest, payload, &mut frame)?;

        // Clear any stale transmit-done event and leftover FIFO contents.
        self.read_register(Register::RadioEventReq0)?;
        self.write_register(Register::FifoStat, FIFO_CLEAR_DATA_FLAGS)?;
        self.state = Ax5043State::TxLongPreamble;

        if self.read_register(Register::Modulation)? & 0x0F == 9 {
            // 4-FSK needs a dummy chunk to force dibit sync.
            self.write_register(Register::FifoData, FIFOCMD_DATA | (7 << 5))?;
            self.write_register(Register::FifoData, 2)?;
            self.write_register(Register::FifoData, FLAG_PKT_START)?;
            self.write_register(Register::FifoData, 0x11)?;
        }

        self.drive_tx_fifo(&frame[..total])?;

        self.set_pwrmode(PWRMODE_FULL_TX)?;
        self.read_register(Register::RadioEventReq0)?;
        self.poll_until(POLL_INTERVAL_MS, RADIO_IDLE_ATTEMPTS, |dev| {
            Ok(dev.read_register(Register::RadioState)? == 0)
        })?;
        self.write_register(Register::RadioEventMask0, 0x00)?;
        self.state = Ax5043State::Tx;
        Ok(())
    }

    /// Assembles the MAC header and payload into `frame`, returning the
    /// framed length. No bus traffic.
    pub(crate) fn build_frame(
        &self,
        dest: &crate::config::AddressMask,
        payload: &[u8],
        frame: &mut [u8; MAX_PACKET_LEN],
    ) -> Result<usize, Ax5043Error> {
        let maclen = self.profile.get(CFG_MACLEN)? as usize;
        let addrlen = self.profile.get(CFG_ADDRLEN)? as usize;
        let total = maclen + payload.len();
        // Station addresses carry at most four bytes.
        if total > MAX_PACKET_LEN || addrlen > 4 {
            return Err(Ax5043Error::Invalid);
        }
        frame[..maclen].fill(0);
        frame[maclen..total].copy_from_slice(payload);

        let destaddrpos = self.profile.get(CFG_DESTADDRPOS)?;
        if destaddrpos != FIELD_ABSENT {
            let pos = destaddrpos as usize;
            if pos + addrlen > total {
                return Err(Ax5043Error::Invalid);
            }
            frame[pos..pos + addrlen].copy_from_slice(&dest.addr[..addrlen]);
        }
        let sourceaddrpos = self.profile.get(CFG_SOURCEADDRPOS)?;
        if sourceaddrpos != FIELD_ABSENT {
            let pos = sourceaddrpos as usize;
            if pos + addrlen > total {
                return Err(Ax5043Error::Invalid);
            }
            frame[pos..pos + addrlen].copy_from_slice(&self.profile.local_addr.addr[..addrlen]);
        }
        let lenmask = self.profile.get(CFG_LENMASK)? as u8;
        if lenmask != 0 {
            let lenoffs = self.profile.get(CFG_LENOFFS)? as u8;
            let lenpos = self.profile.get(CFG_LENPOS)? as usize;
            if lenpos >= total {
                return Err(Ax5043Error::Invalid);
            }
            // Set LENOFFS = 1 to exclude the length byte itself.
            let len_byte = (total as u8).wrapping_sub(lenoffs) & lenmask;
            frame[lenpos] = (frame[lenpos] & !lenmask) | len_byte;
        }
        Ok(total)
    }

    /// Streams preamble, sync word and the framed packet into the FIFO,
    /// committing and pausing whenever the chip runs short of space. Ends
    /// with the transmit-done event armed and the final commit issued.
    pub(crate) fn drive_tx_fifo(&mut self, frame: &[u8]) -> Result<(), Ax5043Error> {
        let preamble_byte = self.profile.get(CFG_PREAMBLE_BYTE)? as u8;
        let preamble_flags = self.profile.get(CFG_PREAMBLE_FLAGS)? as u8;
        let appendbits = self.profile.get(CFG_PREAMBLE_APPENDBITS)? as u8;
        let appendpattern = self.profile.get(CFG_PREAMBLE_APPENDPATTERN)? as u8;
        let synclen = self.profile.get(CFG_SYNCLEN)? as u8;
        let syncflags = self.profile.get(CFG_SYNCFLAGS)? as u8;
        let syncword = self.profile.get(CFG_SYNCWORD)?.to_be_bytes();

        // The sync word holds 32 bits; append bits must leave room for the
        // stop bit. Checked before any FIFO traffic.
        if synclen > 32 || appendbits > 7 {
            return Err(Ax5043Error::Invalid);
        }

        // Long preamble counts in 32-byte units, short preamble in bits.
        let mut remaining: u16 = self.profile.get(CFG_PREAMBLE_LONGLEN)? as u16;
        let mut sent: usize = 0;
        let mut stalls: u32 = 0;

        loop {
            let free = self.fifo_free()?;
            match self.state {
                Ax5043State::TxLongPreamble => {
                    if remaining == 0 {
                        self.state = Ax5043State::TxShortPreamble;
                        remaining = self.profile.get(CFG_PREAMBLE_LEN)? as u16;
                        continue;
                    }
                    if free < MIN_FREE_PREAMBLE {
                        self.tx_stall(&mut stalls)?;
                        continue;
                    }
                    let units = remaining.min(7) as u8;
                    remaining -= u16::from(units);
                    self.write_register(Register::FifoData, FIFOCMD_REPEATDATA | (3 << 5))?;
                    self.write_register(Register::FifoData, preamble_flags)?;
                    self.write_register(Register::FifoData, units << 5)?;
                    self.write_register(Register::FifoData, preamble_byte)?;
                }

                Ax5043State::TxShortPreamble => {
                    if remaining == 0 {
                        if free < MIN_FREE_SYNC {
                            self.tx_stall(&mut stalls)?;
                            continue;
                        }
                        if appendbits != 0 {
                            self.write_register(Register::FifoData, FIFOCMD_DATA | (2 << 5))?;
                            self.write_register(Register::FifoData, FLAG_RAW_NOCRC)?;
                            let msb_first =
                                self.read_register(Register::PktAddrCfg)? & 0x80 != 0;
                            let byte = stop_bit_fold(appendpattern, appendbits, msb_first);
                            self.write_register(Register::FifoData, byte)?;
                        }
                        // Raw pattern-match framing carries the sync word as
                        // an ordinary FIFO chunk.
                        if self.read_register(Register::Framing)? & 0x0E == 0x06 && synclen != 0 {
                            let fractional = if synclen & 0x07 != 0 { 0x04 } else { 0x00 };
                            let sync_bytes = (synclen + 7) >> 3;
                            self.write_register(
                                Register::FifoData,
                                FIFOCMD_DATA | ((sync_bytes + 1) << 5),
                            )?;
                            self.write_register(Register::FifoData, syncflags | fractional)?;
                            for &byte in &syncword[..usize::from(sync_bytes)] {
                                self.write_register(Register::FifoData, byte)?;
                            }
                        }
                        self.state = Ax5043State::TxPacket;
                        continue;
                    }
                    if free < MIN_FREE_PREAMBLE {
                        self.tx_stall(&mut stalls)?;
                        continue;
                    }
                    let bytes = remaining.min(255 * 8) >> 3;
                    if bytes != 0 {
                        remaining -= bytes << 3;
                        self.write_register(Register::FifoData, FIFOCMD_REPEATDATA | (3 << 5))?;
                        self.write_register(Register::FifoData, preamble_flags)?;
                        self.write_register(Register::FifoData, bytes as u8)?;
                        self.write_register(Register::FifoData, preamble_byte)?;
                        continue;
                    }
                    // Fewer than 8 bits left: one partial byte with a stop
                    // bit marking where the valid bits end.
                    let bits = remaining as u8;
                    remaining = 0;
                    self.write_register(Register::FifoData, FIFOCMD_DATA | (2 << 5))?;
                    self.write_register(Register::FifoData, FLAG_RAW_NOCRC)?;
                    let msb_first = self.read_register(Register::PktAddrCfg)? & 0x80 != 0;
                    let byte = stop_bit_fold(preamble_byte, bits, msb_first);
                    self.write_register(Register::FifoData, byte)?;
                }

                Ax5043State::TxPacket => {
                    if free < MIN_FREE_PACKET {
                        self.tx_stall(&mut stalls)?;
                        continue;
                    }
                    let mut flags = 0;
                    if sent == 0 {
                        flags |= FLAG_PKT_START;
                    }
                    let len = frame.len() - sent;
                    let mut chunk = usize::from(free - PACKET_CHUNK_OVERHEAD);
                    if chunk >= len {
                        chunk = len;
                        flags |= FLAG_PKT_END;
                    }
                    if chunk != 0 {
                        self.write_register(Register::FifoData, FIFOCMD_DATA | (7 << 5))?;
                        // Chunk length includes the flag byte.
                        self.write_register(Register::FifoData, chunk as u8 + 1)?;
                        self.write_register(Register::FifoData, flags)?;
                        self.write_block(Register::FifoData, &frame[sent..sent + chunk])?;
                        sent += chunk;
                    }
                    if chunk == 0 || flags & FLAG_PKT_END != 0 {
                        // Arm the transmit-done event, then commit the tail.
                        self.write_register(Register::RadioEventMask0, 0x01)?;
                        self.write_register(Register::FifoStat, FIFO_COMMIT)?;
                        return Ok(());
                    }
                }

                _ => return Err(Ax5043Error::UnexpectedState),
            }
        }
    }

    /// Free FIFO space, saturated to 255 when the high byte is nonzero.
    fn fifo_free(&mut self) -> Result<u8, Ax5043Error> {
        let mut free = self.read_register(Register::FifoFree0)?;
        if self.read_register(Register::FifoFree1)? != 0 {
            free = 0xFF;
        }
        Ok(free)
    }

    /// Commits what is queued so the modulator can drain it, then waits.
    fn tx_stall(&mut self, stalls: &mut u32) -> Result<(), Ax5043Error> {
        *stalls += 1;
        if *stalls > TX_FIFO_RETRIES {
            return Err(Ax5043Error::Timeout);
        }
        self.write_register(Register::FifoStat, FIFO_COMMIT)?;
        self.delay.delay_ms(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{uhf_params, AddressMask, CFG_PREAMBLE_LEN, CFG_SYNCLEN, UHF_REGISTERS};
    use crate::driver::tests::{check_expectations, setup};
    use embedded_hal_mock::eh1::delay::Transaction as DelayTransaction;
    use embedded_hal_mock::eh1::spi::Transaction as SpiTransaction;

    fn dest(addr: u8) -> AddressMask {
        AddressMask {
            addr: [addr, 0, 0, 0],
            mask: [0xFF, 0, 0, 0],
        }
    }

    fn short_write(reg: u8, val: u8) -> [SpiTransaction<u8>; 3] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::transfer_in_place(vec![0x80 | reg, val], vec![0x80, 0x00]),
            SpiTransaction::transaction_end(),
        ]
    }

    fn short_read(reg: u8, val: u8) -> [SpiTransaction<u8>; 3] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::transfer_in_place(vec![reg, 0x00], vec![0x80, val]),
            SpiTransaction::transaction_end(),
        ]
    }

    fn fifo_free(free: u8) -> Vec<SpiTransaction<u8>> {
        let mut v = Vec::new();
        v.extend(short_read(0x2D, free));
        v.extend(short_read(0x2C, 0x00));
        v
    }

    #[test]
    fn frame_layout_inserts_address_and_length() {
        // maclen 3, addrlen 1, dest at 0, length byte at 2, mask 0xFF:
        // 5 payload bytes frame to 8 with the dest and total length inline.
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        let mut frame = [0u8; MAX_PACKET_LEN];

        let total = dev
            .build_frame(&dest(0x42), &[0xDE, 0xAD, 0xBE, 0xEF, 0x99], &mut frame)
            .unwrap();

        assert_eq!(total, 8);
        assert_eq!(frame[0], 0x42);
        assert_eq!(frame[2], 8);
        assert_eq!(&frame[3..8], &[0xDE, 0xAD, 0xBE, 0xEF, 0x99]);

        check_expectations(&mut dev);
    }

    #[test]
    fn length_byte_applies_offset_and_mask() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        dev.set_config(CFG_LENOFFS, 1).unwrap();
        dev.set_config(CFG_LENMASK, 0x7F).unwrap();
        let mut frame = [0u8; MAX_PACKET_LEN];

        let total = dev.build_frame(&dest(0x01), &[0u8; 10], &mut frame).unwrap();

        assert_eq!(total, 13);
        assert_eq!(frame[2], (13 - 1) & 0x7F);

        check_expectations(&mut dev);
    }

    #[test]
    fn oversized_packet_rejected_without_bus_traffic() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        let payload = [0u8; MAX_PACKET_LEN]; // maclen pushes this over

        let res = dev.transmit_packet(&dest(0x42), &payload);

        assert_eq!(res, Err(Ax5043Error::Invalid));
        // No expectations were queued: any SPI write would have failed.
        check_expectations(&mut dev);
    }

    #[test]
    fn misconfigured_framing_positions_rejected() {
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        let mut frame = [0u8; MAX_PACKET_LEN];

        // Destination slot past the end of the frame.
        dev.set_config(CFG_DESTADDRPOS, 200).unwrap();
        assert_eq!(
            dev.build_frame(&dest(0x42), &[0u8; 5], &mut frame),
            Err(Ax5043Error::Invalid)
        );
        dev.set_config(CFG_DESTADDRPOS, 0).unwrap();

        // Length byte position past the end of the frame.
        dev.set_config(CFG_LENPOS, 100).unwrap();
        assert_eq!(
            dev.build_frame(&dest(0x42), &[0u8; 5], &mut frame),
            Err(Ax5043Error::Invalid)
        );
        dev.set_config(CFG_LENPOS, 2).unwrap();

        // Address length beyond the four bytes a station address holds.
        dev.set_config(CFG_ADDRLEN, 5).unwrap();
        assert_eq!(
            dev.build_frame(&dest(0x42), &[0u8; 5], &mut frame),
            Err(Ax5043Error::Invalid)
        );

        check_expectations(&mut dev);
    }

    #[test]
    fn out_of_range_sync_and_append_settings_rejected() {
        // Rejected before any FIFO traffic: no expectations are queued.
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        dev.state = Ax5043State::TxLongPreamble;

        dev.set_config(CFG_SYNCLEN, 40).unwrap();
        assert_eq!(dev.drive_tx_fifo(&[0u8; 3]), Err(Ax5043Error::Invalid));

        dev.set_config(CFG_SYNCLEN, 32).unwrap();
        dev.set_config(CFG_PREAMBLE_APPENDBITS, 8).unwrap();
        assert_eq!(dev.drive_tx_fifo(&[0u8; 3]), Err(Ax5043Error::Invalid));

        check_expectations(&mut dev);
    }

    #[test]
    fn stop_bit_fold_both_bit_orders() {
        // 5 valid bits of 0x7E, stop bit in the unused part.
        assert_eq!(stop_bit_fold(0x7E, 5, true), (0x7E & 0xF8) | 0x04);
        assert_eq!(stop_bit_fold(0x7E, 5, false), (0x7E & 0x1F) | 0x20);
    }

    #[test]
    fn transmit_streams_preamble_sync_and_packet() {
        // 8 preamble bits -> one repeat chunk; 32-bit sync word; 8-byte
        // frame in a single DATA chunk; radio goes idle on the first poll.
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        dev.set_config(CFG_PREAMBLE_LEN, 8).unwrap();
        dev.state = Ax5043State::Tx;

        let mut ex: Vec<SpiTransaction<u8>> = Vec::new();
        ex.extend(short_read(0x0F, 0x00)); // clear pending event
        ex.extend(short_write(0x28, 3)); // clear FIFO
        ex.extend(short_read(0x10, 0x08)); // modulation: FSK, no dibit sync
        // Long preamble is empty: falls through to short preamble.
        ex.extend(fifo_free(0x80));
        ex.extend(fifo_free(0x80));
        ex.extend(short_write(0x29, 0x62)); // REPEATDATA, 3 bytes
        ex.extend(short_write(0x29, 0x38));
        ex.extend(short_write(0x29, 1)); // 8 bits = 1 repeat byte
        ex.extend(short_write(0x29, 0x7E));
        // Preamble exhausted: sync word chunk.
        ex.extend(fifo_free(0x80));
        ex.extend(short_read(0x12, 0x26)); // framing: raw pattern match
        ex.extend(short_write(0x29, 0xA1)); // DATA, 5 payload bytes
        ex.extend(short_write(0x29, 0x38));
        ex.extend(short_write(0x29, 0xCC));
        ex.extend(short_write(0x29, 0xAA));
        ex.extend(short_write(0x29, 0xCC));
        ex.extend(short_write(0x29, 0xAA));
        // Whole frame fits one DATA chunk.
        ex.extend(fifo_free(0x80));
        ex.extend(short_write(0x29, 0xE1)); // DATA, explicit length
        ex.extend(short_write(0x29, 9)); // 8 frame bytes + flag byte
        ex.extend(short_write(0x29, 0x03)); // pkt_start | pkt_end
        ex.push(SpiTransaction::transaction_start());
        ex.push(SpiTransaction::transfer_in_place(vec![0xA9], vec![0x80]));
        ex.push(SpiTransaction::write_vec(vec![
            0x42, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x99,
        ]));
        ex.push(SpiTransaction::transaction_end());
        ex.extend(short_write(0x09, 0x01)); // arm transmit-done event
        ex.extend(short_write(0x28, 4)); // final commit
        // Key up and wait for the radio controller to go idle.
        ex.extend(short_read(0x02, 0x60));
        ex.extend(short_write(0x02, 0x6D));
        ex.extend(short_read(0x0F, 0x00));
        ex.extend(short_read(0x1C, 0x00));
        ex.extend(short_write(0x09, 0x00));
        dev.spi.update_expectations(&ex);

        dev.transmit_packet(&dest(0x42), &[0xDE, 0xAD, 0xBE, 0xEF, 0x99])
            .unwrap();
        assert_eq!(dev.state(), Ax5043State::Tx);

        check_expectations(&mut dev);
    }

    #[test]
    fn transmit_stalls_until_fifo_drains() {
        // No preamble, no sync: a short FIFO forces one commit-and-wait
        // cycle before the packet chunk fits.
        let mut params = uhf_params();
        let mut dev = setup(&mut params, UHF_REGISTERS);
        dev.set_config(CFG_PREAMBLE_LEN, 0).unwrap();
        dev.set_config(CFG_SYNCLEN, 0).unwrap();
        dev.state = Ax5043State::TxLongPreamble;

        let mut ex: Vec<SpiTransaction<u8>> = Vec::new();
        ex.extend(fifo_free(0x80));
        ex.extend(fifo_free(0x80));
        ex.extend(short_read(0x12, 0x26)); // framing read, sync skipped
        // Not enough room for a packet chunk yet.
        ex.extend(fifo_free(0x05));
        ex.extend(short_write(0x28, 4));
        ex.extend(fifo_free(0x80));
        ex.extend(short_write(0x29, 0xE1));
        ex.extend(short_write(0x29, 4));
        ex.extend(short_write(0x29, 0x03));
        ex.push(SpiTransaction::transaction_start());
        ex.push(SpiTransaction::transfer_in_place(vec![0xA9], vec![0x80]));
        ex.push(SpiTransaction::write_vec(vec![0x42, 0x00, 0x03]));
        ex.push(SpiTransaction::transaction_end());
        ex.extend(short_write(0x09, 0x01));
        ex.extend(short_write(0x28, 4));
        dev.spi.update_expectations(&ex);
        dev.delay
            .update_expectations(&[DelayTransaction::blocking_delay_ms(1)]);

        let mut frame = [0u8; MAX_PACKET_LEN];
        let total = dev.build_frame(&dest(0x42), &[], &mut frame).unwrap();
        assert_eq!(total, 3);
        dev.drive_tx_fifo(&frame[..total]).unwrap();

        check_expectations(&mut dev);
    }
}

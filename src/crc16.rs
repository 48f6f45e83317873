//! 16-bit checksums used by the two telegram formats.

use crc::{Crc, CRC_16_ARC, CRC_16_IBM_SDLC};

/// HDLC frame/header check sequence (CRC-16/X.25). Transmitted little-endian.
const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// P1 telegram checksum (CRC-16/IBM, reflected 0x8005, zero init).
const IBM: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub fn x25(data: &[u8]) -> u16 {
    X25.checksum(data)
}

pub fn ibm(data: &[u8]) -> u16 {
    IBM.checksum(data)
}

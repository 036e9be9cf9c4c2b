//! CRC-16/ARC (poly 0x8005 reflected, init 0, no final xor) used by the
//! CRC16-length-prefixed wire format.

const POLY_REFLECTED: u16 = 0xA001;

pub fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
        }
    }
    crc
}

//! Byte frames shared by the IMU input and the servo output on one UART.
//!
//! Wire format (H = header byte, D = data byte, C = CRC byte):
//!
//! ```text
//! HH+DDDDD#C
//! ```
//!
//! The header is ASCII and ends at the first `'+'`. The CRC is the XOR of
//! every byte of the frame except the CRC byte itself - deliberately weak,
//! matching what the MCU can afford per byte. Framing-on-stream (resync)
//! is not handled here; that state machine lives with the IMU reader.

/// Frame format used for lidar-related stuff.
pub const HEADER_LIDAR: &[u8] = b"LD";
/// Frame format used for motors-related stuff.
#[allow(dead_code)]
pub const HEADER_MOTORS: &[u8] = b"MT";

/// Separates the header from the data.
pub const START_BYTE: u8 = b'+';
/// Terminates the data, right before the CRC byte.
pub const END_BYTE: u8 = b'#';

/// Build a frame transporting `data` under `header`.
pub fn encode(header: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + data.len() + 3);
    frame.extend_from_slice(header);
    frame.push(START_BYTE);
    frame.extend_from_slice(data);
    frame.push(END_BYTE);
    frame.push(xor_checksum(&frame));
    frame
}

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |crc, b| crc ^ b)
}

/// Index of the first `'+'`, i.e. the header length.
fn header_len(frame: &[u8]) -> Option<usize> {
    frame.iter().position(|&b| b == START_BYTE)
}

/// The frame's leading bytes, up to the first `'+'`.
pub fn header(frame: &[u8]) -> Option<&[u8]> {
    header_len(frame).map(|n| &frame[..n])
}

/// The frame's payload, between `'+'` and the trailing `'#'`.
pub fn data(frame: &[u8]) -> Option<&[u8]> {
    let n = header_len(frame)?;
    if frame.len() < n + 3 {
        return None;
    }
    Some(&frame[n + 1..frame.len() - 2])
}

/// The frame's last byte - its CRC.
pub fn checksum(frame: &[u8]) -> Option<u8> {
    frame.last().copied()
}

/// Check structure and CRC of a complete frame.
pub fn verify(frame: &[u8]) -> bool {
    let n = match header_len(frame) {
        Some(n) => n,
        None => return false,
    };
    if frame.len() < n + 3 {
        return false;
    }
    if frame[frame.len() - 2] != END_BYTE {
        return false;
    }
    xor_checksum(&frame[..frame.len() - 1]) == frame[frame.len() - 1]
}

/// Render the most common representations of a byte, for wire-level
/// debugging of frames as they are sent or received.
pub fn describe_byte(b: u8) -> String {
    format!(
        "byte(bin: {:08b}, dec: {:3}, hex: {:02x}, ASCII: {:?})",
        b, b, b, b as char
    )
}

// Update sequence (fixup) protection for FILE records and INDX blocks
// The last two bytes of every 512-byte stride hold the USN on disk; the
// original bytes live in the update sequence array after the USN

use crate::structures::FIXUP_STRIDE;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use ntfsrw_core::{NtfsError, Result};

/// Array entries for a record of `size` bytes: the USN plus one per stride.
pub fn usa_count_for(size: usize) -> u16 {
    (size / FIXUP_STRIDE + 1) as u16
}

fn check_layout(buffer: &[u8], usa_offset: usize, usa_count: usize) -> Result<()> {
    if usa_count < 2 || usa_offset + usa_count * 2 > buffer.len() {
        return Err(NtfsError::FormatCorruption(format!(
            "update sequence array at {} with {} entries does not fit a {}-byte record",
            usa_offset,
            usa_count,
            buffer.len()
        )));
    }
    if (usa_count - 1) * FIXUP_STRIDE > buffer.len() {
        return Err(NtfsError::FormatCorruption(format!(
            "{} fixup strides exceed a {}-byte record",
            usa_count - 1,
            buffer.len()
        )));
    }
    Ok(())
}

/// Verify and undo the fixups of a buffer just read from disk.
pub fn apply_fixup(buffer: &mut [u8], usa_offset: u16, usa_count: u16) -> Result<()> {
    let usa_offset = usa_offset as usize;
    let usa_count = usa_count as usize;
    check_layout(buffer, usa_offset, usa_count)?;

    let usn = LittleEndian::read_u16(&buffer[usa_offset..]);
    trace!("Applying fixup with USN {:04X}", usn);

    // Check every stride before touching any of them
    for i in 1..usa_count {
        let tail = i * FIXUP_STRIDE - 2;
        let found = LittleEndian::read_u16(&buffer[tail..]);
        if found != usn {
            return Err(NtfsError::FormatCorruption(format!(
                "fixup mismatch at sector {}: expected {:04X}, found {:04X}",
                i, usn, found
            )));
        }
    }
    for i in 1..usa_count {
        let tail = i * FIXUP_STRIDE - 2;
        let saved = usa_offset + i * 2;
        buffer.copy_within(saved..saved + 2, tail);
    }
    Ok(())
}

/// Stamp a new USN over every stride tail, saving the original bytes.
/// Returns the USN written.
pub fn protect(buffer: &mut [u8], usa_offset: u16, usa_count: u16) -> Result<u16> {
    let usa_offset = usa_offset as usize;
    let usa_count = usa_count as usize;
    check_layout(buffer, usa_offset, usa_count)?;

    let usn = match LittleEndian::read_u16(&buffer[usa_offset..]).wrapping_add(1) {
        0 | 0xFFFF => 1,
        n => n,
    };
    LittleEndian::write_u16(&mut buffer[usa_offset..], usn);
    for i in 1..usa_count {
        let tail = i * FIXUP_STRIDE - 2;
        let saved = usa_offset + i * 2;
        buffer.copy_within(tail..tail + 2, saved);
        LittleEndian::write_u16(&mut buffer[tail..], usn);
    }
    trace!("Protected {} strides with USN {:04X}", usa_count - 1, usn);
    Ok(usn)
}

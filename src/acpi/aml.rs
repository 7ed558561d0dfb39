//! Hand-emitted AML (ACPI Machine Language) building blocks (spec §4.7).
//!
//! Only the subset needed for this core's DSDT: `Scope`, `Device`, `Name` (string/integer/buffer),
//! and the resource descriptors `IO`, `IRQNoFlags`, `Memory32Fixed`, `ExtendedInterrupt`, each buffer
//! closed with the end tag `{0x79, 0x00}`. Follows the teacher's `boot/acpi.rs` byte-by-byte AML
//! construction almost verbatim, generalized to also emit I/O port and legacy IRQ descriptors for the
//! UART/RTC devices the teacher never modeled.

const NAME_OP: u8 = 0x08;
const STRING_PREFIX: u8 = 0x0D;
const BYTE_PREFIX: u8 = 0x0A;
const WORD_PREFIX: u8 = 0x0B;
const DWORD_PREFIX: u8 = 0x0C;
const ZERO_OP: u8 = 0x00;
const ONE_OP: u8 = 0x01;
const BUFFER_OP: u8 = 0x11;
const SCOPE_OP: u8 = 0x10;
const EXT_OP_PREFIX: u8 = 0x5B;
const DEVICE_OP: u8 = 0x82;

/// Encode a PkgLength value (ACPI spec §20.2.4). `content_len` is the size of the bytes that follow
/// the PkgLength encoding; the returned length includes the PkgLength bytes themselves.
pub fn encode_pkg_length(buffer: &mut Vec<u8>, content_len: usize) {
    if content_len < 0x3F {
        buffer.push((content_len + 1) as u8);
        return;
    }
    if content_len + 2 <= 0x0FFF {
        let total = content_len + 2;
        buffer.push((1u8 << 6) | ((total & 0x0F) as u8));
        buffer.push((total >> 4) as u8);
        return;
    }
    if content_len + 3 <= 0x0F_FFFF {
        let total = content_len + 3;
        buffer.push((2u8 << 6) | ((total & 0x0F) as u8));
        buffer.push(((total >> 4) & 0xFF) as u8);
        buffer.push(((total >> 12) & 0xFF) as u8);
        return;
    }
    let total = content_len + 4;
    buffer.push((3u8 << 6) | ((total & 0x0F) as u8));
    buffer.push(((total >> 4) & 0xFF) as u8);
    buffer.push(((total >> 12) & 0xFF) as u8);
    buffer.push(((total >> 20) & 0xFF) as u8);
}

/// A 4-character AML NameSeg, padding with `_` on the right.
pub fn name_seg(name: &str) -> [u8; 4] {
    let mut seg = [b'_'; 4];
    for (i, b) in name.bytes().take(4).enumerate() {
        seg[i] = b;
    }
    seg
}

fn encode_integer(buf: &mut Vec<u8>, value: u64) {
    match value {
        0 => buf.push(ZERO_OP),
        1 => buf.push(ONE_OP),
        v if v <= 0xFF => {
            buf.push(BYTE_PREFIX);
            buf.push(v as u8);
        }
        v if v <= 0xFFFF => {
            buf.push(WORD_PREFIX);
            buf.extend_from_slice(&(v as u16).to_le_bytes());
        }
        v if v <= 0xFFFF_FFFF => {
            buf.push(DWORD_PREFIX);
            buf.extend_from_slice(&(v as u32).to_le_bytes());
        }
        v => {
            buf.push(0x0E); // QWordPrefix
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// `Name(seg, "string")`.
pub fn name_string(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![NAME_OP];
    out.extend_from_slice(&name_seg(name));
    out.push(STRING_PREFIX);
    out.extend_from_slice(value.as_bytes());
    out.push(0x00);
    out
}

/// `Name(seg, <integer>)`.
pub fn name_integer(name: &str, value: u64) -> Vec<u8> {
    let mut out = vec![NAME_OP];
    out.extend_from_slice(&name_seg(name));
    encode_integer(&mut out, value);
    out
}

/// `Name(seg, Buffer() { resources... })`, used for `_CRS` resource templates.
pub fn name_buffer(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut out = vec![NAME_OP];
    out.extend_from_slice(&name_seg(name));
    out.extend_from_slice(&buffer_op(contents));
    out
}

fn buffer_op(contents: &[u8]) -> Vec<u8> {
    let mut size_encoding = Vec::new();
    encode_integer(&mut size_encoding, contents.len() as u64);

    let mut body = Vec::new();
    body.extend_from_slice(&size_encoding);
    body.extend_from_slice(contents);

    let mut out = vec![BUFFER_OP];
    encode_pkg_length(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

/// I/O Port descriptor (small resource, tag `0x47`): fixed-location decode, 1-byte alignment,
/// single-byte length.
pub fn io_port(base: u16, len: u8) -> Vec<u8> {
    vec![
        0x47, // IO descriptor, fixed-location decode (bit0=1)
        0x01, // information: 16-bit decode
        (base & 0xFF) as u8,
        (base >> 8) as u8,
        (base & 0xFF) as u8,
        (base >> 8) as u8,
        0x01, // alignment
        len,
    ]
}

/// IRQNoFlags descriptor (small resource, tag `0x22`): edge-triggered, active-high, exclusive,
/// single IRQ line encoded as a bitmask.
pub fn irq_no_flags(irq: u8) -> Vec<u8> {
    let mask: u16 = 1u16 << (irq as u32 % 16);
    vec![0x22, (mask & 0xFF) as u8, (mask >> 8) as u8]
}

/// Memory32Fixed descriptor (large resource, tag `0x86`).
pub fn memory32_fixed(base: u32, len: u32) -> Vec<u8> {
    let mut out = vec![0x86, 0x09, 0x00, 0x01];
    out.extend_from_slice(&base.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out
}

/// Extended Interrupt descriptor (large resource, tag `0x89`): consumer, level, active-high,
/// exclusive, single GSI.
pub fn extended_interrupt(gsi: u32) -> Vec<u8> {
    let mut out = vec![0x89, 0x06, 0x00, 0x0B, 0x01];
    out.extend_from_slice(&gsi.to_le_bytes());
    out
}

/// End tag for a resource buffer (checksum byte `0x00` disables verification, per ACPI spec).
pub fn end_tag() -> Vec<u8> {
    vec![0x79, 0x00]
}

/// Concatenate resource descriptors and the end tag, then wrap as `Name(_CRS, Buffer() {...})`.
pub fn resource_template(resources: &[Vec<u8>]) -> Vec<u8> {
    let mut contents = Vec::new();
    for r in resources {
        contents.extend_from_slice(r);
    }
    contents.extend_from_slice(&end_tag());
    name_buffer("_CRS", &contents)
}

/// `Device(seg) { contents... }`.
pub fn device(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut out = vec![EXT_OP_PREFIX, DEVICE_OP];
    let mut body = Vec::new();
    body.extend_from_slice(&name_seg(name));
    body.extend_from_slice(contents);
    encode_pkg_length(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

/// `Scope(\_SB) { contents... }`.
pub fn scope_sb(contents: &[u8]) -> Vec<u8> {
    let scope_name: [u8; 5] = [0x5C, 0x5F, 0x53, 0x42, 0x5F]; // "\_SB_"
    let mut out = vec![SCOPE_OP];
    encode_pkg_length(&mut out, scope_name.len() + contents.len());
    out.extend_from_slice(&scope_name);
    out.extend_from_slice(contents);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkg_length_matches_teacher_table() {
        let mut buf = Vec::new();
        encode_pkg_length(&mut buf, 10);
        assert_eq!(buf, vec![11]);

        let mut buf = Vec::new();
        encode_pkg_length(&mut buf, 62 + 1);
        assert_eq!(buf, vec![0x41, 0x04]);
    }

    #[test]
    fn resource_template_ends_with_end_tag() {
        let tmpl = resource_template(&[memory32_fixed(0x1000, 0x200), extended_interrupt(5)]);
        assert_eq!(&tmpl[tmpl.len() - 2..], &[0x79, 0x00]);
    }

    #[test]
    fn name_string_is_null_terminated() {
        let n = name_string("_HID", "PNP0501");
        assert_eq!(*n.last().unwrap(), 0x00);
    }

    #[test]
    fn irq_no_flags_sets_correct_bit() {
        let n = irq_no_flags(4);
        let mask = u16::from_le_bytes([n[1], n[2]]);
        assert_eq!(mask, 1 << 4);
    }
}

//! The raw-frame container format used as the software codec's bitstream.
//!
//! Two record kinds, both little-endian and length-framed:
//!
//! ```text
//! parameter set:  magic "VPS1" | width | height | fmt | frame_rate | bit_rate | gop
//! frame:          magic "VFR1" | width | height | fmt | plane_num | (len, bytes)*
//! ```
//!
//! Frame planes are packed tightly (no stride padding); strides are applied
//! when a frame is copied into a destination surface.

use surface::ColorFormat;

use crate::error::{CodecError, CodecResult};

const PARAM_SET_MAGIC: u32 = 0x5650_5331; // "VPS1"
const FRAME_MAGIC: u32 = 0x5646_5231; // "VFR1"

/// Image properties carried by every frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub format: ColorFormat,
}

/// A parsed container record.
#[derive(Debug)]
pub enum Packet {
    /// Stream-level parameter set; always the first record of a stream.
    ParameterSet {
        width: u32,
        height: u32,
        format: ColorFormat,
        frame_rate: u32,
        bit_rate: u32,
        gop_size: u32,
    },
    /// One picture, planes packed tightly in format order.
    Frame {
        header: FrameHeader,
        planes: Vec<Vec<u8>>,
    },
}

fn format_code(format: ColorFormat) -> u8 {
    match format {
        ColorFormat::Nv12 => 0,
        ColorFormat::Nv21 => 1,
        ColorFormat::I420 => 2,
        ColorFormat::P010 => 3,
        ColorFormat::I010 => 4,
        ColorFormat::Bgr24 => 5,
        ColorFormat::Rgb24 => 6,
        ColorFormat::Bgra => 7,
        ColorFormat::Rgba => 8,
        ColorFormat::Abgr => 9,
        ColorFormat::Argb => 10,
        ColorFormat::Yuyv => 11,
        ColorFormat::Uyvy => 12,
        ColorFormat::Monochrome => 13,
    }
}

fn format_from_code(code: u8) -> CodecResult<ColorFormat> {
    Ok(match code {
        0 => ColorFormat::Nv12,
        1 => ColorFormat::Nv21,
        2 => ColorFormat::I420,
        3 => ColorFormat::P010,
        4 => ColorFormat::I010,
        5 => ColorFormat::Bgr24,
        6 => ColorFormat::Rgb24,
        7 => ColorFormat::Bgra,
        8 => ColorFormat::Rgba,
        9 => ColorFormat::Abgr,
        10 => ColorFormat::Argb,
        11 => ColorFormat::Yuyv,
        12 => ColorFormat::Uyvy,
        13 => ColorFormat::Monochrome,
        _ => return Err(CodecError::CorruptStream("unknown color format code")),
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(CodecError::CorruptStream("record truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> CodecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }
}

/// Serializes a parameter-set record.
pub fn pack_parameter_set(
    width: u32,
    height: u32,
    format: ColorFormat,
    frame_rate: u32,
    bit_rate: u32,
    gop_size: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&PARAM_SET_MAGIC.to_le_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.push(format_code(format));
    out.extend_from_slice(&frame_rate.to_le_bytes());
    out.extend_from_slice(&bit_rate.to_le_bytes());
    out.extend_from_slice(&gop_size.to_le_bytes());
    out
}

/// Serializes one picture with tightly packed planes.
pub fn pack_frame(header: FrameHeader, planes: &[&[u8]]) -> Vec<u8> {
    let payload: usize = planes.iter().map(|p| 4 + p.len()).sum();
    let mut out = Vec::with_capacity(14 + payload);
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&header.width.to_le_bytes());
    out.extend_from_slice(&header.height.to_le_bytes());
    out.push(format_code(header.format));
    out.push(planes.len() as u8);
    for plane in planes {
        out.extend_from_slice(&(plane.len() as u32).to_le_bytes());
        out.extend_from_slice(plane);
    }
    out
}

/// Parses one container record, returning it and the bytes consumed. A
/// stream packet may carry several records back to back (the first packet of
/// an encoded stream holds the parameter set followed by the first picture).
pub fn parse_packet(bits: &[u8]) -> CodecResult<(Packet, usize)> {
    let mut cur = Cursor { bytes: bits, pos: 0 };
    let packet = match cur.u32()? {
        PARAM_SET_MAGIC => {
            let width = cur.u32()?;
            let height = cur.u32()?;
            let format = format_from_code(cur.u8()?)?;
            let frame_rate = cur.u32()?;
            let bit_rate = cur.u32()?;
            let gop_size = cur.u32()?;
            Packet::ParameterSet {
                width,
                height,
                format,
                frame_rate,
                bit_rate,
                gop_size,
            }
        }
        FRAME_MAGIC => {
            let width = cur.u32()?;
            let height = cur.u32()?;
            let format = format_from_code(cur.u8()?)?;
            let plane_num = cur.u8()? as usize;
            if plane_num == 0 || plane_num > 3 {
                return Err(CodecError::CorruptStream("bad plane count"));
            }
            let mut planes = Vec::with_capacity(plane_num);
            for _ in 0..plane_num {
                let len = cur.u32()? as usize;
                planes.push(cur.take(len)?.to_vec());
            }
            Packet::Frame {
                header: FrameHeader {
                    width,
                    height,
                    format,
                },
                planes,
            }
        }
        _ => return Err(CodecError::CorruptStream("unknown record magic")),
    };
    Ok((packet, cur.pos))
}

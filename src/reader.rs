// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-side bitstream cursor: a length-bounded big-endian reader over a
//! byte slice, plus the box header codec and scoped per-box iteration.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::boxes::{BoxType, FourCC};
use crate::{Error, Result, ToU64, TryString, TryVec};

/// A bounded cursor over a byte slice.
///
/// The slice is always the *whole* input stream; a range only moves its
/// `pos..end` window, so `position()` is an absolute file offset. Deriving a
/// sub-range consumes the covered bytes from the parent, which is what keeps
/// every box parse confined to its declared extent.
#[derive(Clone, Copy)]
pub struct BitstreamRange<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> BitstreamRange<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, end: data.len() }
    }

    /// Absolute offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.pos.to_u64()
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::EndOfData);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u24(self.read_bytes(3)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// Split off the next `len` bytes as a child range, consuming them here.
    pub fn sub_range(&mut self, len: u64) -> Result<BitstreamRange<'a>> {
        let len = usize::try_from(len).map_err(|_| Error::EndOfData)?;
        if len > self.remaining() {
            return Err(Error::EndOfData);
        }
        let child = Self { data: self.data, pos: self.pos, end: self.pos + len };
        self.pos += len;
        Ok(child)
    }

    pub fn read_into_try_vec(&mut self) -> Result<TryVec<u8>> {
        let len = self.remaining();
        let mut vec = TryVec::new();
        vec.extend_from_slice(self.read_bytes(len)?)?;
        Ok(vec)
    }

    /// Read a NUL-terminated UTF-8 string. An empty range yields an empty
    /// string; a range that ends before the terminator is `EndOfData`, not
    /// silent truncation.
    pub fn read_null_terminated_string(&mut self) -> Result<TryString> {
        if self.is_empty() {
            return Ok(TryVec::new());
        }
        let rest = &self.data[self.pos..self.end];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Error::EndOfData)?;
        let bytes = self.read_bytes(nul)?;
        self.skip(1)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidData("invalid utf8"))?;
        let mut out = TryVec::new();
        out.extend_from_slice(bytes)?;
        Ok(out)
    }

    /// Read the remainder of the range as UTF-8, tolerating a missing NUL
    /// terminator. Used for trailing name fields (`hdlr`).
    pub fn read_string_to_end(&mut self) -> Result<TryString> {
        let len = self.remaining();
        let mut bytes = self.read_bytes(len)?;
        if let [head @ .., 0] = bytes {
            bytes = head;
        }
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidData("invalid utf8"))?;
        let mut out = TryVec::new();
        out.extend_from_slice(bytes)?;
        Ok(out)
    }
}

/// Basic ISO box structure.
///
/// A stream is a sequence of possibly-nested 'box' structures. Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    /// Box type.
    pub name: BoxType,
    /// Size of the box in bytes, including the header.
    pub size: u64,
    /// Offset to the start of the contained data (i.e. the header size).
    pub offset: u64,
    /// Extended type for 'uuid' boxes.
    pub uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub const MIN_LARGE_SIZE: u64 = 16;
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular box and its
/// length. A returned `size` of 0 means "extends to the end of the stream";
/// `BoxIter` resolves or rejects that depending on nesting.
///
/// See ISO 14496-12:2015 § 4.2
pub fn read_box_header(src: &mut BitstreamRange<'_>) -> Result<BoxHeader> {
    let size32 = src.read_u32()?;
    let name = BoxType::from(src.read_u32()?);
    let size = match size32 {
        0 => 0,
        1 => {
            let size64 = src.read_u64()?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidBoxSize("malformed wide size"));
            }
            size64
        }
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidBoxSize("malformed size"));
            }
            u64::from(size32)
        }
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size != 0 && size < offset + 16 {
            return Err(Error::InvalidBoxSize("uuid box too small for extended type"));
        }
        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(src.read_bytes(16)?);
        offset += 16;
        Some(buffer)
    } else {
        None
    };
    Ok(BoxHeader { name, size, offset, uuid })
}

/// Parse the extra header fields for a full box.
pub fn read_fullbox_extra(src: &mut BMFFBox<'_>) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags = src.read_u24()?;
    Ok((version, flags))
}

/// Parse the extra fields for a full box whose flag fields must be zero.
pub fn read_fullbox_version_no_flags(
    src: &mut BMFFBox<'_>,
    options: &crate::ParseOptions,
) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;
    if flags != 0 && !options.lenient {
        return Err(Error::InvalidData("expected flags to be 0"));
    }
    Ok(version)
}

/// One box scoped to its declared extent.
///
/// See ISO 14496-12:2015 § 4.2
pub struct BMFFBox<'a> {
    pub head: BoxHeader,
    pub content: BitstreamRange<'a>,
}

impl<'a> BMFFBox<'a> {
    pub fn bytes_left(&self) -> u64 {
        self.content.remaining().to_u64()
    }

    pub fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    /// Absolute offset of the next unread content byte.
    pub fn offset(&self) -> u64 {
        self.content.position()
    }

    pub fn box_iter(&mut self) -> BoxIter<'_, 'a> {
        BoxIter { src: &mut self.content, nested: true }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.content.read_u8()
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.content.read_u16()
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        self.content.read_u24()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.content.read_u32()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.content.read_u64()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.content.read_bytes(len)
    }

    pub fn read_into_try_vec(&mut self) -> Result<TryVec<u8>> {
        self.content.read_into_try_vec()
    }

    pub fn read_null_terminated_string(&mut self) -> Result<TryString> {
        self.content.read_null_terminated_string()
    }

    pub fn read_string_to_end(&mut self) -> Result<TryString> {
        self.content.read_string_to_end()
    }
}

/// Iterates the sibling boxes inside a range.
pub struct BoxIter<'r, 'a> {
    src: &'r mut BitstreamRange<'a>,
    nested: bool,
}

impl<'r, 'a> BoxIter<'r, 'a> {
    /// Iterate the top-level boxes of a stream. A final box with size 0
    /// extends to the end of the stream, which is only legal here.
    pub fn new(src: &'r mut BitstreamRange<'a>) -> Self {
        Self { src, nested: false }
    }

    pub fn next_box(&mut self) -> Result<Option<BMFFBox<'a>>> {
        if self.src.is_empty() {
            return Ok(None);
        }
        let mut head = read_box_header(self.src)?;
        let body = if head.size == 0 {
            if self.nested {
                return Err(Error::InvalidBoxSize("size 0 only valid for the last top-level box"));
            }
            self.src.remaining().to_u64()
        } else {
            head.size
                .checked_sub(head.offset)
                .ok_or(Error::InvalidBoxSize("header larger than box"))?
        };
        if body > self.src.remaining().to_u64() {
            return Err(Error::EndOfData);
        }
        // Resolve the to-end sentinel so size closure holds on the tree.
        if head.size == 0 {
            head.size = head.offset + body;
        }
        let content = self.src.sub_range(body)?;
        Ok(Some(BMFFBox { head, content }))
    }
}

/// Skip over the remaining content of a box.
pub fn skip_box_remain(src: &mut BMFFBox<'_>) -> Result<()> {
    let remain = src.content.remaining();
    if remain > 0 {
        debug!("remain {remain} (skipped) in {:?}", src.head);
    }
    src.content.skip(remain)
}

/// Every typed parse must consume its whole box; leftovers mean the parser
/// and the file disagree about the layout.
#[cfg_attr(debug_assertions, track_caller)]
pub fn check_parser_state(src: &BMFFBox<'_>) -> Result<()> {
    if src.content.is_empty() {
        Ok(())
    } else {
        let name: FourCC = From::from(src.head.name);
        debug!("{} unread bytes in '{}'", src.content.remaining(), name);
        Err(Error::InvalidData("unread box content or bad parser sync"))
    }
}

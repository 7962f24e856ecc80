// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Write-side bitstream cursor: big-endian primitives over a growable
//! buffer, deferred box headers, and absolute back-patching for the sizes
//! and offsets that are only known after a body has been serialized.

use byteorder::{BigEndian, ByteOrder};

use crate::boxes::BoxType;
use crate::{Error, Result, ToU64, TryVec};

/// Big-endian box serializer.
///
/// `begin_box` reserves header space and returns a [`BoxStart`] token;
/// `end_box` consumes the token and patches the size once the body length is
/// known. Patches rewrite bytes in place and never extend the stream.
#[derive(Default)]
pub struct BoxWriter {
    data: TryVec<u8>,
}

/// Handle for a reserved box header, redeemed by [`BoxWriter::end_box`].
#[must_use = "a reserved box header must be closed with end_box"]
#[derive(Debug)]
pub struct BoxStart {
    start: u64,
    large: bool,
}

impl BoxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte position, i.e. the number of bytes written so far.
    pub fn position(&self) -> u64 {
        self.data.len().to_u64()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> TryVec<u8> {
        self.data
    }

    pub fn u8(&mut self, v: u8) -> Result<()> {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> Result<()> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn u24(&mut self, v: u32) -> Result<()> {
        if v > 0x00ff_ffff {
            return Err(Error::OverflowOnWrite("value exceeds 24 bits"));
        }
        self.bytes(&v.to_be_bytes()[1..])
    }

    pub fn u32(&mut self, v: u32) -> Result<()> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.data.extend_from_slice(v)?;
        Ok(())
    }

    /// A string with its NUL terminator.
    pub fn null_terminated_string(&mut self, v: &[u8]) -> Result<()> {
        self.bytes(v)?;
        self.u8(0)
    }

    pub fn zeros(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.u8(0)?;
        }
        Ok(())
    }

    /// Reserve a compact (32-bit size) box header.
    pub fn begin_box(&mut self, name: BoxType) -> Result<BoxStart> {
        let start = self.position();
        self.u32(0)?;
        self.u32(u32::from(name))?;
        Ok(BoxStart { start, large: false })
    }

    /// Reserve an extended (64-bit size) box header. Callers that may
    /// exceed the 32-bit form, or that back-patch into pre-reserved slots,
    /// force this up front.
    pub fn begin_box_large(&mut self, name: BoxType) -> Result<BoxStart> {
        let start = self.position();
        self.u32(1)?;
        self.u32(u32::from(name))?;
        self.u64(0)?;
        Ok(BoxStart { start, large: true })
    }

    /// Reserve a compact header followed by full-box version and flags.
    pub fn begin_full_box(&mut self, name: BoxType, version: u8, flags: u32) -> Result<BoxStart> {
        let start = self.begin_box(name)?;
        self.u8(version)?;
        self.u24(flags)?;
        Ok(start)
    }

    /// Close a reserved header, patching the now-known total box size.
    pub fn end_box(&mut self, token: BoxStart) -> Result<()> {
        let size = self.position() - token.start;
        if token.large {
            self.patch_u64(token.start + 8, size)
        } else {
            let size = u32::try_from(size)
                .map_err(|_| Error::OverflowOnWrite("box too large for compact size"))?;
            self.patch_u32(token.start, size)
        }
    }

    pub fn patch_u32(&mut self, position: u64, v: u32) -> Result<()> {
        BigEndian::write_u32(self.patch_slot(position, 4)?, v);
        Ok(())
    }

    pub fn patch_u64(&mut self, position: u64, v: u64) -> Result<()> {
        BigEndian::write_u64(self.patch_slot(position, 8)?, v);
        Ok(())
    }

    fn patch_slot(&mut self, position: u64, len: usize) -> Result<&mut [u8]> {
        let start = usize::try_from(position).map_err(|_| Error::InvalidData("patch position"))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::InvalidData("patch beyond end of stream"))?;
        Ok(&mut self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_box_size_is_patched() {
        let mut w = BoxWriter::new();
        let b = w.begin_box(BoxType::FileTypeBox).unwrap();
        w.u32(0x6865_6963).unwrap();
        w.end_box(b).unwrap();
        assert_eq!(w.data(), &[0, 0, 0, 12, b'f', b't', b'y', b'p', b'h', b'e', b'i', b'c']);
    }

    #[test]
    fn large_box_uses_extended_size() {
        let mut w = BoxWriter::new();
        let b = w.begin_box_large(BoxType::MediaDataBox).unwrap();
        w.bytes(&[0xaa, 0xbb]).unwrap();
        w.end_box(b).unwrap();
        assert_eq!(
            w.data(),
            &[0, 0, 0, 1, b'm', b'd', b'a', b't', 0, 0, 0, 0, 0, 0, 0, 18, 0xaa, 0xbb]
        );
    }

    #[test]
    fn full_box_writes_version_and_flags() {
        let mut w = BoxWriter::new();
        let b = w.begin_full_box(BoxType::MetadataBox, 0, 0).unwrap();
        w.end_box(b).unwrap();
        assert_eq!(w.data(), &[0, 0, 0, 12, b'm', b'e', b't', b'a', 0, 0, 0, 0]);
    }

    #[test]
    fn nested_boxes_patch_outside_in() {
        let mut w = BoxWriter::new();
        let outer = w.begin_box(BoxType::ItemPropertiesBox).unwrap();
        let inner = w.begin_box(BoxType::ItemPropertyContainerBox).unwrap();
        w.end_box(inner).unwrap();
        w.end_box(outer).unwrap();
        assert_eq!(&w.data()[..4], &[0, 0, 0, 16]);
        assert_eq!(&w.data()[8..12], &[0, 0, 0, 8]);
    }

    #[test]
    fn patches_never_extend() {
        let mut w = BoxWriter::new();
        w.u32(0).unwrap();
        assert!(w.patch_u32(1, 5).is_err());
        assert!(w.patch_u32(0, 5).is_ok());
        assert_eq!(w.position(), 4);
    }

    #[test]
    fn u24_range_check() {
        let mut w = BoxWriter::new();
        assert!(w.u24(0x0100_0000).is_err());
        w.u24(0x00ff_fffe).unwrap();
        assert_eq!(w.data(), &[0xff, 0xff, 0xfe]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payloads for the boxes that locate and identify items: `ftyp`, `hdlr`,
//! `pitm`, `infe`, `iloc`, `iref`, `idat`, `dref`/`url `, `grpl`, `mdat`.

use bitreader::BitReader;
use log::warn;

use crate::boxes::{BoxType, FourCC};
use crate::reader::{
    check_parser_state, read_fullbox_extra, read_fullbox_version_no_flags, BMFFBox,
};
use crate::writer::BoxWriter;
use crate::{Error, ParseOptions, Result, ToU64, ToUsize, TryString, TryVec};

/// File type box 'ftyp'.
/// See ISO 14496-12:2015 § 4.3
#[derive(Debug, PartialEq)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    pub fn new(major_brand: FourCC, minor_version: u32, compatible: &[FourCC]) -> Result<Self> {
        let mut compatible_brands = TryVec::new();
        for &brand in compatible {
            compatible_brands.push(brand)?;
        }
        Ok(Self { major_brand, minor_version, compatible_brands })
    }

    pub fn has_compatible_brand(&self, brand: FourCC) -> bool {
        self.compatible_brands.contains(&brand)
    }

    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let major_brand = FourCC::from(src.read_u32()?);
        let minor_version = src.read_u32()?;
        let bytes_left = src.bytes_left();
        if bytes_left % 4 != 0 {
            return Err(Error::InvalidData("invalid ftyp size"));
        }
        let brand_count = bytes_left / 4;
        let mut compatible_brands = TryVec::with_capacity(usize::try_from(brand_count)?)?;
        for _ in 0..brand_count {
            compatible_brands.push(FourCC::from(src.read_u32()?))?;
        }
        Ok(Self { major_brand, minor_version, compatible_brands })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::FileTypeBox)?;
        w.u32(u32::from(self.major_brand))?;
        w.u32(self.minor_version)?;
        for &brand in &self.compatible_brands {
            w.u32(u32::from(brand))?;
        }
        w.end_box(b)
    }
}

/// Handler reference box 'hdlr'.
#[derive(Debug, PartialEq)]
pub struct HandlerBox {
    pub handler_type: FourCC,
    pub name: TryString,
}

impl Default for HandlerBox {
    fn default() -> Self {
        Self { handler_type: FourCC(*b"pict"), name: TryVec::new() }
    }
}

impl HandlerBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        let _pre_defined = src.read_u32()?;
        let handler_type = FourCC::from(src.read_u32()?);
        for _ in 0..3 {
            let _reserved = src.read_u32()?;
        }
        let name = src.read_string_to_end()?;
        Ok(Self { handler_type, name })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::HandlerBox, 0, 0)?;
        w.u32(0)?;
        w.u32(u32::from(self.handler_type))?;
        w.zeros(12)?;
        w.null_terminated_string(&self.name)?;
        w.end_box(b)
    }
}

/// Primary item box 'pitm'.
/// See ISO 14496-12:2015 § 8.11.4
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct PrimaryItemBox {
    pub item_id: u32,
}

impl PrimaryItemBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        let item_id = match version {
            0 => u32::from(src.read_u16()?),
            1 => src.read_u32()?,
            _ => return Err(Error::UnsupportedVersion(version)),
        };
        Ok(Self { item_id })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        if self.item_id > u32::from(u16::MAX) {
            let b = w.begin_full_box(BoxType::PrimaryItemBox, 1, 0)?;
            w.u32(self.item_id)?;
            w.end_box(b)
        } else {
            let b = w.begin_full_box(BoxType::PrimaryItemBox, 0, 0)?;
            w.u16(self.item_id as u16)?;
            w.end_box(b)
        }
    }
}

const ITEM_TYPE_MIME: &[u8; 4] = b"mime";
const ITEM_TYPE_URI: &[u8; 4] = b"uri ";

/// Item info entry 'infe'. Versions 2 and 3 carry the item type; older
/// versions are preserved as opaque boxes.
/// See ISO 14496-12:2015 § 8.11.6.2
#[derive(Debug, PartialEq, Default)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    pub item_protection_index: u16,
    pub item_type: FourCC,
    pub item_name: TryString,
    /// MIME items only.
    pub content_type: TryString,
    /// MIME items only, empty when absent.
    pub content_encoding: TryString,
    /// 'uri ' items only.
    pub item_uri_type: TryString,
    /// Hidden items are not part of the presentation.
    pub hidden: bool,
}

impl ItemInfoEntry {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        // Flags are not required to be zero here; at least one common
        // encoder emits nonzero values.
        let (version, flags) = read_fullbox_extra(src)?;
        let item_id = match version {
            2 => u32::from(src.read_u16()?),
            3 => src.read_u32()?,
            _ => return Err(Error::UnsupportedVersion(version)),
        };
        let hidden = flags & 1 == 1;
        let item_protection_index = src.read_u16()?;
        if item_protection_index != 0 {
            return Err(Error::Unsupported("protected items are not supported"));
        }
        let item_type = FourCC::from(src.read_u32()?);
        let item_name = src.read_null_terminated_string()?;
        let mut entry = Self {
            item_id,
            item_protection_index,
            item_type,
            item_name,
            hidden,
            ..Default::default()
        };
        if item_type == ITEM_TYPE_MIME {
            entry.content_type = src.read_null_terminated_string()?;
            if src.bytes_left() > 0 {
                entry.content_encoding = src.read_null_terminated_string()?;
            }
        } else if item_type == ITEM_TYPE_URI {
            entry.item_uri_type = src.read_null_terminated_string()?;
        }
        // Later editions append fields we don't interpret.
        crate::reader::skip_box_remain(src)?;
        Ok(entry)
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let version = if self.item_id > u32::from(u16::MAX) { 3 } else { 2 };
        let b = w.begin_full_box(BoxType::ItemInfoEntry, version, u32::from(self.hidden))?;
        if version == 3 {
            w.u32(self.item_id)?;
        } else {
            w.u16(self.item_id as u16)?;
        }
        w.u16(self.item_protection_index)?;
        w.u32(u32::from(self.item_type))?;
        w.null_terminated_string(&self.item_name)?;
        if self.item_type == ITEM_TYPE_MIME {
            w.null_terminated_string(&self.content_type)?;
            if !self.content_encoding.is_empty() {
                w.null_terminated_string(&self.content_encoding)?;
            }
        } else if self.item_type == ITEM_TYPE_URI {
            w.null_terminated_string(&self.item_uri_type)?;
        }
        w.end_box(b)
    }
}

/// The addressing mode for an item's extents.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionMethod {
    /// Extents are absolute file offsets (plus the base offset).
    File,
    /// Extents index into the sibling 'idat' box.
    Idat,
    /// Extents reference another item. Parse-preserved; not resolved.
    Item,
}

impl TryFrom<u16> for ConstructionMethod {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::File),
            1 => Ok(Self::Idat),
            2 => Ok(Self::Item),
            _ => Err(Error::InvalidData("construction_method out of range")),
        }
    }
}

impl ConstructionMethod {
    fn code(self) -> u16 {
        match self {
            Self::File => 0,
            Self::Idat => 1,
            Self::Item => 2,
        }
    }
}

/// A contiguous run of an item's bytes.
#[derive(Debug, Default)]
pub struct IlocExtent {
    pub index: u64,
    pub offset: u64,
    /// 0 means "to the end of the source".
    pub length: u64,
    /// Staged payload for extents appended during authoring; empty on
    /// parsed extents.
    pub(crate) data: TryVec<u8>,
}

impl PartialEq for IlocExtent {
    fn eq(&self, other: &Self) -> bool {
        // Staged bytes are write-side state, not part of the location.
        self.index == other.index && self.offset == other.offset && self.length == other.length
    }
}

#[derive(Debug, PartialEq)]
pub struct IlocItem {
    pub item_id: u32,
    pub construction_method: ConstructionMethod,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<IlocExtent>,
}

#[derive(Debug, Clone, Copy)]
struct PendingOffset {
    item_index: usize,
    extent_index: usize,
    position: u64,
}

/// Item location box 'iloc'.
///
/// Items staged with [`append_data`](Self::append_data) are written with
/// zero placeholder offsets; [`write_mdat_after_iloc`](Self::write_mdat_after_iloc)
/// emits their bytes and patches the offsets once they are known.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Default)]
pub struct ItemLocationBox {
    pub items: TryVec<IlocItem>,
    version: u8,
    offset_size: u8,
    length_size: u8,
    base_offset_size: u8,
    index_size: u8,
    /// Running offset for method-1 staging, relative to the start of the
    /// staged idat bytes.
    idat_offset: u64,
    pending: TryVec<PendingOffset>,
}

impl PartialEq for ItemLocationBox {
    fn eq(&self, other: &Self) -> bool {
        // Field widths and version are serialization detail.
        self.items == other.items
    }
}

fn read_field_size(bits: &mut BitReader) -> Result<u8> {
    match bits.read_u8(4)? {
        s @ (0 | 4 | 8) => Ok(s),
        _ => Err(Error::InvalidData("iloc field size must be 0, 4 or 8")),
    }
}

fn width_bits(size: u8) -> u8 {
    size * 8
}

fn write_sized(w: &mut BoxWriter, value: u64, size: u8, what: &'static str) -> Result<()> {
    match size {
        0 if value == 0 => Ok(()),
        0 => Err(Error::OverflowOnWrite(what)),
        4 => {
            let v = u32::try_from(value).map_err(|_| Error::OverflowOnWrite(what))?;
            w.u32(v)
        }
        8 => w.u64(value),
        _ => Err(Error::InvalidData("iloc field size must be 0, 4 or 8")),
    }
}

impl ItemLocationBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version > 2 {
            return Err(Error::UnsupportedVersion(version));
        }
        let body = src.read_bytes(src.content.remaining())?;
        let mut bits = BitReader::new(body);

        let offset_size = read_field_size(&mut bits)?;
        let length_size = read_field_size(&mut bits)?;
        let base_offset_size = read_field_size(&mut bits)?;
        let index_size = if version >= 1 {
            read_field_size(&mut bits)?
        } else {
            let _reserved = bits.read_u8(4)?;
            0
        };

        let item_count = match version {
            0 | 1 => bits.read_u32(16)?,
            _ => bits.read_u32(32)?,
        };
        let mut items = TryVec::with_capacity((item_count.to_usize()).min(body.len() / 4))?;

        for _ in 0..item_count {
            let item_id = match version {
                0 | 1 => bits.read_u32(16)?,
                _ => bits.read_u32(32)?,
            };
            // Version 0 has no construction method; such items address the
            // file directly.
            let construction_method = if version == 0 {
                ConstructionMethod::File
            } else {
                let _reserved = bits.read_u16(12)?;
                ConstructionMethod::try_from(bits.read_u16(4)?)?
            };
            let data_reference_index = bits.read_u16(16)?;
            if data_reference_index != 0 {
                warn!("iloc item {item_id} uses external data reference {data_reference_index}");
            }
            let base_offset = bits.read_u64(width_bits(base_offset_size))?;
            let extent_count = bits.read_u16(16)?;
            if extent_count < 1 {
                return Err(Error::InvalidData("extent_count must be at least 1"));
            }
            let mut extents =
                TryVec::with_capacity((extent_count.to_usize()).min(body.len() / 2))?;
            for _ in 0..extent_count {
                let index = if version >= 1 && index_size > 0 {
                    bits.read_u64(width_bits(index_size))?
                } else {
                    0
                };
                // A zero-width offset field implies offset 0; a zero length
                // means the whole source. BitReader::read_u64(0) yields 0.
                let offset = bits.read_u64(width_bits(offset_size))?;
                let length = bits.read_u64(width_bits(length_size))?;
                extents.push(IlocExtent { index, offset, length, data: TryVec::new() })?;
            }
            items.push(IlocItem {
                item_id,
                construction_method,
                data_reference_index,
                base_offset,
                extents,
            })?;
        }

        if bits.remaining() != 0 {
            return Err(Error::InvalidData("invalid iloc size"));
        }

        Ok(Self {
            items,
            version,
            offset_size,
            length_size,
            base_offset_size,
            index_size,
            idat_offset: 0,
            pending: TryVec::new(),
        })
    }

    /// Stage `data` as a new extent of `item_id`, to be placed when the
    /// tree is serialized. Method-0 extents receive placeholder offsets
    /// that are patched by [`write_mdat_after_iloc`](Self::write_mdat_after_iloc);
    /// method-1 extents are assigned their position in the staged idat
    /// bytes immediately.
    pub fn append_data(
        &mut self,
        item_id: u32,
        data: &[u8],
        construction_method: ConstructionMethod,
    ) -> Result<()> {
        let offset = match construction_method {
            ConstructionMethod::File => 0,
            ConstructionMethod::Idat => {
                let offset = self.idat_offset;
                self.idat_offset = offset
                    .checked_add(data.len().to_u64())
                    .ok_or(Error::OverflowOnWrite("idat too large"))?;
                offset
            }
            ConstructionMethod::Item => {
                return Err(Error::Unsupported("cannot stage item-offset extents"));
            }
        };
        let mut staged = TryVec::new();
        staged.extend_from_slice(data)?;
        let extent =
            IlocExtent { index: 0, offset, length: data.len().to_u64(), data: staged };

        if let Some(item) = self.items.iter_mut().find(|i| i.item_id == item_id) {
            if item.construction_method != construction_method {
                return Err(Error::InvalidData("construction method mismatch for item"));
            }
            item.extents.push(extent)?;
        } else {
            let mut extents = TryVec::new();
            extents.push(extent)?;
            self.items.push(IlocItem {
                item_id,
                construction_method,
                data_reference_index: 0,
                base_offset: 0,
                extents,
            })?;
        }
        Ok(())
    }

    /// Drain staged method-1 bytes for the sibling idat body, rebasing the
    /// extent offsets on whatever that body already holds.
    pub(crate) fn take_staged_idat(&mut self, existing_len: u64) -> Result<TryVec<u8>> {
        let mut out = TryVec::new();
        for item in self.items.iter_mut() {
            if item.construction_method != ConstructionMethod::Idat {
                continue;
            }
            for extent in item.extents.iter_mut() {
                if extent.data.is_empty() {
                    continue;
                }
                extent.offset = extent
                    .offset
                    .checked_add(existing_len)
                    .ok_or(Error::OverflowOnWrite("idat too large"))?;
                out.append(&mut extent.data)?;
            }
        }
        self.idat_offset = 0;
        Ok(out)
    }

    fn has_staged_file_data(&self) -> bool {
        self.items.iter().any(|i| {
            i.construction_method == ConstructionMethod::File
                && i.extents.iter().any(|e| !e.data.is_empty())
        })
    }

    /// Choose the smallest version and field widths that can represent the
    /// stored values.
    pub fn derive_box_version(&mut self) {
        let mut version = 0u8;
        if self.items.len() > 0xffff {
            version = 2;
        }
        let mut max_offset = 0u64;
        let mut max_length = 0u64;
        let mut max_base_offset = 0u64;
        let mut max_index = 0u64;
        for item in &self.items {
            if item.item_id > 0xffff {
                version = 2;
            } else if item.construction_method != ConstructionMethod::File {
                version = version.max(1);
            }
            max_base_offset = max_base_offset.max(item.base_offset);
            for extent in &item.extents {
                if extent.index != 0 {
                    version = version.max(1);
                }
                max_offset = max_offset.max(extent.offset);
                max_length = max_length.max(extent.length);
                max_index = max_index.max(extent.index);
            }
        }
        let fit = |max: u64, nonzero_floor: u8| -> u8 {
            if max > u64::from(u32::MAX) {
                8
            } else if max > 0 {
                4
            } else {
                nonzero_floor
            }
        };
        // Patched offsets are unknown until the payload is placed; reserve
        // a 32-bit field for them.
        let offset_floor = if self.has_staged_file_data() { 4 } else { 0 };
        self.version = version;
        self.offset_size = fit(max_offset, offset_floor);
        self.length_size = fit(max_length, 4);
        self.base_offset_size = fit(max_base_offset, 0);
        self.index_size = if version >= 1 { fit(max_index, 0) } else { 0 };
    }

    /// Serialize the box. Staged method-0 extents get zero placeholder
    /// offsets; call [`write_mdat_after_iloc`](Self::write_mdat_after_iloc)
    /// once every box has been written.
    pub fn write(&mut self, w: &mut BoxWriter) -> Result<()> {
        self.pending = TryVec::new();
        let b = w.begin_full_box(BoxType::ItemLocationBox, self.version, 0)?;
        w.u8(self.offset_size << 4 | self.length_size)?;
        w.u8(self.base_offset_size << 4 | if self.version >= 1 { self.index_size } else { 0 })?;
        match self.version {
            0 | 1 => {
                let count = u16::try_from(self.items.len())
                    .map_err(|_| Error::OverflowOnWrite("too many iloc items"))?;
                w.u16(count)?;
            }
            _ => {
                let count = u32::try_from(self.items.len())
                    .map_err(|_| Error::OverflowOnWrite("too many iloc items"))?;
                w.u32(count)?;
            }
        }
        for (item_index, item) in self.items.iter().enumerate() {
            match self.version {
                0 | 1 => {
                    let id = u16::try_from(item.item_id)
                        .map_err(|_| Error::OverflowOnWrite("iloc item id"))?;
                    w.u16(id)?;
                }
                _ => w.u32(item.item_id)?,
            }
            if self.version >= 1 {
                w.u16(item.construction_method.code())?;
            } else if item.construction_method != ConstructionMethod::File {
                return Err(Error::OverflowOnWrite("version 0 cannot express construction method"));
            }
            w.u16(item.data_reference_index)?;
            write_sized(w, item.base_offset, self.base_offset_size, "iloc base offset")?;
            let extent_count = u16::try_from(item.extents.len())
                .map_err(|_| Error::OverflowOnWrite("too many extents"))?;
            w.u16(extent_count)?;
            for (extent_index, extent) in item.extents.iter().enumerate() {
                if self.version >= 1 && self.index_size > 0 {
                    write_sized(w, extent.index, self.index_size, "iloc extent index")?;
                }
                let staged_file = item.construction_method == ConstructionMethod::File
                    && !extent.data.is_empty();
                if staged_file {
                    self.pending.push(PendingOffset {
                        item_index,
                        extent_index,
                        position: w.position(),
                    })?;
                    write_sized(w, 0, self.offset_size, "iloc extent offset")?;
                } else {
                    write_sized(w, extent.offset, self.offset_size, "iloc extent offset")?;
                }
                write_sized(w, extent.length, self.length_size, "iloc extent length")?;
            }
        }
        w.end_box(b)
    }

    /// Emit every staged method-0 payload inside an `mdat` box and patch
    /// the placeholder offsets written by [`write`](Self::write), preserving
    /// the chosen offset width.
    pub fn write_mdat_after_iloc(&mut self, w: &mut BoxWriter) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }
        let total: u64 = pending
            .iter()
            .map(|p| self.items[p.item_index].extents[p.extent_index].data.len().to_u64())
            .sum();
        let needs_large = total + crate::reader::BoxHeader::MIN_SIZE > u64::from(u32::MAX);
        let b = if needs_large {
            w.begin_box_large(BoxType::MediaDataBox)?
        } else {
            w.begin_box(BoxType::MediaDataBox)?
        };
        for p in &pending {
            let extent = &mut self.items[p.item_index].extents[p.extent_index];
            let offset = w.position();
            w.bytes(&extent.data)?;
            match self.offset_size {
                4 => {
                    let v = u32::try_from(offset)
                        .map_err(|_| Error::OverflowOnWrite("patched offset exceeds 32 bits"))?;
                    w.patch_u32(p.position, v)?;
                }
                8 => w.patch_u64(p.position, offset)?,
                _ => return Err(Error::OverflowOnWrite("iloc offset width cannot hold offset")),
            }
            extent.offset = offset;
        }
        w.end_box(b)
    }
}

/// One reference record from an 'iref' box.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug, PartialEq)]
pub struct ItemReference {
    pub ref_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: TryVec<u32>,
}

/// Item reference box 'iref'. The body is a sequence of sub-boxes whose
/// type is the reference kind.
#[derive(Debug, PartialEq, Default)]
pub struct ItemReferenceBox {
    pub references: TryVec<ItemReference>,
}

impl ItemReferenceBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version > 1 {
            return Err(Error::UnsupportedVersion(version));
        }
        let mut references = TryVec::new();
        let mut iter = src.box_iter();
        while let Some(mut b) = iter.next_box()? {
            let from_item_id = if version == 0 {
                u32::from(b.read_u16()?)
            } else {
                b.read_u32()?
            };
            let reference_count = b.read_u16()?;
            let mut to_item_ids = TryVec::with_capacity(reference_count.to_usize())?;
            for _ in 0..reference_count {
                let to_item_id = if version == 0 {
                    u32::from(b.read_u16()?)
                } else {
                    b.read_u32()?
                };
                if from_item_id == to_item_id {
                    return Err(Error::InvalidData("item must not reference itself"));
                }
                to_item_ids.push(to_item_id)?;
            }
            references.push(ItemReference {
                ref_type: FourCC::from(b.head.name),
                from_item_id,
                to_item_ids,
            })?;
            check_parser_state(&b)?;
        }
        Ok(Self { references })
    }

    pub fn add_reference(
        &mut self,
        from_item_id: u32,
        ref_type: FourCC,
        to_item_ids: &[u32],
    ) -> Result<()> {
        let mut to = TryVec::new();
        for &id in to_item_ids {
            if id == from_item_id {
                return Err(Error::InvalidData("item must not reference itself"));
            }
            to.push(id)?;
        }
        self.references
            .push(ItemReference { ref_type, from_item_id, to_item_ids: to })
            .map_err(From::from)
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let wide = self.references.iter().any(|r| {
            r.from_item_id > u32::from(u16::MAX)
                || r.to_item_ids.iter().any(|&id| id > u32::from(u16::MAX))
        });
        let version = u8::from(wide);
        let b = w.begin_full_box(BoxType::ItemReferenceBox, version, 0)?;
        for reference in &self.references {
            let rb = w.begin_box(BoxType::from(u32::from(reference.ref_type)))?;
            if wide {
                w.u32(reference.from_item_id)?;
            } else {
                w.u16(reference.from_item_id as u16)?;
            }
            let count = u16::try_from(reference.to_item_ids.len())
                .map_err(|_| Error::OverflowOnWrite("too many reference targets"))?;
            w.u16(count)?;
            for &to in &reference.to_item_ids {
                if wide {
                    w.u32(to)?;
                } else {
                    w.u16(to as u16)?;
                }
            }
            w.end_box(rb)?;
        }
        w.end_box(b)
    }
}

/// Inline item data box 'idat'.
#[derive(Debug, PartialEq, Default)]
pub struct ItemDataBox {
    pub data: TryVec<u8>,
}

impl ItemDataBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self { data: src.read_into_try_vec()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::ItemDataBox)?;
        w.bytes(&self.data)?;
        w.end_box(b)
    }

    /// Append inline bytes, returning their offset within the idat body.
    pub fn append_data(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.data.len().to_u64();
        self.data.extend_from_slice(data)?;
        Ok(offset)
    }
}

/// One entity-to-group record inside 'grpl'.
#[derive(Debug, PartialEq)]
pub struct EntityGroup {
    pub group_type: FourCC,
    pub group_id: u32,
    pub entity_ids: TryVec<u32>,
}

/// Entity grouping box 'grpl'.
#[derive(Debug, PartialEq, Default)]
pub struct GroupListBox {
    pub groups: TryVec<EntityGroup>,
}

impl GroupListBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let mut groups = TryVec::new();
        let mut iter = src.box_iter();
        while let Some(mut b) = iter.next_box()? {
            let (version, _flags) = read_fullbox_extra(&mut b)?;
            if version != 0 {
                return Err(Error::UnsupportedVersion(version));
            }
            let group_id = b.read_u32()?;
            let num_entities = b.read_u32()?.to_usize();
            let mut entity_ids =
                TryVec::with_capacity(num_entities.min(b.content.remaining() / 4))?;
            for _ in 0..num_entities {
                entity_ids.push(b.read_u32()?)?;
            }
            groups.push(EntityGroup {
                group_type: FourCC::from(b.head.name),
                group_id,
                entity_ids,
            })?;
            check_parser_state(&b)?;
        }
        Ok(Self { groups })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::GroupListBox)?;
        for group in &self.groups {
            let gb =
                w.begin_full_box(BoxType::from(u32::from(group.group_type)), 0, 0)?;
            w.u32(group.group_id)?;
            w.u32(u32::try_from(group.entity_ids.len())
                .map_err(|_| Error::OverflowOnWrite("too many entities in group"))?)?;
            for &id in &group.entity_ids {
                w.u32(id)?;
            }
            w.end_box(gb)?;
        }
        w.end_box(b)
    }
}

/// Data entry box 'url '. Flags bit 0 marks a self-contained reference
/// (the data lives in this file, no location string).
#[derive(Debug, PartialEq)]
pub struct DataEntryUrlBox {
    pub self_contained: bool,
    pub location: TryString,
}

impl Default for DataEntryUrlBox {
    fn default() -> Self {
        Self { self_contained: true, location: TryVec::new() }
    }
}

impl DataEntryUrlBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let (version, flags) = read_fullbox_extra(src)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        let self_contained = flags & 1 == 1;
        let location = if self_contained {
            TryVec::new()
        } else {
            src.read_string_to_end()?
        };
        Ok(Self { self_contained, location })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::DataEntryUrlBox, 0, u32::from(self.self_contained))?;
        if !self.self_contained {
            w.null_terminated_string(&self.location)?;
        }
        w.end_box(b)
    }
}

/// A media data box 'mdat': the payload bytes, remembered together with
/// their absolute file position so `iloc` extents can be resolved.
/// See ISO 14496-12:2015 § 8.1.1
#[derive(Debug, Default)]
pub struct MediaDataBox {
    /// Offset of `data` from the beginning of the file.
    pub file_offset: u64,
    pub data: TryVec<u8>,
}

impl PartialEq for MediaDataBox {
    fn eq(&self, other: &Self) -> bool {
        // The recorded file position shifts when surrounding boxes change
        // size; the payload is what matters.
        self.data == other.data
    }
}

impl MediaDataBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let file_offset = src.offset();
        Ok(Self { file_offset, data: src.read_into_try_vec()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let large =
            self.data.len().to_u64() + crate::reader::BoxHeader::MIN_SIZE > u64::from(u32::MAX);
        let b = if large {
            w.begin_box_large(BoxType::MediaDataBox)?
        } else {
            w.begin_box(BoxType::MediaDataBox)?
        };
        w.bytes(&self.data)?;
        w.end_box(b)
    }

    /// Whether the absolute range starting at `start` begins inside this box.
    pub(crate) fn contains(&self, start: u64) -> bool {
        start >= self.file_offset && start - self.file_offset < self.data.len().to_u64()
    }

    /// Copy `length` bytes at absolute offset `start` (or everything to the
    /// end of the box) onto `buf`.
    pub(crate) fn read_range(
        &self,
        start: u64,
        length: Option<u64>,
        buf: &mut TryVec<u8>,
    ) -> Result<()> {
        let rel = start
            .checked_sub(self.file_offset)
            .ok_or(Error::InvalidData("extent before mdat"))?;
        let rel = usize::try_from(rel)?;
        let slice = match length {
            Some(len) => {
                let end = rel
                    .checked_add(usize::try_from(len)?)
                    .ok_or(Error::InvalidData("extent end overflow"))?;
                self.data.get(rel..end)
            }
            None => self.data.get(rel..),
        };
        let slice = slice.ok_or(Error::InvalidData("extent crosses box boundary"))?;
        buf.extend_from_slice(slice)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{BitstreamRange, BoxIter};

    fn parse_one<'a, F, T>(bytes: &'a [u8], f: F) -> Result<T>
    where
        F: FnOnce(&mut BMFFBox<'a>) -> Result<T>,
    {
        let mut range = BitstreamRange::new(bytes);
        let mut iter = BoxIter::new(&mut range);
        let mut b = iter.next_box()?.ok_or(Error::EndOfData)?;
        let out = f(&mut b)?;
        check_parser_state(&b)?;
        Ok(out)
    }

    fn written<F: FnOnce(&mut BoxWriter) -> Result<()>>(f: F) -> TryVec<u8> {
        let mut w = BoxWriter::new();
        f(&mut w).unwrap();
        w.into_inner()
    }

    #[test]
    fn infe_mime_fields_roundtrip() {
        let mut infe = ItemInfoEntry {
            item_id: 3,
            item_type: FourCC(*b"mime"),
            ..Default::default()
        };
        infe.content_type.extend_from_slice(b"application/rdf+xml").unwrap();
        let bytes = written(|w| infe.write(w));
        let parsed = parse_one(&bytes, ItemInfoEntry::parse).unwrap();
        assert_eq!(parsed, infe);
    }

    #[test]
    fn infe_uri_type_roundtrip() {
        let mut infe = ItemInfoEntry {
            item_id: 9,
            item_type: FourCC(*b"uri "),
            ..Default::default()
        };
        infe.item_uri_type.extend_from_slice(b"urn:example:kind").unwrap();
        let bytes = written(|w| infe.write(w));
        let parsed = parse_one(&bytes, ItemInfoEntry::parse).unwrap();
        assert_eq!(parsed, infe);
    }

    #[test]
    fn infe_version_widens_with_item_id() {
        let infe = ItemInfoEntry {
            item_id: 0x0002_0000,
            item_type: FourCC(*b"av01"),
            hidden: true,
            ..Default::default()
        };
        let bytes = written(|w| infe.write(w));
        assert_eq!(bytes[8], 3); // version
        assert_eq!(bytes[11], 1); // hidden flag
        let parsed = parse_one(&bytes, ItemInfoEntry::parse).unwrap();
        assert_eq!(parsed, infe);
    }

    #[test]
    fn infe_rejects_protected_items() {
        let bytes = written(|w| {
            let b = w.begin_full_box(BoxType::ItemInfoEntry, 2, 0)?;
            w.u16(1)?; // item id
            w.u16(7)?; // protection index
            w.u32(u32::from_be_bytes(*b"hvc1"))?;
            w.u8(0)?;
            w.end_box(b)
        });
        assert!(matches!(
            parse_one(&bytes, ItemInfoEntry::parse),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn iloc_parse_v1_with_idat_method() {
        let bytes = written(|w| {
            let b = w.begin_full_box(BoxType::ItemLocationBox, 1, 0)?;
            w.u8(0x44)?; // offset_size 4, length_size 4
            w.u8(0x00)?; // base_offset_size 0, index_size 0
            w.u16(1)?; // item count
            w.u16(7)?; // item id
            w.u16(1)?; // construction method: idat
            w.u16(0)?; // data reference index
            w.u16(1)?; // extent count
            w.u32(2)?; // extent offset
            w.u32(5)?; // extent length
            w.end_box(b)
        });
        let iloc = parse_one(&bytes, |b| {
            ItemLocationBox::parse(b, &ParseOptions::default())
        })
        .unwrap();
        assert_eq!(iloc.items.len(), 1);
        let item = &iloc.items[0];
        assert_eq!(item.item_id, 7);
        assert_eq!(item.construction_method, ConstructionMethod::Idat);
        assert_eq!(item.extents[0].offset, 2);
        assert_eq!(item.extents[0].length, 5);
    }

    #[test]
    fn iloc_truncated_extent_table_is_end_of_data() {
        let bytes = written(|w| {
            let b = w.begin_full_box(BoxType::ItemLocationBox, 1, 0)?;
            w.u8(0x44)?;
            w.u8(0x00)?;
            w.u16(1)?;
            w.u16(7)?;
            w.u16(0)?;
            w.u16(0)?;
            w.u16(4)?; // claims 4 extents
            for _ in 0..3 {
                w.u32(0)?;
                w.u32(5)?;
            }
            w.end_box(b) // body ends after 3
        });
        let err = parse_one(&bytes, |b| {
            ItemLocationBox::parse(b, &ParseOptions::default())
        })
        .unwrap_err();
        assert!(matches!(err, Error::EndOfData));
    }

    #[test]
    fn iloc_staged_data_is_patched_after_mdat() {
        let mut iloc = ItemLocationBox::default();
        iloc.append_data(1, &[0xaa, 0xbb, 0xcc], ConstructionMethod::File).unwrap();
        iloc.derive_box_version();

        let mut w = BoxWriter::new();
        iloc.write(&mut w).unwrap();
        let iloc_end = w.position();
        iloc.write_mdat_after_iloc(&mut w).unwrap();

        // Payload bytes live right after the iloc box and its mdat header.
        let patched = iloc.items[0].extents[0].offset;
        assert_eq!(patched, iloc_end + 8);
        let out = w.into_inner();
        let start = usize::try_from(patched).unwrap();
        assert_eq!(&out[start..start + 3], &[0xaa, 0xbb, 0xcc]);
        assert!(patched + 3 <= out.len().to_u64());

        // Re-parsing yields the same locations.
        let reparsed = parse_one(&out[..usize::try_from(iloc_end).unwrap()], |b| {
            ItemLocationBox::parse(b, &ParseOptions::default())
        })
        .unwrap();
        assert_eq!(reparsed.items[0].extents[0].offset, patched);
        assert_eq!(reparsed.items[0].extents[0].length, 3);
    }

    #[test]
    fn iloc_version_derivation() {
        let mut iloc = ItemLocationBox::default();
        iloc.append_data(1, &[1], ConstructionMethod::File).unwrap();
        iloc.derive_box_version();
        assert_eq!(iloc.version, 0);

        let mut iloc = ItemLocationBox::default();
        iloc.append_data(1, &[1], ConstructionMethod::Idat).unwrap();
        iloc.derive_box_version();
        assert_eq!(iloc.version, 1);

        let mut iloc = ItemLocationBox::default();
        iloc.append_data(0x0001_0000, &[1], ConstructionMethod::File).unwrap();
        iloc.derive_box_version();
        assert_eq!(iloc.version, 2);
    }

    #[test]
    fn iref_widens_to_32bit_ids() {
        let mut iref = ItemReferenceBox::default();
        iref.add_reference(0x0001_0001, FourCC(*b"dimg"), &[1, 2]).unwrap();
        let bytes = written(|w| iref.write(w));
        assert_eq!(bytes[8], 1); // version
        let parsed = parse_one(&bytes, |b| {
            ItemReferenceBox::parse(b, &ParseOptions::default())
        })
        .unwrap();
        assert_eq!(parsed, iref);
    }

    #[test]
    fn iref_rejects_self_reference() {
        let mut iref = ItemReferenceBox::default();
        assert!(iref.add_reference(5, FourCC(*b"thmb"), &[5]).is_err());
    }

    #[test]
    fn grpl_roundtrip() {
        let mut groups = GroupListBox::default();
        let mut entity_ids = TryVec::new();
        entity_ids.push(1).unwrap();
        entity_ids.push(2).unwrap();
        groups
            .groups
            .push(EntityGroup { group_type: FourCC(*b"altr"), group_id: 10, entity_ids })
            .unwrap();
        let bytes = written(|w| groups.write(w));
        let parsed = parse_one(&bytes, GroupListBox::parse).unwrap();
        assert_eq!(parsed, groups);
    }

    #[test]
    fn url_self_contained_flag() {
        let url = DataEntryUrlBox::default();
        let bytes = written(|w| url.write(w));
        assert_eq!(bytes[11], 1);
        let parsed = parse_one(&bytes, DataEntryUrlBox::parse).unwrap();
        assert_eq!(parsed, url);

        let mut url = DataEntryUrlBox { self_contained: false, location: TryVec::new() };
        url.location.extend_from_slice(b"http://example.com/a").unwrap();
        let bytes = written(|w| url.write(w));
        let parsed = parse_one(&bytes, DataEntryUrlBox::parse).unwrap();
        assert_eq!(parsed, url);
    }
}

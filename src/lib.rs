#![deny(unsafe_code)]
//! Box-level reader/writer for the ISO Base Media File Format subset used
//! by HEIF/AVIF still-image containers.
//!
//! A byte stream parses into a tree of typed boxes ([`BoxTree`]); the tree
//! answers the cross-box queries that locate and describe image items
//! (bytes, pixel geometry, codec configuration, transformations, colour),
//! and serializes back to bytes. Unknown boxes are preserved verbatim, so
//! metadata a reader does not understand survives a rewrite.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fallible_collections::TryReserveError;
use log::warn;

use std::io::Read;

pub mod boxes;
pub mod codec;
pub mod fraction;
pub mod meta;
pub mod props;
pub mod reader;
pub mod writer;

mod tree;

pub use crate::boxes::{BoxType, FourCC};
pub use crate::fraction::Fraction;
pub use crate::meta::{ConstructionMethod, EntityGroup, ItemReference};
pub use crate::props::{ColourInformation, NclxColourProfile, PropertyAssociation};
pub use crate::tree::{BoxData, HeifBox, UnknownBox};
pub use crate::writer::{BoxStart, BoxWriter};

use crate::meta::{ItemDataBox, ItemLocationBox, MediaDataBox};
use crate::props::ItemPropertyAssociationBox;
use crate::reader::{BitstreamRange, BoxIter};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

impl ToU64 for u32 {
    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

impl ToU64 for u16 {
    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
pub(crate) type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser and serializer failures.
#[derive(Debug)]
pub enum Error {
    /// A declared size exceeds the bytes actually available.
    EndOfData,
    /// A box size smaller than its header, or a size that cannot be
    /// represented.
    InvalidBoxSize(&'static str),
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// A full box carries a version the dispatch does not recognize. The
    /// box is preserved as opaque; typed accessors are unavailable.
    UnsupportedVersion(u8),
    /// The item (by ID) carries an essential property the resolver does not
    /// understand, so the item is undecodable.
    InvalidEssentialProperty(u32),
    /// A value to be serialized exceeds the width chosen for its field.
    OverflowOnWrite(&'static str),
    /// Zero denominator (or overflow) in a clean-aperture fraction.
    InvalidFraction,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidBoxSize(s)
            | Self::InvalidData(s)
            | Self::Unsupported(s)
            | Self::OverflowOnWrite(s) => s,
            Self::EndOfData => "end of data",
            Self::UnsupportedVersion(v) => return write!(f, "unsupported box version {v}"),
            Self::InvalidEssentialProperty(item) => {
                return write!(f, "item {item} has an unsupported essential property")
            }
            Self::InvalidFraction => "invalid fraction",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        match err {
            bitreader::BitReaderError::NotEnoughData { .. } => Self::EndOfData,
            bitreader::BitReaderError::TooManyBitsForType { .. } => {
                warn!("bitreader: {err}");
                debug_assert!(false); // bug
                Self::InvalidData("truncated bits")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::EndOfData,
            _ => Self::Io(err),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidData("invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) | Error::InvalidBoxSize(_) => std::io::ErrorKind::InvalidData,
            Error::EndOfData => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// When true, non-critical validation errors (like non-zero flags in
    /// boxes that expect zero flags) are ignored instead of returned.
    pub lenient: bool,
}

/// The parsed box tree of a whole stream: top-level siblings in file order.
///
/// ```no_run
/// use zenheif_bmff::BoxTree;
///
/// let bytes = std::fs::read("image.heic")?;
/// let tree = BoxTree::parse(&bytes)?;
/// if let Some(id) = tree.primary_item_id() {
///     let coded = tree.item_data(id)?;
///     println!("primary item: {} bytes", coded.len());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Default, PartialEq)]
pub struct BoxTree {
    pub boxes: TryVec<HeifBox>,
}

impl BoxTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a complete stream from a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_with_options(data, &ParseOptions::default())
    }

    pub fn parse_with_options(data: &[u8], options: &ParseOptions) -> Result<Self> {
        let mut range = BitstreamRange::new(data);
        let mut iter = BoxIter::new(&mut range);
        let mut boxes = TryVec::new();
        while let Some(mut b) = iter.next_box()? {
            boxes.push(tree::parse_box(&mut b, options, 0)?)?;
        }
        Ok(Self { boxes })
    }

    /// Read a stream to its end, then parse it.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::parse(&buf)
    }

    pub fn push(&mut self, node: HeifBox) -> Result<()> {
        self.boxes.push(node).map_err(From::from)
    }

    // ========================================
    // Serialization
    // ========================================

    /// Serialize the tree. Box versions and field widths are re-derived
    /// from the stored values; payloads staged via
    /// [`ItemLocationBox::append_data`](crate::meta::ItemLocationBox::append_data)
    /// are emitted after all boxes and their offsets patched into the
    /// `iloc` entry table.
    pub fn write_to_vec(&mut self) -> Result<TryVec<u8>> {
        self.relocate_staged_idat()?;
        for node in self.boxes.iter_mut() {
            tree::derive_box_version(node);
        }
        let mut w = BoxWriter::new();
        for node in self.boxes.iter_mut() {
            tree::write_box(&mut w, node)?;
        }
        if let Some(iloc) = self.iloc_mut() {
            iloc.write_mdat_after_iloc(&mut w)?;
        }
        Ok(w.into_inner())
    }

    /// Serialize into an `io::Write` sink.
    pub fn write_to<W: std::io::Write>(&mut self, out: &mut W) -> Result<()> {
        let data = self.write_to_vec()?;
        out.write_all(&data)?;
        Ok(())
    }

    /// Move bytes staged for inline (method 1) items into the sibling
    /// `idat` box, creating it when absent.
    fn relocate_staged_idat(&mut self) -> Result<()> {
        let existing_len = self
            .idat()
            .map(|idat| idat.data.len().to_u64())
            .unwrap_or(0);
        let staged = match self.iloc_mut() {
            Some(iloc) => iloc.take_staged_idat(existing_len)?,
            None => return Ok(()),
        };
        if staged.is_empty() {
            return Ok(());
        }
        if self.idat().is_none() {
            let idat = HeifBox::new(BoxData::ItemData(ItemDataBox::default()))?;
            let meta = self
                .meta_mut()
                .ok_or(Error::InvalidData("staged idat data without a meta box"))?;
            meta.push_child(idat)?;
        }
        if let Some(meta) = self.meta_mut() {
            if let Some(node) = meta.child_mut(BoxType::ItemDataBox) {
                if let BoxData::ItemData(idat) = &mut node.data {
                    idat.data.extend_from_slice(&staged)?;
                }
            }
        }
        Ok(())
    }

    // ========================================
    // Navigation
    // ========================================

    /// The first top-level box of a given type, in file order.
    pub fn top_level(&self, name: BoxType) -> Option<&HeifBox> {
        self.boxes.iter().find(|b| b.header.name == name)
    }

    pub fn ftyp(&self) -> Option<&meta::FileTypeBox> {
        match &self.top_level(BoxType::FileTypeBox)?.data {
            BoxData::FileType(f) => Some(f),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&HeifBox> {
        self.top_level(BoxType::MetadataBox)
    }

    pub fn meta_mut(&mut self) -> Option<&mut HeifBox> {
        self.boxes
            .iter_mut()
            .find(|b| b.header.name == BoxType::MetadataBox)
    }

    fn meta_child(&self, name: BoxType) -> Option<&HeifBox> {
        self.meta()?.child(name)
    }

    pub fn handler_type(&self) -> Option<FourCC> {
        match &self.meta_child(BoxType::HandlerBox)?.data {
            BoxData::Handler(h) => Some(h.handler_type),
            _ => None,
        }
    }

    pub fn primary_item_id(&self) -> Option<u32> {
        match &self.meta_child(BoxType::PrimaryItemBox)?.data {
            BoxData::PrimaryItem(p) => Some(p.item_id),
            _ => None,
        }
    }

    /// All `infe` entries under `meta`/`iinf`, in file order.
    pub fn item_infos(&self) -> impl Iterator<Item = &meta::ItemInfoEntry> {
        self.meta_child(BoxType::ItemInfoBox)
            .into_iter()
            .flat_map(|iinf| iinf.children.iter())
            .filter_map(|c| match &c.data {
                BoxData::ItemInfoEntry(e) => Some(e),
                _ => None,
            })
    }

    pub fn item_info(&self, item_id: u32) -> Option<&meta::ItemInfoEntry> {
        self.item_infos().find(|e| e.item_id == item_id)
    }

    pub fn iloc(&self) -> Option<&ItemLocationBox> {
        match &self.meta_child(BoxType::ItemLocationBox)?.data {
            BoxData::ItemLocation(l) => Some(l),
            _ => None,
        }
    }

    pub fn iloc_mut(&mut self) -> Option<&mut ItemLocationBox> {
        let meta = self.meta_mut()?;
        match &mut meta.child_mut(BoxType::ItemLocationBox)?.data {
            BoxData::ItemLocation(l) => Some(l),
            _ => None,
        }
    }

    pub fn iref(&self) -> Option<&meta::ItemReferenceBox> {
        match &self.meta_child(BoxType::ItemReferenceBox)?.data {
            BoxData::ItemReference(r) => Some(r),
            _ => None,
        }
    }

    fn idat(&self) -> Option<&ItemDataBox> {
        match &self.meta_child(BoxType::ItemDataBox)?.data {
            BoxData::ItemData(d) => Some(d),
            _ => None,
        }
    }

    /// The property container box under `meta`/`iprp`.
    fn ipco(&self) -> Option<&HeifBox> {
        self.meta_child(BoxType::ItemPropertiesBox)?
            .child(BoxType::ItemPropertyContainerBox)
    }

    fn ipma(&self) -> Option<&ItemPropertyAssociationBox> {
        match &self
            .meta_child(BoxType::ItemPropertiesBox)?
            .child(BoxType::ItemPropertyAssociationBox)?
            .data
        {
            BoxData::ItemPropertyAssociation(a) => Some(a),
            _ => None,
        }
    }

    fn mdats(&self) -> impl Iterator<Item = &MediaDataBox> {
        self.boxes.iter().filter_map(|b| match &b.data {
            BoxData::MediaData(m) => Some(m),
            _ => None,
        })
    }

    pub fn entity_groups(&self) -> impl Iterator<Item = &EntityGroup> {
        self.meta_child(BoxType::GroupListBox)
            .into_iter()
            .filter_map(|g| match &g.data {
                BoxData::GroupList(l) => Some(l),
                _ => None,
            })
            .flat_map(|l| l.groups.iter())
    }

    // ========================================
    // Property resolution
    // ========================================

    /// The property boxes associated with an item, in association order
    /// (not `ipco` sibling order). Index 0 entries are skipped; an index
    /// past the end of `ipco` is an error.
    pub fn properties_for_item(&self, item_id: u32) -> Result<TryVec<&HeifBox>> {
        let mut out = TryVec::new();
        let entry = match self.ipma().and_then(|ipma| ipma.entry_for_item(item_id)) {
            Some(entry) => entry,
            None => return Ok(out),
        };
        let ipco = self
            .ipco()
            .ok_or(Error::InvalidData("ipma without an ipco box"))?;
        for assoc in &entry.associations {
            let index = match assoc.property_index {
                0 => continue,
                i => i.to_usize() - 1,
            };
            let prop = ipco
                .children
                .get(index)
                .ok_or(Error::InvalidData("ipma property index out of range"))?;
            out.push(prop)?;
        }
        Ok(out)
    }

    /// The first property of the given type in association order, if any.
    pub fn property_for_item(&self, item_id: u32, name: BoxType) -> Option<&HeifBox> {
        self.properties_for_item(item_id)
            .ok()?
            .iter()
            .find(|p| p.header.name == name)
            .copied()
    }

    /// The essential bit of the first association entry resolving to the
    /// given property box (compared by identity within this tree).
    pub fn is_property_essential_for_item(
        &self,
        item_id: u32,
        property: &HeifBox,
    ) -> Option<bool> {
        let entry = self.ipma()?.entry_for_item(item_id)?;
        let ipco = self.ipco()?;
        for assoc in &entry.associations {
            let index = match assoc.property_index {
                0 => continue,
                i => i.to_usize() - 1,
            };
            if let Some(prop) = ipco.children.get(index) {
                if std::ptr::eq(prop, property) {
                    return Some(assoc.essential);
                }
            }
        }
        None
    }

    /// Reject items whose essential properties the resolver does not
    /// understand. Items without such a property pass unaffected.
    pub fn check_essential_properties(&self, item_id: u32) -> Result<()> {
        let entry = match self.ipma().and_then(|ipma| ipma.entry_for_item(item_id)) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let ipco = self.ipco();
        for assoc in &entry.associations {
            if !assoc.essential {
                continue;
            }
            let resolved = assoc
                .property_index
                .checked_sub(1)
                .and_then(|i| ipco?.children.get(i.to_usize()));
            match resolved {
                Some(prop) if !matches!(prop.data, BoxData::Unknown(_)) => {}
                _ => return Err(Error::InvalidEssentialProperty(item_id)),
            }
        }
        Ok(())
    }

    /// The coded colour profile associated with an item, copied out.
    pub fn nclx_for_item(&self, item_id: u32) -> Option<NclxColourProfile> {
        match &self
            .property_for_item(item_id, BoxType::ColourInformationBox)?
            .data
        {
            BoxData::ColourInformation(c) => c.nclx().copied(),
            _ => None,
        }
    }

    // ========================================
    // Item references and data
    // ========================================

    /// All reference records originating at an item.
    pub fn references_from_item(&self, item_id: u32) -> impl Iterator<Item = &ItemReference> {
        self.iref()
            .into_iter()
            .flat_map(|r| r.references.iter())
            .filter(move |r| r.from_item_id == item_id)
    }

    /// Target IDs of references of one kind originating at an item.
    pub fn references_for_item(
        &self,
        item_id: u32,
        ref_type: FourCC,
    ) -> impl Iterator<Item = u32> + '_ {
        self.references_from_item(item_id)
            .filter(move |r| r.ref_type == ref_type)
            .flat_map(|r| r.to_item_ids.iter().copied())
    }

    /// Collect the bytes of an item by resolving its `iloc` extents.
    ///
    /// Method-0 extents are read from the `mdat` boxes of this tree,
    /// method-1 extents from the sibling `idat`. Method-2 items and
    /// external data references are not resolved.
    pub fn item_data(&self, item_id: u32) -> Result<TryVec<u8>> {
        let iloc = self.iloc().ok_or(Error::InvalidData("no iloc box"))?;
        let item = iloc
            .items
            .iter()
            .find(|i| i.item_id == item_id)
            .ok_or(Error::InvalidData("item not found in iloc"))?;
        if item.data_reference_index != 0 {
            return Err(Error::Unsupported(
                "external file references (iloc.data_reference_index != 0) are not supported",
            ));
        }
        let mut out = TryVec::new();
        match item.construction_method {
            ConstructionMethod::File => {
                for extent in &item.extents {
                    let start = item
                        .base_offset
                        .checked_add(extent.offset)
                        .ok_or(Error::InvalidData("offset calculation overflow"))?;
                    let length = (extent.length != 0).then_some(extent.length);
                    let mdat = self
                        .mdats()
                        .find(|m| m.contains(start))
                        .ok_or(Error::InvalidData("iloc extent is not in any mdat"))?;
                    mdat.read_range(start, length, &mut out)?;
                }
            }
            ConstructionMethod::Idat => {
                let idat = self.idat().ok_or(Error::InvalidData(
                    "idat box missing but construction method is idat",
                ))?;
                for extent in &item.extents {
                    let start = usize::try_from(extent.offset)?;
                    let slice = if extent.length == 0 {
                        idat.data.get(start..)
                    } else {
                        let end = start
                            .checked_add(usize::try_from(extent.length)?)
                            .ok_or(Error::InvalidData("extent end overflow"))?;
                        idat.data.get(start..end)
                    };
                    let slice = slice.ok_or(Error::InvalidData("extent exceeds idat size"))?;
                    out.extend_from_slice(slice)?;
                }
            }
            ConstructionMethod::Item => {
                return Err(Error::Unsupported(
                    "construction_method 'item_offset' is not supported",
                ));
            }
        }
        Ok(out)
    }

    /// Indented rendering of the whole tree for debugging.
    pub fn dump(&self) -> std::string::String {
        let mut out = std::string::String::new();
        for node in &self.boxes {
            out.push_str(&node.dump());
        }
        out
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The box tree: a header, a typed payload dispatched on the four-character
//! code, and an ordered child list for container types. Unknown types are
//! preserved as opaque byte payloads so copy-through is lossless.

use std::fmt::Write as _;

use log::{debug, warn};

use crate::boxes::{BoxType, FourCC};
use crate::codec::{Av1ConfigBox, HevcConfigBox, VvcConfigBox};
use crate::meta::{
    DataEntryUrlBox, FileTypeBox, GroupListBox, HandlerBox, ItemDataBox, ItemInfoEntry,
    ItemLocationBox, ItemReferenceBox, MediaDataBox, PrimaryItemBox,
};
use crate::props::{
    AuxiliaryTypeBox, CleanApertureBox, ColourInformationBox, ContentLightLevelBox,
    ImageSpatialExtentsBox, ItemPropertyAssociationBox, LayerSelectorBox, LayerSizesBox,
    MasteringDisplayBox, MirrorBox, OperatingPointBox, PixelAspectRatioBox, PixelInformationBox,
    RotationBox, UserDescriptionBox,
};
use crate::reader::{
    check_parser_state, read_fullbox_version_no_flags, BMFFBox, BoxHeader,
};
use crate::writer::BoxWriter;
use crate::{Error, ParseOptions, Result, ToU64, TryVec};

/// Parent chains deeper than this are treated as malformed rather than
/// recursed into.
const MAX_BOX_DEPTH: usize = 32;

/// An unrecognized box, preserved verbatim.
#[derive(Debug, PartialEq, Default)]
pub struct UnknownBox {
    pub data: TryVec<u8>,
}

/// The typed payload of a box, tagged by its four-character code.
/// Pure containers carry no payload of their own; their state is the child
/// list on the owning [`HeifBox`].
#[derive(Debug, PartialEq)]
pub enum BoxData {
    FileType(FileTypeBox),
    Metadata,
    Handler(HandlerBox),
    PrimaryItem(PrimaryItemBox),
    ItemInfo,
    ItemInfoEntry(ItemInfoEntry),
    ItemLocation(ItemLocationBox),
    ItemReference(ItemReferenceBox),
    ItemProperties,
    ItemPropertyContainer,
    ItemPropertyAssociation(ItemPropertyAssociationBox),
    ImageSpatialExtents(ImageSpatialExtentsBox),
    PixelAspectRatio(PixelAspectRatioBox),
    PixelInformation(PixelInformationBox),
    ColourInformation(ColourInformationBox),
    AuxiliaryType(AuxiliaryTypeBox),
    Rotation(RotationBox),
    Mirror(MirrorBox),
    CleanAperture(CleanApertureBox),
    LayerSelector(LayerSelectorBox),
    OperatingPoint(OperatingPointBox),
    LayerSizes(LayerSizesBox),
    ContentLightLevel(ContentLightLevelBox),
    MasteringDisplay(MasteringDisplayBox),
    UserDescription(UserDescriptionBox),
    HevcConfig(HevcConfigBox),
    Av1Config(Av1ConfigBox),
    VvcConfig(VvcConfigBox),
    ItemData(ItemDataBox),
    GroupList(GroupListBox),
    DataInformation,
    DataReference,
    DataEntryUrl(DataEntryUrlBox),
    MediaData(MediaDataBox),
    Unknown(UnknownBox),
}

impl BoxData {
    /// The four-character code implied by the payload tag, if any. Opaque
    /// payloads take their type from the box header instead.
    pub fn box_type(&self) -> Option<BoxType> {
        Some(match self {
            Self::FileType(_) => BoxType::FileTypeBox,
            Self::Metadata => BoxType::MetadataBox,
            Self::Handler(_) => BoxType::HandlerBox,
            Self::PrimaryItem(_) => BoxType::PrimaryItemBox,
            Self::ItemInfo => BoxType::ItemInfoBox,
            Self::ItemInfoEntry(_) => BoxType::ItemInfoEntry,
            Self::ItemLocation(_) => BoxType::ItemLocationBox,
            Self::ItemReference(_) => BoxType::ItemReferenceBox,
            Self::ItemProperties => BoxType::ItemPropertiesBox,
            Self::ItemPropertyContainer => BoxType::ItemPropertyContainerBox,
            Self::ItemPropertyAssociation(_) => BoxType::ItemPropertyAssociationBox,
            Self::ImageSpatialExtents(_) => BoxType::ImageSpatialExtentsBox,
            Self::PixelAspectRatio(_) => BoxType::PixelAspectRatioBox,
            Self::PixelInformation(_) => BoxType::PixelInformationBox,
            Self::ColourInformation(_) => BoxType::ColourInformationBox,
            Self::AuxiliaryType(_) => BoxType::AuxiliaryTypeBox,
            Self::Rotation(_) => BoxType::RotationBox,
            Self::Mirror(_) => BoxType::MirrorBox,
            Self::CleanAperture(_) => BoxType::CleanApertureBox,
            Self::LayerSelector(_) => BoxType::LayerSelectorBox,
            Self::OperatingPoint(_) => BoxType::OperatingPointBox,
            Self::LayerSizes(_) => BoxType::LayerSizesBox,
            Self::ContentLightLevel(_) => BoxType::ContentLightLevelBox,
            Self::MasteringDisplay(_) => BoxType::MasteringDisplayBox,
            Self::UserDescription(_) => BoxType::UserDescriptionBox,
            Self::HevcConfig(_) => BoxType::HevcConfigBox,
            Self::Av1Config(_) => BoxType::Av1ConfigBox,
            Self::VvcConfig(_) => BoxType::VvcConfigBox,
            Self::ItemData(_) => BoxType::ItemDataBox,
            Self::GroupList(_) => BoxType::GroupListBox,
            Self::DataInformation => BoxType::DataInformationBox,
            Self::DataReference => BoxType::DataReferenceBox,
            Self::DataEntryUrl(_) => BoxType::DataEntryUrlBox,
            Self::MediaData(_) => BoxType::MediaDataBox,
            Self::Unknown(_) => return None,
        })
    }
}

/// One node of the box tree.
///
/// The header records what was parsed; after mutation, `size` is stale
/// until the tree is serialized again. Equality ignores the recorded sizes
/// for exactly that reason.
#[derive(Debug)]
pub struct HeifBox {
    pub header: BoxHeader,
    pub data: BoxData,
    pub children: TryVec<HeifBox>,
}

impl PartialEq for HeifBox {
    fn eq(&self, other: &Self) -> bool {
        self.header.name == other.header.name
            && self.header.uuid == other.header.uuid
            && self.data == other.data
            && self.children == other.children
    }
}

impl HeifBox {
    /// A fresh node for a typed payload. The header size stays zero until
    /// serialization.
    pub fn new(data: BoxData) -> Result<Self> {
        let name = data
            .box_type()
            .ok_or(Error::InvalidData("opaque payloads need an explicit box type"))?;
        Ok(Self {
            header: BoxHeader { name, size: 0, offset: 0, uuid: None },
            data,
            children: TryVec::new(),
        })
    }

    /// A fresh opaque node carrying raw body bytes under an arbitrary type.
    pub fn new_unknown(type_code: u32, body: TryVec<u8>) -> Self {
        Self {
            header: BoxHeader {
                name: BoxType::from(type_code),
                size: 0,
                offset: 0,
                uuid: None,
            },
            data: BoxData::Unknown(UnknownBox { data: body }),
            children: TryVec::new(),
        }
    }

    pub fn box_type(&self) -> BoxType {
        self.header.name
    }

    pub fn push_child(&mut self, child: HeifBox) -> Result<()> {
        self.children.push(child).map_err(From::from)
    }

    /// The first child of the given type, in file order.
    pub fn child(&self, name: BoxType) -> Option<&HeifBox> {
        self.children.iter().find(|c| c.header.name == name)
    }

    pub fn child_mut(&mut self, name: BoxType) -> Option<&mut HeifBox> {
        self.children.iter_mut().find(|c| c.header.name == name)
    }

    pub fn children_of_type(&self, name: BoxType) -> impl Iterator<Item = &HeifBox> {
        self.children.iter().filter(move |c| c.header.name == name)
    }

    /// Indented one-line-per-box rendering for debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        let name = FourCC::from(self.header.name);
        let _ = write!(out, "'{name}' size={}", self.header.size);
        match &self.data {
            BoxData::FileType(f) => {
                let _ = write!(out, " major={}", f.major_brand);
            }
            BoxData::PrimaryItem(p) => {
                let _ = write!(out, " item={}", p.item_id);
            }
            BoxData::ItemInfoEntry(e) => {
                let _ = write!(out, " item={} type={}", e.item_id, e.item_type);
            }
            BoxData::ItemLocation(l) => {
                let _ = write!(out, " items={}", l.items.len());
            }
            BoxData::ItemReference(r) => {
                let _ = write!(out, " references={}", r.references.len());
            }
            BoxData::ImageSpatialExtents(e) => {
                let _ = write!(out, " {}x{}", e.width, e.height);
            }
            BoxData::Rotation(r) => {
                let _ = write!(out, " ccw={}", r.rotation_ccw());
            }
            BoxData::MediaData(m) => {
                let _ = write!(out, " bytes={}", m.data.len());
            }
            BoxData::Unknown(u) => {
                let _ = write!(out, " opaque bytes={}", u.data.len());
            }
            _ => {}
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(out, depth + 1);
        }
    }
}

pub(crate) fn read_children(
    src: &mut BMFFBox<'_>,
    options: &ParseOptions,
    depth: usize,
) -> Result<TryVec<HeifBox>> {
    let mut children = TryVec::new();
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        children.push(parse_box(&mut b, options, depth)?)?;
    }
    Ok(children)
}

/// Parse one box into a tree node, dispatching on its type. Unknown types
/// and known full boxes with unrecognized versions are preserved as opaque
/// payloads.
pub(crate) fn parse_box(
    src: &mut BMFFBox<'_>,
    options: &ParseOptions,
    depth: usize,
) -> Result<HeifBox> {
    if depth > MAX_BOX_DEPTH {
        return Err(Error::InvalidData("box nesting too deep"));
    }
    let header = src.head;
    let snapshot = src.content;
    let mut children = TryVec::new();
    let data = match parse_payload(src, &mut children, options, depth) {
        Ok(data) => data,
        Err(Error::UnsupportedVersion(version)) => {
            warn!("preserving '{:?}' with unsupported version {version} as opaque", header.name);
            src.content = snapshot;
            children = TryVec::new();
            BoxData::Unknown(UnknownBox { data: src.read_into_try_vec()? })
        }
        Err(e) => return Err(e),
    };
    check_parser_state(src)?;
    Ok(HeifBox { header, data, children })
}

fn parse_payload(
    src: &mut BMFFBox<'_>,
    children: &mut TryVec<HeifBox>,
    options: &ParseOptions,
    depth: usize,
) -> Result<BoxData> {
    Ok(match src.head.name {
        BoxType::FileTypeBox => BoxData::FileType(FileTypeBox::parse(src)?),
        BoxType::MetadataBox => {
            let version = read_fullbox_version_no_flags(src, options)?;
            if version != 0 {
                return Err(Error::UnsupportedVersion(version));
            }
            *children = read_children(src, options, depth + 1)?;
            BoxData::Metadata
        }
        BoxType::HandlerBox => BoxData::Handler(HandlerBox::parse(src, options)?),
        BoxType::PrimaryItemBox => BoxData::PrimaryItem(PrimaryItemBox::parse(src, options)?),
        BoxType::ItemInfoBox => {
            let version = read_fullbox_version_no_flags(src, options)?;
            let declared = match version {
                0 => src.read_u16()?.to_u64(),
                1 => src.read_u32()?.to_u64(),
                _ => return Err(Error::UnsupportedVersion(version)),
            };
            *children = read_children(src, options, depth + 1)?;
            if children.iter().any(|c| c.header.name != BoxType::ItemInfoEntry) {
                return Err(Error::InvalidData("iinf box should contain only infe boxes"));
            }
            if declared != children.len().to_u64() {
                warn!("iinf declares {declared} entries but carries {}", children.len());
            }
            BoxData::ItemInfo
        }
        BoxType::ItemInfoEntry => BoxData::ItemInfoEntry(ItemInfoEntry::parse(src)?),
        BoxType::ItemLocationBox => {
            BoxData::ItemLocation(ItemLocationBox::parse(src, options)?)
        }
        BoxType::ItemReferenceBox => {
            BoxData::ItemReference(ItemReferenceBox::parse(src, options)?)
        }
        BoxType::ItemPropertiesBox => {
            *children = read_children(src, options, depth + 1)?;
            BoxData::ItemProperties
        }
        BoxType::ItemPropertyContainerBox => {
            *children = read_children(src, options, depth + 1)?;
            BoxData::ItemPropertyContainer
        }
        BoxType::ItemPropertyAssociationBox => {
            BoxData::ItemPropertyAssociation(ItemPropertyAssociationBox::parse(src)?)
        }
        BoxType::ImageSpatialExtentsBox => {
            BoxData::ImageSpatialExtents(ImageSpatialExtentsBox::parse(src, options)?)
        }
        BoxType::PixelAspectRatioBox => {
            BoxData::PixelAspectRatio(PixelAspectRatioBox::parse(src)?)
        }
        BoxType::PixelInformationBox => {
            BoxData::PixelInformation(PixelInformationBox::parse(src, options)?)
        }
        BoxType::ColourInformationBox => {
            BoxData::ColourInformation(ColourInformationBox::parse(src)?)
        }
        BoxType::AuxiliaryTypeBox => {
            BoxData::AuxiliaryType(AuxiliaryTypeBox::parse(src, options)?)
        }
        BoxType::RotationBox => BoxData::Rotation(RotationBox::parse(src)?),
        BoxType::MirrorBox => BoxData::Mirror(MirrorBox::parse(src)?),
        BoxType::CleanApertureBox => BoxData::CleanAperture(CleanApertureBox::parse(src)?),
        BoxType::LayerSelectorBox => BoxData::LayerSelector(LayerSelectorBox::parse(src)?),
        BoxType::OperatingPointBox => BoxData::OperatingPoint(OperatingPointBox::parse(src)?),
        BoxType::LayerSizesBox => BoxData::LayerSizes(LayerSizesBox::parse(src)?),
        BoxType::ContentLightLevelBox => {
            BoxData::ContentLightLevel(ContentLightLevelBox::parse(src)?)
        }
        BoxType::MasteringDisplayBox => {
            BoxData::MasteringDisplay(MasteringDisplayBox::parse(src)?)
        }
        BoxType::UserDescriptionBox => {
            BoxData::UserDescription(UserDescriptionBox::parse(src, options)?)
        }
        BoxType::HevcConfigBox => BoxData::HevcConfig(HevcConfigBox::parse(src)?),
        BoxType::Av1ConfigBox => BoxData::Av1Config(Av1ConfigBox::parse(src)?),
        BoxType::VvcConfigBox => BoxData::VvcConfig(VvcConfigBox::parse(src)?),
        BoxType::ItemDataBox => BoxData::ItemData(ItemDataBox::parse(src)?),
        BoxType::GroupListBox => BoxData::GroupList(GroupListBox::parse(src)?),
        BoxType::DataInformationBox => {
            *children = read_children(src, options, depth + 1)?;
            BoxData::DataInformation
        }
        BoxType::DataReferenceBox => {
            let version = read_fullbox_version_no_flags(src, options)?;
            if version != 0 {
                return Err(Error::UnsupportedVersion(version));
            }
            let declared = src.read_u32()?;
            *children = read_children(src, options, depth + 1)?;
            if declared.to_u64() != children.len().to_u64() {
                warn!("dref declares {declared} entries but carries {}", children.len());
            }
            BoxData::DataReference
        }
        BoxType::DataEntryUrlBox => BoxData::DataEntryUrl(DataEntryUrlBox::parse(src)?),
        BoxType::MediaDataBox => BoxData::MediaData(MediaDataBox::parse(src)?),
        _ => {
            debug!("{:?} (opaque)", src.head);
            BoxData::Unknown(UnknownBox { data: src.read_into_try_vec()? })
        }
    })
}

/// Recursively pick the smallest versions and field widths for boxes whose
/// serialized layout depends on the stored values. Runs before writing.
pub(crate) fn derive_box_version(node: &mut HeifBox) {
    if let BoxData::ItemLocation(iloc) = &mut node.data {
        iloc.derive_box_version();
    }
    for child in node.children.iter_mut() {
        derive_box_version(child);
    }
}

fn write_children(w: &mut BoxWriter, children: &mut TryVec<HeifBox>) -> Result<()> {
    for child in children.iter_mut() {
        write_box(w, child)?;
    }
    Ok(())
}

/// Serialize one node (and its children) through the dispatch table.
pub(crate) fn write_box(w: &mut BoxWriter, node: &mut HeifBox) -> Result<()> {
    match &mut node.data {
        BoxData::FileType(b) => b.write(w),
        BoxData::Metadata => {
            let t = w.begin_full_box(BoxType::MetadataBox, 0, 0)?;
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::Handler(b) => b.write(w),
        BoxData::PrimaryItem(b) => b.write(w),
        BoxData::ItemInfo => {
            let wide = node.children.len() > usize::from(u16::MAX);
            let t = w.begin_full_box(BoxType::ItemInfoBox, u8::from(wide), 0)?;
            if wide {
                let count = u32::try_from(node.children.len())
                    .map_err(|_| Error::OverflowOnWrite("too many item infos"))?;
                w.u32(count)?;
            } else {
                w.u16(node.children.len() as u16)?;
            }
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::ItemInfoEntry(b) => b.write(w),
        BoxData::ItemLocation(b) => b.write(w),
        BoxData::ItemReference(b) => b.write(w),
        BoxData::ItemProperties => {
            let t = w.begin_box(BoxType::ItemPropertiesBox)?;
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::ItemPropertyContainer => {
            let t = w.begin_box(BoxType::ItemPropertyContainerBox)?;
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::ItemPropertyAssociation(b) => b.write(w),
        BoxData::ImageSpatialExtents(b) => b.write(w),
        BoxData::PixelAspectRatio(b) => b.write(w),
        BoxData::PixelInformation(b) => b.write(w),
        BoxData::ColourInformation(b) => b.write(w),
        BoxData::AuxiliaryType(b) => b.write(w),
        BoxData::Rotation(b) => b.write(w),
        BoxData::Mirror(b) => b.write(w),
        BoxData::CleanAperture(b) => b.write(w),
        BoxData::LayerSelector(b) => b.write(w),
        BoxData::OperatingPoint(b) => b.write(w),
        BoxData::LayerSizes(b) => b.write(w),
        BoxData::ContentLightLevel(b) => b.write(w),
        BoxData::MasteringDisplay(b) => b.write(w),
        BoxData::UserDescription(b) => b.write(w),
        BoxData::HevcConfig(b) => b.write(w),
        BoxData::Av1Config(b) => b.write(w),
        BoxData::VvcConfig(b) => b.write(w),
        BoxData::ItemData(b) => b.write(w),
        BoxData::GroupList(b) => b.write(w),
        BoxData::DataInformation => {
            let t = w.begin_box(BoxType::DataInformationBox)?;
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::DataReference => {
            let t = w.begin_full_box(BoxType::DataReferenceBox, 0, 0)?;
            let count = u32::try_from(node.children.len())
                .map_err(|_| Error::OverflowOnWrite("too many data references"))?;
            w.u32(count)?;
            write_children(w, &mut node.children)?;
            w.end_box(t)
        }
        BoxData::DataEntryUrl(b) => b.write(w),
        BoxData::MediaData(b) => b.write(w),
        BoxData::Unknown(b) => {
            let t = w.begin_box(node.header.name)?;
            if let Some(uuid) = node.header.uuid {
                w.bytes(&uuid)?;
            }
            w.bytes(&b.data)?;
            w.end_box(t)
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item property payloads: the descriptor boxes collected under `ipco` and
//! bound to items through `ipma`.

use arrayvec::ArrayVec;
use bitreader::BitReader;

use crate::boxes::{BoxType, FourCC};
use crate::fraction::Fraction;
use crate::reader::{read_fullbox_extra, read_fullbox_version_no_flags, BMFFBox};
use crate::writer::BoxWriter;
use crate::{Error, ParseOptions, Result, ToUsize, TryString, TryVec};

/// Image spatial extents ('ispe').
/// See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ImageSpatialExtentsBox {
    pub width: u32,
    pub height: u32,
}

impl ImageSpatialExtentsBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        let width = src.read_u32()?;
        let height = src.read_u32()?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("ispe dimensions cannot be zero"));
        }
        Ok(Self { width, height })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::ImageSpatialExtentsBox, 0, 0)?;
        w.u32(self.width)?;
        w.u32(self.height)?;
        w.end_box(b)
    }
}

/// Pixel aspect ratio ('pasp').
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PixelAspectRatioBox {
    pub h_spacing: u32,
    pub v_spacing: u32,
}

impl PixelAspectRatioBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self { h_spacing: src.read_u32()?, v_spacing: src.read_u32()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::PixelAspectRatioBox)?;
        w.u32(self.h_spacing)?;
        w.u32(self.v_spacing)?;
        w.end_box(b)
    }
}

/// Per-channel bit depth ('pixi').
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PixelInformationBox {
    pub bits_per_channel: ArrayVec<u8, 16>,
}

impl PixelInformationBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        let num_channels = src.read_u8()?.to_usize();
        let mut bits_per_channel = ArrayVec::new();
        if num_channels > bits_per_channel.capacity() {
            return Err(Error::InvalidData("too many channels in pixi"));
        }
        bits_per_channel
            .try_extend_from_slice(src.read_bytes(num_channels)?)
            .map_err(|_| Error::InvalidData("pixi channel count"))?;
        // Some encoders append extended fields; tolerate them on request.
        if options.lenient && src.bytes_left() > 0 {
            crate::reader::skip_box_remain(src)?;
        }
        Ok(Self { bits_per_channel })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::PixelInformationBox, 0, 0)?;
        w.u8(self.bits_per_channel.len() as u8)?;
        w.bytes(&self.bits_per_channel)?;
        w.end_box(b)
    }
}

pub const COLOUR_TYPE_NCLX: &[u8; 4] = b"nclx";
pub const COLOUR_TYPE_ICC_RESTRICTED: &[u8; 4] = b"rICC";
pub const COLOUR_TYPE_ICC_UNRESTRICTED: &[u8; 4] = b"prof";

pub const NCLX_UNSPECIFIED: u16 = 2;

/// On-screen colour interpretation via coded code points.
/// See ISO/IEC 23091-2 for the code point values.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NclxColourProfile {
    pub colour_primaries: u16,
    pub transfer_characteristics: u16,
    pub matrix_coefficients: u16,
    pub full_range_flag: bool,
}

impl Default for NclxColourProfile {
    fn default() -> Self {
        Self {
            colour_primaries: NCLX_UNSPECIFIED,
            transfer_characteristics: NCLX_UNSPECIFIED,
            matrix_coefficients: NCLX_UNSPECIFIED,
            full_range_flag: true,
        }
    }
}

/// The payload of a 'colr' box: either a coded NCLX record or a raw ICC
/// profile tagged with its colour type.
#[derive(Debug, PartialEq)]
pub enum ColourInformation {
    Nclx(NclxColourProfile),
    Raw { profile_type: FourCC, data: TryVec<u8> },
}

/// Colour information ('colr').
#[derive(Debug, PartialEq)]
pub struct ColourInformationBox {
    pub profile: ColourInformation,
}

impl ColourInformationBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let profile_type = FourCC::from(src.read_u32()?);
        let profile = if profile_type == COLOUR_TYPE_NCLX {
            let colour_primaries = src.read_u16()?;
            let transfer_characteristics = src.read_u16()?;
            let matrix_coefficients = src.read_u16()?;
            let full_range_flag = src.read_u8()? & 0x80 != 0;
            ColourInformation::Nclx(NclxColourProfile {
                colour_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range_flag,
            })
        } else {
            ColourInformation::Raw { profile_type, data: src.read_into_try_vec()? }
        };
        Ok(Self { profile })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::ColourInformationBox)?;
        match &self.profile {
            ColourInformation::Nclx(nclx) => {
                w.u32(u32::from_be_bytes(*COLOUR_TYPE_NCLX))?;
                w.u16(nclx.colour_primaries)?;
                w.u16(nclx.transfer_characteristics)?;
                w.u16(nclx.matrix_coefficients)?;
                // Full-range bit on top, the remaining seven bits reserved.
                w.u8(if nclx.full_range_flag { 0x80 } else { 0 })?;
            }
            ColourInformation::Raw { profile_type, data } => {
                w.u32(u32::from(*profile_type))?;
                w.bytes(data)?;
            }
        }
        w.end_box(b)
    }

    /// The coded profile, if this box carries one.
    pub fn nclx(&self) -> Option<&NclxColourProfile> {
        match &self.profile {
            ColourInformation::Nclx(nclx) => Some(nclx),
            ColourInformation::Raw { .. } => None,
        }
    }
}

/// Auxiliary image type ('auxC'): a URN, optionally followed by subtype
/// bytes after the NUL.
#[derive(Debug, PartialEq)]
pub struct AuxiliaryTypeBox {
    pub aux_data: TryString,
}

impl AuxiliaryTypeBox {
    pub fn new(aux_type: &str, subtypes: &[u8]) -> Result<Self> {
        let mut aux_data = TryVec::new();
        aux_data.extend_from_slice(aux_type.as_bytes())?;
        if !subtypes.is_empty() {
            aux_data.push(0)?;
            aux_data.extend_from_slice(subtypes)?;
        }
        Ok(Self { aux_data })
    }

    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self { aux_data: src.read_into_try_vec()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::AuxiliaryTypeBox, 0, 0)?;
        w.bytes(&self.aux_data)?;
        w.end_box(b)
    }

    #[must_use]
    pub fn type_subtype(&self) -> (&[u8], &[u8]) {
        let split = self
            .aux_data
            .iter()
            .position(|&b| b == b'\0')
            .map(|pos| self.aux_data.split_at(pos));
        if let Some((aux_type, rest)) = split {
            (aux_type, &rest[1..])
        } else {
            (&self.aux_data, &[])
        }
    }

    pub fn aux_type(&self) -> &[u8] {
        self.type_subtype().0
    }
}

/// Image rotation ('irot'), counter-clockwise in 90-degree steps.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct RotationBox {
    rotation_ccw: u16,
}

impl RotationBox {
    pub fn new(degrees_ccw: u16) -> Result<Self> {
        if degrees_ccw % 90 != 0 || degrees_ccw >= 360 {
            return Err(Error::InvalidData("rotation must be 0, 90, 180 or 270"));
        }
        Ok(Self { rotation_ccw: degrees_ccw })
    }

    pub fn rotation_ccw(&self) -> u16 {
        self.rotation_ccw
    }

    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self { rotation_ccw: u16::from(src.read_u8()? & 0x03) * 90 })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::RotationBox)?;
        w.u8((self.rotation_ccw / 90) as u8)?;
        w.end_box(b)
    }
}

/// The mirror axis of an 'imir' box.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MirrorAxis {
    /// Flip the image left-right.
    Vertical,
    /// Flip the image top-bottom.
    Horizontal,
}

/// Image mirroring ('imir').
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MirrorBox {
    pub axis: MirrorAxis,
}

impl MirrorBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let axis = if src.read_u8()? & 1 == 0 { MirrorAxis::Vertical } else { MirrorAxis::Horizontal };
        Ok(Self { axis })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::MirrorBox)?;
        w.u8(match self.axis {
            MirrorAxis::Vertical => 0,
            MirrorAxis::Horizontal => 1,
        })?;
        w.end_box(b)
    }
}

/// Clean aperture ('clap'): a fractional crop window anchored at the image
/// centre. Rounded accessors need the image dimensions to resolve.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CleanApertureBox {
    pub clean_aperture_width: Fraction,
    pub clean_aperture_height: Fraction,
    pub horizontal_offset: Fraction,
    pub vertical_offset: Fraction,
}

impl CleanApertureBox {
    /// Centre a `clap_width` x `clap_height` aperture on an image.
    pub fn from_dimensions(
        clap_width: u32,
        clap_height: u32,
        image_width: u32,
        image_height: u32,
    ) -> Result<Self> {
        let clap_width_i = i32::try_from(clap_width)?;
        let clap_height_i = i32::try_from(clap_height)?;
        Ok(Self {
            clean_aperture_width: Fraction::new(clap_width_i, 1)?,
            clean_aperture_height: Fraction::new(clap_height_i, 1)?,
            horizontal_offset: Fraction::new(clap_width_i - i32::try_from(image_width)?, 2)?,
            vertical_offset: Fraction::new(clap_height_i - i32::try_from(image_height)?, 2)?,
        })
    }

    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let mut next = || -> Result<Fraction> {
            let num = src.read_u32()? as i32;
            let den = src.read_u32()? as i32;
            Fraction::new(num, den)
        };
        Ok(Self {
            clean_aperture_width: next()?,
            clean_aperture_height: next()?,
            horizontal_offset: next()?,
            vertical_offset: next()?,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        for f in [
            &self.clean_aperture_width,
            &self.clean_aperture_height,
            &self.horizontal_offset,
            &self.vertical_offset,
        ] {
            if !f.is_valid() {
                return Err(Error::InvalidFraction);
            }
        }
        let b = w.begin_box(BoxType::CleanApertureBox)?;
        for f in [
            &self.clean_aperture_width,
            &self.clean_aperture_height,
            &self.horizontal_offset,
            &self.vertical_offset,
        ] {
            w.u32(f.numerator as u32)?;
            w.u32(f.denominator as u32)?;
        }
        w.end_box(b)
    }

    fn centre(offset: Fraction, image_extent: u32) -> Result<Fraction> {
        offset.add(Fraction::new(i32::try_from(image_extent)? - 1, 2)?)
    }

    /// First column of the aperture.
    pub fn left_rounded(&self, image_width: u32) -> Result<i32> {
        let pc_x = Self::centre(self.horizontal_offset, image_width)?;
        let left = pc_x.sub(self.clean_aperture_width.sub_int(1)?.div_int(2)?)?;
        Ok(left.round_down())
    }

    /// Last column that is part of the aperture.
    pub fn right_rounded(&self, image_width: u32) -> Result<i32> {
        let pc_x = Self::centre(self.horizontal_offset, image_width)?;
        let right = pc_x.add(self.clean_aperture_width.sub_int(1)?.div_int(2)?)?;
        Ok(right.round_up())
    }

    /// First row of the aperture.
    pub fn top_rounded(&self, image_height: u32) -> Result<i32> {
        let pc_y = Self::centre(self.vertical_offset, image_height)?;
        let top = pc_y.sub(self.clean_aperture_height.sub_int(1)?.div_int(2)?)?;
        Ok(top.round_down())
    }

    /// Last row that is part of the aperture.
    pub fn bottom_rounded(&self, image_height: u32) -> Result<i32> {
        let pc_y = Self::centre(self.vertical_offset, image_height)?;
        let bottom = pc_y.add(self.clean_aperture_height.sub_int(1)?.div_int(2)?)?;
        Ok(bottom.round_up())
    }

    pub fn width_rounded(&self) -> i32 {
        self.clean_aperture_width.round()
    }

    pub fn height_rounded(&self) -> i32 {
        self.clean_aperture_height.round()
    }
}

/// Layer selection ('lsel').
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct LayerSelectorBox {
    pub layer_id: u16,
}

impl LayerSelectorBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self { layer_id: src.read_u16()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::LayerSelectorBox)?;
        w.u16(self.layer_id)?;
        w.end_box(b)
    }
}

/// AV1 operating point selection ('a1op').
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct OperatingPointBox {
    pub op_index: u8,
}

impl OperatingPointBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self { op_index: src.read_u8()? })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::OperatingPointBox)?;
        w.u8(self.op_index)?;
        w.end_box(b)
    }
}

/// AV1 layered image sizes ('a1lx').
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct LayerSizesBox {
    pub layer_sizes: [u32; 3],
}

impl LayerSizesBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let large = src.read_u8()? & 1 == 1;
        let mut layer_sizes = [0u32; 3];
        for size in &mut layer_sizes {
            *size = if large { src.read_u32()? } else { u32::from(src.read_u16()?) };
        }
        Ok(Self { layer_sizes })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let large = self.layer_sizes.iter().any(|&s| s > u32::from(u16::MAX));
        let b = w.begin_box(BoxType::LayerSizesBox)?;
        w.u8(u8::from(large))?;
        for &size in &self.layer_sizes {
            if large {
                w.u32(size)?;
            } else {
                w.u16(size as u16)?;
            }
        }
        w.end_box(b)
    }
}

/// Content light level ('clli'), CEA-861.3.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ContentLightLevelBox {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

impl ContentLightLevelBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        Ok(Self {
            max_content_light_level: src.read_u16()?,
            max_pic_average_light_level: src.read_u16()?,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::ContentLightLevelBox)?;
        w.u16(self.max_content_light_level)?;
        w.u16(self.max_pic_average_light_level)?;
        w.end_box(b)
    }
}

/// Mastering display colour volume ('mdcv'), SMPTE ST 2086.
///
/// Primaries and white point are CIE 1931 xy scaled by 50000; luminances
/// are cd/m² scaled by 10000.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct MasteringDisplayBox {
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

impl MasteringDisplayBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let mut display_primaries = [(0u16, 0u16); 3];
        for primary in &mut display_primaries {
            *primary = (src.read_u16()?, src.read_u16()?);
        }
        let white_point = (src.read_u16()?, src.read_u16()?);
        Ok(Self {
            display_primaries,
            white_point,
            max_display_mastering_luminance: src.read_u32()?,
            min_display_mastering_luminance: src.read_u32()?,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::MasteringDisplayBox)?;
        for &(x, y) in &self.display_primaries {
            w.u16(x)?;
            w.u16(y)?;
        }
        w.u16(self.white_point.0)?;
        w.u16(self.white_point.1)?;
        w.u32(self.max_display_mastering_luminance)?;
        w.u32(self.min_display_mastering_luminance)?;
        w.end_box(b)
    }
}

/// User description ('udes').
/// See ISO/IEC 23008-12:2022 § 6.5.20
#[derive(Debug, PartialEq, Default)]
pub struct UserDescriptionBox {
    pub lang: TryString,
    pub name: TryString,
    pub description: TryString,
    pub tags: TryString,
}

impl UserDescriptionBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>, options: &ParseOptions) -> Result<Self> {
        let version = read_fullbox_version_no_flags(src, options)?;
        if version != 0 {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self {
            lang: src.read_null_terminated_string()?,
            name: src.read_null_terminated_string()?,
            description: src.read_null_terminated_string()?,
            tags: src.read_null_terminated_string()?,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_full_box(BoxType::UserDescriptionBox, 0, 0)?;
        w.null_terminated_string(&self.lang)?;
        w.null_terminated_string(&self.name)?;
        w.null_terminated_string(&self.description)?;
        w.null_terminated_string(&self.tags)?;
        w.end_box(b)
    }
}

/// One `(essential, index)` pair from an 'ipma' entry. The index is 1-based
/// into the sibling order of `ipco`'s children; 0 means "no property".
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PropertyAssociation {
    pub essential: bool,
    pub property_index: u16,
}

#[derive(Debug, PartialEq)]
pub struct IpmaEntry {
    pub item_id: u32,
    pub associations: TryVec<PropertyAssociation>,
}

/// Item property association ('ipma').
/// See ISO/IEC 23008-12:2017 § 9.3.2
#[derive(Debug, PartialEq, Default)]
pub struct ItemPropertyAssociationBox {
    pub entries: TryVec<IpmaEntry>,
}

impl ItemPropertyAssociationBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let (version, flags) = read_fullbox_extra(src)?;
        if version > 1 {
            return Err(Error::UnsupportedVersion(version));
        }
        let entry_count = src.read_u32()?.to_usize();
        let mut entries = TryVec::with_capacity(entry_count.min(src.content.remaining() / 3))?;
        for _ in 0..entry_count {
            let item_id = if version == 0 {
                u32::from(src.read_u16()?)
            } else {
                src.read_u32()?
            };
            let association_count = src.read_u8()?;
            let mut associations = TryVec::with_capacity(association_count.to_usize())?;
            for _ in 0..association_count {
                let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
                let bytes = src.read_bytes(num_association_bytes)?;
                let mut bits = BitReader::new(bytes);
                let essential = bits.read_bool()?;
                let property_index = bits.read_u16(bits.remaining().try_into()?)?;
                associations.push(PropertyAssociation { essential, property_index })?;
            }
            entries.push(IpmaEntry { item_id, associations })?;
        }
        Ok(Self { entries })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let version = if self.entries.iter().any(|e| e.item_id > u32::from(u16::MAX)) {
            1
        } else {
            0
        };
        let wide_index = self
            .entries
            .iter()
            .flat_map(|e| e.associations.iter())
            .any(|a| a.property_index > 0x7f);
        let b = w.begin_full_box(
            BoxType::ItemPropertyAssociationBox,
            version,
            u32::from(wide_index),
        )?;
        w.u32(u32::try_from(self.entries.len())
            .map_err(|_| Error::OverflowOnWrite("too many ipma entries"))?)?;
        for entry in &self.entries {
            if version == 0 {
                w.u16(entry.item_id as u16)?;
            } else {
                w.u32(entry.item_id)?;
            }
            let count = u8::try_from(entry.associations.len())
                .map_err(|_| Error::OverflowOnWrite("too many associations for item"))?;
            w.u8(count)?;
            for assoc in &entry.associations {
                if wide_index {
                    if assoc.property_index > 0x7fff {
                        return Err(Error::OverflowOnWrite("ipma property index"));
                    }
                    w.u16(u16::from(assoc.essential) << 15 | assoc.property_index)?;
                } else {
                    w.u8(u8::from(assoc.essential) << 7 | assoc.property_index as u8)?;
                }
            }
        }
        w.end_box(b)
    }

    /// The association list for one item, if any.
    pub fn entry_for_item(&self, item_id: u32) -> Option<&IpmaEntry> {
        self.entries.iter().find(|e| e.item_id == item_id)
    }

    pub fn add_property_for_item(
        &mut self,
        item_id: u32,
        association: PropertyAssociation,
    ) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.item_id == item_id) {
            return entry.associations.push(association).map_err(From::from);
        }
        let mut associations = TryVec::new();
        associations.push(association)?;
        self.entries.push(IpmaEntry { item_id, associations })?;
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec configuration payloads: `hvcC`, `av1C`, `vvcC`.
//!
//! The structured header fields are decoded; NAL unit and OBU payloads are
//! opaque bytes that round-trip exactly. No codec semantics are validated
//! here.

use crate::boxes::BoxType;
use crate::reader::BMFFBox;
use crate::writer::BoxWriter;
use crate::{Error, Result, ToUsize, TryVec};

/// One array of NAL units of a single type inside `hvcC`.
#[derive(Debug, PartialEq)]
pub struct HevcNalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    pub nal_units: TryVec<TryVec<u8>>,
}

/// HEVC decoder configuration record.
/// See ISO/IEC 14496-15 § 8.3.3.1
#[derive(Debug, PartialEq)]
pub struct HevcConfigBox {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// 48 significant bits.
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    /// Stored as the actual bit depth, not the minus-8 wire value.
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    /// Bytes per NAL unit length prefix in the sample stream (1, 2 or 4).
    pub nal_length_size: u8,
    pub nal_arrays: TryVec<HevcNalArray>,
}

impl Default for HevcConfigBox {
    fn default() -> Self {
        Self {
            configuration_version: 1,
            general_profile_space: 0,
            general_tier_flag: false,
            general_profile_idc: 0,
            general_profile_compatibility_flags: 0,
            general_constraint_indicator_flags: 0,
            general_level_idc: 0,
            min_spatial_segmentation_idc: 0,
            parallelism_type: 0,
            chroma_format: 0,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: 1,
            temporal_id_nested: false,
            nal_length_size: 4,
            nal_arrays: TryVec::new(),
        }
    }
}

impl HevcConfigBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let configuration_version = src.read_u8()?;
        let b = src.read_u8()?;
        let general_profile_space = b >> 6;
        let general_tier_flag = (b >> 5) & 1 == 1;
        let general_profile_idc = b & 0x1f;
        let general_profile_compatibility_flags = src.read_u32()?;
        let mut general_constraint_indicator_flags = 0u64;
        for _ in 0..6 {
            general_constraint_indicator_flags =
                general_constraint_indicator_flags << 8 | u64::from(src.read_u8()?);
        }
        let general_level_idc = src.read_u8()?;
        let min_spatial_segmentation_idc = src.read_u16()? & 0x0fff;
        let parallelism_type = src.read_u8()? & 0x03;
        let chroma_format = src.read_u8()? & 0x03;
        let bit_depth_luma = (src.read_u8()? & 0x07) + 8;
        let bit_depth_chroma = (src.read_u8()? & 0x07) + 8;
        let avg_frame_rate = src.read_u16()?;
        let b = src.read_u8()?;
        let constant_frame_rate = b >> 6;
        let num_temporal_layers = (b >> 3) & 0x07;
        let temporal_id_nested = (b >> 2) & 1 == 1;
        let nal_length_size = (b & 0x03) + 1;

        let num_arrays = src.read_u8()?;
        let mut nal_arrays = TryVec::new();
        for _ in 0..num_arrays {
            let b = src.read_u8()?;
            let array_completeness = b >> 7 == 1;
            let nal_unit_type = b & 0x3f;
            let num_nalus = src.read_u16()?;
            let mut nal_units = TryVec::new();
            for _ in 0..num_nalus {
                let len = src.read_u16()?.to_usize();
                let mut unit = TryVec::new();
                unit.extend_from_slice(src.read_bytes(len)?)?;
                nal_units.push(unit)?;
            }
            nal_arrays.push(HevcNalArray { array_completeness, nal_unit_type, nal_units })?;
        }

        Ok(Self {
            configuration_version,
            general_profile_space,
            general_tier_flag,
            general_profile_idc,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format,
            bit_depth_luma,
            bit_depth_chroma,
            avg_frame_rate,
            constant_frame_rate,
            num_temporal_layers,
            temporal_id_nested,
            nal_length_size,
            nal_arrays,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::HevcConfigBox)?;
        w.u8(self.configuration_version)?;
        w.u8(self.general_profile_space << 6
            | u8::from(self.general_tier_flag) << 5
            | (self.general_profile_idc & 0x1f))?;
        w.u32(self.general_profile_compatibility_flags)?;
        for shift in (0..6).rev() {
            w.u8((self.general_constraint_indicator_flags >> (shift * 8)) as u8)?;
        }
        w.u8(self.general_level_idc)?;
        w.u16(0xf000 | (self.min_spatial_segmentation_idc & 0x0fff))?;
        w.u8(0xfc | (self.parallelism_type & 0x03))?;
        w.u8(0xfc | (self.chroma_format & 0x03))?;
        w.u8(0xf8 | (self.bit_depth_luma.wrapping_sub(8) & 0x07))?;
        w.u8(0xf8 | (self.bit_depth_chroma.wrapping_sub(8) & 0x07))?;
        w.u16(self.avg_frame_rate)?;
        w.u8(self.constant_frame_rate << 6
            | (self.num_temporal_layers & 0x07) << 3
            | u8::from(self.temporal_id_nested) << 2
            | (self.nal_length_size.wrapping_sub(1) & 0x03))?;
        let num_arrays = u8::try_from(self.nal_arrays.len())
            .map_err(|_| Error::OverflowOnWrite("too many NAL arrays"))?;
        w.u8(num_arrays)?;
        for array in &self.nal_arrays {
            w.u8(u8::from(array.array_completeness) << 7 | (array.nal_unit_type & 0x3f))?;
            let num_nalus = u16::try_from(array.nal_units.len())
                .map_err(|_| Error::OverflowOnWrite("too many NAL units"))?;
            w.u16(num_nalus)?;
            for unit in &array.nal_units {
                let len = u16::try_from(unit.len())
                    .map_err(|_| Error::OverflowOnWrite("NAL unit too long"))?;
                w.u16(len)?;
                w.bytes(unit)?;
            }
        }
        w.end_box(b)
    }

    /// Append a header NAL unit, grouping it with others of its type.
    pub fn append_nal_data(&mut self, nal: &[u8]) -> Result<()> {
        let nal_unit_type = (*nal.first().ok_or(Error::InvalidData("empty NAL unit"))? >> 1) & 0x3f;
        let mut unit = TryVec::new();
        unit.extend_from_slice(nal)?;
        if let Some(array) = self
            .nal_arrays
            .iter_mut()
            .find(|a| a.nal_unit_type == nal_unit_type)
        {
            return array.nal_units.push(unit).map_err(From::from);
        }
        let mut nal_units = TryVec::new();
        nal_units.push(unit)?;
        self.nal_arrays.push(HevcNalArray {
            array_completeness: true,
            nal_unit_type,
            nal_units,
        })?;
        Ok(())
    }

    /// All header NAL units in file order, tagged with their unit type.
    pub fn nal_units(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.nal_arrays
            .iter()
            .flat_map(|a| a.nal_units.iter().map(move |u| (a.nal_unit_type, &u[..])))
    }
}

/// AV1 codec configuration record.
/// See the AV1 ISOBMFF mapping § 2.3
#[derive(Debug, PartialEq, Default)]
pub struct Av1ConfigBox {
    pub seq_profile: u8,
    pub seq_level_idx_0: u8,
    pub seq_tier_0: bool,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: bool,
    pub chroma_subsampling_y: bool,
    pub chroma_sample_position: u8,
    pub initial_presentation_delay_present: bool,
    pub initial_presentation_delay_minus_one: u8,
    /// Opaque OBU tail, typically the sequence header.
    pub config_obus: TryVec<u8>,
}

impl Av1ConfigBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let b = src.read_u8()?;
        if b != 0x81 {
            return Err(Error::InvalidData("av1C marker/version"));
        }
        let b = src.read_u8()?;
        let seq_profile = b >> 5;
        let seq_level_idx_0 = b & 0x1f;
        let b = src.read_u8()?;
        let seq_tier_0 = b >> 7 == 1;
        let high_bitdepth = (b >> 6) & 1 == 1;
        let twelve_bit = (b >> 5) & 1 == 1;
        let monochrome = (b >> 4) & 1 == 1;
        let chroma_subsampling_x = (b >> 3) & 1 == 1;
        let chroma_subsampling_y = (b >> 2) & 1 == 1;
        let chroma_sample_position = b & 0x03;
        let b = src.read_u8()?;
        let initial_presentation_delay_present = (b >> 4) & 1 == 1;
        let initial_presentation_delay_minus_one = b & 0x0f;
        let config_obus = src.read_into_try_vec()?;
        Ok(Self {
            seq_profile,
            seq_level_idx_0,
            seq_tier_0,
            high_bitdepth,
            twelve_bit,
            monochrome,
            chroma_subsampling_x,
            chroma_subsampling_y,
            chroma_sample_position,
            initial_presentation_delay_present,
            initial_presentation_delay_minus_one,
            config_obus,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::Av1ConfigBox)?;
        w.u8(0x81)?;
        w.u8((self.seq_profile & 0x07) << 5 | (self.seq_level_idx_0 & 0x1f))?;
        w.u8(u8::from(self.seq_tier_0) << 7
            | u8::from(self.high_bitdepth) << 6
            | u8::from(self.twelve_bit) << 5
            | u8::from(self.monochrome) << 4
            | u8::from(self.chroma_subsampling_x) << 3
            | u8::from(self.chroma_subsampling_y) << 2
            | (self.chroma_sample_position & 0x03))?;
        w.u8(u8::from(self.initial_presentation_delay_present) << 4
            | (self.initial_presentation_delay_minus_one & 0x0f))?;
        w.bytes(&self.config_obus)?;
        w.end_box(b)
    }
}

/// VVC codec configuration record.
///
/// Only the fixed prefix is decoded; the PTL record and NAL unit arrays stay
/// in `config_bytes` and round-trip byte-exact.
#[derive(Debug, PartialEq)]
pub struct VvcConfigBox {
    pub configuration_version: u8,
    pub avg_frame_rate_times_256: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    /// Bytes per NAL unit length prefix (1, 2 or 4).
    pub length_size: u8,
    pub ptl_present: bool,
    pub config_bytes: TryVec<u8>,
}

impl VvcConfigBox {
    pub(crate) fn parse(src: &mut BMFFBox<'_>) -> Result<Self> {
        let configuration_version = src.read_u8()?;
        let avg_frame_rate_times_256 = src.read_u16()?;
        let b = src.read_u8()?;
        let constant_frame_rate = b >> 6;
        let num_temporal_layers = (b >> 3) & 0x07;
        let length_size = ((b >> 1) & 0x03) + 1;
        let ptl_present = b & 1 == 1;
        let config_bytes = src.read_into_try_vec()?;
        Ok(Self {
            configuration_version,
            avg_frame_rate_times_256,
            constant_frame_rate,
            num_temporal_layers,
            length_size,
            ptl_present,
            config_bytes,
        })
    }

    pub(crate) fn write(&self, w: &mut BoxWriter) -> Result<()> {
        let b = w.begin_box(BoxType::VvcConfigBox)?;
        w.u8(self.configuration_version)?;
        w.u16(self.avg_frame_rate_times_256)?;
        w.u8((self.constant_frame_rate & 0x03) << 6
            | (self.num_temporal_layers & 0x07) << 3
            | (self.length_size.wrapping_sub(1) & 0x03) << 1
            | u8::from(self.ptl_present))?;
        w.bytes(&self.config_bytes)?;
        w.end_box(b)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four-character codes and the registry of known box types.

use std::fmt;

macro_rules! box_database {
    ($($boxenum:ident $boxtype:expr),*,) => {
        /// The known box types, with a fallthrough for everything else.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum BoxType {
            $($boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(t: BoxType) -> u32 {
                use self::BoxType::*;
                match t {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                write!(f, "{fourcc}")
            }
        }
    }
}

box_database!(
    FileTypeBox                  0x6674_7970, // "ftyp"
    MetadataBox                  0x6d65_7461, // "meta"
    HandlerBox                   0x6864_6c72, // "hdlr"
    PrimaryItemBox               0x7069_746d, // "pitm"
    ItemInfoBox                  0x6969_6e66, // "iinf"
    ItemInfoEntry                0x696e_6665, // "infe"
    ItemLocationBox              0x696c_6f63, // "iloc"
    ItemReferenceBox             0x6972_6566, // "iref"
    ItemPropertiesBox            0x6970_7270, // "iprp"
    ItemPropertyContainerBox     0x6970_636f, // "ipco"
    ItemPropertyAssociationBox   0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox       0x6973_7065, // "ispe"
    PixelAspectRatioBox          0x7061_7370, // "pasp"
    PixelInformationBox          0x7069_7869, // "pixi"
    ColourInformationBox         0x636f_6c72, // "colr"
    AuxiliaryTypeBox             0x6175_7843, // "auxC"
    RotationBox                  0x6972_6f74, // "irot"
    MirrorBox                    0x696d_6972, // "imir"
    CleanApertureBox             0x636c_6170, // "clap"
    LayerSelectorBox             0x6c73_656c, // "lsel"
    OperatingPointBox            0x6131_6f70, // "a1op"
    LayerSizesBox                0x6131_6c78, // "a1lx"
    ContentLightLevelBox         0x636c_6c69, // "clli"
    MasteringDisplayBox          0x6d64_6376, // "mdcv"
    UserDescriptionBox           0x7564_6573, // "udes"
    HevcConfigBox                0x6876_6343, // "hvcC"
    Av1ConfigBox                 0x6176_3143, // "av1C"
    VvcConfigBox                 0x7676_6343, // "vvcC"
    ItemDataBox                  0x6964_6174, // "idat"
    GroupListBox                 0x6772_706c, // "grpl"
    DataInformationBox           0x6469_6e66, // "dinf"
    DataReferenceBox             0x6472_6566, // "dref"
    DataEntryUrlBox              0x7572_6c20, // "url "
    MediaDataBox                 0x6d64_6174, // "mdat"
    UuidBox                      0x7575_6964, // "uuid"
);

impl BoxType {
    /// Whether this box type holds child boxes (possibly after a fixed
    /// prelude, like the `iinf` entry count).
    pub fn is_container(self) -> bool {
        matches!(
            self,
            Self::MetadataBox
                | Self::ItemPropertiesBox
                | Self::ItemPropertyContainerBox
                | Self::ItemInfoBox
                | Self::DataInformationBox
                | Self::DataReferenceBox
        )
    }
}

/// A four-character code: four ASCII bytes read big-endian.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC(pub [u8; 4]);

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self(number.to_be_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> u32 {
        u32::from_be_bytes(fourcc.0)
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        Self::from(u32::from(t))
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.0 == **other
    }
}

impl PartialEq<[u8; 4]> for FourCC {
    fn eq(&self, other: &[u8; 4]) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for FourCC {
    /// Printable codes render as text, anything else as hex escapes.
    /// Non-printable type bytes are a logging concern only, never a
    /// parse failure.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in &self.0 {
            if (0x20..0x7f).contains(&b) {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-tree tests over hand-built streams: parse/write round trips,
//! authored files with patched item locations, and the cross-box queries.

use zenheif_bmff::codec::{Av1ConfigBox, HevcConfigBox, VvcConfigBox};
use zenheif_bmff::meta::{
    ConstructionMethod, DataEntryUrlBox, EntityGroup, FileTypeBox, GroupListBox, HandlerBox,
    ItemInfoEntry, ItemLocationBox, ItemReferenceBox, PrimaryItemBox,
};
use zenheif_bmff::props::{
    AuxiliaryTypeBox, CleanApertureBox, ColourInformation, ColourInformationBox,
    ContentLightLevelBox, ImageSpatialExtentsBox, ItemPropertyAssociationBox, LayerSelectorBox,
    LayerSizesBox, MasteringDisplayBox, MirrorAxis, MirrorBox, NclxColourProfile,
    OperatingPointBox, PixelAspectRatioBox, PixelInformationBox, PropertyAssociation,
    RotationBox, UserDescriptionBox,
};
use zenheif_bmff::{BoxData, BoxTree, BoxType, Error, FourCC, HeifBox, TryVec};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn node(data: BoxData) -> HeifBox {
    HeifBox::new(data).expect("typed payload")
}

fn try_vec(bytes: &[u8]) -> TryVec<u8> {
    let mut v = TryVec::new();
    v.extend_from_slice(bytes).unwrap();
    v
}

/// ftyp, then a meta box assembled from the given children.
fn tree_with_meta(meta_children: Vec<HeifBox>) -> BoxTree {
    let mut tree = BoxTree::new();
    let ftyp = FileTypeBox::new(
        FourCC(*b"heic"),
        0,
        &[FourCC(*b"mif1"), FourCC(*b"heic")],
    )
    .unwrap();
    tree.push(node(BoxData::FileType(ftyp))).unwrap();
    let mut meta = node(BoxData::Metadata);
    for child in meta_children {
        meta.push_child(child).unwrap();
    }
    tree.push(meta).unwrap();
    tree
}

fn infe(item_id: u32, item_type: &[u8; 4]) -> HeifBox {
    node(BoxData::ItemInfoEntry(ItemInfoEntry {
        item_id,
        item_type: FourCC(*item_type),
        ..Default::default()
    }))
}

fn iinf_with(entries: Vec<HeifBox>) -> HeifBox {
    let mut iinf = node(BoxData::ItemInfo);
    for e in entries {
        iinf.push_child(e).unwrap();
    }
    iinf
}

fn iprp_with(props: Vec<HeifBox>, ipma: ItemPropertyAssociationBox) -> HeifBox {
    let mut iprp = node(BoxData::ItemProperties);
    let mut ipco = node(BoxData::ItemPropertyContainer);
    for p in props {
        ipco.push_child(p).unwrap();
    }
    iprp.push_child(ipco).unwrap();
    iprp.push_child(node(BoxData::ItemPropertyAssociation(ipma))).unwrap();
    iprp
}

// Spec scenario: a 24-byte ftyp parses to its fields and writes back
// identically.
#[test]
fn ftyp_parses_and_writes_identically() {
    init_logs();
    let input: &[u8] = &[
        0x00, 0x00, 0x00, 0x18, 0x66, 0x74, 0x79, 0x70, 0x68, 0x65, 0x69, 0x63, 0x00, 0x00,
        0x00, 0x00, 0x6d, 0x69, 0x66, 0x31, 0x68, 0x65, 0x69, 0x63,
    ];
    let mut tree = BoxTree::parse(input).unwrap();
    let ftyp = tree.ftyp().unwrap();
    assert_eq!(ftyp.major_brand, b"heic");
    assert_eq!(ftyp.minor_version, 0);
    assert_eq!(ftyp.compatible_brands[..], [FourCC(*b"mif1"), FourCC(*b"heic")]);
    assert!(ftyp.has_compatible_brand(FourCC(*b"mif1")));

    let out = tree.write_to_vec().unwrap();
    assert_eq!(&*out, input);
}

// Spec scenario: an authored iloc entry points at the payload bytes placed
// after the box, and reading them back yields the appended data.
#[test]
fn authored_item_location_is_patched_and_resolvable() {
    init_logs();
    let payload = [0xaa, 0xbb, 0xcc];

    let mut iloc = ItemLocationBox::default();
    iloc.append_data(1, &payload, ConstructionMethod::File).unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::Handler(HandlerBox::default())),
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"hvc1")]),
        node(BoxData::ItemLocation(iloc)),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();

    assert_eq!(parsed.primary_item_id(), Some(1));
    assert_eq!(parsed.handler_type(), Some(FourCC(*b"pict")));
    assert_eq!(parsed.item_data(1).unwrap(), payload.as_ref());

    // The patched offset addresses the payload bytes directly, within the
    // bounds of the produced file.
    let item = &parsed.iloc().unwrap().items[0];
    let offset = usize::try_from(item.base_offset + item.extents[0].offset).unwrap();
    assert_eq!(item.extents[0].length, 3);
    assert!(offset + 3 <= out.len());
    assert_eq!(&out[offset..offset + 3], &payload);
}

#[test]
fn multiple_extents_concatenate_in_order() {
    init_logs();
    let mut iloc = ItemLocationBox::default();
    iloc.append_data(1, &[1, 2], ConstructionMethod::File).unwrap();
    iloc.append_data(1, &[3, 4, 5], ConstructionMethod::File).unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"av01")]),
        node(BoxData::ItemLocation(iloc)),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();
    assert_eq!(parsed.item_data(1).unwrap(), [1, 2, 3, 4, 5].as_ref());
    assert_eq!(parsed.iloc().unwrap().items[0].extents.len(), 2);
}

#[test]
fn inline_items_land_in_idat() {
    init_logs();
    let mut iloc = ItemLocationBox::default();
    iloc.append_data(2, b"exif-ish bytes", ConstructionMethod::Idat).unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 2 })),
        iinf_with(vec![infe(2, b"mime")]),
        node(BoxData::ItemLocation(iloc)),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();
    assert_eq!(parsed.item_data(2).unwrap(), b"exif-ish bytes".as_ref());

    // The extent stays within the idat body.
    let meta = parsed.meta().unwrap();
    let idat = meta.child(BoxType::ItemDataBox).expect("idat box created");
    match &idat.data {
        BoxData::ItemData(d) => {
            let item = &parsed.iloc().unwrap().items[0];
            assert_eq!(item.construction_method, ConstructionMethod::Idat);
            let extent = &item.extents[0];
            assert!(extent.offset + extent.length <= d.data.len() as u64);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

// Spec scenario: associations resolve in association order, not ipco
// sibling order, and the essential bit is queryable per property.
#[test]
fn property_resolution_follows_association_order() {
    init_logs();
    let mut ipma = ItemPropertyAssociationBox::default();
    ipma.add_property_for_item(1, PropertyAssociation { essential: false, property_index: 1 })
        .unwrap();
    ipma.add_property_for_item(1, PropertyAssociation { essential: true, property_index: 2 })
        .unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"hvc1")]),
        iprp_with(
            vec![
                node(BoxData::ImageSpatialExtents(ImageSpatialExtentsBox {
                    width: 100,
                    height: 50,
                })),
                node(BoxData::HevcConfig(HevcConfigBox::default())),
                node(BoxData::Rotation(RotationBox::new(90).unwrap())),
            ],
            ipma,
        ),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();

    let props = parsed.properties_for_item(1).unwrap();
    assert_eq!(props.len(), 2);
    assert_eq!(props[0].box_type(), BoxType::ImageSpatialExtentsBox);
    assert_eq!(props[1].box_type(), BoxType::HevcConfigBox);

    assert!(parsed.property_for_item(1, BoxType::RotationBox).is_none());
    let hvcc = parsed.property_for_item(1, BoxType::HevcConfigBox).unwrap();
    assert_eq!(parsed.is_property_essential_for_item(1, hvcc), Some(true));
    let ispe = parsed.property_for_item(1, BoxType::ImageSpatialExtentsBox).unwrap();
    assert_eq!(parsed.is_property_essential_for_item(1, ispe), Some(false));

    parsed.check_essential_properties(1).unwrap();
}

// Spec scenario: an item whose essential property is not understood is
// undecodable; items without such a property are unaffected.
#[test]
fn unknown_essential_property_rejects_item() {
    init_logs();
    let mut ipma = ItemPropertyAssociationBox::default();
    ipma.add_property_for_item(1, PropertyAssociation { essential: true, property_index: 1 })
        .unwrap();
    ipma.add_property_for_item(2, PropertyAssociation { essential: false, property_index: 1 })
        .unwrap();

    let mystery = HeifBox::new_unknown(u32::from_be_bytes(*b"frob"), try_vec(&[1, 2, 3]));
    let mut tree = tree_with_meta(vec![
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"av01"), infe(2, b"av01")]),
        iprp_with(vec![mystery], ipma),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();

    assert!(matches!(
        parsed.check_essential_properties(1),
        Err(Error::InvalidEssentialProperty(1))
    ));
    parsed.check_essential_properties(2).unwrap();
}

// Spec scenario: an unrecognized box survives parse → write byte-exact.
#[test]
fn unknown_top_level_box_copies_through() {
    init_logs();
    let input: &[u8] = &[
        0x00, 0x00, 0x00, 0x0c, b'x', b'x', b'x', b'x', 0xde, 0xad, 0xbe, 0xef,
    ];
    let mut tree = BoxTree::parse(input).unwrap();
    match &tree.boxes[0].data {
        BoxData::Unknown(u) => assert_eq!(u.data, [0xde, 0xad, 0xbe, 0xef].as_ref()),
        other => panic!("unexpected payload {other:?}"),
    }
    let out = tree.write_to_vec().unwrap();
    assert_eq!(&*out, input);
}

// Spec scenario: an iloc whose body ends before its declared extents
// reports EndOfData instead of crashing; the bytes before it still parse.
#[test]
fn truncated_iloc_reports_end_of_data() {
    init_logs();
    let mut w = zenheif_bmff::BoxWriter::new();
    let m = w.begin_full_box(BoxType::MetadataBox, 0, 0).unwrap();
    let p = w.begin_full_box(BoxType::PrimaryItemBox, 0, 0).unwrap();
    w.u16(1).unwrap();
    w.end_box(p).unwrap();
    let marker = w.position();
    let l = w.begin_full_box(BoxType::ItemLocationBox, 1, 0).unwrap();
    w.u8(0x44).unwrap(); // offset/length size 4
    w.u8(0x00).unwrap();
    w.u16(1).unwrap(); // item count
    w.u16(7).unwrap(); // item id
    w.u16(0).unwrap(); // construction method
    w.u16(0).unwrap(); // data reference index
    w.u16(4).unwrap(); // four declared extents...
    for _ in 0..3 {
        w.u32(0).unwrap();
        w.u32(5).unwrap();
    }
    w.end_box(l).unwrap(); // ...but the body holds three
    w.end_box(m).unwrap();
    let bytes = w.into_inner();

    assert!(matches!(BoxTree::parse(&bytes), Err(Error::EndOfData)));

    // The sibling before the malformed box is intact and parseable.
    let mut prefix = try_vec(&bytes[..usize::try_from(marker).unwrap()]);
    prefix[..4].copy_from_slice(&u32::try_from(marker).unwrap().to_be_bytes());
    let tree = BoxTree::parse(&prefix).unwrap();
    assert_eq!(tree.primary_item_id(), Some(1));
}

#[test]
fn size_zero_box_extends_to_end_of_file() {
    init_logs();
    let mut bytes = vec![0, 0, 0, 0];
    bytes.extend_from_slice(b"mdat");
    bytes.extend_from_slice(&[0x11, 0x22, 0x33]);
    let mut tree = BoxTree::parse(&bytes).unwrap();
    match &tree.boxes[0].data {
        BoxData::MediaData(m) => assert_eq!(m.data, [0x11, 0x22, 0x33].as_ref()),
        other => panic!("unexpected payload {other:?}"),
    }
    // The rewrite gets a concrete size and still re-parses.
    let out = tree.write_to_vec().unwrap();
    let reparsed = BoxTree::parse(&out).unwrap();
    assert_eq!(tree, reparsed);
}

#[test]
fn item_references_resolve_by_kind() {
    init_logs();
    let mut iref = ItemReferenceBox::default();
    iref.add_reference(1, FourCC(*b"dimg"), &[2, 3]).unwrap();
    iref.add_reference(4, FourCC(*b"thmb"), &[1]).unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"grid"), infe(2, b"av01"), infe(3, b"av01"), infe(4, b"av01")]),
        node(BoxData::ItemReference(iref)),
    ]);

    let out = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&out).unwrap();

    let tiles: Vec<u32> = parsed.references_for_item(1, FourCC(*b"dimg")).collect();
    assert_eq!(tiles, [2, 3]);
    assert_eq!(parsed.references_from_item(4).count(), 1);
    assert_eq!(parsed.references_for_item(1, FourCC(*b"thmb")).count(), 0);
}

/// A tree exercising every supported payload, for the full-fidelity
/// round trip below.
fn kitchen_sink_tree() -> BoxTree {
    let mut hvcc = HevcConfigBox {
        general_profile_idc: 1,
        general_level_idc: 120,
        chroma_format: 1,
        bit_depth_luma: 8,
        bit_depth_chroma: 8,
        temporal_id_nested: true,
        ..Default::default()
    };
    hvcc.append_nal_data(&[0x40, 0x01, 0x0c]).unwrap();
    hvcc.append_nal_data(&[0x42, 0x01, 0x01]).unwrap();

    let mut av1c = Av1ConfigBox {
        seq_profile: 0,
        seq_level_idx_0: 8,
        ..Default::default()
    };
    av1c.config_obus.extend_from_slice(&[0x0a, 0x0e]).unwrap();

    let vvcc = VvcConfigBox {
        configuration_version: 1,
        avg_frame_rate_times_256: 0,
        constant_frame_rate: 0,
        num_temporal_layers: 1,
        length_size: 4,
        ptl_present: false,
        config_bytes: try_vec(&[0x00]),
    };

    let mut pixi = PixelInformationBox::default();
    pixi.bits_per_channel.push(8);
    pixi.bits_per_channel.push(8);
    pixi.bits_per_channel.push(8);

    let mut udes = UserDescriptionBox::default();
    udes.lang.extend_from_slice(b"en-AU").unwrap();
    udes.name.extend_from_slice(b"Sample").unwrap();

    let props = vec![
        node(BoxData::ImageSpatialExtents(ImageSpatialExtentsBox { width: 640, height: 480 })),
        node(BoxData::HevcConfig(hvcc)),
        node(BoxData::Av1Config(av1c)),
        node(BoxData::VvcConfig(vvcc)),
        node(BoxData::PixelAspectRatio(PixelAspectRatioBox { h_spacing: 1, v_spacing: 1 })),
        node(BoxData::PixelInformation(pixi)),
        node(BoxData::ColourInformation(ColourInformationBox {
            profile: ColourInformation::Nclx(NclxColourProfile {
                colour_primaries: 1,
                transfer_characteristics: 13,
                matrix_coefficients: 6,
                full_range_flag: true,
            }),
        })),
        node(BoxData::Rotation(RotationBox::new(270).unwrap())),
        node(BoxData::Mirror(MirrorBox { axis: MirrorAxis::Horizontal })),
        node(BoxData::CleanAperture(CleanApertureBox::from_dimensions(600, 400, 640, 480).unwrap())),
        node(BoxData::LayerSelector(LayerSelectorBox { layer_id: 1 })),
        node(BoxData::OperatingPoint(OperatingPointBox { op_index: 0 })),
        node(BoxData::LayerSizes(LayerSizesBox { layer_sizes: [100, 200, 0] })),
        node(BoxData::ContentLightLevel(ContentLightLevelBox {
            max_content_light_level: 1000,
            max_pic_average_light_level: 400,
        })),
        node(BoxData::MasteringDisplay(MasteringDisplayBox {
            display_primaries: [(8500, 39850), (6550, 2300), (35400, 14600)],
            white_point: (15635, 16450),
            max_display_mastering_luminance: 10_000_000,
            min_display_mastering_luminance: 50,
        })),
        node(BoxData::UserDescription(udes)),
        node(BoxData::AuxiliaryType(
            AuxiliaryTypeBox::new("urn:mpeg:mpegB:cicp:systems:auxiliary:alpha", &[]).unwrap(),
        )),
    ];

    let mut ipma = ItemPropertyAssociationBox::default();
    for index in 1..=4u16 {
        ipma.add_property_for_item(
            1,
            PropertyAssociation { essential: index == 2, property_index: index },
        )
        .unwrap();
    }
    ipma.add_property_for_item(2, PropertyAssociation { essential: false, property_index: 17 })
        .unwrap();

    let mut alpha_infe = ItemInfoEntry {
        item_id: 2,
        item_type: FourCC(*b"hvc1"),
        hidden: true,
        ..Default::default()
    };
    alpha_infe.item_name.extend_from_slice(b"alpha").unwrap();

    let mut mime_infe = ItemInfoEntry {
        item_id: 3,
        item_type: FourCC(*b"mime"),
        ..Default::default()
    };
    mime_infe.content_type.extend_from_slice(b"application/rdf+xml").unwrap();

    let mut iref = ItemReferenceBox::default();
    iref.add_reference(2, FourCC(*b"auxl"), &[1]).unwrap();
    iref.add_reference(3, FourCC(*b"cdsc"), &[1]).unwrap();

    let mut grpl = GroupListBox::default();
    let mut entity_ids = TryVec::new();
    entity_ids.push(1).unwrap();
    entity_ids.push(2).unwrap();
    grpl.groups
        .push(EntityGroup { group_type: FourCC(*b"altr"), group_id: 100, entity_ids })
        .unwrap();

    let mut dinf = node(BoxData::DataInformation);
    let mut dref = node(BoxData::DataReference);
    dref.push_child(node(BoxData::DataEntryUrl(DataEntryUrlBox::default()))).unwrap();
    dinf.push_child(dref).unwrap();

    let mut iloc = ItemLocationBox::default();
    iloc.append_data(1, &[0x26, 0x01, 0xaf, 0x78], ConstructionMethod::File).unwrap();
    iloc.append_data(2, &[0x26, 0x01, 0x99], ConstructionMethod::File).unwrap();
    iloc.append_data(3, b"<x:xmpmeta/>", ConstructionMethod::Idat).unwrap();

    let mut tree = tree_with_meta(vec![
        node(BoxData::Handler(HandlerBox::default())),
        node(BoxData::PrimaryItem(PrimaryItemBox { item_id: 1 })),
        iinf_with(vec![infe(1, b"hvc1"), node(BoxData::ItemInfoEntry(alpha_infe)),
            node(BoxData::ItemInfoEntry(mime_infe))]),
        node(BoxData::ItemReference(iref)),
        iprp_with(props, ipma),
        node(BoxData::ItemLocation(iloc)),
        node(BoxData::GroupList(grpl)),
        dinf,
    ]);
    tree.push(HeifBox::new_unknown(
        u32::from_be_bytes(*b"skip"),
        try_vec(&[0x00, 0x01, 0x02]),
    ))
    .unwrap();
    tree
}

// The round-trip invariant: write → parse → write again is structurally
// stable and byte-stable.
#[test]
fn full_tree_roundtrip_is_stable() {
    init_logs();
    let mut tree = kitchen_sink_tree();
    let first = tree.write_to_vec().unwrap();

    let mut parsed = BoxTree::parse(&first).unwrap();
    let second = parsed.write_to_vec().unwrap();
    assert_eq!(&*first, &*second);

    let reparsed = BoxTree::parse(&second).unwrap();
    assert_eq!(parsed, reparsed);
}

#[test]
fn full_tree_queries_after_roundtrip() {
    init_logs();
    let mut tree = kitchen_sink_tree();
    let bytes = tree.write_to_vec().unwrap();
    let parsed = BoxTree::parse(&bytes).unwrap();

    assert_eq!(parsed.primary_item_id(), Some(1));
    assert_eq!(parsed.item_data(1).unwrap(), [0x26, 0x01, 0xaf, 0x78].as_ref());
    assert_eq!(parsed.item_data(2).unwrap(), [0x26, 0x01, 0x99].as_ref());
    assert_eq!(parsed.item_data(3).unwrap(), b"<x:xmpmeta/>".as_ref());

    let info = parsed.item_info(2).unwrap();
    assert!(info.hidden);
    assert_eq!(info.item_name, b"alpha".as_ref());
    let mime = parsed.item_info(3).unwrap();
    assert_eq!(mime.content_type, b"application/rdf+xml".as_ref());

    let nclx = parsed.nclx_for_item(1).unwrap();
    assert_eq!(nclx.colour_primaries, 1);
    assert_eq!(nclx.transfer_characteristics, 13);
    assert!(nclx.full_range_flag);

    let aux_sources: Vec<u32> = parsed.references_for_item(2, FourCC(*b"auxl")).collect();
    assert_eq!(aux_sources, [1]);

    let groups: Vec<&EntityGroup> = parsed.entity_groups().collect();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_id, 100);
    assert_eq!(groups[0].entity_ids[..], [1, 2]);

    // Property order matches the association list.
    let props = parsed.properties_for_item(1).unwrap();
    let kinds: Vec<BoxType> = props.iter().map(|p| p.box_type()).collect();
    assert_eq!(
        kinds,
        [
            BoxType::ImageSpatialExtentsBox,
            BoxType::HevcConfigBox,
            BoxType::Av1ConfigBox,
            BoxType::VvcConfigBox,
        ]
    );

    // Item 2's association points at a property the container holds.
    let aux = parsed.property_for_item(2, BoxType::AuxiliaryTypeBox).unwrap();
    match &aux.data {
        BoxData::AuxiliaryType(a) => {
            assert_eq!(a.aux_type(), b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn oversized_child_box_is_rejected() {
    init_logs();
    // A meta box whose child claims more bytes than the parent holds.
    let mut bytes = vec![0, 0, 0, 24];
    bytes.extend_from_slice(b"meta");
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(&[0, 0, 1, 0]); // child size 256
    bytes.extend_from_slice(b"pitm");
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    assert!(matches!(BoxTree::parse(&bytes), Err(Error::EndOfData)));
}

#[test]
fn garbage_input_does_not_parse() {
    init_logs();
    assert!(BoxTree::parse(&[0x01]).is_err());
    assert!(BoxTree::parse(&[0xff; 64]).is_err());
    // An empty stream is an empty tree, not an error.
    assert!(BoxTree::parse(&[]).unwrap().boxes.is_empty());
}

#![no_main]

use libfuzzer_sys::fuzz_target;
use zenheif_bmff::BoxTree;

/// Parsing and the item queries must never panic or overread on arbitrary
/// input.
fuzz_target!(|data: &[u8]| {
    if let Ok(tree) = BoxTree::parse(data) {
        if let Some(id) = tree.primary_item_id() {
            let _ = tree.check_essential_properties(id);
            let _ = tree.properties_for_item(id);
            let _ = tree.item_data(id);
        }
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use zenheif_bmff::BoxTree;

/// Anything that parses must serialize again, and the result must re-parse
/// to an equal tree.
fuzz_target!(|data: &[u8]| {
    if let Ok(mut tree) = BoxTree::parse(data) {
        if let Ok(bytes) = tree.write_to_vec() {
            let reparsed = BoxTree::parse(&bytes).expect("rewritten stream must parse");
            assert_eq!(tree, reparsed);
        }
    }
});

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dump the box tree of a HEIF/AVIF file.

use std::env;
use std::fs::File;
use std::process;

use zenheif_bmff::BoxTree;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <heif-or-avif-file>", args[0]);
        process::exit(1);
    }

    let path = &args[1];
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("{path}: {err}");
            process::exit(1);
        }
    };

    match BoxTree::from_reader(&mut f) {
        Ok(tree) => print!("{}", tree.dump()),
        Err(err) => {
            eprintln!("{path}: parse failed: {err}");
            process::exit(1);
        }
    }
}

//! Minimal mosaicking example: blend every DEM passed on the command line
//! into a single-tile mosaic next to the first input.
//!
//! Run with: cargo run --example basic -- a.tif b.tif

use demblend::{Mosaic, MosaicConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dem_files: Vec<_> = std::env::args().skip(1).map(Into::into).collect();
    if dem_files.is_empty() {
        eprintln!("usage: basic <dem.tif> [dem.tif ...]");
        std::process::exit(1);
    }

    let config = MosaicConfig {
        dem_files,
        output_prefix: "blended".into(),
        threads: 4,
        ..MosaicConfig::default()
    };

    let mosaic = Mosaic::open(&config)?;
    println!(
        "The size of the mosaic is {} x {} pixels.",
        mosaic.cols(),
        mosaic.rows()
    );

    for path in mosaic.run()? {
        println!("Writing: {}", path.display());
    }
    Ok(())
}

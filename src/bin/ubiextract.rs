//! Extract UBI volumes from a raw NAND dump or image file.
//!
//! Every reconstructable volume of every image lands at
//! `<output-dir>/<image-seq>/<volume-name>`. Exit codes: 0 when at least one
//! volume was extracted, 1 when nothing could be reconstructed, 2 on argument
//! or I/O errors. Partial success is the expected common case for real-world
//! dumps, so per-image failures are reported on stderr without stopping the
//! run.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use ubi_reader::ubi::{ImageContent, Ubi, UbiError, Volume};

#[derive(Parser, Debug)]
#[clap(name = "ubiextract", about = "Extract UBI volumes from a raw flash dump")]
struct Cli {
    /// Raw UBI image or NAND dump to read
    source: PathBuf,

    /// Directory to place extracted volumes in
    output_dir: PathBuf,

    /// Only extract the volume with this ID
    #[clap(long)]
    volume: Option<u32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("ubiextract: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    let mut file = File::open(&cli.source)
        .with_context(|| format!("cannot open {}", cli.source.display()))?;

    let ubi = match Ubi::scan(&mut file) {
        Ok(ubi) => ubi,
        Err(UbiError::Io(err)) => {
            return Err(err).with_context(|| format!("cannot read {}", cli.source.display()))
        }
        Err(err) => {
            // Not a UBI image (or too damaged to even size up the blocks).
            eprintln!("ubiextract: {err}");
            return Ok(false);
        }
    };

    let census = ubi.census();
    println!(
        "PEB size {}, LEB size {}, {} PEBs ({} layout, {} data, {} internal, {} unknown)",
        ubi.geometry.peb_size,
        ubi.geometry.leb_size,
        ubi.geometry.peb_count,
        census.layout,
        census.data,
        census.internal,
        census.unknown,
    );

    let mut extracted = 0usize;

    for image in &ubi.images {
        let volumes = match &image.content {
            ImageContent::Volumes(volumes) => volumes,
            ImageContent::Unreconstructible(reason) => {
                eprintln!(
                    "image {:#010x} (PEBs {}-{}): {reason}",
                    image.image_seq, image.peb_range[0], image.peb_range[1],
                );
                continue;
            }
        };

        for volume in volumes {
            if cli.volume.is_some_and(|id| id != volume.vol_id) {
                continue;
            }

            let dir = cli.output_dir.join(image.image_seq.to_string());
            fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
            let path = dir.join(volume_file_name(volume));

            let mut out = File::create(&path)
                .with_context(|| format!("cannot create {}", path.display()))?;

            match ubi.reader(&mut file, volume).extract_to(&mut out) {
                Ok(total) => {
                    println!(
                        "volume {} ({} bytes) -> {}",
                        volume.vol_id,
                        total,
                        path.display(),
                    );
                    extracted += 1;
                }
                Err(mismatch @ UbiError::VolumeChecksumMismatch { .. }) => {
                    // The bytes are all there; integrity is the caller's call.
                    eprintln!("volume {}: {mismatch}", volume.vol_id);
                    println!("volume {} -> {} (checksum mismatch)", volume.vol_id, path.display());
                    extracted += 1;
                }
                Err(UbiError::Io(err)) => {
                    return Err(err)
                        .with_context(|| format!("I/O error extracting volume {}", volume.vol_id))
                }
                Err(err) => eprintln!("volume {}: {err}", volume.vol_id),
            }
        }
    }

    Ok(extracted > 0)
}

/// Volume names come off the flash; keep only something safe to use as a file
/// name.
fn volume_file_name(volume: &Volume) -> String {
    let name: String = volume
        .name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0' | ':'))
        .collect();

    if name.is_empty() || name == "." || name == ".." {
        format!("volume_{}", volume.vol_id)
    } else {
        name
    }
}

use std::path::Path;

use anyhow::{Context, Result};
use sekai_env::rla::{self, RlaArchive, RlaVersion};

/// Usage: dump_rla <archive.rlh | segment.rla> [version] [--strict]
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let strict = args.iter().any(|arg| arg == "--strict");
    let mut positional = args.iter().filter(|arg| !arg.starts_with("--"));
    let path = positional.next().context("missing input path")?;
    let path = Path::new(path);

    let frames = match path.extension().and_then(|ext| ext.to_str()) {
        Some("rlh") => RlaArchive::open(path)?.read_all(strict)?,
        _ => {
            let version = match positional.next() {
                Some(version) => RlaVersion::parse(version)?,
                None => RlaVersion(1, 6),
            };
            rla::read_rla_file(path, version, strict)?
        }
    };

    let records: usize = frames
        .values()
        .flat_map(|frame| frame.values())
        .map(Vec::len)
        .sum();
    eprintln!("{} ticks, {records} records", frames.len());
    println!("{}", serde_json::to_string_pretty(&frames)?);

    Ok(())
}

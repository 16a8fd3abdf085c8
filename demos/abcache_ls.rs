use anyhow::{Context, Result};
use sekai_env::fs::NodeKind;
use sekai_env::{AssetBundleCache, BundleFs};

/// Usage: abcache_ls <cache.bin> [path] [--update]
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let update = args.iter().any(|arg| arg == "--update");
    let mut positional = args.iter().filter(|arg| !arg.starts_with("--"));
    let cache_path = positional.next().context("missing cache path")?;
    let dir = positional.next().map_or("/", String::as_str);

    let mut cache = AssetBundleCache::load(cache_path)?;
    if update {
        cache.update()?;
    }
    let index = cache.index()?;
    eprintln!(
        "{} {} ({}): {} bundles",
        cache.config.region,
        index.version,
        index.os,
        index.bundles.len()
    );

    let fs = BundleFs::new(cache);
    let info = fs.info(dir)?;
    println!(
        "{}: {} files, {} bytes",
        info.path, info.file_count, info.total_size
    );
    for node in fs.ls(dir)? {
        match node.kind {
            NodeKind::Dir => println!(
                "{:>12}  {}/ ({} items)",
                node.total_size,
                node.name(),
                node.item_count
            ),
            NodeKind::File => println!("{:>12}  {}", node.size, node.name()),
        }
    }

    Ok(())
}

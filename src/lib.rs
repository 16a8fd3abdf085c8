//! Decoders and asset access for the game's live-stream archives, animation
//! clips and asset bundle server.

pub mod animation;
pub mod bitstream;
pub mod cache;
pub mod crypto;
pub mod downloader;
pub mod error;
pub mod fs;
pub mod resolver;
pub mod rla;
pub mod unity;
pub mod utils;

pub use animation::{AnimationHelper, Curve, CurveValue};
pub use cache::{AssetBundleCache, CacheConfig, Region};
pub use downloader::{Downloader, DownloaderConfig};
pub use error::{Error, Result};
pub use fs::{BundleFs, File, FileConfig, NodeInfo};
pub use resolver::{BundleResolver, MemoryResolver};
pub use rla::{RlaVersion, read_rla};

//! Read-only directory view over the bundle name space.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::OnceLock;

use elsa::sync::FrozenMap;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::resolver::BundleResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Absolute path, `/` for the root.
    pub path: String,
    pub kind: NodeKind,
    /// Advertised size of a file, zero for directories.
    pub size: u64,
    /// Immediate children.
    pub item_count: usize,
    /// Files anywhere below, or one for a file.
    pub file_count: usize,
    pub total_size: u64,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

struct Tree {
    nodes: Vec<NodeInfo>,
    children: Vec<Vec<usize>>,
    by_path: FxHashMap<String, usize>,
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn absolute(path: &str) -> String {
    format!("/{path}")
}

impl Tree {
    fn build(bundles: Vec<(String, u64)>) -> Tree {
        let mut files: FxHashMap<String, u64> = FxHashMap::default();
        for (name, size) in bundles {
            let name = normalize(&name);
            if name.is_empty() {
                continue;
            }
            files.insert(name.to_owned(), size);
        }

        let mut dirs = rustc_hash::FxHashSet::default();
        for name in files.keys() {
            let mut rest = name.as_str();
            while let Some((parent, _)) = rest.rsplit_once('/') {
                if !dirs.insert(parent.to_owned()) {
                    break;
                }
                rest = parent;
            }
        }
        for dir in &dirs {
            if files.remove(dir).is_some() {
                tracing::warn!("bundle '{dir}' is also a directory, listing it as one");
            }
        }

        let mut names: Vec<(&str, Option<u64>)> = files
            .iter()
            .map(|(name, size)| (name.as_str(), Some(*size)))
            .chain(dirs.iter().map(|dir| (dir.as_str(), None)))
            .collect();
        names.sort_unstable_by(|(a, _), (b, _)| a.split('/').cmp(b.split('/')));

        let mut nodes = Vec::with_capacity(names.len() + 1);
        let mut parents = Vec::with_capacity(names.len() + 1);
        let mut children = vec![Vec::new()];
        nodes.push(NodeInfo {
            path: "/".into(),
            kind: NodeKind::Dir,
            size: 0,
            item_count: 0,
            file_count: 0,
            total_size: 0,
        });
        parents.push(0);

        // open directories, innermost last
        let mut stack: Vec<(usize, &str)> = vec![(0, "")];
        for (name, size) in names {
            while let Some(&(_, dir)) = stack.last() {
                let inside = dir.is_empty()
                    || name
                        .strip_prefix(dir)
                        .is_some_and(|rest| rest.starts_with('/'));
                if inside {
                    break;
                }
                stack.pop();
            }
            let parent = stack.last().map_or(0, |&(index, _)| index);
            let index = nodes.len();
            nodes.push(NodeInfo {
                path: absolute(name),
                kind: match size {
                    Some(_) => NodeKind::File,
                    None => NodeKind::Dir,
                },
                size: size.unwrap_or(0),
                item_count: 0,
                file_count: usize::from(size.is_some()),
                total_size: size.unwrap_or(0),
            });
            parents.push(parent);
            children.push(Vec::new());
            children[parent].push(index);
            if size.is_none() {
                stack.push((index, name));
            }
        }

        // children come after their parent in depth-first order
        for index in (1..nodes.len()).rev() {
            let (file_count, total_size) = (nodes[index].file_count, nodes[index].total_size);
            let parent = &mut nodes[parents[index]];
            parent.file_count += file_count;
            parent.total_size += total_size;
        }
        for (node, children) in nodes.iter_mut().zip(&children) {
            node.item_count = children.len();
        }

        let by_path = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (normalize(&node.path).to_owned(), index))
            .collect();
        Tree {
            nodes,
            children,
            by_path,
        }
    }

    fn lookup(&self, path: &str) -> Result<usize> {
        self.by_path
            .get(normalize(path))
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no such file or directory '{path}'")))
    }
}

/// A read-only file system whose files are the bundles of `R`.
///
/// The directory tree is built on first use; listings are cached.
pub struct BundleFs<R> {
    pub resolver: R,
    config: FileConfig,
    tree: OnceLock<Tree>,
    listings: FrozenMap<usize, Vec<NodeInfo>>,
}

impl<R: BundleResolver> BundleFs<R> {
    pub fn new(resolver: R) -> Self {
        BundleFs::with_config(resolver, FileConfig::default())
    }

    pub fn with_config(resolver: R, config: FileConfig) -> Self {
        BundleFs {
            resolver,
            config,
            tree: OnceLock::new(),
            listings: FrozenMap::new(),
        }
    }

    fn tree(&self) -> &Tree {
        self.tree
            .get_or_init(|| Tree::build(self.resolver.bundles()))
    }

    pub fn info(&self, path: &str) -> Result<&NodeInfo> {
        let tree = self.tree();
        Ok(&tree.nodes[tree.lookup(path)?])
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree().lookup(path).is_ok()
    }

    /// Immediate children of a directory, in path order.
    pub fn ls(&self, path: &str) -> Result<&[NodeInfo]> {
        let tree = self.tree();
        let index = tree.lookup(path)?;
        if !tree.nodes[index].is_dir() {
            return Err(Error::NotFound(format!("'{path}' is not a directory")));
        }
        if let Some(listing) = self.listings.get(&index) {
            return Ok(listing);
        }
        let listing = tree.children[index]
            .iter()
            .map(|&child| tree.nodes[child].clone())
            .collect();
        Ok(self.listings.insert(index, listing))
    }

    /// Every file below `path` in depth-first order.
    pub fn walk(&self, path: &str) -> Result<Vec<&NodeInfo>> {
        let tree = self.tree();
        let mut pending = vec![tree.lookup(path)?];
        let mut files = Vec::new();
        while let Some(index) = pending.pop() {
            let node = &tree.nodes[index];
            match node.kind {
                NodeKind::File => files.push(node),
                NodeKind::Dir => pending.extend(tree.children[index].iter().rev()),
            }
        }
        Ok(files)
    }

    pub fn open(&self, path: &str) -> Result<File> {
        let node = self.info(path)?;
        if node.is_dir() {
            return Err(Error::NotFound(format!("'{path}' is a directory")));
        }
        let name = normalize(&node.path);
        let reader = self.resolver.open_bundle(name)?;
        Ok(File::new(reader, name, node.size, self.config))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileConfig {
    pub block_size: usize,
    /// Blocks kept behind the read head; older ones are dropped.
    pub max_cached_blocks: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            block_size: 65536,
            max_cached_blocks: 16,
        }
    }
}

/// A forward-only view of a bundle stream.
///
/// Bytes are fetched block by block into a bounded window. Seeking within
/// the window or forward works; seeking before it fails with
/// [`Error::NonSequentialSeek`]. The advertised [`File::size`] may be
/// inaccurate, reads continue until the stream ends.
pub struct File {
    reader: Box<dyn Read + Send>,
    name: String,
    size: u64,
    config: FileConfig,
    blocks: VecDeque<Vec<u8>>,
    first_block: u64,
    fetched: u64,
    pos: u64,
    exhausted: bool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .field("fetched", &self.fetched)
            .finish_non_exhaustive()
    }
}

impl File {
    pub fn new(
        reader: Box<dyn Read + Send>,
        name: impl Into<String>,
        size: u64,
        config: FileConfig,
    ) -> Self {
        File {
            reader,
            name: name.into(),
            size,
            config: FileConfig {
                block_size: config.block_size.max(1),
                max_cached_blocks: config.max_cached_blocks.max(1),
            },
            blocks: VecDeque::new(),
            first_block: 0,
            fetched: 0,
            pos: 0,
            exhausted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised size, not necessarily the length of the stream.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Offset of the first byte still cached.
    fn window_start(&self) -> u64 {
        self.first_block * self.config.block_size as u64
    }

    fn fetch_block(&mut self) -> Result<()> {
        let mut block = Vec::with_capacity(self.config.block_size);
        self.reader
            .by_ref()
            .take(self.config.block_size as u64)
            .read_to_end(&mut block)?;
        if block.len() < self.config.block_size {
            self.exhausted = true;
        }
        if block.is_empty() {
            return Ok(());
        }
        self.fetched += block.len() as u64;
        self.blocks.push_back(block);
        if self.blocks.len() > self.config.max_cached_blocks {
            self.blocks.pop_front();
            self.first_block += 1;
        }
        Ok(())
    }

    /// Fetches blocks until `offset` is cached or the stream ends.
    fn fill_to(&mut self, offset: u64) -> Result<()> {
        while !self.exhausted && self.fetched <= offset {
            self.fetch_block()?;
        }
        Ok(())
    }

    fn check_window(&self, target: u64) -> Result<()> {
        let earliest = self.window_start();
        if target < earliest {
            return Err(Error::NonSequentialSeek { target, earliest });
        }
        Ok(())
    }

    /// Reads into `buf`, returning fewer bytes only at the end of the stream.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            self.check_window(self.pos)?;
            self.fill_to(self.pos)?;
            if self.pos >= self.fetched {
                break;
            }
            let block_size = self.config.block_size as u64;
            let block = &self.blocks[(self.pos / block_size - self.first_block) as usize];
            let offset = (self.pos % block_size) as usize;
            let n = (buf.len() - filled).min(block.len() - offset);
            buf[filled..filled + n].copy_from_slice(&block[offset..offset + n]);
            filled += n;
            self.pos += n as u64;
        }
        Ok(filled)
    }

    /// Reads up to `len` bytes, fewer at the end of the stream.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Moves the read head, fetching every block up to the target.
    pub fn seek_to(&mut self, target: u64) -> Result<u64> {
        self.check_window(target)?;
        self.fill_to(target)?;
        self.pos = target;
        Ok(target)
    }

    /// Drains the stream and returns its actual length.
    pub fn stream_len(&mut self) -> Result<u64> {
        self.fill_to(u64::MAX)?;
        Ok(self.fetched)
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?)
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.stream_len()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        Ok(self.seek_to(target)?)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::resolver::MemoryResolver;

    fn scenario() -> BundleFs<MemoryResolver> {
        let mut resolver = MemoryResolver::new();
        resolver.insert("a/b/x", vec![0; 10]);
        resolver.insert("a/b/y", vec![1; 20]);
        resolver.insert("a/z", vec![2; 30]);
        BundleFs::new(resolver)
    }

    #[test]
    fn directory_sizes() {
        let fs = scenario();
        let ab = fs.info("/a/b").unwrap();
        assert_eq!(ab.kind, NodeKind::Dir);
        assert_eq!((ab.file_count, ab.total_size, ab.item_count), (2, 30, 2));

        let root = fs.info("/").unwrap();
        assert_eq!((root.file_count, root.total_size, root.item_count), (3, 60, 1));
        assert_eq!(fs.info("").unwrap(), root);

        let z = fs.info("a/z").unwrap();
        assert_eq!((z.kind, z.size, z.file_count), (NodeKind::File, 30, 1));
        assert!(matches!(fs.info("/a/q"), Err(Error::NotFound(_))));
    }

    #[test]
    fn listings() {
        let fs = scenario();
        let names: Vec<&str> = fs.ls("/a").unwrap().iter().map(NodeInfo::name).collect();
        assert_eq!(names, ["b", "z"]);
        let paths: Vec<&str> = fs.ls("/a/b").unwrap().iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, ["/a/b/x", "/a/b/y"]);
        assert!(std::ptr::eq(fs.ls("/a").unwrap(), fs.ls("a/").unwrap()));
        assert!(fs.ls("/a/z").is_err());

        let walked: Vec<&str> = fs.walk("/").unwrap().iter().map(|n| n.path.as_str()).collect();
        assert_eq!(walked, ["/a/b/x", "/a/b/y", "/a/z"]);
    }

    #[test]
    fn children_sum_to_parents() {
        let mut resolver = MemoryResolver::new();
        let mut count = 0;
        for _ in 0..300 {
            let depth = fastrand::usize(1..5);
            let name: Vec<String> = (0..depth)
                .map(|_| ["a", "b", "a-b", "c.d", "e_f"][fastrand::usize(..5)].to_owned())
                .collect();
            let name = name.join("/");
            if resolver.contains(&name) {
                continue;
            }
            count += 1;
            resolver.insert_with_size(name, fastrand::u64(..1000), Vec::new());
        }
        let fs = BundleFs::new(resolver);

        let dirs: Vec<NodeInfo> = fs.tree().nodes.iter().filter(|n| n.is_dir()).cloned().collect();
        for dir in dirs {
            let children = fs.ls(&dir.path).unwrap();
            assert_eq!(children.len(), dir.item_count);
            assert_eq!(children.iter().map(|c| c.total_size).sum::<u64>(), dir.total_size);
            assert_eq!(children.iter().map(|c| c.file_count).sum::<usize>(), dir.file_count);
        }

        // names that are also directories are listed as directories only
        let files = fs.walk("/").unwrap().len();
        assert_eq!(fs.info("/").unwrap().file_count, files);
        assert!(files <= count);
    }

    #[test]
    fn reads_whole_files() {
        let fs = scenario();
        let mut file = fs.open("/a/b/y").unwrap();
        assert_eq!(file.size(), 20);
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![1; 20]);
        assert!(matches!(fs.open("/a/b"), Err(Error::NotFound(_))));
    }

    fn numbered(len: usize, config: FileConfig) -> File {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        File::new(Box::new(Cursor::new(data)), "numbered", len as u64, config)
    }

    #[test]
    fn end_of_stream() {
        let mut file = numbered(100, FileConfig {
            block_size: 16,
            max_cached_blocks: 4,
        });
        assert_eq!(file.read_bytes(90).unwrap().len(), 90);
        let tail = file.read_bytes(64).unwrap();
        assert_eq!(tail, (90..100).map(|i| i as u8).collect::<Vec<_>>());
        assert!(file.read_bytes(64).unwrap().is_empty());
        assert_eq!(file.tell(), 100);
    }

    #[test]
    fn advertised_size_is_advisory() {
        let data = vec![7u8; 50];
        let mut file = File::new(Box::new(Cursor::new(data)), "short", 10, FileConfig::default());
        assert_eq!(file.read_bytes(100).unwrap().len(), 50);
        assert_eq!(file.stream_len().unwrap(), 50);
    }

    #[test]
    fn seeks_within_the_window() {
        let config = FileConfig {
            block_size: 8,
            max_cached_blocks: 2,
        };
        let mut file = numbered(64, config);
        assert_eq!(file.read_bytes(4).unwrap(), [0, 1, 2, 3]);
        file.seek(SeekFrom::Current(6)).unwrap();
        assert_eq!(file.read_bytes(2).unwrap(), [10, 11]);
        file.seek(SeekFrom::Start(1)).unwrap();
        assert_eq!(file.read_bytes(1).unwrap(), [1]);

        file.seek(SeekFrom::Start(40)).unwrap();
        assert_eq!(file.read_bytes(1).unwrap(), [40]);
        file.seek(SeekFrom::Start(32)).unwrap();
        let err = file.seek_to(5).unwrap_err();
        assert!(matches!(
            err,
            Error::NonSequentialSeek {
                target: 5,
                earliest: 32
            }
        ));
        let err = file.seek(SeekFrom::Start(0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        assert_eq!(file.seek(SeekFrom::End(-4)).unwrap(), 60);
        assert_eq!(file.read_bytes(10).unwrap(), [60, 61, 62, 63]);
        assert_eq!(file.seek(SeekFrom::Start(1000)).unwrap(), 1000);
        assert!(file.read_bytes(1).unwrap().is_empty());
    }
}

use std::io::{Cursor, Read};

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// A trait abstracting where asset bundles are read from.
pub trait BundleResolver {
    /// Every bundle name with its advertised size.
    fn bundles(&self) -> Vec<(String, u64)>;

    /// Opens the decrypted body stream of a bundle.
    fn open_bundle(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    fn contains(&self, name: &str) -> bool {
        self.bundles().iter().any(|(bundle, _)| bundle == name)
    }
}

impl<T: BundleResolver> BundleResolver for &T {
    fn bundles(&self) -> Vec<(String, u64)> {
        (**self).bundles()
    }

    fn open_bundle(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        (**self).open_bundle(name)
    }
}

/// Bundles held in memory. Sizes are the actual body lengths unless
/// overridden with [`MemoryResolver::insert_with_size`].
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    bundles: IndexMap<String, (u64, Vec<u8>)>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        MemoryResolver::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        let size = data.len() as u64;
        self.bundles.insert(name.into(), (size, data));
    }

    pub fn insert_with_size(&mut self, name: impl Into<String>, size: u64, data: Vec<u8>) {
        self.bundles.insert(name.into(), (size, data));
    }
}

impl FromIterator<(String, Vec<u8>)> for MemoryResolver {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut resolver = MemoryResolver::new();
        for (name, data) in iter {
            resolver.insert(name, data);
        }
        resolver
    }
}

impl BundleResolver for MemoryResolver {
    fn bundles(&self) -> Vec<(String, u64)> {
        self.bundles
            .iter()
            .map(|(name, (size, _))| (name.clone(), *size))
            .collect()
    }

    fn open_bundle(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let (_, data) = self
            .bundles
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("bundle '{name}'")))?;
        Ok(Box::new(Cursor::new(data.clone())))
    }

    fn contains(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }
}

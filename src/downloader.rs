//! Worker pool writing bundle streams to disk.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fs::BundleFs;
use crate::resolver::BundleResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloaderConfig {
    pub workers: usize,
    /// Attempts after the first before a task is reported failed.
    pub retries: u32,
    pub chunk_size: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        DownloaderConfig {
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            retries: 1,
            chunk_size: 64 * 1024,
        }
    }
}

type Opener = Box<dyn FnMut() -> Result<Box<dyn Read + Send>> + Send>;

struct Task {
    dest: PathBuf,
    open: Opener,
}

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    progress: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    failures: Mutex<Vec<Error>>,
}

enum Outcome {
    Done,
    Cancelled,
}

pub struct Downloader {
    config: DownloaderConfig,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        let config = DownloaderConfig {
            workers: config.workers.max(1),
            chunk_size: config.chunk_size.max(1),
            ..config
        };
        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(Shared::default());
        let workers = (0..config.workers)
            .map(|i| {
                let receiver: Receiver<Task> = receiver.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("downloader-{i}"))
                    .spawn(move || {
                        for task in receiver {
                            run(&shared, &config, task);
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Downloader {
            config,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shared,
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Queues a download. `open` is called again for every retry.
    pub fn submit<F, S>(&self, dest: impl Into<PathBuf>, mut open: F) -> Result<()>
    where
        F: FnMut() -> Result<S> + Send + 'static,
        S: Read + Send + 'static,
    {
        let dest = dest.into();
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::DownloaderFailed {
                path: dest,
                attempts: 0,
                reason: "the downloader is shut down".into(),
            });
        };
        let open: Opener =
            Box::new(move || -> Result<Box<dyn Read + Send>> { Ok(Box::new(open()?)) });
        sender
            .send(Task { dest, open })
            .map_err(|e| Error::DownloaderFailed {
                path: e.into_inner().dest,
                attempts: 0,
                reason: "all workers exited".into(),
            })
    }

    /// Queues the download of the file at `path` in `fs`.
    pub fn submit_bundle<R>(
        &self,
        fs: &Arc<BundleFs<R>>,
        path: &str,
        dest: impl Into<PathBuf>,
    ) -> Result<()>
    where
        R: BundleResolver + Send + Sync + 'static,
    {
        let fs = Arc::clone(fs);
        let path = path.to_owned();
        self.submit(dest, move || fs.open(&path))
    }

    /// Bytes written by running and finished tasks.
    pub fn progress(&self) -> u64 {
        self.shared.progress.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Tasks dropped without running because of cancellation.
    pub fn skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Acquire)
    }

    pub fn take_failures(&self) -> Vec<Error> {
        std::mem::take(&mut *self.shared.failures.lock())
    }

    /// Asks running tasks to stop at their next chunk and drops queued ones.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Stops accepting tasks and waits for the workers to drain the queue.
    /// Calling it again does nothing.
    pub fn shutdown(&self, cancel: bool) {
        if cancel {
            self.cancel();
        }
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("downloader worker panicked");
            }
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn run(shared: &Shared, config: &DownloaderConfig, mut task: Task) {
    let mut attempts = 0;
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            shared.skipped.fetch_add(1, Ordering::AcqRel);
            return;
        }
        attempts += 1;
        let mut written = 0;
        let result = attempt(shared, config, &mut task, &mut written);
        if !matches!(result, Ok(Outcome::Done)) {
            shared.progress.fetch_sub(written, Ordering::AcqRel);
            remove_partial(&task.dest);
        }
        match result {
            Ok(Outcome::Done) => {
                shared.completed.fetch_add(1, Ordering::AcqRel);
                return;
            }
            Ok(Outcome::Cancelled) => {
                tracing::debug!("cancelled download of {}", task.dest.display());
                shared.skipped.fetch_add(1, Ordering::AcqRel);
                return;
            }
            Err(e) if attempts > config.retries => {
                tracing::error!("giving up on {}: {e}", task.dest.display());
                shared.failures.lock().push(Error::DownloaderFailed {
                    path: task.dest,
                    attempts,
                    reason: e.to_string(),
                });
                return;
            }
            Err(e) => {
                tracing::warn!("retrying {} after attempt {attempts}: {e}", task.dest.display());
            }
        }
    }
}

fn attempt(
    shared: &Shared,
    config: &DownloaderConfig,
    task: &mut Task,
    written: &mut u64,
) -> Result<Outcome> {
    let mut reader = (task.open)()?;
    if let Some(parent) = task.dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(fs::File::create(&task.dest)?);
    let mut chunk = Vec::with_capacity(config.chunk_size);
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            return Ok(Outcome::Cancelled);
        }
        chunk.clear();
        reader
            .by_ref()
            .take(config.chunk_size as u64)
            .read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        *written += chunk.len() as u64;
        shared.progress.fetch_add(chunk.len() as u64, Ordering::AcqRel);
    }
    out.flush()?;
    Ok(Outcome::Done)
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("could not remove partial download {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::resolver::MemoryResolver;

    fn config(workers: usize) -> DownloaderConfig {
        DownloaderConfig {
            workers,
            retries: 1,
            chunk_size: 1024,
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        std::iter::repeat_with(|| fastrand::u8(..)).take(len).collect()
    }

    /// Yields `fail_after` bytes, then errors.
    struct Flaky {
        data: Cursor<Vec<u8>>,
        fail_after: u64,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.position() >= self.fail_after {
                return Err(io::Error::other("connection reset"));
            }
            let limit = (self.fail_after - self.data.position()) as usize;
            let len = buf.len().min(limit);
            self.data.read(&mut buf[..len])
        }
    }

    /// Sleeps before every read.
    struct Slow(Cursor<Vec<u8>>);

    impl Read for Slow {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(2));
            self.0.read(buf)
        }
    }

    #[test]
    fn downloads_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let bundles: Vec<(String, Vec<u8>)> = (0..8)
            .map(|i| (format!("music/{i}/bundle"), random_bytes(fastrand::usize(0..5000))))
            .collect();
        let total: usize = bundles.iter().map(|(_, data)| data.len()).sum();
        let fs = Arc::new(BundleFs::new(bundles.iter().cloned().collect::<MemoryResolver>()));

        let downloader = Downloader::new(config(3)).unwrap();
        for (name, _) in &bundles {
            downloader
                .submit_bundle(&fs, name, dir.path().join(name))
                .unwrap();
        }
        downloader.shutdown(false);
        downloader.shutdown(false);

        assert_eq!(downloader.completed(), bundles.len() as u64);
        assert_eq!(downloader.progress(), total as u64);
        assert!(downloader.take_failures().is_empty());
        for (name, data) in &bundles {
            assert_eq!(&std::fs::read(dir.path().join(name)).unwrap(), data);
        }
        assert!(downloader.submit(dir.path().join("late"), || Ok(Cursor::new(Vec::<u8>::new()))).is_err());
    }

    #[test]
    fn retries_roll_back_progress() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_bytes(5000);
        let calls = Arc::new(AtomicUsize::new(0));

        let downloader = Downloader::new(config(1)).unwrap();
        let source = data.clone();
        let counter = Arc::clone(&calls);
        downloader
            .submit(dir.path().join("flaky"), move || {
                let fail_after = match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => 2500,
                    _ => u64::MAX,
                };
                Ok(Flaky {
                    data: Cursor::new(source.clone()),
                    fail_after,
                })
            })
            .unwrap();
        downloader.shutdown(false);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(downloader.completed(), 1);
        assert_eq!(downloader.progress(), data.len() as u64);
        assert_eq!(std::fs::read(dir.path().join("flaky")).unwrap(), data);
    }

    #[test]
    fn exhausted_retries_report_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("broken");
        let downloader = Downloader::new(config(2)).unwrap();
        downloader
            .submit(&dest, || {
                Ok(Flaky {
                    data: Cursor::new(vec![0; 4000]),
                    fail_after: 3000,
                })
            })
            .unwrap();
        downloader
            .submit(dir.path().join("missing"), || {
                Err::<Cursor<Vec<u8>>, _>(Error::NotFound("bundle 'missing'".into()))
            })
            .unwrap();
        downloader.shutdown(false);

        let failures = downloader.take_failures();
        assert_eq!(failures.len(), 2);
        for failure in &failures {
            assert!(matches!(failure, Error::DownloaderFailed { attempts: 2, .. }));
        }
        assert_eq!(downloader.progress(), 0);
        assert_eq!(downloader.completed(), 0);
        assert!(!dest.exists());
    }

    #[test]
    fn cancellation_keeps_progress_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(config(2)).unwrap();
        let dests: Vec<PathBuf> = (0..6).map(|i| dir.path().join(format!("slow{i}"))).collect();
        for dest in &dests {
            let data = random_bytes(20 * 1024);
            downloader
                .submit(dest, move || Ok(Slow(Cursor::new(data.clone()))))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        downloader.shutdown(true);
        assert!(downloader.is_cancelled());

        let on_disk: u64 = dests
            .iter()
            .filter_map(|dest| std::fs::metadata(dest).ok())
            .map(|meta| meta.len())
            .sum();
        assert_eq!(downloader.progress(), on_disk);
        assert_eq!(downloader.completed() + downloader.skipped(), dests.len() as u64);
        assert!(downloader.take_failures().is_empty());
    }
}

//! Spool directories connecting the daemon to the filesystem.
//!
//! Outbound: `<outbound_dir>/<duct>/*.bundle` files are claimed by renaming
//! them to `.sending`. Success deletes the file, failure renames it back so
//! the next poll retries it.
//!
//! Inbound: each received bundle is written to `<inbound_dir>/*.part` and
//! renamed to `.bundle` once complete.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc};

use tcpcl_engine::{Acquisition, AcquisitionSink, BundleHandle, OutboundBundle, PeerInfo, XmitObserver};

const READY_EXT: &str = "bundle";
const SENDING_EXT: &str = "sending";
const PART_EXT: &str = "part";

/// Handle → path of the claimed `.sending` file.
pub type Claims = Arc<DashMap<BundleHandle, PathBuf>>;

pub fn new_claims() -> Claims {
    Arc::new(DashMap::new())
}

// ── Outbound ──────────────────────────────────────────────────────────────────

pub struct OutboundSpool {
    dir: PathBuf,
    duct: String,
    claims: Claims,
    handles: Arc<AtomicU64>,
}

impl OutboundSpool {
    /// Open `<root>/<duct>`, creating it, and put back any file left
    /// claimed by a previous run.
    pub fn open(root: &Path, duct: &str, claims: Claims, handles: Arc<AtomicU64>) -> Result<Self> {
        let dir = root.join(duct);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        for path in list_with_ext(&dir, SENDING_EXT)? {
            let ready = path.with_extension(READY_EXT);
            std::fs::rename(&path, &ready)
                .with_context(|| format!("failed to restore {}", path.display()))?;
            tracing::info!(path = %ready.display(), "restored unsent bundle");
        }

        Ok(Self {
            dir,
            duct: duct.to_string(),
            claims,
            handles,
        })
    }

    /// Claim the oldest ready bundle, if any.
    pub async fn claim_next(&self) -> Result<Option<OutboundBundle>> {
        let Some(path) = list_with_ext(&self.dir, READY_EXT)?.into_iter().next() else {
            return Ok(None);
        };
        let claimed = path.with_extension(SENDING_EXT);
        tokio::fs::rename(&path, &claimed)
            .await
            .with_context(|| format!("failed to claim {}", path.display()))?;

        let file = tokio::fs::File::open(&claimed)
            .await
            .with_context(|| format!("failed to open {}", claimed.display()))?;
        let length = file.metadata().await?.len();

        let handle = self.handles.fetch_add(1, Ordering::Relaxed);
        self.claims.insert(handle, claimed);

        Ok(Some(OutboundBundle {
            handle,
            length,
            class_of_service: 0,
            ecos_ordinal: 0,
            duct_name: self.duct.clone(),
            reader: Box::new(file),
        }))
    }

    /// Feed claimed bundles to `queue` until shutdown.
    pub async fn run(
        self,
        queue: mpsc::Sender<OutboundBundle>,
        poll: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::info!(duct = %self.duct, dir = %self.dir.display(), "outbound spool polling");
        loop {
            let bundle = match self.claim_next().await {
                Ok(Some(bundle)) => bundle,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        _ = tokio::time::sleep(poll) => continue,
                    }
                }
                Err(e) => {
                    tracing::warn!(duct = %self.duct, error = %e, "spool scan failed");
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        _ = tokio::time::sleep(poll) => continue,
                    }
                }
            };

            let handle = bundle.handle;
            tokio::select! {
                _ = shutdown.recv() => {
                    release(&self.claims, handle, false);
                    return Ok(());
                }
                sent = queue.send(bundle) => {
                    if sent.is_err() {
                        release(&self.claims, handle, false);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Reports outcomes by deleting or restoring claimed files.
pub struct SpoolObserver {
    claims: Claims,
}

impl SpoolObserver {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }
}

impl XmitObserver for SpoolObserver {
    fn xmit_success(&self, handle: BundleHandle, length: u64) {
        tracing::debug!(handle, bytes = length, "bundle delivered to peer");
        release(&self.claims, handle, true);
    }

    fn xmit_failure(&self, handle: BundleHandle) {
        release(&self.claims, handle, false);
    }

    fn outduct_blocked(&self, duct: &str) {
        tracing::warn!(duct, "outduct blocked");
    }

    fn outduct_unblocked(&self, duct: &str) {
        tracing::info!(duct, "outduct unblocked");
    }
}

fn release(claims: &Claims, handle: BundleHandle, sent: bool) {
    let Some((_, path)) = claims.remove(&handle) else {
        tracing::warn!(handle, "outcome for unknown bundle");
        return;
    };
    let result = if sent {
        std::fs::remove_file(&path)
    } else {
        std::fs::rename(&path, path.with_extension(READY_EXT))
    };
    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "failed to release spooled bundle");
    }
}

fn list_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == ext) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Writes received bundles into the inbound directory.
pub struct SpoolSink {
    dir: PathBuf,
    seq: AtomicU64,
}

impl SpoolSink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(0),
        })
    }
}

impl AcquisitionSink for SpoolSink {
    fn begin_acquisition(&self, peer: &PeerInfo) -> Result<Box<dyn Acquisition>> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let part = self.dir.join(format!("{millis:015}-{seq:06}.{PART_EXT}"));
        let file = blocking(|| File::create(&part))
            .with_context(|| format!("failed to create {}", part.display()))?;

        tracing::debug!(peer_addr = %peer.addr, path = %part.display(), "receiving bundle");
        Ok(Box::new(SpoolAcquisition {
            writer: BufWriter::new(file),
            part,
        }))
    }
}

struct SpoolAcquisition {
    writer: BufWriter<File>,
    part: PathBuf,
}

impl Acquisition for SpoolAcquisition {
    fn continue_acquisition(&mut self, bytes: &[u8]) -> Result<()> {
        blocking(|| self.writer.write_all(bytes))?;
        Ok(())
    }

    fn end_acquisition(self: Box<Self>) -> Result<()> {
        let SpoolAcquisition { mut writer, part } = *self;
        let done = part.with_extension(READY_EXT);
        blocking(|| {
            writer.flush()?;
            std::fs::rename(&part, &done)
        })
        .with_context(|| format!("failed to finish {}", part.display()))?;
        tracing::info!(path = %done.display(), "bundle received");
        Ok(())
    }

    fn cancel_acquisition(self: Box<Self>) {
        let SpoolAcquisition { writer, part } = *self;
        let removed = blocking(|| {
            drop(writer);
            std::fs::remove_file(&part)
        });
        if let Err(e) = removed {
            tracing::warn!(path = %part.display(), error = %e, "failed to remove partial bundle");
        }
    }
}

/// Run filesystem work without stalling other tasks on this worker.
/// Acquisitions are driven from inside the receive loop, so writes land on
/// a runtime thread. A current-thread runtime cannot hand off its only
/// worker, so there the call just runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

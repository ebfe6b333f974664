//! Thin manual smoke-test binary: creates a store under a temporary
//! directory, creates a blob, and reports its device path. Not a deliverable
//! of the core (see Non-goals) -- exists so the crate can be exercised by
//! hand without writing a throwaway test.

use anyhow::{Context, Result};

use blobstore::{Blobstore, OpenParams};

fn main() -> Result<()> {
    env_logger::init();

    let root = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("blobstore-smoke"));

    let params = OpenParams {
        limit_blocks: Some(1024),
        ..Default::default()
    };

    let store = Blobstore::open_system(root, params).context("opening blobstore")?;
    log::info!("opened store {} at {}", store.id(), store.root().display());

    let blob = blobstore::blob::create_or_open(
        &store,
        Some("smoke"),
        16,
        blobstore::BlobFlags { create: true, exclusive: false },
        None,
        blobstore::Timeout::Forever,
    )
    .context("creating blob 'smoke'")?;

    println!("blob 'smoke' exposed at {}", blob.device_path().display());

    blobstore::blob::close(&store, blob).context("closing blob 'smoke'")?;
    Ok(())
}

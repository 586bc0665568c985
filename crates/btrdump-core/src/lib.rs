use std::io::{Read, Write};
use std::path::Path;

pub mod config;
pub mod container;
pub mod dump;
pub mod error;
pub mod fixup;
pub mod fs;
pub mod pipeline;
pub mod report;
pub mod restore;
pub mod sanitize;

pub use config::{DumpConfig, RestoreConfig};
pub use container::{Cluster, ClusterReader, ClusterWriter, Compression, ITEMS_PER_CLUSTER};
pub use dump::DumpEngine;
pub use error::{MetadumpError, Result};
pub use fixup::{DeviceIdentity, FixupStrategy};
pub use fs::btrfs::image::BtrfsImage;
pub use report::{DumpReport, Progress, RestoreReport, Stage};
pub use restore::RestoreEngine;

/// Capture the btrfs image at `source` into `out`
pub fn create_metadump<P, W>(source: P, out: W, config: DumpConfig) -> Result<(DumpReport, W)>
where
    P: AsRef<Path>,
    W: Write,
{
    let image = BtrfsImage::open(source)?;
    DumpEngine::new(image, config, out)?.run()
}

/// Restore the container read from `input` onto `target`
pub fn restore_metadump<R, P>(input: R, target: P, config: RestoreConfig) -> Result<RestoreReport>
where
    R: Read,
    P: AsRef<Path>,
{
    RestoreEngine::new(input, target, config)?.run()
}

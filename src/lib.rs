//! ptpd - a PTP (PIMA 15740) still-image gadget daemon.
//!
//! Presents one directory of files to a USB host as a digital camera's
//! storage, over the Linux FunctionFS endpoint files. The host can
//! enumerate, download, upload and delete the files as if they were
//! camera images.

pub mod control;
pub mod engine;
pub mod ffs;
pub mod gate;
pub mod proto;
pub mod store;
#[cfg(feature = "thumbnails")]
pub mod thumbs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;

use crate::gate::ResetGate;
use crate::store::ObjectStore;

/// Parsed command line: `ptpd [-v]... <backing-directory>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Count of `-v` flags; selects the default log level.
    pub verbosity: u8,
    /// The directory served as the camera storage.
    pub root: PathBuf,
}

impl Config {
    /// Parse command-line arguments (without the program name).
    ///
    /// # Errors
    ///
    /// Returns a usage message for unknown flags or a missing backing
    /// directory.
    pub fn from_args<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        const USAGE: &str = "usage: ptpd [-v]... <backing-directory>";

        let mut verbosity: u8 = 0;
        let mut root: Option<PathBuf> = None;
        for arg in args {
            if let Some(flags) = arg.strip_prefix('-') {
                if !flags.is_empty() && flags.bytes().all(|b| b == b'v') {
                    verbosity = verbosity.saturating_add(flags.len() as u8);
                    continue;
                }
                return Err(format!("unsupported option {arg}\n{USAGE}"));
            }
            if root.replace(PathBuf::from(&arg)).is_some() {
                return Err(format!("more than one directory given\n{USAGE}"));
            }
        }
        match root {
            Some(root) => Ok(Self { verbosity, root }),
            None => Err(USAGE.to_owned()),
        }
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Bring the gadget up and serve until the control endpoint dies.
///
/// # Errors
///
/// Any initialization failure (bad arguments, invalid backing
/// directory, signal installation, control endpoint) and any error
/// that ends the control loop.
pub fn run() -> anyhow::Result<()> {
    let config = Config::from_args(std::env::args().skip(1)).map_err(anyhow::Error::msg)?;
    init_logging(config.verbosity);

    log::info!(
        "ptpd {} starting, backing directory {}",
        env!("CARGO_PKG_VERSION"),
        config.root.display()
    );

    control::install_wakeup_handler().context("cannot install wakeup signal handler")?;

    let store = ObjectStore::open(&config.root)
        .with_context(|| format!("cannot open backing directory {}", config.root.display()))?;
    log::info!("{} objects listed", store.object_count());

    let ep0 = ffs::init_control().context("cannot initialize control endpoint")?;
    let gate = Arc::new(ResetGate::new());
    let mut control = control::ControlLoop::new(ep0, store, gate);
    control.run().context("control loop failed")?;
    Ok(())
}

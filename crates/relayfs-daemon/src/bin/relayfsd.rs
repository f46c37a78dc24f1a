// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RelayFS daemon executable
//!
//! Hosts a complete protocol session in one process: the client-core pump
//! services the request device on a background thread while the main thread
//! plays the issuing side, exercising a mount and a small workload against
//! it. Useful as a smoke check of the whole protocol stack.

use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use relayfs_core::{BulkMapping, ProtocolConfig, ServiceOptions, Session};
use relayfs_daemon::logging::{self, CliLogLevel};
use relayfs_daemon::{ClientCore, MemServicer};
use relayfs_proto::{DirentPage, Request, RequestBody, ResponseBody};

#[derive(Parser)]
#[command(name = "relayfsd")]
#[command(about = "RelayFS client-core daemon with a built-in protocol exerciser")]
#[command(version, long_about = None)]
struct Cli {
    /// Protocol configuration file (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Filesystem id the in-memory servicer reports
    #[arg(long, default_value = "1")]
    fs_id: i32,

    /// Mount configuration string passed to the servicer
    #[arg(long, default_value = "server=local")]
    mount_config: String,

    /// Log verbosity level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ProtocolConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(ProtocolConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    let config = load_config(cli.config.as_ref())?;
    let slot_count = config.slot_count;
    let session = Session::new(config);

    let bulk = BulkMapping {
        total_size: u64::from(slot_count) * 4096,
        slot_count,
        slot_size: 4096,
    };
    let core = ClientCore::attach(&session, Box::new(MemServicer::new(cli.fs_id)), bulk)
        .context("attaching client core")?;
    let shutdown = core.shutdown_handle();
    let pump = thread::spawn(move || core.run());
    info!(ready = session.is_client_ready(), "client core attached");

    let result = exercise(&session, &cli.mount_config);

    shutdown.store(true, std::sync::atomic::Ordering::Release);
    pump.join().expect("pump thread panicked").context("pump failed")?;
    result
}

/// Mount, touch a handful of objects, list them back, unmount.
fn exercise(session: &std::sync::Arc<Session>, mount_config: &str) -> anyhow::Result<()> {
    let opts = ServiceOptions::default();
    let (fs_id, root) = session
        .mount(mount_config, opts)
        .map_err(|err| anyhow::anyhow!("mount failed: {err}"))?;
    info!(fs_id, root, "mounted");

    for name in ["alpha", "beta", "gamma"] {
        let request = Request {
            fs_id,
            body: RequestBody::Create { parent: root, name: name.to_string(), mode: 0o644 },
        };
        session
            .service_request(request)
            .map_err(|err| anyhow::anyhow!("create {name} failed: {err}"))?;
    }

    let request =
        Request { fs_id, body: RequestBody::Readdir { handle: root, token: 0, max_entries: 16 } };
    let (response, trailer) = session
        .service_request(request)
        .map_err(|err| anyhow::anyhow!("readdir failed: {err}"))?;
    let ResponseBody::Readdir { entry_count, .. } = response.body else {
        bail!("readdir returned mismatched body");
    };
    let page = DirentPage::decode(trailer.as_deref().unwrap_or_default())
        .context("decoding dirent page")?;
    info!(entry_count, "directory listing");
    for entry in &page.entries {
        info!(handle = entry.handle, name = %entry.name, "entry");
    }

    let request = Request { fs_id, body: RequestBody::Statfs };
    let (response, _) = session
        .service_request(request)
        .map_err(|err| anyhow::anyhow!("statfs failed: {err}"))?;
    if let ResponseBody::Statfs(stats) = response.body {
        info!(files_avail = stats.files_avail, "filesystem statistics");
    }

    session
        .unmount(fs_id, 0, opts)
        .map_err(|err| anyhow::anyhow!("unmount failed: {err}"))?;
    info!("exercise complete");
    Ok(())
}

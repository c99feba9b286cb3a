//! NFS share gate: phase tooling lives on a share that must be mounted
//! before any phase can start.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::io::os::OsActions;

#[derive(Debug, Clone)]
pub struct MountGate<'a, O: OsActions> {
    os: &'a O,
    server_ip: Option<String>,
    export: String,
    mount_point: PathBuf,
}

impl<'a, O: OsActions> MountGate<'a, O> {
    pub fn new(
        os: &'a O,
        server_ip: Option<String>,
        export: impl Into<String>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            os,
            server_ip,
            export: export.into(),
            mount_point: mount_point.into(),
        }
    }

    /// Whether the live mount table references the share server.
    ///
    /// An unset address or an unreadable mount table counts as not mounted.
    pub fn is_mounted(&self) -> bool {
        let Some(ip) = self.server_ip.as_deref().filter(|ip| !ip.trim().is_empty()) else {
            return false;
        };
        match self.os.mount_table() {
            Ok(table) => table.lines().any(|line| line.contains(ip)),
            Err(err) => {
                debug!(err = %format!("{err:#}"), "mount table unavailable");
                false
            }
        }
    }

    /// Try once to mount the share; failures are logged, never returned.
    pub fn mount(&self) {
        let raw = self.server_ip.as_deref().unwrap_or_default();
        let ip = match raw.trim().parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                error!(server_ip = raw, "mount nfs error: share server address is not a valid IPv4 address");
                return;
            }
        };
        let source = format!("{ip}:{}", self.export);
        info!(%source, mount_point = %self.mount_point.display(), "mounting nfs share");
        if let Err(err) = self.os.mount_share(&source, &self.mount_point) {
            error!(err = %format!("{err:#}"), "mount nfs error");
            return;
        }
        if !self.is_mounted() {
            error!(%source, "mount nfs error: share not in mount table after mount");
        }
    }

    /// Best-effort unmount of the share.
    pub fn unmount(&self) {
        if let Err(err) = self.os.unmount_share(&self.mount_point) {
            error!(err = %format!("{err:#}"), "umount nfs error");
            return;
        }
        if self.is_mounted() {
            error!(mount_point = %self.mount_point.display(), "umount nfs error: share still mounted");
        }
    }
}

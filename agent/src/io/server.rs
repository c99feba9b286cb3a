//! Identity-scoped requests to the provisioning server's phase endpoints.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::core::types::NodeIdentity;
use crate::io::transport::Transport;

/// Lifecycle action appended to `{vmodel}/{target}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmodelAction {
    Start,
    Skip,
    End,
    File,
    Do,
}

impl VmodelAction {
    pub fn as_str(self) -> &'static str {
        match self {
            VmodelAction::Start => "start",
            VmodelAction::Skip => "skip",
            VmodelAction::End => "end",
            VmodelAction::File => "file",
            VmodelAction::Do => "do",
        }
    }
}

impl fmt::Display for VmodelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServerClient<'a, T: Transport> {
    transport: &'a T,
    vmodel_url: Option<String>,
    staging_dir: PathBuf,
}

impl<'a, T: Transport> ServerClient<'a, T> {
    pub fn new(transport: &'a T, vmodel_url: Option<String>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            vmodel_url,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// `GET {vmodel}/{target}/{action}` scoped to `identity`.
    ///
    /// For [`VmodelAction::File`] the body is saved as
    /// `<staging_dir>/<filename>` and `None` is returned; other actions
    /// return the body. Every failure is logged and yields `None`.
    pub fn request(
        &self,
        identity: Option<&NodeIdentity>,
        target: &str,
        action: VmodelAction,
        filename: Option<&str>,
    ) -> Option<String> {
        let Some(identity) = identity.filter(|id| !id.uuid.is_empty()) else {
            error!(target, %action, "node uuid unknown, request not sent");
            return None;
        };
        let Some(base) = self.vmodel_url.as_deref() else {
            error!(target, %action, "no server configured, request not sent");
            return None;
        };
        let url = format!("{}/{target}/{action}", base.trim_end_matches('/'));
        let mac_id = identity.mac_id_param();
        let mut query = vec![("uuid", identity.uuid.as_str()), ("mac_id", mac_id.as_str())];

        if action != VmodelAction::File {
            info!(%url, "vmodel request");
            return match self.transport.get(&url, &query) {
                Ok(body) => Some(String::from_utf8_lossy(&body).into_owned()),
                Err(err) => {
                    error!(err = %format!("{err:#}"), "vmodel request failed");
                    None
                }
            };
        }

        let Some(filename) = filename else {
            error!(%url, "file request without a file name");
            return None;
        };
        let Some(stem) = plain_file_stem(filename) else {
            error!(filename, "refusing to stage file outside the staging directory");
            return None;
        };
        query.push(("name", stem));
        info!(%url, filename, "fetching phase file");
        if let Err(err) = self.fetch_file(&url, &query, filename) {
            error!(err = %format!("{err:#}"), filename, "failed to fetch phase file");
        }
        None
    }

    fn fetch_file(&self, url: &str, query: &[(&str, &str)], filename: &str) -> Result<()> {
        let body = self.transport.get(url, query)?;
        fs::create_dir_all(&self.staging_dir)
            .with_context(|| format!("create staging dir {}", self.staging_dir.display()))?;
        let path = self.staging_dir.join(filename);
        fs::write(&path, &body).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), bytes = body.len(), "phase file staged");
        Ok(())
    }
}

/// File stem of `filename` when it names a file directly inside a directory.
fn plain_file_stem(filename: &str) -> Option<&str> {
    let path = Path::new(filename);
    if path.file_name().and_then(|name| name.to_str()) != Some(filename) {
        return None;
    }
    path.file_stem().and_then(|stem| stem.to_str())
}

//! Device-keyed boot loader session.
//!
//! This is the thin surface a firmware-style caller uses: one volume is
//! mounted at a time, and load/list calls report failure as a sentinel
//! after logging the underlying error.

use std::io::{Read, Seek};

use log::debug;

use crate::config::LoaderConfig;
use crate::error::{HfsError, Result};
use crate::fs::{DirEntry, DirIndex, HfsVolume};

/// Opaque handle naming a boot device.
pub type DeviceId = u32;

/// Returned by `load_file` on any failure.
pub const LOAD_FAILED: i64 = -1;

struct Mounted<R: Read + Seek> {
    device: DeviceId,
    volume: HfsVolume<R>,
}

pub struct BootLoader<R: Read + Seek> {
    config: LoaderConfig,
    mounted: Option<Mounted<R>>,
}

impl<R: Read + Seek> BootLoader<R> {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            mounted: None,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Mount the volume on `device`.
    ///
    /// Mounting the device that is already mounted keeps the existing state
    /// and drops `reader`. Any other device replaces it; on failure nothing
    /// stays mounted.
    pub fn mount(&mut self, device: DeviceId, reader: R) -> Result<()> {
        if self.mounted_device() == Some(device) {
            debug!("device {device} already mounted");
            return Ok(());
        }
        self.mounted = None;
        let volume = HfsVolume::mount(reader, self.config.clone())?;
        debug!(
            "device {device}: mounted '{}' (generation {})",
            volume.volume_name(),
            volume.generation()
        );
        self.mounted = Some(Mounted { device, volume });
        Ok(())
    }

    pub fn mounted_device(&self) -> Option<DeviceId> {
        self.mounted.as_ref().map(|m| m.device)
    }

    /// The mounted volume, if it belongs to `device`.
    pub fn volume(&mut self, device: DeviceId) -> Result<&mut HfsVolume<R>> {
        match self.mounted.as_mut() {
            Some(m) if m.device == device => Ok(&mut m.volume),
            _ => Err(HfsError::NotFound(format!("device {device} is not mounted"))),
        }
    }

    /// Unmount and hand back the device reader.
    pub fn unmount(&mut self) -> Option<R> {
        self.mounted.take().map(|m| m.volume.into_inner())
    }

    /// Load the whole file at `path` into `buf`.
    ///
    /// Returns the file length, or `LOAD_FAILED`. Either the full length is
    /// copied or the call fails.
    pub fn load_file(&mut self, device: DeviceId, path: &str, buf: &mut [u8]) -> i64 {
        let result = self
            .volume(device)
            .and_then(|v| v.load_file_into(path, buf));
        match result {
            Ok(n) => n as i64,
            Err(e) => {
                debug!("load_file({device}, {path}) failed: {e}");
                LOAD_FAILED
            }
        }
    }

    /// Next entry of `dir_path`, or `None` once the listing is exhausted or
    /// on any error.
    pub fn get_dir_entry(
        &mut self,
        device: DeviceId,
        dir_path: &str,
        cursor: &mut DirIndex,
    ) -> Option<DirEntry> {
        let result = self
            .volume(device)
            .and_then(|v| v.dir_entry(dir_path, cursor));
        match result {
            Ok(entry) => entry,
            Err(e) => {
                debug!("get_dir_entry({device}, {dir_path}) failed: {e}");
                None
            }
        }
    }
}

use chrono::{DateTime, Utc};

/// Seconds between 1904-01-01 and 1970-01-01.
pub const MAC_EPOCH_OFFSET: u32 = 2_082_844_800;

/// Convert an on-disk 1904-epoch timestamp to Unix seconds (0 if earlier).
pub fn mac_time_to_unix(mac: u32) -> u32 {
    mac.saturating_sub(MAC_EPOCH_OFFSET)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Thread records; callers listing a directory skip these.
    Unknown,
}

/// Type, permission and ownership summary of a catalog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFlags {
    pub kind: EntryKind,
    /// BSD mode bits. Classic volumes and HFS+ records without BSD info have none.
    pub mode: Option<u16>,
    pub owner_not_root: bool,
}

impl FileFlags {
    pub fn unknown() -> Self {
        FileFlags {
            kind: EntryKind::Unknown,
            mode: None,
            owner_not_root: false,
        }
    }

    pub fn permissions(&self) -> u16 {
        self.mode.map_or(0, |m| m & 0o7777)
    }

    pub fn group_or_other_writable(&self) -> bool {
        self.permissions() & 0o022 != 0
    }
}

/// A catalog entry as returned by directory listing and `stat`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub flags: FileFlags,
    /// Modification time, Unix seconds.
    pub mtime: u32,
    /// Data fork logical length; 0 for folders.
    pub size: u64,
    /// Catalog node ID (folder ID or file ID).
    pub id: u32,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.flags.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.flags.kind == EntryKind::File
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        if self.mtime == 0 {
            return None;
        }
        DateTime::from_timestamp(self.mtime as i64, 0)
    }
}

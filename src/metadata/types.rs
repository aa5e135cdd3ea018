use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Inode番号
pub type InodeId = u64;

/// ディレクトリID (ディレクトリのinode番号、キャッシュのキー)
pub type DirectoryId = u64;

/// パーティションインデックス (分割トライ上の位置)
pub type PartitionIndex = u32;

/// メタデータサーバーID (0から始まる連番)
pub type ServerId = u32;

/// ルートディレクトリのID
pub const ROOT_DIRECTORY_ID: DirectoryId = 0;

/// ルートディレクトリのzeroth server
pub const ROOT_ZEROTH_SERVER: ServerId = 0;

/// Inodeタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    File,
    Directory,
}

/// ファイルパーミッション (Unix風)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePermissions {
    pub mode: u32, // Unix mode (例: 0o644)
    pub uid: u32,  // User ID
    pub gid: u32,  // Group ID
}

impl FilePermissions {
    pub fn file() -> Self {
        Self {
            mode: 0o644, // rw-r--r--
            uid: 0,
            gid: 0,
        }
    }

    pub fn directory() -> Self {
        Self {
            mode: 0o755, // rwxr-xr-x
            uid: 0,
            gid: 0,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o7777;
        self
    }
}

impl Default for FilePermissions {
    fn default() -> Self {
        Self::file()
    }
}

/// ディレクトリエントリ本体 (ストレージに保存される値)
///
/// 小さなファイルの内容は `data` にインラインで保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Inode番号
    pub inode: InodeId,

    /// エントリ種別
    pub inode_type: InodeType,

    /// パーミッション
    pub permissions: FilePermissions,

    /// インラインデータのサイズ (バイト)
    pub size: u64,

    /// 作成時刻
    pub created_at: SystemTime,

    /// 最終更新時刻
    pub modified_at: SystemTime,

    /// ディレクトリの場合、そのパーティション0を担当するサーバー
    pub zeroth_server: Option<ServerId>,

    /// インラインデータ
    pub data: Vec<u8>,
}

impl EntryRecord {
    /// 新しいファイルエントリを作成
    pub fn file(inode: InodeId, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            inode,
            inode_type: InodeType::File,
            permissions: FilePermissions::file().with_mode(mode),
            size: 0,
            created_at: now,
            modified_at: now,
            zeroth_server: None,
            data: Vec::new(),
        }
    }

    /// 新しいディレクトリエントリを作成
    pub fn directory(inode: InodeId, mode: u32, zeroth_server: ServerId) -> Self {
        let now = SystemTime::now();
        Self {
            inode,
            inode_type: InodeType::Directory,
            permissions: FilePermissions::directory().with_mode(mode),
            size: 0,
            created_at: now,
            modified_at: now,
            zeroth_server: Some(zeroth_server),
            data: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.inode_type == InodeType::Directory
    }

    /// `offset` からデータを書き込み、必要ならゼロで埋めて拡張する
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> usize {
        let offset = offset as usize;
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        self.size = self.data.len() as u64;
        self.modified_at = SystemTime::now();
        bytes.len()
    }

    /// `offset` から最大 `length` バイトを読み出す
    pub fn read_at(&self, offset: u64, length: u64) -> &[u8] {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(length as usize).min(self.data.len());
        &self.data[start..end]
    }

    /// 属性のみのビュー (データを含まない)
    pub fn attr(&self) -> EntryAttr {
        EntryAttr {
            inode: self.inode,
            inode_type: self.inode_type,
            permissions: self.permissions,
            size: self.size,
            created_at: self.created_at,
            modified_at: self.modified_at,
            zeroth_server: self.zeroth_server,
        }
    }
}

/// GetAttr / Lookup で返される属性
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryAttr {
    pub inode: InodeId,
    pub inode_type: InodeType,
    pub permissions: FilePermissions,
    pub size: u64,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    pub zeroth_server: Option<ServerId>,
}

/// ReadDir で返されるエントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub name: String,
    pub inode: InodeId,
    pub inode_type: InodeType,
}

/// クライアントがディレクトリを指定するための参照
///
/// `zeroth_server` はサーバーがマップを持っていない場合の取得先として使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirRef {
    pub id: DirectoryId,
    pub zeroth_server: ServerId,
}

impl DirRef {
    pub fn new(id: DirectoryId, zeroth_server: ServerId) -> Self {
        Self { id, zeroth_server }
    }

    pub fn root() -> Self {
        Self::new(ROOT_DIRECTORY_ID, ROOT_ZEROTH_SERVER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_inline_data() {
        let mut entry = EntryRecord::file(7, 0o644);
        assert_eq!(entry.size, 0);

        entry.write_at(0, b"hello");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.read_at(0, 5), b"hello");

        // 穴はゼロで埋められる
        entry.write_at(8, b"!");
        assert_eq!(entry.size, 9);
        assert_eq!(entry.read_at(5, 4), &[0, 0, 0, b'!']);

        // 範囲外の読み出しは空
        assert!(entry.read_at(100, 10).is_empty());
        assert_eq!(entry.read_at(7, 100), &[0, b'!']);
    }

    #[test]
    fn test_directory_entry() {
        let entry = EntryRecord::directory(3, 0o700, 2);
        assert!(entry.is_directory());
        assert_eq!(entry.zeroth_server, Some(2));
        assert_eq!(entry.permissions.mode, 0o700);

        let attr = entry.attr();
        assert_eq!(attr.inode, 3);
        assert_eq!(attr.inode_type, InodeType::Directory);
    }

    #[test]
    fn test_mode_is_masked() {
        let perms = FilePermissions::file().with_mode(0o170644);
        assert_eq!(perms.mode, 0o644);
    }
}

// ディレクトリ分割メタデータモジュール
pub mod types;
pub mod partition_map;
pub mod index;
pub mod id_generator;

pub use types::{
    DirRef, DirectoryId, DirectoryListing, EntryAttr, EntryRecord, FilePermissions, InodeId,
    InodeType, PartitionIndex, ServerId, ROOT_DIRECTORY_ID, ROOT_ZEROTH_SERVER,
};
pub use partition_map::{PartitionBitmap, PartitionMap, PartitionMapError, PartitionMapResult};
pub use index::{belongs_to_child, index_for_name, name_hash, server_for_name};
pub use id_generator::{IdGenerator, IdGeneratorError};

// 分割トライの最大深さ
// 2^10 = 1024 partitions per directory
pub const MAX_RADIX: u32 = 10;

// ビットマップが表現できるパーティション数
pub const MAX_PARTITIONS: usize = 1 << MAX_RADIX;

// ビットマップのワード数 (u64単位)
pub const BITMAP_WORDS: usize = MAX_PARTITIONS / 64;

// xxHash seed for entry names
// Every client and server must use the same value
pub const NAME_HASH_SEED: u64 = 0;

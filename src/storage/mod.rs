// ストレージ層モジュール
pub mod error;
#[cfg(test)]
pub(crate) mod faulty;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStore;

use serde::{Deserialize, Serialize};

use crate::metadata::{DirectoryId, EntryRecord, PartitionIndex, PartitionMap};

/// メタデータストレージトレイト
///
/// ディレクトリエントリは `(directory, partition, name)` をキーに保存される。
/// 接続ごとのスレッドと分割スレッドから同時に呼ばれるため `Send + Sync` を要求する。
pub trait MetadataStore: Send + Sync {
    /// エントリを取得
    fn get(&self, dir: DirectoryId, partition: PartitionIndex, name: &str)
        -> StorageResult<EntryRecord>;

    /// エントリを保存 (上書き)
    fn put(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()>;

    /// エントリが存在しない場合のみ保存
    fn insert_new(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()>;

    /// エントリをその場で更新し、更新後の値を返す
    fn update(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        f: &mut dyn FnMut(&mut EntryRecord),
    ) -> StorageResult<EntryRecord>;

    /// エントリを削除し、削除された値を返す
    fn delete(&self, dir: DirectoryId, partition: PartitionIndex, name: &str)
        -> StorageResult<EntryRecord>;

    /// パーティション内の全エントリを名前順に列挙
    fn list_partition(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
    ) -> StorageResult<Vec<(String, EntryRecord)>>;

    /// パーティション内のエントリ数
    fn partition_len(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64>;

    /// 子パーティションに移動するエントリを抽出する (副作用なし)
    fn scan_partition(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<ScanSummary>;

    /// 抽出済みユニットを取り込む
    ///
    /// 対象パーティションの内容はユニットで置き換えられるため、
    /// 同じユニットを何度取り込んでも結果は同じになる。
    ///
    /// # Returns
    /// 取り込んだエントリ数
    fn bulk_load(&self, unit: &TransportUnit, range: SequenceRange) -> StorageResult<u64>;

    /// 分割の公開後、子に移動したエントリを親から削除する
    fn remove_partition_range(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<u64>;

    /// パーティションを丸ごと削除する (中止された分割の後始末)
    ///
    /// # Returns
    /// 削除したエントリ数
    fn drop_partition(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64>;

    /// パーティションマップを永続化
    fn put_mapping(&self, dir: DirectoryId, mapping: &PartitionMap) -> StorageResult<()>;

    /// 永続化されたパーティションマップを取得
    fn get_mapping(&self, dir: DirectoryId) -> StorageResult<Option<PartitionMap>>;

    /// パーティションマップを削除
    fn delete_mapping(&self, dir: DirectoryId) -> StorageResult<()>;
}

/// 書き込み順序番号の半開区間 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}

impl SequenceRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.start && seq < self.end
    }

    /// Smallest range covering `self` and `seq`
    pub fn extend(self, seq: u64) -> Self {
        if self.is_empty() {
            Self::new(seq, seq + 1)
        } else {
            Self::new(self.start.min(seq), self.end.max(seq + 1))
        }
    }
}

/// 転送ユニット内の1エントリ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRecord {
    pub name: String,
    pub sequence: u64,
    pub entry: EntryRecord,
}

/// 分割時にパーティション間で移動されるエントリの塊
///
/// ペイロードは `TransportRecord` 列の bincode 表現。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportUnit {
    pub directory: DirectoryId,
    pub partition: PartitionIndex,
    payload: Vec<u8>,
}

impl TransportUnit {
    pub fn encode(
        directory: DirectoryId,
        partition: PartitionIndex,
        records: &[TransportRecord],
    ) -> StorageResult<Self> {
        Ok(Self {
            directory,
            partition,
            payload: bincode::serialize(records)?,
        })
    }

    pub fn decode(&self) -> StorageResult<Vec<TransportRecord>> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// `scan_partition` の結果
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub unit: TransportUnit,
    pub count: u64,
    pub range: SequenceRange,
}

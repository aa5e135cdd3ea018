use super::types::{PartitionIndex, ServerId};
use super::{BITMAP_WORDS, MAX_PARTITIONS, MAX_RADIX};
use serde::{Deserialize, Serialize};
use std::fmt;

/// パーティションマップのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionMapError {
    #[error("server_count must be greater than zero")]
    NoServers,

    #[error("zeroth server {zeroth} is out of range (server_count={server_count})")]
    ZerothOutOfRange { zeroth: ServerId, server_count: u32 },

    #[error("Partition {0} does not exist")]
    UnknownPartition(PartitionIndex),

    #[error("Partition {0} cannot be a split child")]
    InvalidChild(PartitionIndex),

    #[error("Partition {parent} cannot split further (max radix {max})")]
    MaxRadixReached { parent: PartitionIndex, max: u32 },

    #[error("Cannot merge maps with different zeroth servers ({ours} vs {theirs})")]
    ZerothMismatch { ours: ServerId, theirs: ServerId },
}

pub type PartitionMapResult<T> = Result<T, PartitionMapError>;

/// 分割トライのパーティション存在ビットマップ
///
/// ビット `i` がセットされている ⇔ パーティション `i` が存在する。
/// ビット `i` はワード `i / 64` のビット位置 `i % 64` に格納される。
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBitmap {
    words: [u64; BITMAP_WORDS],
}

impl PartitionBitmap {
    /// 空のビットマップを作成
    pub fn empty() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
        }
    }

    /// ビットがセットされているか
    #[inline]
    pub fn contains(&self, index: PartitionIndex) -> bool {
        let i = index as usize;
        if i >= MAX_PARTITIONS {
            return false;
        }
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// ビットをセット
    ///
    /// # Returns
    /// 新たにセットされた場合は `true`
    pub fn insert(&mut self, index: PartitionIndex) -> bool {
        let i = index as usize;
        debug_assert!(i < MAX_PARTITIONS);
        let mask = 1u64 << (i % 64);
        let was_set = self.words[i / 64] & mask != 0;
        self.words[i / 64] |= mask;
        !was_set
    }

    /// ビット単位のOR
    ///
    /// # Returns
    /// 1ビットでも増えた場合は `true`
    pub fn union_with(&mut self, other: &PartitionBitmap) -> bool {
        let mut changed = false;
        for (ours, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *ours | *theirs;
            changed |= merged != *ours;
            *ours = merged;
        }
        changed
    }

    /// `other` のすべてのビットが自分にもセットされているか
    pub fn is_superset_of(&self, other: &PartitionBitmap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(ours, theirs)| theirs & !ours == 0)
    }

    /// セットされているビット数
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// セットされている最大のインデックス
    pub fn highest(&self) -> Option<PartitionIndex> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(word, w)| (word * 64 + 63 - w.leading_zeros() as usize) as PartitionIndex)
    }

    /// セットされているインデックスを昇順に列挙
    pub fn iter(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        (0..MAX_PARTITIONS as PartitionIndex).filter(move |i| self.contains(*i))
    }
}

impl Default for PartitionBitmap {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PartitionBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// インデックスの深さ (ビット長)。`depth(0) == 0`
#[inline]
pub fn depth_of(index: PartitionIndex) -> u32 {
    PartitionIndex::BITS - index.leading_zeros()
}

/// 最上位ビットを落とした親インデックス。パーティション0の親は0
#[inline]
pub fn parent_of(index: PartitionIndex) -> PartitionIndex {
    match depth_of(index) {
        0 => 0,
        d => index & !(1 << (d - 1)),
    }
}

/// ディレクトリごとのパーティションマップ
///
/// ディレクトリが何回分割されたか、どのパーティションが存在するかを記録する。
/// マップは単調: `radix` は増えるだけ、ビットはセットされるだけ、
/// `server_count` は増えるだけである。
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    /// 現在のトライの深さ
    radix: u32,

    /// パーティション0を担当するサーバー
    zeroth_server: ServerId,

    /// このディレクトリの配置に参加するサーバー数
    server_count: u32,

    /// パーティション存在ビットマップ
    bitmap: PartitionBitmap,
}

impl PartitionMap {
    /// パーティション0のみを持つ新しいマップを作成
    ///
    /// # Arguments
    /// * `zeroth_server` - パーティション0を担当するサーバー
    /// * `server_count` - 参加サーバー数
    pub fn new(zeroth_server: ServerId, server_count: u32) -> PartitionMapResult<Self> {
        if server_count == 0 {
            return Err(PartitionMapError::NoServers);
        }
        if zeroth_server >= server_count {
            return Err(PartitionMapError::ZerothOutOfRange {
                zeroth: zeroth_server,
                server_count,
            });
        }

        let mut bitmap = PartitionBitmap::empty();
        bitmap.insert(0);

        Ok(Self {
            radix: 0,
            zeroth_server,
            server_count,
            bitmap,
        })
    }

    pub fn radix(&self) -> u32 {
        self.radix
    }

    pub fn zeroth_server(&self) -> ServerId {
        self.zeroth_server
    }

    pub fn server_count(&self) -> u32 {
        self.server_count
    }

    pub fn bitmap(&self) -> &PartitionBitmap {
        &self.bitmap
    }

    /// パーティションが存在するか
    #[inline]
    pub fn exists(&self, index: PartitionIndex) -> bool {
        self.bitmap.contains(index)
    }

    /// 存在するパーティション数
    pub fn partition_count(&self) -> usize {
        self.bitmap.count()
    }

    /// 存在するパーティションを昇順に列挙
    pub fn partitions(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        self.bitmap.iter()
    }

    /// 指定されたサーバーが担当するパーティション
    pub fn partitions_on(&self, server: ServerId) -> Vec<PartitionIndex> {
        self.partitions()
            .filter(|i| self.server_for_index(*i) == server)
            .collect()
    }

    /// 最も深い既存パーティションの深さ
    ///
    /// 不変条件として常に `radix` と等しい。
    pub fn highest_set_depth(&self) -> u32 {
        self.bitmap.highest().map(depth_of).unwrap_or(0)
    }

    /// パーティションが自身の現在の深さで既に子を生んでいるか
    pub fn is_split(&self, index: PartitionIndex) -> bool {
        let d = depth_of(index);
        if d >= MAX_RADIX {
            return false;
        }
        self.exists(index) && self.exists(index + (1 << d))
    }

    /// パーティションをさらに分割できるか
    pub fn can_split(&self, parent: PartitionIndex) -> bool {
        self.compute_child_index(parent).is_ok()
    }

    /// `parent` を分割したときに作られる子のインデックスを計算
    ///
    /// 子は `parent + 2^d`。`d` は `depth(parent)` 以上で、
    /// まだ存在しない子を与える最小の深さ。
    pub fn compute_child_index(&self, parent: PartitionIndex) -> PartitionMapResult<PartitionIndex> {
        if !self.exists(parent) {
            return Err(PartitionMapError::UnknownPartition(parent));
        }

        let mut d = depth_of(parent);
        while d < MAX_RADIX {
            let child = parent + (1 << d);
            if !self.exists(child) {
                return Ok(child);
            }
            d += 1;
        }

        Err(PartitionMapError::MaxRadixReached {
            parent,
            max: MAX_RADIX,
        })
    }

    /// パーティションを担当するサーバー
    #[inline]
    pub fn server_for_index(&self, index: PartitionIndex) -> ServerId {
        ((index as u64 + self.zeroth_server as u64) % self.server_count as u64) as ServerId
    }

    /// 子パーティションの作成を記録する (唯一の変更操作)
    ///
    /// 子の親が存在しない場合はエラー。既に存在する子に対しては何もしない。
    ///
    /// # Returns
    /// マップが変化した場合は `true`
    pub fn mark_split(&mut self, child: PartitionIndex) -> PartitionMapResult<bool> {
        if child == 0 || child as usize >= MAX_PARTITIONS {
            return Err(PartitionMapError::InvalidChild(child));
        }
        let parent = parent_of(child);
        if !self.exists(parent) {
            return Err(PartitionMapError::UnknownPartition(parent));
        }

        if !self.bitmap.insert(child) {
            return Ok(false);
        }
        self.radix = self.radix.max(depth_of(child));
        Ok(true)
    }

    /// サーバー数を増やす (減らすことはない)
    pub fn grow_server_count(&mut self, server_count: u32) -> bool {
        if server_count > self.server_count {
            self.server_count = server_count;
            true
        } else {
            false
        }
    }

    /// 別のマップを取り込む (ビットマップのOR、radix/server_countの最大値)
    ///
    /// # Returns
    /// マップが変化した場合は `true`
    pub fn merge(&mut self, other: &PartitionMap) -> PartitionMapResult<bool> {
        if other.zeroth_server != self.zeroth_server {
            return Err(PartitionMapError::ZerothMismatch {
                ours: self.zeroth_server,
                theirs: other.zeroth_server,
            });
        }

        let mut changed = self.bitmap.union_with(&other.bitmap);
        if other.radix > self.radix {
            self.radix = other.radix;
            changed = true;
        }
        changed |= self.grow_server_count(other.server_count);
        Ok(changed)
    }

    /// `other` が知っているすべてを自分も知っているか
    pub fn covers(&self, other: &PartitionMap) -> bool {
        self.zeroth_server == other.zeroth_server
            && self.radix >= other.radix
            && self.server_count >= other.server_count
            && self.bitmap.is_superset_of(&other.bitmap)
    }
}

impl fmt::Debug for PartitionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionMap")
            .field("radix", &self.radix)
            .field("zeroth_server", &self.zeroth_server)
            .field("server_count", &self.server_count)
            .field("partitions", &self.bitmap)
            .finish()
    }
}

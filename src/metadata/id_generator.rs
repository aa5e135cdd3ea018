use super::types::{InodeId, ServerId};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snowflake-like分散ID生成器
///
/// 64ビットのID構成:
/// - 42ビット: タイムスタンプ（ミリ秒単位、カスタムエポックからの経過時間）
/// - 10ビット: サーバーID（最大1024サーバー: 0-1023）
/// - 12ビット: シーケンス番号（同一ミリ秒内で最大4096個のID生成: 0-4095）
///
/// 複数のコネクションスレッドから同時に呼ばれるため、
/// 状態は1つのMutexで保護する。
#[derive(Debug)]
pub struct IdGenerator {
    /// サーバーID（0-1023）
    server_id: u64,
    /// (最後にIDを生成したタイムスタンプ, 同一ミリ秒内のシーケンス番号)
    state: Mutex<(u64, u64)>,
}

/// ID生成エラー
#[derive(Debug, thiserror::Error)]
pub enum IdGeneratorError {
    #[error("Invalid server ID: {0} (must be 0-1023)")]
    InvalidServerId(u64),

    #[error("Clock moved backwards: last={0}, current={1}")]
    ClockMovedBackwards(u64, u64),
}

pub type IdGeneratorResult<T> = Result<T, IdGeneratorError>;

// ビット構成の定数
const TIMESTAMP_BITS: u64 = 42;
const SERVER_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

const MAX_SERVER_ID: u64 = (1 << SERVER_ID_BITS) - 1; // 1023
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1; // 4095

const SERVER_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SERVER_ID_BITS + SEQUENCE_BITS;

// カスタムエポック: 2024-01-01 00:00:00 UTC のUNIXタイムスタンプ（ミリ秒）
const CUSTOM_EPOCH_MS: u64 = 1704067200000;

impl IdGenerator {
    /// 新しいID生成器を作成
    ///
    /// # Errors
    /// サーバーIDが範囲外の場合はエラー
    pub fn new(server_id: ServerId) -> IdGeneratorResult<Self> {
        let server_id = server_id as u64;
        if server_id > MAX_SERVER_ID {
            return Err(IdGeneratorError::InvalidServerId(server_id));
        }

        Ok(Self {
            server_id,
            state: Mutex::new((0, 0)),
        })
    }

    /// 次のユニークなID（inode番号）を生成
    ///
    /// 生成されるIDは0にならない (0はルートディレクトリ用)。
    ///
    /// # Errors
    /// 時計が巻き戻った場合
    pub fn next_id(&self) -> IdGeneratorResult<InodeId> {
        let mut state = self.state.lock();
        let (last_timestamp, sequence) = &mut *state;

        let mut current = current_timestamp_ms()?;
        if current < *last_timestamp {
            return Err(IdGeneratorError::ClockMovedBackwards(
                *last_timestamp,
                current,
            ));
        }

        if current == *last_timestamp {
            *sequence = (*sequence + 1) & MAX_SEQUENCE;
            if *sequence == 0 {
                // シーケンスがオーバーフロー: 次のミリ秒まで待機
                while current <= *last_timestamp {
                    std::hint::spin_loop();
                    current = current_timestamp_ms()?;
                }
            }
        } else {
            *sequence = 0;
        }

        *last_timestamp = current;

        let timestamp_part = (current - CUSTOM_EPOCH_MS) << TIMESTAMP_SHIFT;
        let server_part = self.server_id << SERVER_ID_SHIFT;
        Ok(timestamp_part | server_part | *sequence)
    }

    /// サーバーIDを取得
    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// IDから各コンポーネントを抽出（デバッグ用）
    pub fn extract_components(id: InodeId) -> (u64, u64, u64) {
        let timestamp = (id >> TIMESTAMP_SHIFT) & ((1 << TIMESTAMP_BITS) - 1);
        let server_id = (id >> SERVER_ID_SHIFT) & MAX_SERVER_ID;
        let sequence = id & MAX_SEQUENCE;

        (timestamp, server_id, sequence)
    }
}

fn current_timestamp_ms() -> IdGeneratorResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| IdGeneratorError::ClockMovedBackwards(0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_invalid_server_id() {
        let result = IdGenerator::new(1024);
        assert!(matches!(
            result.unwrap_err(),
            IdGeneratorError::InvalidServerId(1024)
        ));
    }

    #[test]
    fn test_id_monotonicity() {
        let generator = IdGenerator::new(10).unwrap();

        let mut prev_id = 0;
        for _ in 0..1000 {
            let id = generator.next_id().unwrap();
            assert!(id > prev_id, "ID should be monotonically increasing");
            prev_id = id;
        }
    }

    #[test]
    fn test_extract_components() {
        let generator = IdGenerator::new(123).unwrap();
        let id = generator.next_id().unwrap();

        let (timestamp, server_id, sequence) = IdGenerator::extract_components(id);
        assert_eq!(server_id, 123);
        assert!(timestamp > 0);
        assert!(sequence <= MAX_SEQUENCE);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let generator = Arc::new(IdGenerator::new(7).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..2000)
                        .map(|_| generator.next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}

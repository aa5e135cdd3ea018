// サーバーリストファイル管理モジュール
//
// クラスタのメンバーシップをファイルで共有する。
// ファイルフォーマット:
//   # Comment
//   node_<server_id> ip:port
//
// 例:
//   node_0 192.168.1.10:7400
//   node_1 192.168.1.11:7400

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::metadata::ServerId;

/// サーバーリストエラー型
#[derive(Debug, thiserror::Error)]
pub enum ServerListError {
    /// ファイルが見つからない
    #[error("Server list file not found: {}", .0.display())]
    FileNotFound(std::path::PathBuf),

    /// ファイル読み書きエラー
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// パースエラー
    #[error("Parse error at line {line}: '{content}' - {reason}")]
    ParseError {
        line: usize,
        content: String,
        reason: String,
    },

    /// サーバーが見つからない
    #[error("Server not found: {0}")]
    ServerNotFound(ServerId),
}

/// サーバー情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub node_id: String,
    pub server_id: ServerId,
    pub socket_addr: SocketAddr,
}

/// ノードID (`node_3` または `3`) からサーバーIDを取り出す
pub fn parse_node_id(node_id: &str) -> Option<ServerId> {
    node_id
        .strip_prefix("node_")
        .unwrap_or(node_id)
        .parse::<ServerId>()
        .ok()
}

/// サーバーリストファイルにサーバー情報を追記する
///
/// # Note
/// 複数プロセスから同時に呼ばれる場合の排他は呼び出し元で制御すること
pub fn append_to_server_list(
    path: &Path,
    server_id: ServerId,
    socket_addr: SocketAddr,
) -> Result<(), ServerListError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    writeln!(file, "node_{} {}", server_id, socket_addr)?;
    file.flush()?;

    tracing::debug!("Appended to server list: node_{} -> {}", server_id, socket_addr);
    Ok(())
}

/// サーバーリストファイルを読み込む
///
/// # Returns
/// サーバーID順に並べたサーバー情報
pub fn read_server_list(path: &Path) -> Result<Vec<ServerInfo>, ServerListError> {
    if !path.exists() {
        return Err(ServerListError::FileNotFound(path.to_path_buf()));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut servers = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line_num = line_num + 1;

        // 空行とコメント行をスキップ
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(ServerListError::ParseError {
                line: line_num,
                content: line.clone(),
                reason: format!(
                    "Expected 2 fields (node_id socket_addr), found {}",
                    parts.len()
                ),
            });
        }

        let server_id = parse_node_id(parts[0]).ok_or_else(|| ServerListError::ParseError {
            line: line_num,
            content: line.clone(),
            reason: "node_id must be node_<number>".to_string(),
        })?;

        let socket_addr =
            parts[1]
                .parse::<SocketAddr>()
                .map_err(|e| ServerListError::ParseError {
                    line: line_num,
                    content: line.clone(),
                    reason: format!("Failed to parse SocketAddr: {}", e),
                })?;

        servers.push(ServerInfo {
            node_id: parts[0].to_string(),
            server_id,
            socket_addr,
        });
    }

    servers.sort_by_key(|s| s.server_id);
    tracing::debug!("Read {} servers from server list", servers.len());
    Ok(servers)
}

/// リトライ付きでサーバーリストを読み込む
///
/// サーバーリストファイルがまだ作成されていない場合など、
/// 一時的なエラーに対してリトライする。
pub fn read_server_list_with_retry(
    path: &Path,
    max_retries: usize,
    delay: Duration,
) -> Result<Vec<ServerInfo>, ServerListError> {
    for attempt in 1..=max_retries {
        match read_server_list(path) {
            Ok(list) => {
                tracing::info!(
                    "Read server list (attempt {}/{}): {} servers",
                    attempt,
                    max_retries,
                    list.len()
                );
                return Ok(list);
            }
            Err(ServerListError::FileNotFound(_)) if attempt < max_retries => {
                tracing::debug!(
                    "Server list not found, retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    max_retries
                );
                std::thread::sleep(delay);
            }
            Err(e) => {
                tracing::error!(
                    "Failed to read server list (attempt {}/{}): {}",
                    attempt,
                    max_retries,
                    e
                );
                return Err(e);
            }
        }
    }

    Err(ServerListError::FileNotFound(path.to_path_buf()))
}

/// サーバーリストから特定のサーバーを検索
pub fn find_server(servers: &[ServerInfo], server_id: ServerId) -> Result<&ServerInfo, ServerListError> {
    servers
        .iter()
        .find(|s| s.server_id == server_id)
        .ok_or(ServerListError::ServerNotFound(server_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_append_and_read_server_list() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        append_to_server_list(path, 1, "192.168.1.1:5678".parse().unwrap()).unwrap();
        append_to_server_list(path, 0, "127.0.0.1:1234".parse().unwrap()).unwrap();

        // IDの順に並び替えられる
        let servers = read_server_list(path).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].server_id, 0);
        assert_eq!(servers[0].socket_addr.port(), 1234);
        assert_eq!(servers[1].node_id, "node_1");
        assert_eq!(servers[1].socket_addr.port(), 5678);
    }

    #[test]
    fn test_read_with_comments_and_empty_lines() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "# This is a comment").unwrap();
        writeln!(temp_file).unwrap();
        writeln!(temp_file, "node_0 127.0.0.1:1234").unwrap();
        writeln!(temp_file, "   # Another comment").unwrap();
        writeln!(temp_file, "1 127.0.0.1:5678").unwrap();
        temp_file.flush().unwrap();

        let servers = read_server_list(temp_file.path()).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].server_id, 1);
    }

    #[test]
    fn test_invalid_lines() {
        for bad in [
            "invalid format without port",
            "node_0 invalid:addr",
            "server_a 127.0.0.1:1",
        ] {
            let mut temp_file = NamedTempFile::new().unwrap();
            writeln!(temp_file, "{}", bad).unwrap();
            temp_file.flush().unwrap();

            let result = read_server_list(temp_file.path());
            assert!(
                matches!(result, Err(ServerListError::ParseError { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_file_not_found() {
        let result = read_server_list(Path::new("/nonexistent/path"));
        assert!(matches!(result, Err(ServerListError::FileNotFound(_))));
    }

    #[test]
    fn test_find_server() {
        let servers = vec![
            ServerInfo {
                node_id: "node_0".to_string(),
                server_id: 0,
                socket_addr: "127.0.0.1:1234".parse().unwrap(),
            },
            ServerInfo {
                node_id: "node_1".to_string(),
                server_id: 1,
                socket_addr: "127.0.0.1:5678".parse().unwrap(),
            },
        ];

        assert_eq!(find_server(&servers, 1).unwrap().socket_addr.port(), 5678);
        assert!(matches!(
            find_server(&servers, 2),
            Err(ServerListError::ServerNotFound(2))
        ));
    }
}

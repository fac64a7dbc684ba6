//! 基于文件系统的轮次快照存储
//!
//! 每个轮次一个 `<roundId>.json` 文件。写入走「临时文件 + 原子改名」，
//! 序列化直接流式写入 BufWriter，避免把整份快照在内存中再复制一次。

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use dispatchd_domain::{RoundId, RoundSnapshot, SnapshotStore};
use dispatchd_errors::{DispatchError, DispatchResult};

pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// 创建存储实例，目录不存在时自动建立
    pub fn new<P: AsRef<Path>>(dir: P) -> DispatchResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| DispatchError::persistence(format!("创建快照目录失败: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, round_id: &str) -> PathBuf {
        self.dir.join(format!("{round_id}.json"))
    }

    fn temp_path_for(&self, round_id: &str) -> PathBuf {
        self.dir.join(format!(".{round_id}.json.tmp"))
    }

    fn read_sync(path: &Path) -> DispatchResult<Option<RoundSnapshot>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DispatchError::persistence(format!("读取快照失败: {e}"))),
        };
        let snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| DispatchError::persistence(format!("解析快照失败: {e}")))?;
        Ok(Some(snapshot))
    }

    fn write_sync(path: &Path, temp: &Path, snapshot: &RoundSnapshot) -> DispatchResult<()> {
        {
            let file = fs::File::create(temp)
                .map_err(|e| DispatchError::persistence(format!("创建临时快照文件失败: {e}")))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, snapshot)
                .map_err(|e| DispatchError::persistence(format!("序列化快照失败: {e}")))?;
            writer
                .flush()
                .map_err(|e| DispatchError::persistence(format!("写入快照失败: {e}")))?;
        }
        // rename 在同一目录内是原子替换，旧文件随之消失
        fs::rename(temp, path)
            .map_err(|e| DispatchError::persistence(format!("替换快照文件失败: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn read(&self, round_id: &str) -> DispatchResult<Option<RoundSnapshot>> {
        let path = self.path_for(round_id);
        let round_id = round_id.to_string();
        let result = tokio::task::spawn_blocking(move || Self::read_sync(&path))
            .await
            .map_err(|e| DispatchError::Internal(format!("快照读取任务中断: {e}")))??;
        debug!("读取轮次快照 {}: {}", round_id, if result.is_some() { "命中" } else { "不存在" });
        Ok(result)
    }

    async fn write(&self, snapshot: &RoundSnapshot) -> DispatchResult<()> {
        let round_id = snapshot.metadata.id.clone();
        let path = self.path_for(&round_id);
        let temp = self.temp_path_for(&round_id);
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || Self::write_sync(&path, &temp, &snapshot))
            .await
            .map_err(|e| DispatchError::Internal(format!("快照写入任务中断: {e}")))??;
        debug!("轮次快照已落盘: {}", round_id);
        Ok(())
    }

    async fn delete(&self, round_id: &str) -> DispatchResult<()> {
        let path = self.path_for(round_id);
        let round_id = round_id.to_string();
        tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DispatchError::persistence(format!("删除快照失败: {e}"))),
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("快照删除任务中断: {e}")))??;
        debug!("轮次快照已删除: {}", round_id);
        Ok(())
    }

    async fn list_ids(&self) -> DispatchResult<Vec<RoundId>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut ids = Vec::new();
            let entries = fs::read_dir(&dir)
                .map_err(|e| DispatchError::persistence(format!("枚举快照目录失败: {e}")))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| DispatchError::persistence(format!("枚举快照目录失败: {e}")))?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    warn!("忽略非UTF-8文件名: {:?}", name);
                    continue;
                };
                // 跳过残留的临时文件
                if let Some(id) = name.strip_suffix(".json") {
                    if !id.starts_with('.') {
                        ids.push(id.to_string());
                    }
                }
            }
            Ok(ids)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("快照枚举任务中断: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatchd_domain::{RoundMeta, SourceType, StoreSnapshot, Task};

    fn sample_snapshot(round_id: &str) -> RoundSnapshot {
        let task = Task::new(round_id.to_string(), "/data/a.bin".to_string());
        RoundSnapshot {
            metadata: RoundMeta::new(round_id.to_string(), None, SourceType::Manual, None),
            store: StoreSnapshot {
                round_id: round_id.to_string(),
                tasks: vec![task.clone()],
                pending_queue: vec![task.id],
                processing_started_at: vec![],
                completed_list: vec![],
                failed_list: vec![],
                total_processed_item_num: 7,
                total_processed_running_time: 1.5,
                last_processed_at: None,
            },
        }
    }

    #[tokio::test]
    async fn test_write_read_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();

        let snapshot = sample_snapshot("round_0001");
        store.write(&snapshot).await.unwrap();

        let loaded = store.read("round_0001").await.unwrap().expect("应当存在");
        assert_eq!(loaded.metadata.id, "round_0001");
        assert_eq!(loaded.store.tasks.len(), 1);
        assert_eq!(loaded.store.total_processed_item_num, 7);

        store.delete("round_0001").await.unwrap();
        assert!(store.read("round_0001").await.unwrap().is_none());
        // 重复删除不报错
        store.delete("round_0001").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();

        let mut snapshot = sample_snapshot("round_0002");
        store.write(&snapshot).await.unwrap();

        snapshot.store.total_processed_item_num = 99;
        store.write(&snapshot).await.unwrap();

        let loaded = store.read("round_0002").await.unwrap().unwrap();
        assert_eq!(loaded.store.total_processed_item_num, 99);

        // 没有残留的临时文件
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["round_0002.json".to_string()]);
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        assert!(store.read("round_9999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ids_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();

        store.write(&sample_snapshot("round_0001")).await.unwrap();
        store.write(&sample_snapshot("round_0002")).await.unwrap();
        std::fs::write(dir.path().join(".round_0003.json.tmp"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut ids = store.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["round_0001".to_string(), "round_0002".to_string()]);
    }
}

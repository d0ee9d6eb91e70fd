//! Shared fixtures for tests across the crate.

use super::context::TaskContext;
use super::environment::{TaskEnvironment, UpscalerProfile};
use super::payload::TaskPayload;
use super::types::TaskId;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted folder scan should do.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    BlockUntilCancelled,
    Delay(Duration),
}

/// `TaskEnvironment` whose scans follow a per-folder script.
pub struct ScriptedEnvironment {
    pub library_root: PathBuf,
    pub upscaled_root: PathBuf,
    behaviors: Mutex<HashMap<PathBuf, Behavior>>,
    executed: Mutex<Vec<PathBuf>>,
    ready: Mutex<Vec<i64>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedEnvironment {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            library_root: root.join("library"),
            upscaled_root: root.join("upscaled"),
            behaviors: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, folder: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(PathBuf::from(folder), behavior);
    }

    /// Folders in the order their scans started.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    pub fn ready_chapters(&self) -> Vec<i64> {
        self.ready.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskEnvironment for ScriptedEnvironment {
    fn input_file(&self, payload: &TaskPayload) -> Option<PathBuf> {
        match payload {
            TaskPayload::UpscaleChapter { chapter_path, .. }
            | TaskPayload::RepairUpscale { chapter_path, .. } => {
                Some(self.library_root.join(chapter_path))
            }
            _ => None,
        }
    }

    fn output_file(&self, payload: &TaskPayload) -> Option<PathBuf> {
        match payload {
            TaskPayload::UpscaleChapter { chapter_path, .. }
            | TaskPayload::RepairUpscale { chapter_path, .. } => {
                Some(self.upscaled_root.join(chapter_path))
            }
            _ => None,
        }
    }

    async fn profile(&self, profile_id: i64) -> Option<UpscalerProfile> {
        (profile_id == 1).then(UpscalerProfile::default)
    }

    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        _profile: &UpscalerProfile,
        _ctx: &TaskContext,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn mark_result_ready(&self, payload: &TaskPayload) -> Result<()> {
        if let Some((chapter_id, _)) = payload.upscale_target() {
            self.ready.lock().unwrap().push(chapter_id);
        }
        Ok(())
    }

    async fn scan_folder(&self, _library_id: i64, folder: &Path, ctx: &TaskContext) -> Result<()> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(folder)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        self.executed.lock().unwrap().push(folder.to_path_buf());

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let result = match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(anyhow::anyhow!("scripted failure in {}", folder.display())),
            Behavior::Panic => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("scripted panic in {}", folder.display());
            }
            Behavior::BlockUntilCancelled => {
                ctx.cancellation().cancelled().await;
                Err(anyhow::anyhow!("scan canceled"))
            }
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn check_integrity(&self, _library_id: i64, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn notify_reader(&self, _series_path: &Path) -> Result<()> {
        Ok(())
    }
}

pub fn scan(folder: &str) -> TaskPayload {
    TaskPayload::ScanFolder {
        library_id: 1,
        folder: PathBuf::from(folder),
    }
}

pub fn upscale(chapter_id: i64, chapter_path: &str) -> TaskPayload {
    TaskPayload::UpscaleChapter {
        chapter_id,
        chapter_path: PathBuf::from(chapter_path),
        profile_id: 1,
    }
}

/// Context with a no-op progress sink, for calling payloads directly.
pub fn context(task_id: TaskId, env: Arc<dyn TaskEnvironment>) -> TaskContext {
    TaskContext::new(
        task_id,
        tokio_util::sync::CancellationToken::new(),
        env,
        Arc::new(|_| {}),
    )
}

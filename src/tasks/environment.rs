//! Collaborator seam between the task engine and the rest of the system.
//!
//! Payloads never reach for global state: everything they need from the
//! library, the upscaler or the reader server goes through the
//! [`TaskEnvironment`] handle injected into their [`TaskContext`].

use super::context::TaskContext;
use super::payload::TaskPayload;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const ARCHIVE_EXTENSIONS: [&str; 2] = ["cbz", "zip"];

/// Execution profile handed to the upscaler (and to remote workers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpscalerProfile {
    pub id: i64,
    pub name: String,
    pub model: String,
    pub scale: u8,
    pub output_format: String,
    pub quality: u8,
}

impl Default for UpscalerProfile {
    fn default() -> Self {
        Self {
            id: 1,
            name: "default".to_string(),
            model: "realesrgan-x2".to_string(),
            scale: 2,
            output_format: "webp".to_string(),
            quality: 85,
        }
    }
}

#[async_trait]
pub trait TaskEnvironment: Send + Sync {
    /// Source archive of a chapter task.
    fn input_file(&self, payload: &TaskPayload) -> Option<PathBuf>;

    /// Where the finished artifact of a chapter task belongs.
    fn output_file(&self, payload: &TaskPayload) -> Option<PathBuf>;

    async fn profile(&self, profile_id: i64) -> Option<UpscalerProfile>;

    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscalerProfile,
        ctx: &TaskContext,
    ) -> Result<()>;

    /// Flips the chapter's external state once its upscaled copy is in place.
    async fn mark_result_ready(&self, payload: &TaskPayload) -> Result<()>;

    async fn scan_folder(&self, library_id: i64, folder: &Path, ctx: &TaskContext) -> Result<()>;

    async fn check_integrity(&self, library_id: i64, ctx: &TaskContext) -> Result<()>;

    async fn notify_reader(&self, series_path: &Path) -> Result<()>;
}

/// Filesystem-backed environment that shells out to an external upscaler.
pub struct CommandEnvironment {
    library_root: PathBuf,
    upscaled_root: PathBuf,
    profiles: HashMap<i64, UpscalerProfile>,
    upscaler_command: Option<String>,
    notify_url: Option<String>,
    http_client: reqwest::Client,
}

impl CommandEnvironment {
    /// Environment rooted at the library and the upscaled output tree.
    pub fn new(library_root: impl Into<PathBuf>, upscaled_root: impl Into<PathBuf>) -> Self {
        let default_profile = UpscalerProfile::default();
        Self {
            library_root: library_root.into(),
            upscaled_root: upscaled_root.into(),
            profiles: HashMap::from([(default_profile.id, default_profile)]),
            upscaler_command: None,
            notify_url: None,
            http_client: reqwest::Client::new(),
        }
    }

    /// External upscaler; input, output and profile settings are passed as flags.
    pub fn with_upscaler_command(mut self, command: Option<String>) -> Self {
        self.upscaler_command = command;
        self
    }

    /// Reader server endpoint told about finished chapters.
    pub fn with_notify_url(mut self, url: Option<String>) -> Self {
        self.notify_url = url;
        self
    }

    /// Registers an extra upscaler profile, replacing one with the same id.
    pub fn with_profile(mut self, profile: UpscalerProfile) -> Self {
        self.profiles.insert(profile.id, profile);
        self
    }

    fn chapter_path(payload: &TaskPayload) -> Option<&Path> {
        match payload {
            TaskPayload::UpscaleChapter { chapter_path, .. }
            | TaskPayload::RepairUpscale { chapter_path, .. } => Some(chapter_path.as_path()),
            _ => None,
        }
    }
}

#[async_trait]
impl TaskEnvironment for CommandEnvironment {
    fn input_file(&self, payload: &TaskPayload) -> Option<PathBuf> {
        Self::chapter_path(payload).map(|path| self.library_root.join(path))
    }

    fn output_file(&self, payload: &TaskPayload) -> Option<PathBuf> {
        Self::chapter_path(payload).map(|path| self.upscaled_root.join(path))
    }

    async fn profile(&self, profile_id: i64) -> Option<UpscalerProfile> {
        self.profiles.get(&profile_id).cloned()
    }

    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscalerProfile,
        ctx: &TaskContext,
    ) -> Result<()> {
        let command = self
            .upscaler_command
            .as_deref()
            .context("No upscaler command configured (TASKD_UPSCALER_COMMAND)")?;

        run_upscaler_command(command, input, output, profile, ctx.cancellation()).await
    }

    async fn mark_result_ready(&self, payload: &TaskPayload) -> Result<()> {
        if let Some((chapter_id, profile_id)) = payload.upscale_target() {
            tracing::info!(
                "Chapter {} is now upscaled with profile {}",
                chapter_id,
                profile_id
            );
        }
        Ok(())
    }

    async fn scan_folder(&self, library_id: i64, folder: &Path, ctx: &TaskContext) -> Result<()> {
        let root = self.library_root.join(folder);
        let archives = list_archives(&root).await?;

        for (index, archive) in archives.iter().enumerate() {
            if ctx.is_cancelled() {
                anyhow::bail!("Scan of {} canceled", root.display());
            }
            ctx.report_progress(
                index as u64 + 1,
                archives.len() as u64,
                format!("Found {}", archive.display()),
            );
        }

        tracing::info!(
            "Library {}: scanned {} ({} chapter archives)",
            library_id,
            root.display(),
            archives.len()
        );
        Ok(())
    }

    async fn check_integrity(&self, library_id: i64, ctx: &TaskContext) -> Result<()> {
        let upscaled = list_archives(&self.upscaled_root).await?;
        let mut orphans = 0usize;

        for (index, path) in upscaled.iter().enumerate() {
            let relative = path.strip_prefix(&self.upscaled_root).unwrap_or(path);
            if !tokio::fs::try_exists(self.library_root.join(relative)).await? {
                tracing::warn!("Upscaled chapter without source: {}", relative.display());
                orphans += 1;
            }
            ctx.report_progress(index as u64 + 1, upscaled.len() as u64, "Checking upscaled chapters");
        }

        tracing::info!(
            "Library {} integrity check: {} upscaled chapters, {} orphaned",
            library_id,
            upscaled.len(),
            orphans
        );
        Ok(())
    }

    async fn notify_reader(&self, series_path: &Path) -> Result<()> {
        let Some(url) = self.notify_url.as_deref() else {
            tracing::debug!(
                "No reader server configured, skipping notification for {}",
                series_path.display()
            );
            return Ok(());
        };

        let response = self
            .http_client
            .post(url)
            .json(&serde_json::json!({ "folderPath": series_path }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Reader server notification failed: {}", response.status());
        }
        Ok(())
    }
}

/// Runs the external upscaler and waits for it, killing it on cancellation.
///
/// The command string is split on whitespace; input, output and profile
/// settings are appended as flags.
pub async fn run_upscaler_command(
    command: &str,
    input: &Path,
    output: &Path,
    profile: &UpscalerProfile,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut parts = command.split_whitespace();
    let program = parts.next().context("Upscaler command is empty")?;

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut child = Command::new(program)
        .args(parts)
        .arg("--input")
        .arg(input)
        .arg("--output")
        .arg(output)
        .arg("--model")
        .arg(&profile.model)
        .arg("--scale")
        .arg(profile.scale.to_string())
        .arg("--format")
        .arg(&profile.output_format)
        .arg("--quality")
        .arg(profile.quality.to_string())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start upscaler '{}'", program))?;

    let exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match exit {
        Some(status) => {
            let status = status?;
            if !status.success() {
                anyhow::bail!("Upscaler exited with {}", status);
            }
            Ok(())
        }
        None => {
            let _ = child.kill().await;
            anyhow::bail!("Upscaling of {} canceled", input.display())
        }
    }
}

async fn list_archives(root: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            {
                archives.push(path);
            }
        }
    }

    archives.sort();
    Ok(archives)
}

use super::context::TaskContext;
use super::types::Lane;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The definition of a unit of work.
///
/// Closed set of task kinds. The `kind` tag is the persisted discriminator,
/// and [`TaskPayload::execute`] is the only place that dispatches on it:
/// a new kind is one variant here plus one arm there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run the ML upscaler over a chapter archive.
    UpscaleChapter {
        chapter_id: i64,
        /// Archive path relative to the library root.
        chapter_path: PathBuf,
        profile_id: i64,
    },
    /// Re-run the upscaler for a chapter whose upscaled copy is damaged.
    RepairUpscale {
        chapter_id: i64,
        chapter_path: PathBuf,
        profile_id: i64,
    },
    /// Look for new chapter archives below a library folder.
    ScanFolder { library_id: i64, folder: PathBuf },
    /// Cross-check upscaled copies against their source chapters.
    CheckLibraryIntegrity { library_id: i64 },
    /// Ask the reader server to rescan a series folder.
    NotifyReaderServer { series_path: PathBuf },
}

impl TaskPayload {
    /// Lane membership is a pure function of the variant.
    pub fn lane(&self) -> Lane {
        match self {
            TaskPayload::UpscaleChapter { .. } | TaskPayload::RepairUpscale { .. } => {
                Lane::ComputeHeavy
            }
            TaskPayload::ScanFolder { .. }
            | TaskPayload::CheckLibraryIntegrity { .. }
            | TaskPayload::NotifyReaderServer { .. } => Lane::Standard,
        }
    }

    /// Upper bound on automatic retries after a failure.
    pub fn retry_for(&self) -> u32 {
        match self {
            TaskPayload::UpscaleChapter { .. } => 2,
            TaskPayload::RepairUpscale { .. } => 1,
            TaskPayload::ScanFolder { .. } => 3,
            TaskPayload::CheckLibraryIntegrity { .. } => 1,
            TaskPayload::NotifyReaderServer { .. } => 3,
        }
    }

    /// Stable name of the variant, as stored in the `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::UpscaleChapter { .. } => "upscale_chapter",
            TaskPayload::RepairUpscale { .. } => "repair_upscale",
            TaskPayload::ScanFolder { .. } => "scan_folder",
            TaskPayload::CheckLibraryIntegrity { .. } => "check_library_integrity",
            TaskPayload::NotifyReaderServer { .. } => "notify_reader_server",
        }
    }

    /// Chapter and profile of an upscaling task, `None` for other kinds.
    pub fn upscale_target(&self) -> Option<(i64, i64)> {
        match self {
            TaskPayload::UpscaleChapter {
                chapter_id,
                profile_id,
                ..
            }
            | TaskPayload::RepairUpscale {
                chapter_id,
                profile_id,
                ..
            } => Some((*chapter_id, *profile_id)),
            _ => None,
        }
    }

    /// Runs the task in-process.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let env = ctx.environment();

        match self {
            TaskPayload::UpscaleChapter {
                chapter_id,
                profile_id,
                ..
            }
            | TaskPayload::RepairUpscale {
                chapter_id,
                profile_id,
                ..
            } => {
                let profile = env
                    .profile(*profile_id)
                    .await
                    .with_context(|| format!("Upscaler profile {} not found", profile_id))?;
                let input = env
                    .input_file(self)
                    .with_context(|| format!("No source file for chapter {}", chapter_id))?;
                let output = env
                    .output_file(self)
                    .with_context(|| format!("No destination for chapter {}", chapter_id))?;

                if matches!(self, TaskPayload::RepairUpscale { .. }) {
                    ctx.report_progress(0, 2, format!("Removing damaged copy of chapter {}", chapter_id));
                    match tokio::fs::remove_file(&output).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }

                ctx.report_progress(0, 1, format!("Upscaling chapter {} with {}", chapter_id, profile.name));
                env.upscale(&input, &output, &profile, ctx).await?;
                env.mark_result_ready(self).await?;
                ctx.report_progress(1, 1, "Upscaled");
                Ok(())
            }
            TaskPayload::ScanFolder { library_id, folder } => {
                env.scan_folder(*library_id, folder, ctx).await
            }
            TaskPayload::CheckLibraryIntegrity { library_id } => {
                env.check_integrity(*library_id, ctx).await
            }
            TaskPayload::NotifyReaderServer { series_path } => env.notify_reader(series_path).await,
        }
    }
}

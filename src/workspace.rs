//! Per-request temporary directories and locating the file yt-dlp produced.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "yt_download_";
/// Workspaces renamed aside while their contents are deleted off the runtime.
const REMOVING_PREFIX: &str = "yt_removing_";

/// Paths of workspaces still owned by a request. The stale sweep never
/// touches them, whatever their age.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkspaces(Arc<Mutex<HashSet<PathBuf>>>);

impl ActiveWorkspaces {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, path: PathBuf) {
        self.lock().insert(path);
    }

    fn remove(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A temporary directory owned by exactly one request.
///
/// The directory is deleted when the workspace is dropped, whichever way the
/// request ends.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    base_name: String,
    active: ActiveWorkspaces,
}

impl Workspace {
    pub async fn create(root: &Path, active: &ActiveWorkspaces) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let root = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(WORKSPACE_PREFIX)
                .tempdir_in(root)
        })
        .await
        .map_err(std::io::Error::other)??;

        let path = dir.path().to_path_buf();
        active.insert(path.clone());
        debug!("Created workspace {:?}", path);

        Ok(Self {
            dir: Some(dir),
            path,
            base_name: Uuid::new_v4().simple().to_string(),
            active: active.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Random file stem handed to yt-dlp's output template.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn output_template(&self) -> String {
        self.path
            .join(format!("{}.%(ext)s", self.base_name))
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for Workspace {
    /// The workspace path disappears before `drop` returns. Inside a runtime
    /// the directory is renamed aside and its contents are deleted on the
    /// blocking pool; elsewhere it is deleted in place.
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        let handle = tokio::runtime::Handle::try_current().ok();
        let removing = self.path.file_name().map(|name| {
            self.path.with_file_name(format!(
                "{REMOVING_PREFIX}{}",
                name.to_string_lossy()
            ))
        });
        match (handle, removing) {
            (Some(handle), Some(removing)) if std::fs::rename(&self.path, &removing).is_ok() => {
                // The TempDir's own path is gone now, so dropping it is a no-op.
                drop(dir);
                handle.spawn_blocking(move || remove_renamed(&removing));
            }
            _ => match dir.close() {
                Ok(()) => debug!("Removed workspace {:?}", self.path),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove workspace {:?}: {error}", self.path),
            },
        }

        self.active.remove(&self.path);
    }
}

fn remove_renamed(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed workspace {:?}", path),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Could not remove workspace {:?}: {error}", path),
    }
}

/// Finds the downloaded file inside `workspace`.
///
/// Order: the path yt-dlp reported, files named after the workspace base
/// name (preferring `preferred_ext`), then the largest file present.
pub async fn locate_output(
    workspace: &Workspace,
    hinted: Option<&Path>,
    preferred_ext: &str,
) -> std::io::Result<Option<PathBuf>> {
    let canonical_root = tokio::fs::canonicalize(workspace.path()).await?;

    if let Some(hinted) = hinted {
        let candidate = if hinted.is_absolute() {
            hinted.to_path_buf()
        } else {
            workspace.path().join(hinted)
        };
        if let Some(path) = resolve_candidate(&canonical_root, &candidate).await? {
            return Ok(Some(path));
        }
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(workspace.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            files.push((path, metadata.len()));
        }
    }

    let matching: Vec<&PathBuf> = files
        .iter()
        .map(|(path, _)| path)
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(workspace.base_name()) && !is_partial(name))
        })
        .collect();

    let preferred = matching
        .iter()
        .find(|path| has_extension(path, preferred_ext))
        .or_else(|| matching.first());
    if let Some(path) = preferred
        && let Some(path) = resolve_candidate(&canonical_root, path).await?
    {
        return Ok(Some(path));
    }

    let largest = files
        .iter()
        .filter(|(path, _)| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !is_partial(name))
        })
        .max_by_key(|(_, size)| *size);
    match largest {
        Some((path, _)) => resolve_candidate(&canonical_root, path).await,
        None => Ok(None),
    }
}

fn is_partial(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl")
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

async fn resolve_candidate(
    canonical_root: &Path,
    candidate: &Path,
) -> std::io::Result<Option<PathBuf>> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_root) {
        warn!(
            "Ignoring file outside the request workspace: {:?}",
            canonical
        );
        return Ok(None);
    }

    Ok(Some(canonical))
}

/// Removes workspaces left behind by a crash or kill. Workspaces in `active`
/// belong to running requests and are skipped.
pub async fn sweep_stale_workspaces(
    root: &Path,
    older_than: Duration,
    active: &ActiveWorkspaces,
) -> usize {
    if older_than.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer directory for cleanup: {error}");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate transfer directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let is_workspace = entry
            .file_name()
            .to_str()
            .is_some_and(|name| {
                name.starts_with(WORKSPACE_PREFIX) || name.starts_with(REMOVING_PREFIX)
            });
        if !is_workspace || active.contains(&path) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than || !metadata.is_dir() {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale workspace {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("Removed {removed} stale workspace(s) from {:?}", root);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(path: &Path, len: usize) {
        tokio::fs::write(path, vec![0u8; len]).await.unwrap();
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        let path = workspace.path().to_path_buf();
        write(&path.join("partial.mp4"), 16).await;
        assert!(path.is_dir());

        drop(workspace);
        assert!(!path.exists());

        // Contents are deleted off the runtime thread.
        for _ in 0..200 {
            if root_is_empty(root.path()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workspace contents were never deleted");
    }

    fn root_is_empty(root: &Path) -> bool {
        std::fs::read_dir(root).unwrap().next().is_none()
    }

    #[test]
    fn workspace_dropped_outside_a_runtime_is_removed_in_place() {
        let root = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let workspace = runtime
            .block_on(Workspace::create(root.path(), &ActiveWorkspaces::default()))
            .unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("clip.mp4"), [1u8; 8]).unwrap();
        drop(runtime);

        drop(workspace);
        assert!(!path.exists());
        assert!(root_is_empty(root.path()));
    }

    #[tokio::test]
    async fn active_workspaces_are_tracked_until_dropped() {
        let root = tempfile::tempdir().unwrap();
        let active = ActiveWorkspaces::default();

        let workspace = Workspace::create(root.path(), &active).await.unwrap();
        assert!(active.contains(workspace.path()));
        assert_eq!(active.len(), 1);

        drop(workspace);
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_workspaces_still_in_use() {
        let root = tempfile::tempdir().unwrap();
        let active = ActiveWorkspaces::default();
        let live = Workspace::create(root.path(), &active).await.unwrap();
        write(&live.path().join("clip.mp4"), 8).await;
        let orphan = root.path().join(format!("{WORKSPACE_PREFIX}orphan"));
        tokio::fs::create_dir_all(&orphan).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sweep_stale_workspaces(root.path(), Duration::from_millis(10), &active).await,
            1
        );
        assert!(live.path().join("clip.mp4").exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn workspaces_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let first = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        let second = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        assert_ne!(first.path(), second.path());
        assert_ne!(first.base_name(), second.base_name());
        assert!(first.output_template().ends_with(".%(ext)s"));
    }

    #[tokio::test]
    async fn prefers_hinted_path() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        let hinted = workspace.path().join("Some Title.mkv");
        write(&hinted, 4).await;
        write(&workspace.path().join(format!("{}.mp4", workspace.base_name())), 8).await;

        let found = locate_output(&workspace, Some(&hinted), "mp4").await.unwrap();
        assert_eq!(found.unwrap().file_name().unwrap(), "Some Title.mkv");
    }

    #[tokio::test]
    async fn falls_back_to_base_name_with_preferred_extension() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        let base = workspace.base_name().to_string();
        write(&workspace.path().join(format!("{base}.webm")), 64).await;
        write(&workspace.path().join(format!("{base}.mp4")), 8).await;

        let missing = workspace.path().join("gone.mp4");
        let found = locate_output(&workspace, Some(&missing), "mp4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.extension().unwrap(), "mp4");
    }

    #[tokio::test]
    async fn falls_back_to_largest_file() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        write(&workspace.path().join("small.m4a"), 4).await;
        write(&workspace.path().join("large.webm"), 128).await;
        write(&workspace.path().join("huge.webm.part"), 1024).await;

        let found = locate_output(&workspace, None, "mp4").await.unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "large.webm");
    }

    #[tokio::test]
    async fn empty_workspace_yields_nothing() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();
        assert!(locate_output(&workspace, None, "mp4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hinted_path_outside_workspace_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let outside = root.path().join("outside.mp4");
        write(&outside, 4).await;
        let workspace = Workspace::create(root.path(), &ActiveWorkspaces::default()).await.unwrap();

        let found = locate_output(&workspace, Some(&outside), "mp4").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn sweep_only_touches_old_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join(format!("{WORKSPACE_PREFIX}old"));
        let unrelated = root.path().join("keep-me");
        tokio::fs::create_dir_all(&stale).await.unwrap();
        tokio::fs::create_dir_all(&unrelated).await.unwrap();

        assert_eq!(sweep_stale_workspaces(root.path(), Duration::ZERO, &ActiveWorkspaces::default()).await, 0);
        assert_eq!(
            sweep_stale_workspaces(root.path(), Duration::from_secs(3600), &ActiveWorkspaces::default()).await,
            0
        );
        assert!(stale.exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sweep_stale_workspaces(root.path(), Duration::from_millis(10), &ActiveWorkspaces::default())
                .await,
            1
        );
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }
}

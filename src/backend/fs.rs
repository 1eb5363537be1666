//! Filesystem-backed experiment store honoring `file:` URIs.
//!
//! Layout: `<root>/<experiment-id>/<run-id>/{params,metrics,tags,artifacts}`
//! with one file per param/tag and one append-only file per metric key.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use trackpads_errors::{enverr, usage, ErrorCode, TrackResult};
use uuid::Uuid;

use crate::backend::{RunInfo, TrackingBackend, WriteFormat};

/// Store writing runs as directories under the URI's root path.
#[derive(Debug)]
pub struct FileStoreBackend {
    uri: String,
    root: PathBuf,
    active: Mutex<Vec<RunInfo>>,
}

impl FileStoreBackend {
    /// Open (and create if needed) the store behind a `file:` URI.
    pub fn open(uri: &str) -> TrackResult<Self> {
        let Some(path) = uri.strip_prefix("file:") else {
            return Err(usage!(
                ErrorCode::BackendUnavailable,
                "unsupported backend uri '{}' (expected file:…)",
                uri
            ));
        };
        let root = PathBuf::from(path);
        if root.exists() && !root.is_dir() {
            return Err(enverr!(
                ErrorCode::Io,
                "store path '{}' exists and is not a directory",
                root.display()
            ));
        }
        fs::create_dir_all(&root).map_err(|err| {
            enverr!(
                ErrorCode::Io,
                "failed to create store directory '{}'",
                root.display()
            )
            .with_source(err)
        })?;
        Ok(Self {
            uri: uri.to_string(),
            root,
            active: Mutex::new(Vec::new()),
        })
    }

    fn run_dir(&self, run: &RunInfo) -> PathBuf {
        self.root.join(&run.experiment_id).join(&run.run_id)
    }

    fn active_run_info(&self) -> TrackResult<RunInfo> {
        self.active
            .lock()
            .expect("active run lock")
            .last()
            .cloned()
            .ok_or_else(|| usage!(ErrorCode::NoActiveRun, "no active run to log against"))
    }

    fn write_kv(&self, bucket: &str, key: &str, value: &str) -> TrackResult<()> {
        let run = self.active_run_info()?;
        let dir = self.run_dir(&run).join(bucket);
        fs::create_dir_all(&dir)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to create '{}'", dir.display()).with_source(err))?;
        let path = dir.join(sanitize(key));
        fs::write(&path, value)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to write '{}'", path.display()).with_source(err))
    }

    fn find_run_dir(&self, run_id: &str) -> Option<PathBuf> {
        let experiments = fs::read_dir(&self.root).ok()?;
        for experiment in experiments.flatten() {
            let candidate = experiment.path().join(run_id);
            if candidate.is_dir() {
                return Some(candidate);
            }
        }
        None
    }
}

impl TrackingBackend for FileStoreBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn start_run(&self, experiment: &str, nested: bool) -> TrackResult<RunInfo> {
        let mut active = self.active.lock().expect("active run lock");
        if !nested && !active.is_empty() {
            return Err(usage!(
                ErrorCode::AlreadyActive,
                "a run is already active; use a nested run"
            ));
        }
        let info = RunInfo {
            run_id: Uuid::new_v4().to_string(),
            experiment_id: sanitize(experiment),
        };
        let dir = self.run_dir(&info);
        fs::create_dir_all(&dir).map_err(|err| {
            enverr!(
                ErrorCode::Io,
                "failed to create run directory '{}'",
                dir.display()
            )
            .with_source(err)
        })?;
        active.push(info.clone());
        Ok(info)
    }

    fn resume_run(&self, run_id: &str) -> TrackResult<RunInfo> {
        let dir = self.find_run_dir(run_id).ok_or_else(|| {
            usage!(ErrorCode::UnknownTarget, "run '{}' does not exist", run_id)
        })?;
        let experiment_id = dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let info = RunInfo {
            run_id: run_id.to_string(),
            experiment_id,
        };
        let mut active = self.active.lock().expect("active run lock");
        if active.last() != Some(&info) {
            active.push(info.clone());
        }
        Ok(info)
    }

    fn end_run(&self) -> TrackResult<()> {
        self.active.lock().expect("active run lock").pop();
        Ok(())
    }

    fn active_run(&self) -> Option<RunInfo> {
        self.active.lock().expect("active run lock").last().cloned()
    }

    fn log_param(&self, key: &str, value: &str) -> TrackResult<()> {
        self.write_kv("params", key, value)
    }

    fn log_metric(&self, key: &str, value: f64, step: Option<i64>) -> TrackResult<()> {
        let run = self.active_run_info()?;
        let dir = self.run_dir(&run).join("metrics");
        fs::create_dir_all(&dir)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to create '{}'", dir.display()).with_source(err))?;
        let path = dir.join(sanitize(key));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to open '{}'", path.display()).with_source(err))?;
        let line = match step {
            Some(step) => format!("{} {}\n", value, step),
            None => format!("{}\n", value),
        };
        file.write_all(line.as_bytes())
            .map_err(|err| enverr!(ErrorCode::Io, "failed to append '{}'", path.display()).with_source(err))
    }

    fn set_tag(&self, key: &str, value: &str) -> TrackResult<()> {
        self.write_kv("tags", key, value)
    }

    fn get_tag(&self, run_id: &str, key: &str) -> TrackResult<Option<String>> {
        let Some(dir) = self.find_run_dir(run_id) else {
            return Ok(None);
        };
        let path = dir.join("tags").join(sanitize(key));
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to read '{}'", path.display()).with_source(err))
    }

    fn log_artifact(&self, path: &Path) -> TrackResult<()> {
        let bytes = fs::read(path).map_err(|err| {
            enverr!(
                ErrorCode::Io,
                "failed to read artifact '{}'",
                path.display()
            )
            .with_source(err)
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let run = self.active_run_info()?;
        let dir = self.run_dir(&run).join("artifacts");
        fs::create_dir_all(&dir)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to create '{}'", dir.display()).with_source(err))?;
        let target = dir.join(sanitize(&name));
        fs::write(&target, bytes)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to write '{}'", target.display()).with_source(err))
    }

    fn log_in_memory_artifact(
        &self,
        name: &str,
        bytes: &[u8],
        format: WriteFormat,
    ) -> TrackResult<()> {
        let run = self.active_run_info()?;
        let file_name = format!("{}.{}", sanitize(name), format.extension());
        let path = self.run_dir(&run).join("artifacts").join(file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                enverr!(ErrorCode::Io, "failed to create '{}'", parent.display()).with_source(err)
            })?;
        }
        fs::write(&path, bytes)
            .map_err(|err| enverr!(ErrorCode::Io, "failed to write '{}'", path.display()).with_source(err))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(tmp: &tempfile::TempDir) -> FileStoreBackend {
        let uri = format!("file:{}", tmp.path().join("runs").display());
        FileStoreBackend::open(&uri).expect("open store")
    }

    #[test]
    fn rejects_non_file_uris() {
        let err = FileStoreBackend::open("http://somewhere").expect_err("bad uri");
        assert_eq!(err.code, ErrorCode::BackendUnavailable);
    }

    #[test]
    fn params_and_tags_land_on_disk() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(&tmp);
        let run = store.start_run("exp", false).expect("run");
        store.log_param("alpha", "0.5").expect("param");
        store.set_tag("pads.config", "{}").expect("tag");

        let run_dir = store.run_dir(&run);
        assert_eq!(
            fs::read_to_string(run_dir.join("params").join("alpha")).expect("param file"),
            "0.5"
        );
        assert_eq!(
            store.get_tag(&run.run_id, "pads.config").expect("get tag"),
            Some("{}".to_string())
        );
    }

    #[test]
    fn metrics_append_with_steps() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(&tmp);
        let run = store.start_run("exp", false).expect("run");
        store.log_metric("loss", 0.9, Some(0)).expect("metric");
        store.log_metric("loss", 0.4, Some(1)).expect("metric");

        let contents =
            fs::read_to_string(store.run_dir(&run).join("metrics").join("loss")).expect("metric file");
        assert_eq!(contents, "0.9 0\n0.4 1\n");
    }

    #[test]
    fn artifact_names_are_sanitized() {
        let tmp = tempdir().expect("tempdir");
        let store = open_store(&tmp);
        let run = store.start_run("exp", false).expect("run");
        store
            .log_in_memory_artifact("lib.mod.f/output", b"5", WriteFormat::Text)
            .expect("artifact");
        let artifacts = store.run_dir(&run).join("artifacts");
        assert!(artifacts.join("lib.mod.f_output.txt").exists());
    }
}

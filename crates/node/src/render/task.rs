//! Task payload construction for the agent.
//!
//! Takes a manifest plus one chunk and produces the fully substituted
//! JSON the agent needs: resolved executable, expanded arguments,
//! environment, working dir, output dir (possibly redirected to local
//! staging), and the stdout log destination.

use std::path::{Path, PathBuf};

use midrender_core::error::{CoreError, CoreResult};
use midrender_core::manifest::{substitute_tokens, JobManifest};
use midrender_core::types::ChunkRange;
use serde_json::json;

/// Where a chunk's staging directory lives under the local data dir.
pub fn staging_dir(staging_root: &Path, job_id: &str, chunk: &ChunkRange) -> PathBuf {
    staging_root.join(job_id).join(chunk.label())
}

/// Build the `start_task` payload.
///
/// `output_dir` is the effective output directory -- the manifest's, or
/// the staging substitute. Fails when the template has no executable
/// for this OS.
pub fn build_task_json(
    manifest: &JobManifest,
    chunk: &ChunkRange,
    node_os: &str,
    output_dir: Option<&str>,
    log_path: &Path,
) -> CoreResult<serde_json::Value> {
    let cmd = manifest.cmd_for_os(node_os).ok_or_else(|| {
        CoreError::Validation(format!(
            "template '{}' has no command for OS '{node_os}'",
            manifest.template_id
        ))
    })?;

    let mut args: Vec<String> = Vec::new();
    for flag in &manifest.flags {
        if !flag.name.is_empty() {
            args.push(flag.name.clone());
        }
        if !flag.value.is_empty() {
            args.push(substitute_tokens(&flag.value, chunk));
        }
    }

    let working_dir = manifest
        .working_dir
        .as_deref()
        .map(|dir| substitute_tokens(dir, chunk));

    Ok(json!({
        "job_id": manifest.job_id,
        "chunk_start": chunk.frame_start,
        "chunk_end": chunk.frame_end,
        "cmd": cmd,
        "args": args,
        "env": manifest.env,
        "working_dir": working_dir,
        "output_dir": output_dir,
        "log_path": log_path.to_string_lossy(),
        "progress_regex": manifest.progress_regex,
        "frame_regex": manifest.frame_regex,
        "timeout_seconds": manifest.timeout_seconds,
    }))
}

/// Copy every regular file from the staging directory into the real
/// output directory after a successful render.
pub async fn copy_staging_files(staging: &Path, output: &Path) -> std::io::Result<usize> {
    tokio::fs::create_dir_all(output).await?;

    let mut copied = 0;
    let mut entries = tokio::fs::read_dir(staging).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let dest = output.join(entry.file_name());
            tokio::fs::copy(entry.path(), &dest).await?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midrender_core::manifest::ManifestFlag;
    use std::collections::BTreeMap;

    fn manifest() -> JobManifest {
        let mut cmd = BTreeMap::new();
        cmd.insert("linux".to_string(), "/usr/bin/blender".to_string());
        cmd.insert("windows".to_string(), r"C:\Blender\blender.exe".to_string());

        JobManifest {
            job_id: "shot-040".into(),
            template_id: "blender-cycles".into(),
            submitted_by: "node-a".into(),
            submitted_at_ms: 0,
            frame_start: 1,
            frame_end: 100,
            chunk_size: 10,
            max_retries: 3,
            timeout_seconds: Some(1800),
            output_dir: Some("/mnt/out".into()),
            tags_required: vec![],
            cmd,
            flags: vec![
                ManifestFlag {
                    name: "-b".into(),
                    value: "/mnt/scenes/shot.blend".into(),
                },
                ManifestFlag {
                    name: "-s".into(),
                    value: "{chunk_start}".into(),
                },
                ManifestFlag {
                    name: "-e".into(),
                    value: "{chunk_end}".into(),
                },
                ManifestFlag {
                    name: "-a".into(),
                    value: String::new(),
                },
            ],
            env: BTreeMap::new(),
            working_dir: Some("/mnt/scenes".into()),
            progress_regex: Some(r"Fra:(\d+)".into()),
            frame_regex: None,
        }
    }

    #[test]
    fn task_json_substitutes_chunk_tokens() {
        let task = build_task_json(
            &manifest(),
            &ChunkRange::new(11, 20),
            "linux",
            Some("/mnt/out"),
            Path::new("/farm/jobs/shot-040/stdout/n1/f11-20_0.log"),
        )
        .unwrap();

        assert_eq!(task["cmd"], "/usr/bin/blender");
        let args: Vec<&str> = task["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            args,
            vec!["-b", "/mnt/scenes/shot.blend", "-s", "11", "-e", "20", "-a"]
        );
        assert_eq!(task["chunk_start"], 11);
        assert_eq!(task["chunk_end"], 20);
        assert_eq!(task["output_dir"], "/mnt/out");
        assert_eq!(task["timeout_seconds"], 1800);
    }

    #[test]
    fn task_json_selects_os_specific_command() {
        let task = build_task_json(
            &manifest(),
            &ChunkRange::new(1, 5),
            "windows",
            None,
            Path::new("log"),
        )
        .unwrap();
        assert_eq!(task["cmd"], r"C:\Blender\blender.exe");
    }

    #[test]
    fn missing_os_command_is_rejected() {
        let err = build_task_json(
            &manifest(),
            &ChunkRange::new(1, 5),
            "macos",
            None,
            Path::new("log"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("macos"));
    }

    #[test]
    fn staging_dir_is_per_chunk() {
        let dir = staging_dir(Path::new("/local/staging"), "shot-040", &ChunkRange::new(1, 5));
        assert_eq!(dir, PathBuf::from("/local/staging/shot-040/f1-5"));
    }

    #[tokio::test]
    async fn staging_copy_moves_files_flat() {
        let staging = tempfile::TempDir::new().unwrap();
        let output = tempfile::TempDir::new().unwrap();
        tokio::fs::write(staging.path().join("frame_0001.exr"), b"pixels")
            .await
            .unwrap();
        tokio::fs::write(staging.path().join("frame_0002.exr"), b"pixels")
            .await
            .unwrap();
        tokio::fs::create_dir(staging.path().join("subdir")).await.unwrap();

        let copied = copy_staging_files(staging.path(), output.path()).await.unwrap();
        assert_eq!(copied, 2);
        assert!(output.path().join("frame_0001.exr").is_file());
    }
}

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn metrics_path(data_dir: &Path) -> PathBuf {
    data_dir.join("metrics.jsonl")
}

pub fn append_jsonl<T: Serialize>(data_dir: &Path, obj: &T) -> Result<()> {
    std::fs::create_dir_all(data_dir).context("create data dir failed")?;
    let p = metrics_path(data_dir);
    let mut line = serde_json::to_string(obj).context("serialize metrics json failed")?;
    line.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .with_context(|| format!("open metrics jsonl failed: {}", p.display()))?;
    f.write_all(line.as_bytes())
        .context("write metrics line failed")?;
    Ok(())
}

/// Like [`append_jsonl`], but a failure is only logged.
pub fn append_best_effort<T: Serialize>(data_dir: &Path, obj: &T) {
    if let Err(e) = append_jsonl(data_dir, obj) {
        tracing::warn!("metrics append failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_record() {
        let td = tempfile::tempdir().unwrap();
        append_jsonl(td.path(), &serde_json::json!({"type": "a"})).unwrap();
        append_best_effort(td.path(), &serde_json::json!({"type": "b"}));
        let raw = std::fs::read_to_string(metrics_path(td.path())).unwrap();
        let types: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, ["a", "b"]);
    }
}

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::{Engine, EngineJob, EngineOutput};
use crate::error::EngineError;

const EXTENSIONS: &[&str] = &["txt", "md", "csv", "log", "json"];

/// Options accepted by the text engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextOptions {
    /// Prepend a `# <file name>` heading.
    pub title: bool,
    /// Read at most this many bytes of input.
    pub max_bytes: Option<u64>,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            title: true,
            max_bytes: None,
        }
    }
}

/// Converts plain-text inputs into a Markdown result file.
pub struct TextEngine;

impl TextEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for TextEngine {
    fn name(&self) -> &str {
        "text"
    }

    fn supports(&self, path: &Path) -> bool {
        extension(path).is_some_and(|ext| EXTENSIONS.contains(&ext.as_str()))
    }

    fn process(&self, job: &EngineJob<'_>) -> Result<EngineOutput, EngineError> {
        let options: TextOptions = job.options().parse()?;
        let input = job.input_path();

        let text = read_input(input, options.max_bytes)?;

        let mut markdown = String::new();
        if options.title {
            markdown.push_str(&format!("# {}\n\n", job.file_name()));
        }
        match extension(input).as_deref() {
            Some(lang @ ("json" | "csv")) => {
                markdown.push_str(&format!("```{}\n{}\n```\n", lang, text.trim_end()));
            }
            _ => markdown.push_str(&text),
        }

        let output_dir = job.output_dir();
        std::fs::create_dir_all(output_dir).map_err(|e| EngineError::WriteOutput {
            path: output_dir.to_path_buf(),
            source: e,
        })?;

        let stem = Path::new(job.file_name())
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("result");
        let result_file: PathBuf = output_dir.join(format!("{}.md", stem));
        std::fs::write(&result_file, markdown).map_err(|e| EngineError::WriteOutput {
            path: result_file.clone(),
            source: e,
        })?;

        Ok(EngineOutput::new(output_dir).with_file(result_file))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn read_input(path: &Path, max_bytes: Option<u64>) -> Result<String, EngineError> {
    let read_err = |e: std::io::Error| EngineError::ReadInput {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = std::fs::File::open(path).map_err(read_err)?;
    let mut bytes = Vec::new();
    match max_bytes {
        Some(limit) => file.take(limit).read_to_end(&mut bytes),
        None => file.read_to_end(&mut bytes),
    }
    .map_err(read_err)?;

    // Truncation may split a multi-byte character; keep what decodes.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

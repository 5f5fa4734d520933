//! Shader compilation front end for the Reactive framework.
//!
//! The GPU crates only ever see SPIR-V words. This crate turns shader
//! sources into those words through a [`ShaderCompiler`] and provides the
//! file handling around it: stage inference from file extensions,
//! `#include` expansion, SPIR-V loading and cache staleness checks.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

#[cfg(feature = "shaderc")]
mod shaderc_backend;
#[cfg(feature = "shaderc")]
pub use shaderc_backend::ShadercCompiler;

/// SPIR-V magic number, first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader compilation errors.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A source, include or SPIR-V file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stage could not be inferred from the file name.
    #[error("Cannot infer shader stage from {0}")]
    UnknownStage(PathBuf),

    /// `#include` directives form a cycle.
    #[error("Recursive include of {0}")]
    RecursiveInclude(PathBuf),

    /// The compiler rejected the source. Carries the diagnostic text.
    #[error("Failed to compile {name}:\n{diagnostics}")]
    Compilation { name: String, diagnostics: String },

    /// Bytes that are not a SPIR-V module.
    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Pipeline stage a shader module runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
    Task,
    Mesh,
}

impl ShaderStage {
    /// Infer the stage from a file extension such as `comp` or `rchit`.
    ///
    /// A trailing `.glsl` is skipped, so `trace.rgen.glsl` is a ray
    /// generation shader.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut stem = path.to_path_buf();
        if stem.extension().is_some_and(|ext| ext == "glsl") {
            stem.set_extension("");
        }

        stem.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| CompileError::UnknownStage(path.to_path_buf()))
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "vert" => Self::Vertex,
            "frag" => Self::Fragment,
            "comp" => Self::Compute,
            "rgen" => Self::RayGen,
            "rmiss" => Self::Miss,
            "rchit" => Self::ClosestHit,
            "rahit" => Self::AnyHit,
            "rint" => Self::Intersection,
            "rcall" => Self::Callable,
            "task" => Self::Task,
            "mesh" => Self::Mesh,
            _ => return None,
        })
    }
}

/// Shader source text ready for compilation.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    /// Name reported in diagnostics, usually the file name.
    pub name: String,
    pub text: String,
    pub stage: ShaderStage,
}

impl ShaderSource {
    /// Read a shader file, inferring its stage and expanding includes.
    pub fn from_file(path: &Path) -> Result<Self> {
        let stage = ShaderStage::from_path(path)?;
        let text = expand_includes(path)?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        Ok(Self { name, text, stage })
    }
}

/// Compiles shader sources to SPIR-V.
pub trait ShaderCompiler {
    /// Compile `source`, returning one SPIR-V module per entry point in
    /// the order given.
    fn compile(&self, source: &ShaderSource, entry_points: &[&str]) -> Result<Vec<Vec<u32>>>;
}

/// Convert a byte slice to SPIR-V words, validating length and magic.
pub fn bytes_to_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(CompileError::InvalidSpirv(format!(
            "length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(CompileError::InvalidSpirv(format!(
            "bad magic number {other:#010x}"
        ))),
        None => Err(CompileError::InvalidSpirv("empty module".to_string())),
    }
}

/// Load a compiled `.spv` file.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = fs::read(path).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    bytes_to_spirv(&bytes)
}

/// Paths named by `#include "..."` directives, in order of appearance.
pub fn included_files(source: &str) -> Vec<&str> {
    source.lines().filter_map(include_target).collect()
}

fn include_target(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("#include")?.trim();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Read `path` and inline every `#include "..."` relative to the including file.
pub fn expand_includes(path: &Path) -> Result<String> {
    let mut stack = HashSet::new();
    expand_recursive(path, &mut stack)
}

fn expand_recursive(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<String> {
    let key = path.to_path_buf();
    if !stack.insert(key.clone()) {
        return Err(CompileError::RecursiveInclude(key));
    }

    let text = read_text(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if let Some(target) = include_target(line) {
            out.push_str(&expand_recursive(&dir.join(target), stack)?);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    stack.remove(&key);
    Ok(out)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether `spirv` must be rebuilt from `source`.
///
/// True when the output is missing or older than the source or any file it
/// includes, directly or transitively.
pub fn needs_recompile(source: &Path, spirv: &Path) -> Result<bool> {
    let Some(output_time) = modified(spirv) else {
        return Ok(true);
    };

    let mut pending = vec![source.to_path_buf()];
    let mut seen = HashSet::new();
    while let Some(path) = pending.pop() {
        if !seen.insert(path.clone()) {
            continue;
        }
        let Some(input_time) = modified(&path) else {
            return Err(CompileError::Io {
                path,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        };
        if input_time > output_time {
            tracing::debug!("{} is newer than {}", path.display(), spirv.display());
            return Ok(true);
        }

        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let text = read_text(&path)?;
        pending.extend(included_files(&text).into_iter().map(|inc| dir.join(inc)));
    }

    Ok(false)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

//! Input scanning: collect class bytes from `.class` files, directories,
//! and jars, and write woven output back out.
//!
//! Scanning is deterministic (full path sort) so weave runs are
//! reproducible. The classpath side exists for one consumer only: frame
//! recomputation asks [`ClasspathResolver`] for superclasses when merging
//! reference types, so the closure over jar-manifest `Class-Path` chains
//! is taken up front and every reachable class header is recorded.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::classfile::{self, SuperclassResolver};

/// One class collected from the inputs.
pub struct ScannedClass {
    /// Internal name, read from the classfile header.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Collect every class under the given paths. Directories are walked
/// recursively; jars are read entry by entry; ordering is sorted and
/// deterministic throughout.
pub fn scan_inputs(inputs: &[PathBuf]) -> Result<Vec<ScannedClass>> {
    let mut classes = Vec::new();
    for input in inputs {
        scan_path(input, true, &mut classes)?;
    }
    Ok(classes)
}

fn scan_path(path: &Path, strict: bool, classes: &mut Vec<ScannedClass>) -> Result<()> {
    if path.is_dir() {
        scan_dir(path, classes)
    } else if path.extension().is_some_and(|ext| ext == "class") {
        scan_class_file(path, classes)
    } else if is_jar(path) {
        scan_jar_file(path, classes)
    } else if strict {
        anyhow::bail!("{} is not a class, a jar, or a directory", path.display())
    } else {
        Ok(())
    }
}

/// Walk a directory tree: gather every file first, then visit them in one
/// globally sorted pass. Files that are neither classes nor jars are
/// skipped without complaint.
fn scan_dir(root: &Path, classes: &mut Vec<ScannedClass>) -> Result<()> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();
    for file in files {
        scan_path(&file, false, classes)?;
    }
    Ok(())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry under {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn scan_class_file(path: &Path, classes: &mut Vec<ScannedClass>) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let header = classfile::parse_header(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    classes.push(ScannedClass { name: header.name, bytes });
    Ok(())
}

fn scan_jar_file(path: &Path, classes: &mut Vec<ScannedClass>) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let header = classfile::parse_header(&bytes)
            .with_context(|| format!("failed to parse {}:{}", path.display(), name))?;
        classes.push(ScannedClass { name: header.name, bytes });
    }
    Ok(())
}

/// Close a classpath over jar-manifest `Class-Path` chains. Frame merges
/// want the whole closure: a superclass mentioned only through a chained
/// jar would otherwise merge to `java/lang/Object` and cost precision.
/// Entries keep first-seen order; chained discoveries append after their
/// jar.
pub fn expand_classpath(entries: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut frontier = entries;
    frontier.sort();
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    let mut closure = Vec::new();
    let mut next = 0;
    while next < frontier.len() {
        let entry = frontier[next].clone();
        next += 1;
        if !seen.insert(entry.clone()) {
            continue;
        }
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
        if is_jar(&entry) {
            let mut chained = manifest_class_path_entries(&entry)?;
            chained.sort();
            frontier.extend(chained);
        }
        closure.push(entry);
    }
    Ok(closure)
}

/// `Class-Path` entries of a jar's manifest, resolved against the jar's
/// own directory the way the JVM resolves them. Jars without a manifest
/// or without the attribute contribute nothing.
fn manifest_class_path_entries(jar: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(jar).with_context(|| format!("failed to open {}", jar.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", jar.display()))?;
    let mut manifest = String::new();
    match archive.by_name("META-INF/MANIFEST.MF") {
        Ok(mut entry) => {
            entry
                .read_to_string(&mut manifest)
                .with_context(|| format!("failed to read manifest of {}", jar.display()))?;
        }
        Err(_) => return Ok(Vec::new()),
    }
    let base = jar.parent().unwrap_or_else(|| Path::new(""));
    let entries = class_path_attribute(&manifest)
        .map(|value| {
            value
                .split_whitespace()
                .map(|entry| {
                    let path = PathBuf::from(entry);
                    if path.is_absolute() { path } else { base.join(path) }
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

/// The unfolded value of the manifest's `Class-Path` attribute. Manifests
/// wrap long attribute values across physical lines; a leading space marks
/// a continuation, joined after dropping that one space.
fn class_path_attribute(manifest: &str) -> Option<String> {
    let mut logical: Vec<String> = Vec::new();
    for raw in manifest.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        match line.strip_prefix(' ') {
            Some(continuation) => {
                if let Some(last) = logical.last_mut() {
                    last.push_str(continuation);
                }
            }
            None => logical.push(line.to_string()),
        }
    }
    logical.into_iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key == "Class-Path" {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn is_jar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
}

/// Superclass resolver backed by the class headers of everything the CLI
/// scanned. Unknown names merge to `java/lang/Object`.
#[derive(Default)]
pub struct ClasspathResolver {
    supers: HashMap<String, Option<String>>,
}

impl ClasspathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one class's header.
    pub fn add(&mut self, bytes: &[u8]) -> Result<()> {
        let header = classfile::parse_header(bytes)?;
        self.supers.insert(header.name, header.super_name);
        Ok(())
    }

    /// Record every class under the given paths.
    pub fn add_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
        for class in scan_inputs(paths)? {
            self.add(&class.bytes)?;
        }
        Ok(())
    }
}

impl SuperclassResolver for ClasspathResolver {
    fn super_name(&self, name: &str) -> Option<String> {
        self.supers.get(name).cloned().flatten()
    }
}

/// Write classes into an output directory, one file per internal name.
pub fn write_output_dir(directory: &Path, classes: &[(String, Vec<u8>)]) -> Result<()> {
    for (name, bytes) in classes {
        let path = directory.join(format!("{name}.class"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Write classes into a single jar.
pub fn write_output_jar(path: &Path, classes: &[(String, Vec<u8>)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output directory {}", parent.display()))?;
    }
    let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, bytes) in classes {
        writer
            .start_file(format!("{name}.class"), options)
            .with_context(|| format!("add {name} to {}", path.display()))?;
        writer.write_all(bytes).with_context(|| format!("write {name}"))?;
    }
    writer.finish().with_context(|| format!("finish {}", path.display()))?;
    Ok(())
}

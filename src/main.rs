use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use classweave::classfile;
use classweave::registry::MixinRegistry;
use classweave::runtime;
use classweave::scan::{
    expand_classpath, scan_inputs, write_output_dir, write_output_jar, ClasspathResolver,
};
use classweave::transformer::Transformer;

/// CLI arguments for a weave run.
#[derive(Parser, Debug)]
#[command(
    name = "classweave",
    about = "Applies annotation-driven mixins to JVM class files and jars.",
    version
)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        required = true,
        num_args = 1..,
        help = "Target class/JAR/directory paths."
    )]
    input: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        required = true,
        num_args = 1..,
        help = "Mixin class/JAR/directory paths."
    )]
    mixin: Vec<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Output directory for woven classes.")]
    output: PathBuf,
    #[arg(
        long,
        value_name = "PATH",
        num_args = 1..,
        help = "Classpath entries used to resolve superclasses during frame computation."
    )]
    classpath: Vec<PathBuf>,
    #[arg(long, value_name = "NAME", help = "Bundle the output into a single jar.")]
    jar: Option<String>,
    #[arg(long, help = "Do not emit the classweave runtime support classes.")]
    no_runtime: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let started_at = Instant::now();
    for path in cli.input.iter().chain(&cli.mixin).chain(&cli.classpath) {
        if !path.exists() {
            anyhow::bail!("path not found: {}", path.display());
        }
    }

    let registry = register_mixins(&cli.mixin)?;
    if registry.is_empty() {
        anyhow::bail!("no mixin classes found under the --mixin paths");
    }

    let scan_started_at = Instant::now();
    let classes = scan_inputs(&cli.input)?;
    let scan_duration_ms = scan_started_at.elapsed().as_millis();
    check_duplicate_names(&classes)?;

    let mut resolver = ClasspathResolver::new();
    for class in &classes {
        resolver.add(&class.bytes).ok();
    }
    let classpath = expand_classpath(cli.classpath.clone())?;
    resolver.add_paths(&classpath).context("scan --classpath entries")?;
    resolver.add_paths(&cli.mixin).context("scan --mixin entries")?;
    let resolver = Arc::new(resolver);

    let transformer = Transformer::with_resolver(registry, resolver.clone());
    let weave_started_at = Instant::now();
    let woven: Vec<(String, Vec<u8>, bool)> = classes
        .par_iter()
        .map(|class| -> Result<(String, Vec<u8>, bool)> {
            match transformer.transform(&class.name, &class.bytes)? {
                Some(bytes) => Ok((class.name.clone(), bytes, true)),
                None => Ok((class.name.clone(), class.bytes.clone(), false)),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    let weave_duration_ms = weave_started_at.elapsed().as_millis();

    let transformed = woven.iter().filter(|(_, _, changed)| *changed).count();
    let mut output: Vec<(String, Vec<u8>)> =
        woven.into_iter().map(|(name, bytes, _)| (name, bytes)).collect();
    if !cli.no_runtime {
        for class in runtime::runtime_classes() {
            let bytes = classfile::write(&class, resolver.as_ref())
                .with_context(|| format!("synthesize runtime class {}", class.name))?;
            output.push((class.name.clone(), bytes));
        }
    }

    match &cli.jar {
        Some(name) => write_output_jar(&cli.output.join(name), &output)?,
        None => write_output_dir(&cli.output, &output)?,
    }

    info!(
        classes = output.len(),
        transformed,
        output = %cli.output.display(),
        "weave complete"
    );
    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} weave_ms={} (classes={} transformed={})",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            weave_duration_ms,
            output.len(),
            transformed
        );
    }
    Ok(())
}

fn register_mixins(paths: &[PathBuf]) -> Result<MixinRegistry> {
    let mut registry = MixinRegistry::new();
    for class in scan_inputs(paths)? {
        match registry.register_if_mixin(&class.bytes) {
            Ok(true) => debug!(mixin = %class.name, "registered mixin"),
            Ok(false) => debug!(class = %class.name, "not a mixin, skipping"),
            Err(err) => warn!(
                class = %class.name,
                error = %format!("{err:#}"),
                "failed to register mixin, skipping"
            ),
        }
    }
    Ok(registry)
}

fn check_duplicate_names(classes: &[classweave::scan::ScannedClass]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for class in classes {
        if !seen.insert(class.name.as_str()) {
            anyhow::bail!("duplicate class {} in the inputs", class.name);
        }
    }
    Ok(())
}

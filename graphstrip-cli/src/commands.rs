//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use graphstrip_core::config::{load_config, workspace_config_path};
use graphstrip_core::convert::{Converter, PythonConverter};
use graphstrip_core::fetch::{ArchiveFetcher, locate_file};
use graphstrip_core::graph::DataType;
use graphstrip_core::validate::{CoreMlPredictor, TfPredictor, ValidationReport};
use graphstrip_core::{Graph, Pipeline, PythonRuntime, StripConfig, prune};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REQUIRED_PACKAGES: &[&str] = &["numpy", "tensorflow", "coremltools", "tfcoreml"];

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = || {
        load_config(Some(workspace), config_file)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
    };

    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Fetch { url, dir, force } => {
            handle_fetch(config()?, workspace, url, dir, force).await
        }
        Commands::Inspect { graph, json } => handle_inspect(&graph, json),
        Commands::Prune {
            graph,
            inputs,
            outputs,
            out,
            dtype,
        } => handle_prune(config()?, workspace, graph, inputs, outputs, out, dtype),
        Commands::Convert {
            graph,
            out,
            input_shapes,
            output_tensors,
        } => {
            handle_convert(config()?, workspace, graph, out, input_shapes, output_tensors).await
        }
        Commands::Validate {
            graph,
            model,
            input,
            tolerance,
            seed,
        } => handle_validate(config()?, workspace, graph, model, input, tolerance, seed).await,
        Commands::Run { graph } => handle_run(config()?, workspace, graph).await,
        Commands::Doctor => handle_doctor(config()?, workspace).await,
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&StripConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_fetch(
    config: StripConfig,
    workspace: &Path,
    url: Option<String>,
    dir: Option<PathBuf>,
    force: bool,
) -> anyhow::Result<()> {
    let url = url.unwrap_or_else(|| config.fetch.url.clone());
    let dest = dir.unwrap_or_else(|| config.model_dir(workspace));
    let fetcher = ArchiveFetcher::new(
        Duration::from_secs(config.fetch.timeout_secs),
        config.fetch.reuse_existing && !force,
    )?;

    let fetched = fetcher
        .fetch(&url, &dest)
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;

    let verb = if fetched.reused { "Reused" } else { "Downloaded" };
    println!("{} {}", verb, fetched.archive_path.display());
    println!("Extracted {} file(s) to {}", fetched.files.len(), dest.display());
    for file in &fetched.files {
        println!("  {}", file.display());
    }
    Ok(())
}

fn handle_inspect(graph_path: &Path, json: bool) -> anyhow::Result<()> {
    let graph = Graph::load(graph_path)?;
    let summary = graph.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Graph: {}", graph_path.display());
    println!("  Nodes: {}", summary.node_count);
    if let Some(producer) = summary.producer {
        println!("  Producer version: {}", producer);
    }
    println!("  Placeholders ({}):", summary.placeholders.len());
    for name in &summary.placeholders {
        println!("    {}", name);
    }
    println!("  Terminal nodes ({}):", summary.terminals.len());
    for name in &summary.terminals {
        println!("    {}", name);
    }

    let mut ops: Vec<_> = summary.op_counts.iter().collect();
    ops.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    println!("  Ops ({} distinct):", ops.len());
    for (op, count) in ops {
        println!("    {:<32} {}", op, count);
    }
    Ok(())
}

/// The graph to work on: an explicit path, or the configured graph file
/// inside the model directory.
fn source_graph(
    config: &StripConfig,
    workspace: &Path,
    graph: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    match graph {
        Some(path) => Ok(path),
        None => locate_file(&config.model_dir(workspace), &config.fetch.graph_file).context(
            "No graph given and none found in the model directory (run `graphstrip fetch` first)",
        ),
    }
}

fn handle_prune(
    mut config: StripConfig,
    workspace: &Path,
    graph: Option<PathBuf>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    out: Option<PathBuf>,
    dtype: Option<String>,
) -> anyhow::Result<()> {
    if !inputs.is_empty() {
        config.prune.input_nodes = inputs;
    }
    if !outputs.is_empty() {
        config.prune.output_nodes = outputs;
    }
    if let Some(name) = dtype {
        config.prune.placeholder_dtype = DataType::from_name(&name)
            .with_context(|| format!("Unknown dtype '{name}'"))?;
    }

    let graph_path = source_graph(&config, workspace, graph)?;
    let pipeline = Pipeline::new(config, workspace);
    let out = out.unwrap_or_else(|| pipeline.paths().pruned_graph.clone());

    let graph = Graph::load(&graph_path)?;
    let outcome = prune(&graph, &pipeline.prune_spec()?)?;
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    outcome
        .graph
        .save(&out)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!(
        "Pruned {} -> {} ({} of {} nodes kept, {} removed)",
        graph_path.display(),
        out.display(),
        outcome.kept,
        graph.len(),
        outcome.removed
    );
    Ok(())
}

async fn handle_convert(
    mut config: StripConfig,
    workspace: &Path,
    graph: Option<PathBuf>,
    out: Option<PathBuf>,
    input_shapes: Vec<(String, Vec<usize>)>,
    output_tensors: Vec<String>,
) -> anyhow::Result<()> {
    if !input_shapes.is_empty() {
        config.convert.input_shapes = input_shapes.into_iter().collect();
    }
    if !output_tensors.is_empty() {
        config.convert.output_tensors = output_tensors;
    }

    let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());
    let pipeline = Pipeline::new(config, workspace);
    let mut request = pipeline.conversion_request();
    if let Some(graph) = graph {
        request.source_path = graph;
    }
    if let Some(out) = out {
        request.output_path = out;
    }

    let converter = PythonConverter::new(runtime);
    let result = converter.convert(&request).await?;
    println!(
        "Converted {} -> {} ({})",
        result.source_path.display(),
        result.output_path.display(),
        result.target_format
    );
    println!(
        "  {} bytes -> {} bytes, sha256 {}",
        result.source_size_bytes, result.output_size_bytes, result.output_sha256
    );
    Ok(())
}

async fn handle_validate(
    mut config: StripConfig,
    workspace: &Path,
    graph: Option<PathBuf>,
    model: Option<PathBuf>,
    input: Option<PathBuf>,
    tolerance: Option<f32>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    if input.is_some() {
        config.validate.input_file = input;
    }
    if let Some(tolerance) = tolerance {
        config.validate.tolerance = tolerance;
    }
    if let Some(seed) = seed {
        config.validate.seed = seed;
    }

    let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());
    let pipeline = Pipeline::new(config.clone(), workspace);
    let graph = graph.unwrap_or_else(|| pipeline.paths().pruned_graph.clone());
    let model = model.unwrap_or_else(|| pipeline.paths().converted_model.clone());
    let pipeline = pipeline.with_predictors(
        Box::new(TfPredictor::new(runtime.clone(), graph)),
        Box::new(CoreMlPredictor::new(runtime, model, config.validate.cpu_only)),
    );

    let report = pipeline.validate().await?;
    print_validation(&report);
    if !report.passed {
        anyhow::bail!(
            "Validation failed: worst relative error {} exceeds tolerance {}",
            report.worst_error(),
            report.tolerance
        );
    }
    Ok(())
}

async fn handle_run(
    config: StripConfig,
    workspace: &Path,
    graph: Option<PathBuf>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config, workspace);
    let report = match graph {
        Some(path) => pipeline.run_from_graph(&path).await?,
        None => pipeline.run().await?,
    };

    println!(
        "Pruned graph: {} ({} nodes, {} removed)",
        report.prune.pruned_graph.display(),
        report.prune.pruned_nodes,
        report.prune.removed_nodes
    );
    println!("Converted model: {}", report.conversion.output_path.display());
    print_validation(&report.validation);
    println!("Report: {}", pipeline.paths().report.display());

    if !report.passed() {
        anyhow::bail!("Validation failed");
    }
    Ok(())
}

fn print_validation(report: &ValidationReport) {
    println!(
        "Validation ({} vs {}, tolerance {}):",
        report.source_runtime, report.target_runtime, report.tolerance
    );
    for c in &report.comparisons {
        println!(
            "  {:<24} max relative error {:<12} {}",
            c.name,
            c.max_relative_error,
            if c.passed { "ok" } else { "FAILED" }
        );
    }
}

async fn handle_doctor(config: StripConfig, workspace: &Path) -> anyhow::Result<()> {
    println!("Workspace: {}", workspace.display());
    println!("Model directory: {}", config.model_dir(workspace).display());
    println!(
        "Workspace config: {}",
        workspace_config_path(workspace).display()
    );
    if let Some(user) = graphstrip_core::config::user_config_path() {
        println!("User config: {}", user.display());
    }

    match PythonRuntime::detect().await {
        Ok(info) => {
            println!("Python: {} ({})", info.version, info.path.display());
            if let Some(venv) = info.venv_path {
                println!("  virtualenv: {}", venv.display());
            }
        }
        Err(e) => {
            println!("Python: not found ({})", e);
            return Ok(());
        }
    }

    let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());
    let packages = runtime.check_packages(REQUIRED_PACKAGES).await;
    let mut missing = Vec::new();
    for (name, available) in &packages {
        println!("  {:<12} {}", name, if *available { "ok" } else { "missing" });
        if !available {
            missing.push(name.as_str());
        }
    }
    if !missing.is_empty() {
        println!("Install with: pip install {}", missing.join(" "));
    }
    Ok(())
}

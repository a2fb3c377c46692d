// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Parser;
use satchel::archive::DirectorySink;
use satchel::{DirectoryImporter, PackageExporter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "satchel", version, about = clap::crate_description!())]
struct Args {
    /// Add a search path for Python modules
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Directory the archive records are written to
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// Intern modules matching this glob
    #[arg(long = "intern", value_name = "GLOB")]
    intern: Vec<String>,

    /// Mock out modules matching this glob
    #[arg(long = "mock", value_name = "GLOB")]
    mock: Vec<String>,

    /// Declare modules matching this glob external
    #[arg(long = "extern", value_name = "GLOB")]
    extern_modules: Vec<String>,

    /// Forbid modules matching this glob
    #[arg(long = "deny", value_name = "GLOB")]
    deny: Vec<String>,

    /// Framework root that is externed without an explicit rule
    #[arg(long, value_name = "NAME")]
    framework: Option<String>,

    /// Write a JSON report of the finished package
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Write the dependency graph to a dot file
    #[arg(long, value_name = "FILE")]
    graph: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Entry modules to package
    #[arg(value_name = "MODULE", required = true)]
    modules: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Instantiate a new logger with the verbosity level the user requested.
    simple_logger::init_with_level(match args.verbose {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    })?;

    let roots = if args.include.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.include.clone()
    };
    let importer = DirectoryImporter::with_roots(roots);
    let sink = DirectorySink::new(&args.output)
        .with_context(|| format!("Failed to open output directory `{}`", args.output.display()))?;

    let mut exporter = PackageExporter::new(Box::new(sink), Box::new(importer));
    if let Some(framework) = &args.framework {
        exporter.set_framework_root(framework);
    }
    for pattern in &args.intern {
        exporter.intern(pattern)?;
    }
    for pattern in &args.mock {
        exporter.mock(pattern)?;
    }
    for pattern in &args.extern_modules {
        exporter.extern_(pattern)?;
    }
    for pattern in &args.deny {
        exporter.deny(pattern)?;
    }

    for module in &args.modules {
        exporter
            .save_module(module, true)
            .with_context(|| format!("Failed to save module `{}`", module))?;
    }

    if let Some(path) = &args.graph {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "{}", exporter.graph_dot())?;
    }

    let report = exporter.finalize()?;

    if let Some(path) = &args.manifest {
        let json = serde_json::to_string_pretty(&report)?;
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", json)?;
    }

    Ok(())
}

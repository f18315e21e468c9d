//! Strata CLI - Demand-driven Array Pipelines
//!
//! This is a demonstration CLI for the Strata library.

use anyhow::{bail, Context, Result};
use log::info;
use std::path::PathBuf;
use strata::filters::builtin::save_array_as_image;
use strata::prelude::*;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("strata");

    if args.len() < 2 {
        print_usage(program);
        return;
    }

    let result = match args[1].as_str() {
        "schedule" => print_schedule(&args[2..]),
        "pyramid" => build_pyramid(&args[2..]),
        "demo" => run_demo(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage(program);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(program);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Strata v{}", strata::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  schedule [options]             Print a shrink schedule");
    println!("  pyramid <in> <out-dir> [opts]  Write every pyramid level of an image");
    println!("  demo [--config <toml>]         Run a synthetic pipeline and print its snapshot");
    println!("  help                           Show this help message");
    println!();
    println!("Schedule options:");
    println!("  --levels <n>        Number of levels (default: 3)");
    println!("  --axes <n>          Number of axes (default: 2)");
    println!("  --start <a,b,...>   Starting factors per axis");
    println!();
    println!("Pyramid options:");
    println!("  --levels <n>        Number of levels (default: 3)");
    println!("  --config <toml>     Execution options file");
}

/// Flags of the form `--name value`.
struct Flags<'a> {
    args: &'a [String],
}

impl<'a> Flags<'a> {
    fn new(args: &'a [String]) -> Self {
        Self { args }
    }

    fn value(&self, name: &str) -> Option<&'a str> {
        self.args
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.value(name) {
            Some(text) => text
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value '{}' for {}", text, name)),
            None => Ok(default),
        }
    }

    fn positional(&self) -> Vec<&'a str> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.args.len() {
            if self.args[i].starts_with("--") {
                i += 2;
            } else {
                out.push(self.args[i].as_str());
                i += 1;
            }
        }
        out
    }

    fn options(&self) -> Result<ExecutionOptions> {
        match self.value("--config") {
            Some(path) => ExecutionOptions::from_toml_file(path)
                .with_context(|| format!("Failed to load options from {}", path)),
            None => Ok(ExecutionOptions::default()),
        }
    }
}

fn parse_factors(text: &str) -> Result<Vec<u32>> {
    text.split(',')
        .map(|f| {
            f.trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid shrink factor '{}'", f))
        })
        .collect()
}

fn print_schedule(args: &[String]) -> Result<()> {
    let flags = Flags::new(args);
    let levels = flags.parsed("--levels", 3usize)?;

    let schedule = match flags.value("--start") {
        Some(start) => ScheduleBuilder::build_from_start_factors(&parse_factors(start)?, levels),
        None => ScheduleBuilder::build_from_level_count(levels, flags.parsed("--axes", 2usize)?),
    };

    print!("{}", schedule);
    println!("downward divisible: {}", schedule.is_downward_divisible());
    Ok(())
}

fn build_pyramid(args: &[String]) -> Result<()> {
    let flags = Flags::new(args);
    let positional = flags.positional();
    let (input, out_dir) = match positional.as_slice() {
        [input, out_dir, ..] => (PathBuf::from(input), PathBuf::from(out_dir)),
        _ => bail!("Please specify an input image and an output directory"),
    };
    let levels = flags.parsed("--levels", 3usize)?;

    let mut pipeline = Pipeline::with_options(flags.options()?)?.with_name("pyramid");
    let source = pipeline.add_stage(ImageSource::from_path(&input));
    let mut stage = MultiResolutionPyramid::new(2);
    stage.set_number_of_levels(levels);
    let pyramid = pipeline.add_stage(stage);
    pipeline.connect(source, "output", pyramid, "input")?;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    for level in 0..levels {
        let port = format!("level_{}", level);
        let report = pipeline.request_update(pyramid, &port)?;
        let buffer = report
            .output
            .as_array()
            .context("Pyramid level is not an array")?;
        let path = out_dir.join(format!("{}.png", port));
        save_array_as_image(buffer, &path)?;
        info!(
            "{}: {} ({} executed, {} reused in {:?})",
            port,
            buffer.region(),
            report.stats.outputs_executed,
            report.stats.outputs_reused,
            report.stats.duration
        );
    }
    Ok(())
}

fn run_demo(args: &[String]) -> Result<()> {
    let flags = Flags::new(args);
    let mut pipeline = Pipeline::with_options(flags.options()?)?.with_name("demo");

    let information = ImageInformation::new(Region::from_size([256, 256]));
    let source = pipeline.add_stage(FunctionSource::new(information, |idx| {
        ((idx[0] as f32 / 16.0).sin() * (idx[1] as f32 / 16.0).cos() + 1.0) / 2.0
    }));
    let smooth = pipeline.add_stage(MeanSmoothing::new(vec![2, 2]));
    let mut stage = MultiResolutionPyramid::new(2);
    stage.set_number_of_levels(4);
    let pyramid = pipeline.add_stage(stage);
    let stats = pipeline.add_stage(StatisticsStage::new());

    pipeline.connect(source, "output", smooth, "input")?;
    pipeline.connect(smooth, "output", pyramid, "input")?;
    pipeline.connect(pyramid, "level_0", stats, "input")?;

    pipeline.add_observer(pyramid, EventKind::End, |event: &Event| {
        info!("Finished {}", event.output);
        Ok(())
    })?;

    // A corner of the finest level only reads a corner of the source
    let corner = pipeline.update_region(pyramid, "level_3", Region::new([0, 0], [32, 32]))?;
    info!("Corner: {} outputs executed", corner.stats.outputs_executed);

    for feature in StatisticFeature::ALL {
        let value = pipeline.get_feature(stats, feature.name())?;
        info!("{} of level_0: {:.4}", feature, value);
    }

    println!("{}", pipeline.snapshot().to_json()?);
    Ok(())
}

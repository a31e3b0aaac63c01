//! caresched CLI - batch driver for the decomposition engine.
//!
//! Reads a YAML configuration (a `base` block plus per-group overrides),
//! walks the input tree `input/<group>/<instance>.json`, and solves every
//! selected (config, group, instance) combination into
//! `output/<config>__<group>__<instance>/`.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caresched_core::MasterInstance;
use caresched_solver::{
    solve_monolithic, ConfigFile, InstanceDriver, OutputLayout, SolverConfig, StructureType,
};

#[derive(Parser)]
#[command(name = "caresched")]
#[command(author, version, about = "Iterative care-unit scheduling solver", long_about = None)]
struct Cli {
    /// Location of the solving configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Location of master instance groups
    #[arg(short, long)]
    input: PathBuf,

    /// Where the output will be written
    #[arg(short, long)]
    output: PathBuf,

    /// Allow overwriting previous per-instance output directories
    #[arg(long)]
    overwrite: bool,
}

/// One unit of work: a configuration applied to one instance file.
#[derive(Clone, Debug, PartialEq, Eq)]
struct WorkItem {
    config_name: String,
    group_name: String,
    instance_name: String,
    instance_path: PathBuf,
}

impl WorkItem {
    fn output_dir(&self, output_root: &Path) -> PathBuf {
        output_root.join(format!(
            "{}__{}__{}",
            self.config_name, self.group_name, self.instance_name
        ))
    }
}

/// Enumerate the work the filters and overwrite policy leave to do.
fn collect_work(
    config_file: &ConfigFile,
    input_root: &Path,
    output_root: &Path,
    overwrite: bool,
) -> Result<Vec<WorkItem>> {
    let mut work = Vec::new();

    for config_name in config_file.group_names() {
        let config = config_file
            .group_config(config_name)
            .with_context(|| format!("invalid configuration group '{config_name}'"))?;
        if !config.is_combination_to_do(Some(config_name), None, None) {
            continue;
        }

        let mut group_dirs: Vec<PathBuf> = fs::read_dir(input_root)
            .with_context(|| format!("cannot read input directory {}", input_root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        group_dirs.sort();

        for group_dir in group_dirs {
            let group_name = group_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if !config.is_combination_to_do(Some(config_name), Some(&group_name), None) {
                continue;
            }

            let mut instance_paths: Vec<PathBuf> = fs::read_dir(&group_dir)
                .with_context(|| format!("cannot read group directory {}", group_dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect();
            instance_paths.sort();

            for instance_path in instance_paths {
                let instance_name = instance_path
                    .file_stem()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                if !config.is_combination_to_do(
                    Some(config_name),
                    Some(&group_name),
                    Some(&instance_name),
                ) {
                    continue;
                }

                let item = WorkItem {
                    config_name: config_name.clone(),
                    group_name: group_name.clone(),
                    instance_name,
                    instance_path,
                };
                if !overwrite && item.output_dir(output_root).exists() {
                    println!(
                        "WARNING: directory {} already exists, will not be considered.",
                        item.output_dir(output_root).display()
                    );
                    continue;
                }
                work.push(item);
            }
        }
    }

    Ok(work)
}

fn print_preliminary_info(work: &[WorkItem]) {
    println!("\n***** [PRELIMINARY INFORMATION] *****");

    let mut per_config: BTreeMap<&str, usize> = BTreeMap::new();
    for item in work {
        *per_config.entry(&item.config_name).or_default() += 1;
    }
    if per_config.is_empty() {
        println!("WARNING: no instance selected to solve");
    }
    for (config_name, count) in &per_config {
        println!("Configuration '{config_name}' will be solving {count} instances");
    }
    println!(
        "{} configurations will be solving {} instances overall; some may be the same, repeated in different groups",
        per_config.len(),
        work.len()
    );
    println!("***** [END OF PRELIMINARY INFORMATION] *****\n");
}

/// Solve one instance; the returned code follows the exit-code contract
/// (0 OK, 1-14 per failing checker phase).
fn solve_work_item(item: &WorkItem, config: &SolverConfig, merged: &serde_yaml::Value, output_root: &Path) -> i32 {
    let instance: MasterInstance = match fs::read_to_string(&item.instance_path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
    {
        Ok(instance) => instance,
        Err(error) => {
            println!("ERROR: cannot read instance {}: {error}", item.instance_path.display());
            return 1;
        }
    };

    let layout = OutputLayout::new(item.output_dir(output_root));

    let report = if config.structure_type == StructureType::Monolithic {
        solve_monolithic(&instance, config, &layout, Some(merged))
    } else {
        InstanceDriver::new(&instance, config.clone(), layout, Some(merged))
            .and_then(|mut driver| driver.run())
    };

    match report {
        Ok(report) => {
            println!(
                "[{}] stop: {:?}, iterations: {}, best value: {}, solver time: {:.2}s",
                item.instance_name,
                report.stop,
                report.iterations,
                report
                    .best_final_value
                    .map_or_else(|| "none".to_string(), |v| format!("{v}")),
                report.solver_time.as_secs_f64(),
            );
            0
        }
        Err(error) => {
            println!("[{}] ERROR: {error}", item.instance_name);
            error.exit_code()
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_text = fs::read_to_string(&cli.config)
        .with_context(|| format!("cannot read configuration {}", cli.config.display()))?;
    let config_file = ConfigFile::parse(&config_text)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("cannot create output directory {}", cli.output.display()))?;

    let work = collect_work(&config_file, &cli.input, &cli.output, cli.overwrite)?;
    print_preliminary_info(&work);

    let total = work.len();
    let mut solved = 0usize;
    for (index, item) in work.iter().enumerate() {
        let config = config_file
            .group_config(&item.config_name)
            .with_context(|| format!("invalid configuration group '{}'", item.config_name))?;
        let merged = config_file.merged_value(&item.config_name);

        println!(
            "Solving instance '{}' of group '{}' with config '{}' ({}/{total})",
            item.instance_name,
            item.group_name,
            item.config_name,
            index + 1,
        );
        let code = solve_work_item(item, &config, &merged, &cli.output);
        if code == 0 {
            solved += 1;
        } else {
            println!("Error code: {code}");
        }
    }

    println!("End of tests. Solved {solved} instances.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r"
base:
    structure_type: slim-fat
    core_type: basic
    max_iteration: 5
groups:
    quick: {}
    filtered:
        groups_to_do: [groupA]
";

    fn sample_tree() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        for group in ["groupA", "groupB"] {
            fs::create_dir_all(input.join(group)).unwrap();
            fs::write(input.join(group).join("inst0.json"), "{}").unwrap();
            fs::write(input.join(group).join("notes.txt"), "").unwrap();
        }
        fs::create_dir_all(&output).unwrap();
        (dir, input, output)
    }

    #[test]
    fn collects_json_instances_per_group_and_config() {
        let (_dir, input, output) = sample_tree();
        let config_file = ConfigFile::parse(CONFIG).unwrap();
        let work = collect_work(&config_file, &input, &output, false).unwrap();

        // 'quick' takes both groups, 'filtered' only groupA.
        assert_eq!(work.len(), 3);
        let filtered: Vec<&WorkItem> =
            work.iter().filter(|w| w.config_name == "filtered").collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].group_name, "groupA");
        assert_eq!(filtered[0].instance_name, "inst0");
    }

    #[test]
    fn existing_output_is_skipped_without_overwrite() {
        let (_dir, input, output) = sample_tree();
        let config_file = ConfigFile::parse(CONFIG).unwrap();
        fs::create_dir_all(output.join("quick__groupA__inst0")).unwrap();

        let without = collect_work(&config_file, &input, &output, false).unwrap();
        assert_eq!(without.len(), 2);

        let with = collect_work(&config_file, &input, &output, true).unwrap();
        assert_eq!(with.len(), 3);
    }

    #[test]
    fn output_dir_encodes_the_combination() {
        let item = WorkItem {
            config_name: "cfg".into(),
            group_name: "grp".into(),
            instance_name: "inst".into(),
            instance_path: PathBuf::from("/in/grp/inst.json"),
        };
        assert_eq!(item.output_dir(Path::new("/out")), PathBuf::from("/out/cfg__grp__inst"));
    }
}

//! On-disk layout of one instance's solving artifacts.
//!
//! Everything the driver produces lands under a single per-instance
//! directory; each iteration gets a fresh `iter_<k>/` subdirectory, so a
//! failing iteration never corrupts artifacts of earlier ones. Persistence
//! is the source of truth for the cache: matched day results are re-read
//! from these files, never from memory.

use crate::milp::{SolveOutcome, SolveStatus};
use caresched_core::{DayName, IterationName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Paths of one `<output>/<config>__<group>__<instance>/` tree.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_instance(&self) -> PathBuf {
        self.root.join("master_instance.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn best_final_result(&self) -> PathBuf {
        self.root.join("best_final_result_so_far.json")
    }

    pub fn iteration_dir(&self, iteration: IterationName) -> PathBuf {
        self.root.join(format!("iter_{iteration}"))
    }

    pub fn master_result(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("master_result.json")
    }

    pub fn master_log(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("master_log.log")
    }

    pub fn cache_matching(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("cache_matching.json")
    }

    pub fn cache_final_result(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("cache_final_result.json")
    }

    pub fn cache_log(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("cache_log.log")
    }

    pub fn subproblem_instance(&self, iteration: IterationName, day: DayName) -> PathBuf {
        self.iteration_dir(iteration).join(format!("subproblem_day_{day}_instance.json"))
    }

    pub fn subproblem_result(&self, iteration: IterationName, day: DayName) -> PathBuf {
        self.iteration_dir(iteration).join(format!("subproblem_day_{day}_result.json"))
    }

    pub fn subproblem_log(&self, iteration: IterationName, day: DayName) -> PathBuf {
        self.iteration_dir(iteration).join(format!("subproblem_day_{day}_log.log"))
    }

    pub fn final_result(&self, iteration: IterationName) -> PathBuf {
        self.iteration_dir(iteration).join("final_result.json")
    }

    pub fn cores(&self, iteration: IterationName, stage: &str) -> PathBuf {
        self.iteration_dir(iteration).join(format!("{stage}_cores.json"))
    }

    /// Create the per-instance root.
    pub fn prepare_root(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.root)
            .map_err(|source| PersistError::Io { path: self.root.clone(), source })
    }

    /// Empty and recreate one iteration's directory.
    pub fn prepare_iteration(&self, iteration: IterationName) -> Result<(), PersistError> {
        let dir = self.iteration_dir(iteration);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|source| PersistError::Io { path: dir.clone(), source })?;
        }
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io { path: dir, source })
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|source| PersistError::Json { path: path.to_path_buf(), source })?;
    fs::write(path, text).map_err(|source| PersistError::Io { path: path.to_path_buf(), source })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let text = fs::read_to_string(path)
        .map_err(|source| PersistError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&text)
        .map_err(|source| PersistError::Json { path: path.to_path_buf(), source })
}

pub fn write_yaml(path: &Path, value: &serde_yaml::Value) -> Result<(), PersistError> {
    let text = serde_yaml::to_string(value).unwrap_or_default();
    fs::write(path, text).map_err(|source| PersistError::Io { path: path.to_path_buf(), source })
}

/// Record one oracle call's verdict next to its artifact.
pub fn write_solve_log(
    path: &Path,
    outcome: &SolveOutcome,
    variables: usize,
    constraints: usize,
) -> Result<(), PersistError> {
    let status = match outcome.status {
        SolveStatus::Optimal => "optimal",
        SolveStatus::Feasible => "feasible (time limit)",
        SolveStatus::Infeasible => "infeasible",
        SolveStatus::Unknown => "unknown (time limit)",
    };
    let mut file = fs::File::create(path)
        .map_err(|source| PersistError::Io { path: path.to_path_buf(), source })?;
    let body = format!(
        "status: {status}\nobjective: {}\nvariables: {variables}\nconstraints: {constraints}\nelapsed_ms: {}\n",
        outcome.objective.map_or_else(|| "none".to_string(), |v| v.to_string()),
        outcome.elapsed.as_millis(),
    );
    file.write_all(body.as_bytes())
        .map_err(|source| PersistError::Io { path: path.to_path_buf(), source })
}

//! Solving configuration.
//!
//! The on-disk shape is a YAML file with a `base` block and a `groups` map;
//! each group's keys override the base key-for-key before the typed config
//! is deserialized. The driver only ever sees the merged [`SolverConfig`].

use crate::milp::SolveLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which master/subproblem pairing the decomposition runs.
///
/// The first tag names the master (fat pins operators, slim only picks care
/// units); the second names the day subproblem. A slim master carries no
/// operator to fix, so both `slim-*` structures run the operator-choosing
/// slim subproblem; `fat-fat` projects the master's fat day instance onto
/// its forgetful slim shape and lets the subproblem re-choose operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureType {
    SlimSlim,
    SlimFat,
    FatSlim,
    FatFat,
    Monolithic,
}

impl StructureType {
    pub fn master_is_fat(self) -> bool {
        matches!(self, StructureType::FatSlim | StructureType::FatFat)
    }

    /// Whether the day subproblem keeps the master's operator assignment.
    pub fn subproblem_is_fixed(self) -> bool {
        matches!(self, StructureType::FatSlim)
    }

    /// Whether the fat day instance is projected onto its slim shape.
    pub fn is_forgetful(self) -> bool {
        matches!(self, StructureType::FatFat)
    }
}

/// How far down the core pipeline extraction runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    Generalist,
    Basic,
    Reduced,
    Pruned,
}

/// Per-phase solver budget and free-form flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Time limit in seconds for a single oracle call
    pub time_limit: f64,
    /// Soft memory limit in MB (kept for backend compatibility)
    pub memory_limit: Option<u64>,
    /// Flags such as `minimize_hospital_accesses` or `preemptive_forbidding`
    pub additional_info: Vec<String>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self { time_limit: 60.0, memory_limit: None, additional_info: Vec::new() }
    }
}

impl PhaseConfig {
    pub fn limits(&self) -> SolveLimits {
        SolveLimits {
            time_limit: std::time::Duration::from_secs_f64(self.time_limit.max(0.0)),
            memory_limit_mb: self.memory_limit,
        }
    }

    pub fn has(&self, flag: &str) -> bool {
        self.additional_info.iter().any(|f| f == flag)
    }
}

/// The merged solving configuration of one group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub structure_type: StructureType,
    pub problem_type: String,
    pub core_type: CoreType,
    pub use_cache: bool,
    pub max_iteration: u32,
    /// Cumulative solver-time budget in seconds across all phases
    pub total_time_limit: f64,

    pub core_patient_expansion: bool,
    pub core_service_expansion: bool,
    pub core_operator_expansion: bool,
    pub core_day_expansion: bool,
    pub max_single_core_expansion: u32,
    pub post_pruning_irreducibility: bool,
    /// Stop once `final ≥ pct · master`; 1.0 disables the early stop
    pub early_stop_optimum_approximation_percentage: f64,

    pub master: PhaseConfig,
    pub subproblem: PhaseConfig,
    pub cache: PhaseConfig,
    pub core_pruning: PhaseConfig,
    pub core_expansion: PhaseConfig,
    pub subsumption: PhaseConfig,

    pub configs_to_do: Option<Vec<String>>,
    pub configs_to_avoid: Option<Vec<String>>,
    pub groups_to_do: Option<Vec<String>>,
    pub groups_to_avoid: Option<Vec<String>>,
    pub instances_to_do: Option<Vec<String>>,
    pub instances_to_avoid: Option<Vec<String>>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            structure_type: StructureType::SlimSlim,
            problem_type: "single-pass".to_string(),
            core_type: CoreType::Basic,
            use_cache: false,
            max_iteration: 30,
            total_time_limit: 3600.0,
            core_patient_expansion: false,
            core_service_expansion: false,
            core_operator_expansion: false,
            core_day_expansion: false,
            max_single_core_expansion: 100,
            post_pruning_irreducibility: false,
            early_stop_optimum_approximation_percentage: 1.0,
            master: PhaseConfig::default(),
            subproblem: PhaseConfig::default(),
            cache: PhaseConfig::default(),
            core_pruning: PhaseConfig::default(),
            core_expansion: PhaseConfig::default(),
            subsumption: PhaseConfig::default(),
            configs_to_do: None,
            configs_to_avoid: None,
            groups_to_do: None,
            groups_to_avoid: None,
            instances_to_do: None,
            instances_to_avoid: None,
        }
    }
}

impl SolverConfig {
    pub fn any_core_expansion(&self) -> bool {
        self.core_patient_expansion
            || self.core_service_expansion
            || self.core_operator_expansion
            || self.core_day_expansion
    }

    pub fn preemptive_forbidding(&self) -> bool {
        self.structure_type == StructureType::FatFat
            && self.subproblem.has("preemptive_forbidding")
    }

    /// Apply the `*_to_do` / `*_to_avoid` filters to a (config, group,
    /// instance) combination; `None` components are not filtered. An `all`
    /// entry in a `*_to_do` list acts as a wildcard.
    pub fn is_combination_to_do(
        &self,
        config: Option<&str>,
        group: Option<&str>,
        instance: Option<&str>,
    ) -> bool {
        fn allowed(name: Option<&str>, to_do: &Option<Vec<String>>, to_avoid: &Option<Vec<String>>) -> bool {
            let Some(name) = name else {
                return true;
            };
            if to_avoid.as_ref().is_some_and(|list| list.iter().any(|n| n == name)) {
                return false;
            }
            if let Some(list) = to_do {
                if !list.iter().any(|n| n == "all") && !list.iter().any(|n| n == name) {
                    return false;
                }
            }
            true
        }
        allowed(config, &self.configs_to_do, &self.configs_to_avoid)
            && allowed(group, &self.groups_to_do, &self.groups_to_avoid)
            && allowed(instance, &self.instances_to_do, &self.instances_to_avoid)
    }
}

/// The raw YAML config file: a `base` block plus per-group overrides.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigFile {
    pub base: serde_yaml::Value,
    #[serde(default)]
    pub groups: BTreeMap<String, serde_yaml::Value>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Base keys overridden by the group's keys, as a YAML value. This is
    /// what gets persisted next to each instance's artifacts.
    pub fn merged_value(&self, group: &str) -> serde_yaml::Value {
        let mut merged = self.base.clone();
        if let (serde_yaml::Value::Mapping(base), Some(serde_yaml::Value::Mapping(diff))) =
            (&mut merged, self.groups.get(group))
        {
            for (key, value) in diff {
                base.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// The typed configuration of one group.
    pub fn group_config(&self, group: &str) -> Result<SolverConfig, serde_yaml::Error> {
        serde_yaml::from_value(self.merged_value(group))
    }

    pub fn group_names(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r"
base:
    structure_type: slim-fat
    core_type: basic
    use_cache: true
    max_iteration: 20
    total_time_limit: 120.0
    master:
        time_limit: 10.0
        additional_info: [minimize_hospital_accesses]
groups:
    pruned:
        core_type: pruned
        post_pruning_irreducibility: true
    fat:
        structure_type: fat-fat
        subproblem:
            time_limit: 5.0
            additional_info: [preemptive_forbidding]
";

    #[test]
    fn group_overrides_base_keys() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        let config = file.group_config("pruned").unwrap();
        assert_eq!(config.core_type, CoreType::Pruned);
        assert_eq!(config.structure_type, StructureType::SlimFat);
        assert!(config.post_pruning_irreducibility);
        assert!(config.use_cache);
        assert_eq!(config.max_iteration, 20);
        assert!(config.master.has("minimize_hospital_accesses"));
    }

    #[test]
    fn override_replaces_whole_phase_block() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        let config = file.group_config("fat").unwrap();
        assert_eq!(config.structure_type, StructureType::FatFat);
        assert!(config.preemptive_forbidding());
        assert_eq!(config.subproblem.time_limit, 5.0);
        // The base master block survives untouched.
        assert_eq!(config.master.time_limit, 10.0);
    }

    #[test]
    fn filters_respect_all_wildcard() {
        let config = SolverConfig {
            configs_to_do: Some(vec!["all".into()]),
            groups_to_avoid: Some(vec!["skipme".into()]),
            ..SolverConfig::default()
        };
        assert!(config.is_combination_to_do(Some("anything"), Some("g0"), None));
        assert!(!config.is_combination_to_do(Some("anything"), Some("skipme"), None));
    }

    #[test]
    fn structure_type_round_trips_kebab_case() {
        let parsed: StructureType = serde_yaml::from_str("fat-slim").unwrap();
        assert_eq!(parsed, StructureType::FatSlim);
        assert!(parsed.master_is_fat());
        assert!(parsed.subproblem_is_fixed());
    }
}

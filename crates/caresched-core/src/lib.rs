//! # caresched-core
//!
//! Core domain model for the caresched engine.
//!
//! This crate provides:
//! - Domain types: [`MasterInstance`], [`Day`], [`Service`], [`Window`],
//!   subproblem instances, results and cores
//! - Structural checkers returning human-readable error lists ([`check`])
//! - Result valuation ([`value`])
//!
//! All artifact types serialize to the on-disk JSON schemas used by the
//! iteration driver, so persisted files round-trip through `serde_json`.
//!
//! ## Example
//!
//! ```rust
//! use caresched_core::{Day, MasterInstance, MasterPatient, Operator, Service, Window};
//!
//! let mut instance = MasterInstance::default();
//! instance.services.insert(
//!     "srv00".into(),
//!     Service { care_unit: "cu00".into(), duration: 4 },
//! );
//! let mut day = Day::default();
//! day.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
//! instance.days.insert(1, day);
//! let mut patient = MasterPatient::new(2);
//! patient.add_request("srv00", Window::new(1, 1));
//! instance.patients.insert("pat00".into(), patient);
//! assert!(caresched_core::check::check_master_instance(&instance).is_empty());
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod check;
pub mod value;

// ============================================================================
// Type Aliases
// ============================================================================

/// Unique identifier for a care unit
pub type CareUnitName = String;

/// Unique identifier for a service
pub type ServiceName = String;

/// Unique identifier for a patient
pub type PatientName = String;

/// Unique identifier for an operator
pub type OperatorName = String;

/// Discrete time slot within a day
pub type TimeSlot = i32;

/// Day index; instance days form a contiguous range of these
pub type DayName = i32;

/// Iteration counter of the decomposition loop (1-based)
pub type IterationName = u32;

// ============================================================================
// Errors
// ============================================================================

/// A structural checker rejected an artifact.
#[derive(Debug, Error)]
#[error("{artifact} failed validation with {} error(s)", errors.len())]
pub struct ValidationError {
    /// Which artifact failed (e.g. "master instance", "final result")
    pub artifact: String,
    /// Human-readable error lines from the checker
    pub errors: Vec<String>,
}

/// Turn a checker's error list into a `Result`.
pub fn ensure_valid(artifact: &str, errors: Vec<String>) -> Result<(), ValidationError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { artifact: artifact.to_string(), errors })
    }
}

// ============================================================================
// Calendar primitives
// ============================================================================

/// An operator's shift on a single day: `[start, start + duration)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub start: TimeSlot,
    pub duration: TimeSlot,
}

impl Operator {
    /// First time slot after the shift
    pub fn end(&self) -> TimeSlot {
        self.start + self.duration
    }

    /// Whether `[time, time + duration)` fits inside the shift
    pub fn covers(&self, time: TimeSlot, duration: TimeSlot) -> bool {
        time >= self.start && time + duration <= self.end()
    }
}

/// One day of the planning horizon: operators grouped by care unit.
///
/// Invariant: every operator name appears under exactly one care unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Day {
    care_units: BTreeMap<CareUnitName, BTreeMap<OperatorName, Operator>>,
}

impl Day {
    pub fn add_operator(
        &mut self,
        care_unit: impl Into<CareUnitName>,
        operator: impl Into<OperatorName>,
        shift: Operator,
    ) {
        self.care_units
            .entry(care_unit.into())
            .or_default()
            .insert(operator.into(), shift);
    }

    pub fn care_units(&self) -> &BTreeMap<CareUnitName, BTreeMap<OperatorName, Operator>> {
        &self.care_units
    }

    pub fn care_unit(&self, name: &str) -> Option<&BTreeMap<OperatorName, Operator>> {
        self.care_units.get(name)
    }

    /// Flat view over all operators, in (care unit, operator) order.
    pub fn operators(&self) -> impl Iterator<Item = (&OperatorName, &CareUnitName, &Operator)> {
        self.care_units
            .iter()
            .flat_map(|(cu, ops)| ops.iter().map(move |(name, op)| (name, cu, op)))
    }

    /// Look an operator up by name across all care units.
    pub fn operator(&self, name: &str) -> Option<(&CareUnitName, &Operator)> {
        self.care_units
            .iter()
            .find_map(|(cu, ops)| ops.get(name).map(|op| (cu, op)))
    }

    pub fn has_operators(&self) -> bool {
        self.care_units.values().any(|ops| !ops.is_empty())
    }

    /// Sum of operator durations of one care unit (its daily capacity).
    pub fn care_unit_capacity(&self, care_unit: &str) -> TimeSlot {
        self.care_unit(care_unit)
            .map(|ops| ops.values().map(|op| op.duration).sum())
            .unwrap_or(0)
    }

    /// `max_o end − min_o start` over all operators of the day; the upper
    /// bound on any single patient's served duration.
    pub fn max_span(&self) -> TimeSlot {
        let first = self.operators().map(|(_, _, op)| op.start).min();
        let last = self.operators().map(|(_, _, op)| op.end()).max();
        match (first, last) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    /// Largest shift end within one care unit.
    pub fn max_end(&self, care_unit: &str) -> Option<TimeSlot> {
        self.care_unit(care_unit)
            .and_then(|ops| ops.values().map(Operator::end).max())
    }
}

/// A service offered by a care unit; duration counted in time slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub care_unit: CareUnitName,
    pub duration: TimeSlot,
}

/// Closed day interval `[start, end]` during which an obligation may be
/// satisfied. Serialized as the two-element array `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[DayName; 2]", into = "[DayName; 2]")]
pub struct Window {
    pub start: DayName,
    pub end: DayName,
}

impl Window {
    pub fn new(start: DayName, end: DayName) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> DayName {
        self.end - self.start
    }

    pub fn contains(&self, day: DayName) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        (self.start <= other.start && self.end >= other.start)
            || (other.start <= self.start && other.end >= self.start)
    }

    /// All day names inside the window, in order.
    pub fn days(&self) -> impl Iterator<Item = DayName> {
        self.start..=self.end
    }
}

impl From<[DayName; 2]> for Window {
    fn from([start, end]: [DayName; 2]) -> Self {
        Self { start, end }
    }
}

impl From<Window> for [DayName; 2] {
    fn from(window: Window) -> Self {
        [window.start, window.end]
    }
}

// ============================================================================
// Request shapes
// ============================================================================

/// Access to the shared header fields of every request shape, so checker
/// and core code can stay parametric over fat/slim.
pub trait RequestRef {
    fn patient(&self) -> &str;
    fn service(&self) -> &str;
    fn operator(&self) -> Option<&str> {
        None
    }

    /// Same patient and service (the slim identity).
    fn same_slim(&self, other: &impl RequestRef) -> bool {
        self.patient() == other.patient() && self.service() == other.service()
    }
}

/// A (patient, service) request without operator identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlimRequest {
    pub patient: PatientName,
    pub service: ServiceName,
}

/// A (patient, service, operator) request with the operator pinned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FatRequest {
    pub patient: PatientName,
    pub service: ServiceName,
    pub operator: OperatorName,
}

/// One window obligation of a patient.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowRequest {
    pub patient: PatientName,
    pub service: ServiceName,
    pub window: Window,
}

/// A request placed by a subproblem: operator plus start time slot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub patient: PatientName,
    pub service: ServiceName,
    pub operator: OperatorName,
    pub time: TimeSlot,
}

impl RequestRef for SlimRequest {
    fn patient(&self) -> &str {
        &self.patient
    }
    fn service(&self) -> &str {
        &self.service
    }
}

impl RequestRef for FatRequest {
    fn patient(&self) -> &str {
        &self.patient
    }
    fn service(&self) -> &str {
        &self.service
    }
    fn operator(&self) -> Option<&str> {
        Some(&self.operator)
    }
}

impl RequestRef for WindowRequest {
    fn patient(&self) -> &str {
        &self.patient
    }
    fn service(&self) -> &str {
        &self.service
    }
}

impl RequestRef for Placement {
    fn patient(&self) -> &str {
        &self.patient
    }
    fn service(&self) -> &str {
        &self.service
    }
    fn operator(&self) -> Option<&str> {
        Some(&self.operator)
    }
}

impl From<FatRequest> for SlimRequest {
    fn from(request: FatRequest) -> Self {
        Self { patient: request.patient, service: request.service }
    }
}

impl From<Placement> for FatRequest {
    fn from(placement: Placement) -> Self {
        Self {
            patient: placement.patient,
            service: placement.service,
            operator: placement.operator,
        }
    }
}

impl From<Placement> for SlimRequest {
    fn from(placement: Placement) -> Self {
        Self { patient: placement.patient, service: placement.service }
    }
}

// ============================================================================
// Master instance
// ============================================================================

/// A patient of the master instance: priority plus windowed service requests.
///
/// The same service may be requested in several (possibly overlapping)
/// windows; each window is an independent satisfaction obligation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPatient {
    pub priority: i32,
    pub requests: BTreeMap<ServiceName, Vec<Window>>,
}

impl MasterPatient {
    pub fn new(priority: i32) -> Self {
        Self { priority, requests: BTreeMap::new() }
    }

    pub fn add_request(&mut self, service: impl Into<ServiceName>, window: Window) {
        self.requests.entry(service.into()).or_default().push(window);
    }

    /// All (service, window) obligations of the patient.
    pub fn windows(&self) -> impl Iterator<Item = (&ServiceName, &Window)> {
        self.requests
            .iter()
            .flat_map(|(service, windows)| windows.iter().map(move |w| (service, w)))
    }
}

/// The multi-day master instance: days, service catalog and patients.
///
/// Immutable for the duration of a run; the driver owns every derived
/// result, core and cache and passes this by reference to pure builders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInstance {
    pub services: BTreeMap<ServiceName, Service>,
    pub days: BTreeMap<DayName, Day>,
    pub patients: BTreeMap<PatientName, MasterPatient>,
}

impl MasterInstance {
    /// Every (patient, service, window) obligation of the instance.
    pub fn window_requests(&self) -> impl Iterator<Item = WindowRequest> + '_ {
        self.patients.iter().flat_map(|(patient, data)| {
            data.windows().map(move |(service, window)| WindowRequest {
                patient: patient.clone(),
                service: service.clone(),
                window: *window,
            })
        })
    }

    /// Care unit of a service, if the service exists.
    pub fn care_unit_of(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(|s| s.care_unit.as_str())
    }
}

// ============================================================================
// Subproblem instances
// ============================================================================

/// A request of a fat subproblem patient: service plus master-chosen operator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceOperator {
    pub service: ServiceName,
    pub operator: OperatorName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatSubproblemPatient {
    pub priority: i32,
    pub requests: Vec<ServiceOperator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlimSubproblemPatient {
    pub priority: i32,
    pub requests: Vec<ServiceName>,
}

/// Per-day packing instance with operators pre-assigned by the master.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatSubproblemInstance {
    pub services: BTreeMap<ServiceName, Service>,
    pub day: Day,
    pub patients: BTreeMap<PatientName, FatSubproblemPatient>,
}

/// Per-day packing instance where the subproblem chooses operators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlimSubproblemInstance {
    pub services: BTreeMap<ServiceName, Service>,
    pub day: Day,
    pub patients: BTreeMap<PatientName, SlimSubproblemPatient>,
}

impl FatSubproblemInstance {
    /// Forget the operator assignments, producing the slim projection used
    /// by the forgetful subproblem.
    pub fn forgetful(&self) -> SlimSubproblemInstance {
        SlimSubproblemInstance {
            services: self.services.clone(),
            day: self.day.clone(),
            patients: self
                .patients
                .iter()
                .map(|(name, patient)| {
                    (
                        name.clone(),
                        SlimSubproblemPatient {
                            priority: patient.priority,
                            requests: patient
                                .requests
                                .iter()
                                .map(|r| r.service.clone())
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Either shape of per-day instance; the `patients.requests` entries make
/// the two shapes distinguishable in JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubproblemInstance {
    Fat(FatSubproblemInstance),
    Slim(SlimSubproblemInstance),
}

// ============================================================================
// Results
// ============================================================================

/// Master result with operators pinned per assignment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatMasterResult {
    pub scheduled: BTreeMap<DayName, Vec<FatRequest>>,
    pub rejected: Vec<WindowRequest>,
}

/// Master result carrying only (patient, service) per day.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlimMasterResult {
    pub scheduled: BTreeMap<DayName, Vec<SlimRequest>>,
    pub rejected: Vec<WindowRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MasterResult {
    Fat(FatMasterResult),
    Slim(SlimMasterResult),
}

/// A scheduled/rejected entry of unknown flavor, as read from disk.
#[derive(Deserialize)]
struct RawRequest {
    patient: PatientName,
    service: ServiceName,
    #[serde(default)]
    operator: Option<OperatorName>,
}

impl<'de> Deserialize<'de> for MasterResult {
    /// The flavor is detected from the entries themselves: any scheduled
    /// request carrying an operator makes the result fat.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            scheduled: BTreeMap<String, Vec<RawRequest>>,
            #[serde(default)]
            rejected: Vec<WindowRequest>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let is_fat = raw
            .scheduled
            .values()
            .flatten()
            .any(|request| request.operator.is_some());

        let mut days: BTreeMap<DayName, Vec<RawRequest>> = BTreeMap::new();
        for (key, requests) in raw.scheduled {
            let day: DayName = key
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid day name '{key}'")))?;
            days.insert(day, requests);
        }

        if is_fat {
            let mut result = FatMasterResult { rejected: raw.rejected, ..Default::default() };
            for (day, requests) in days {
                let mut entries = Vec::with_capacity(requests.len());
                for request in requests {
                    let operator = request.operator.ok_or_else(|| {
                        serde::de::Error::custom("scheduled request without operator in fat result")
                    })?;
                    entries.push(FatRequest {
                        patient: request.patient,
                        service: request.service,
                        operator,
                    });
                }
                result.scheduled.insert(day, entries);
            }
            Ok(MasterResult::Fat(result))
        } else {
            let mut result = SlimMasterResult { rejected: raw.rejected, ..Default::default() };
            for (day, requests) in days {
                result.scheduled.insert(
                    day,
                    requests
                        .into_iter()
                        .map(|request| SlimRequest {
                            patient: request.patient,
                            service: request.service,
                        })
                        .collect(),
                );
            }
            Ok(MasterResult::Slim(result))
        }
    }
}

impl MasterResult {
    pub fn is_fat(&self) -> bool {
        matches!(self, MasterResult::Fat(_))
    }

    pub fn rejected(&self) -> &[WindowRequest] {
        match self {
            MasterResult::Fat(r) => &r.rejected,
            MasterResult::Slim(r) => &r.rejected,
        }
    }

    pub fn day_names(&self) -> Vec<DayName> {
        match self {
            MasterResult::Fat(r) => r.scheduled.keys().copied().collect(),
            MasterResult::Slim(r) => r.scheduled.keys().copied().collect(),
        }
    }

    /// (patient, service) pairs scheduled on one day, either flavor.
    pub fn slim_requests_on(&self, day: DayName) -> Vec<SlimRequest> {
        match self {
            MasterResult::Fat(r) => r
                .scheduled
                .get(&day)
                .map(|requests| requests.iter().cloned().map(SlimRequest::from).collect())
                .unwrap_or_default(),
            MasterResult::Slim(r) => r.scheduled.get(&day).cloned().unwrap_or_default(),
        }
    }
}

/// Subproblem result whose rejections carry the master-pinned operator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatSubproblemResult {
    pub scheduled: Vec<Placement>,
    pub rejected: Vec<FatRequest>,
}

/// Subproblem result with operator-free rejections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlimSubproblemResult {
    pub scheduled: Vec<Placement>,
    pub rejected: Vec<SlimRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SubproblemResult {
    Fat(FatSubproblemResult),
    Slim(SlimSubproblemResult),
}

impl<'de> Deserialize<'de> for SubproblemResult {
    /// Flavor detection follows the rejection list: operators on the
    /// rejected entries make the result fat, an empty list reads as slim.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            scheduled: Vec<Placement>,
            #[serde(default)]
            rejected: Vec<RawRequest>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let is_fat = raw.rejected.first().is_some_and(|request| request.operator.is_some());

        if is_fat {
            let mut rejected = Vec::with_capacity(raw.rejected.len());
            for request in raw.rejected {
                let operator = request.operator.ok_or_else(|| {
                    serde::de::Error::custom("rejected request without operator in fat result")
                })?;
                rejected.push(FatRequest {
                    patient: request.patient,
                    service: request.service,
                    operator,
                });
            }
            Ok(SubproblemResult::Fat(FatSubproblemResult {
                scheduled: raw.scheduled,
                rejected,
            }))
        } else {
            Ok(SubproblemResult::Slim(SlimSubproblemResult {
                scheduled: raw.scheduled,
                rejected: raw
                    .rejected
                    .into_iter()
                    .map(|request| SlimRequest {
                        patient: request.patient,
                        service: request.service,
                    })
                    .collect(),
            }))
        }
    }
}

impl SubproblemResult {
    pub fn scheduled(&self) -> &[Placement] {
        match self {
            SubproblemResult::Fat(r) => &r.scheduled,
            SubproblemResult::Slim(r) => &r.scheduled,
        }
    }

    pub fn rejected_count(&self) -> usize {
        match self {
            SubproblemResult::Fat(r) => r.rejected.len(),
            SubproblemResult::Slim(r) => r.rejected.len(),
        }
    }

    pub fn has_rejections(&self) -> bool {
        self.rejected_count() > 0
    }

    /// Rejections reduced to their slim identity.
    pub fn slim_rejected(&self) -> Vec<SlimRequest> {
        match self {
            SubproblemResult::Fat(r) => {
                r.rejected.iter().cloned().map(SlimRequest::from).collect()
            }
            SubproblemResult::Slim(r) => r.rejected.clone(),
        }
    }

    /// Drop every scheduled/rejected entry whose (patient, service) is not
    /// in `keep`. Used when a cached day result is reused under a master
    /// result that schedules a subset of the original requests.
    pub fn retain_requests(&mut self, keep: &[SlimRequest]) {
        let keep_slim = |patient: &str, service: &str| {
            keep.iter().any(|r| r.patient == patient && r.service == service)
        };
        match self {
            SubproblemResult::Fat(r) => {
                r.scheduled.retain(|p| keep_slim(&p.patient, &p.service));
                r.rejected.retain(|p| keep_slim(&p.patient, &p.service));
            }
            SubproblemResult::Slim(r) => {
                r.scheduled.retain(|p| keep_slim(&p.patient, &p.service));
                r.rejected.retain(|p| keep_slim(&p.patient, &p.service));
            }
        }
    }
}

/// Final composed result: per-day placements plus rejected windows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub scheduled: BTreeMap<DayName, Vec<Placement>>,
    pub rejected: Vec<WindowRequest>,
}

// ============================================================================
// Cores
// ============================================================================

/// A no-good cut: on each of `days`, not all of `components` may be
/// assigned together. `reason` names the rejected requests that caused
/// the core and is always a subset of `components`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Core<C> {
    #[serde(alias = "day", deserialize_with = "one_or_many_days")]
    pub days: Vec<DayName>,
    pub reason: Vec<C>,
    pub components: Vec<C>,
}

pub type FatCore = Core<FatRequest>;
pub type SlimCore = Core<SlimRequest>;

impl<C> Core<C> {
    pub fn new(day: DayName) -> Self {
        Self { days: vec![day], reason: Vec::new(), components: Vec::new() }
    }
}

impl<C: PartialEq> Core<C> {
    /// Order-insensitive equality of the component multisets.
    pub fn has_same_components(&self, other: &Core<C>) -> bool {
        self.components.len() == other.components.len()
            && self.components.iter().all(|c| other.components.contains(c))
    }

    /// Same day set and same component set.
    pub fn is_equivalent(&self, other: &Core<C>) -> bool {
        self.days.len() == other.days.len()
            && self.days.iter().all(|d| other.days.contains(d))
            && self.has_same_components(other)
    }
}

fn one_or_many_days<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<DayName>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(DayName),
        Many(Vec<DayName>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(day) => vec![day],
        OneOrMany::Many(days) => days,
    })
}

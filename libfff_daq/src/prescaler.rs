use fxhash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::config::PrescaleConfig;
use super::error::PrescaleConfigError;

/// A path and the factor it runs with when no L1 label override applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrescale {
    pub name: String,
    pub base_factor: u32,
}

/// Factors to use for some paths while a given L1 label is selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelOverride {
    pub label: String,
    pub factors: Vec<(String, u32)>,
}

#[derive(Debug)]
struct PathState {
    base_factor: u32,
    overrides: FxHashMap<String, u32>,
    counter: AtomicU64,
}

/// Deterministic 1-in-N admission per path.
///
/// Each path's counter is incremented before the check, and an event is admitted
/// when `counter % factor == 0`. With a factor of N the N-th, 2N-th, ... events are
/// admitted and the first admitted event is the N-th. Counters are atomics so one
/// Prescaler can be shared by every stream; the admitted totals do not depend on how
/// events are spread over streams.
///
/// Changing the L1 label between calls never resets a counter. Only `reconfigure` does.
#[derive(Debug)]
pub struct Prescaler {
    paths: FxHashMap<String, PathState>,
    labels: Vec<String>,
    force_default: bool,
}

impl Prescaler {
    /// Build a prescaler. With `force_default` set, every override is ignored and each
    /// path always runs at its base factor.
    pub fn configure(
        paths: &[PathPrescale],
        l1_labels: &[String],
        overrides: &[LabelOverride],
        force_default: bool,
    ) -> Result<Self, PrescaleConfigError> {
        let mut states: FxHashMap<String, PathState> = FxHashMap::default();
        for path in paths {
            if path.base_factor == 0 {
                return Err(PrescaleConfigError::ZeroFactor {
                    path: path.name.clone(),
                    label: None,
                });
            }
            let state = PathState {
                base_factor: path.base_factor,
                overrides: FxHashMap::default(),
                counter: AtomicU64::new(0),
            };
            if states.insert(path.name.clone(), state).is_some() {
                return Err(PrescaleConfigError::DuplicatePath(path.name.clone()));
            }
        }

        for table in overrides {
            if !l1_labels.contains(&table.label) {
                return Err(PrescaleConfigError::UnknownLabel(table.label.clone()));
            }
            for (path_name, factor) in &table.factors {
                let state = states
                    .get_mut(path_name)
                    .ok_or_else(|| PrescaleConfigError::UnknownPath(path_name.clone()))?;
                if *factor == 0 {
                    return Err(PrescaleConfigError::ZeroFactor {
                        path: path_name.clone(),
                        label: Some(table.label.clone()),
                    });
                }
                state.overrides.insert(table.label.clone(), *factor);
            }
        }

        if force_default && !overrides.is_empty() {
            log::info!("Prescale overrides present but ignored; forcing default factors");
        }

        Ok(Self {
            paths: states,
            labels: l1_labels.to_vec(),
            force_default,
        })
    }

    /// Build from the configuration table, where `prescales[i]` belongs to
    /// `lvl1_labels[i]` and the base factor is the one under `lvl1_default_label`.
    /// Paths in `path_names` missing from the table run unprescaled.
    pub fn from_config(
        config: &PrescaleConfig,
        path_names: &[String],
    ) -> Result<Self, PrescaleConfigError> {
        let default_idx = config
            .lvl1_labels
            .iter()
            .position(|l| *l == config.lvl1_default_label)
            .ok_or_else(|| PrescaleConfigError::UnknownLabel(config.lvl1_default_label.clone()))?;

        let mut paths: Vec<PathPrescale> = Vec::new();
        let mut overrides: Vec<LabelOverride> = config
            .lvl1_labels
            .iter()
            .map(|label| LabelOverride {
                label: label.clone(),
                factors: Vec::new(),
            })
            .collect();

        for row in &config.prescale_table {
            if row.prescales.len() != config.lvl1_labels.len() {
                return Err(PrescaleConfigError::LabelCountMismatch {
                    path: row.path_name.clone(),
                    given: row.prescales.len(),
                    expected: config.lvl1_labels.len(),
                });
            }
            paths.push(PathPrescale {
                name: row.path_name.clone(),
                base_factor: row.prescales[default_idx],
            });
            for (table, factor) in overrides.iter_mut().zip(&row.prescales) {
                table.factors.push((row.path_name.clone(), *factor));
            }
        }
        for name in path_names {
            if !paths.iter().any(|p| p.name == *name) {
                log::info!("Path {name} has no prescale entry and will not be prescaled");
                paths.push(PathPrescale {
                    name: name.clone(),
                    base_factor: 1,
                });
            }
        }

        Self::configure(&paths, &config.lvl1_labels, &overrides, config.force_default)
    }

    /// Rebuild the tables and start every counter from zero
    pub fn reconfigure(
        &mut self,
        paths: &[PathPrescale],
        l1_labels: &[String],
        overrides: &[LabelOverride],
        force_default: bool,
    ) -> Result<(), PrescaleConfigError> {
        *self = Self::configure(paths, l1_labels, overrides, force_default)?;
        Ok(())
    }

    /// The factor in effect for a path under a label. None for unknown paths.
    pub fn factor(&self, path_name: &str, label: &str) -> Option<u32> {
        let state = self.paths.get(path_name)?;
        if self.force_default {
            return Some(state.base_factor);
        }
        Some(state.overrides.get(label).copied().unwrap_or(state.base_factor))
    }

    /// Count an event on a path and decide whether it passes.
    ///
    /// Paths the prescaler was not configured with admit everything.
    pub fn admit(&self, path_name: &str, label: &str) -> bool {
        let (Some(state), Some(factor)) = (self.paths.get(path_name), self.factor(path_name, label))
        else {
            return true;
        };
        let count = state.counter.fetch_add(1, Ordering::Relaxed) + 1;
        count % factor as u64 == 0
    }

    /// How many events have been offered to a path
    pub fn counter(&self, path_name: &str) -> Option<u64> {
        self.paths
            .get(path_name)
            .map(|s| s.counter.load(Ordering::Relaxed))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_known_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrescaleRow;

    fn single(name: &str, factor: u32) -> Prescaler {
        Prescaler::configure(
            &[PathPrescale {
                name: String::from(name),
                base_factor: factor,
            }],
            &[String::from("Default")],
            &[],
            false,
        )
        .unwrap()
    }

    fn labels() -> Vec<String> {
        vec![String::from("Default"), String::from("Cosmics")]
    }

    fn with_override(force_default: bool) -> Prescaler {
        Prescaler::configure(
            &[PathPrescale {
                name: String::from("p1"),
                base_factor: 10,
            }],
            &labels(),
            &[LabelOverride {
                label: String::from("Cosmics"),
                factors: vec![(String::from("p1"), 2)],
            }],
            force_default,
        )
        .unwrap()
    }

    #[test]
    fn test_one_in_n() {
        for factor in [1u32, 2, 3, 7, 10, 100] {
            let prescaler = single("p", factor);
            let admitted: Vec<u64> = (1..=(factor as u64 * 5))
                .filter(|_| prescaler.admit("p", "Default"))
                .collect();
            assert_eq!(admitted.len(), 5);
            for window in 0..5u64 {
                let calls = (window * factor as u64 + 1)..=((window + 1) * factor as u64);
                assert_eq!(admitted.iter().filter(|c| calls.contains(c)).count(), 1);
            }
        }
    }

    #[test]
    fn test_first_admitted_is_nth() {
        let prescaler = single("p", 10);
        let decisions: Vec<bool> = (0..20).map(|_| prescaler.admit("p", "Default")).collect();
        // One-based: the first call is not admitted, the tenth is
        assert!(!decisions[0]);
        assert!(decisions[9]);
        assert!(decisions[19]);
        assert_eq!(decisions.iter().filter(|d| **d).count(), 2);
        // A zero-based counter would have admitted calls 1 and 11 instead
        assert!(!decisions[10]);
    }

    #[test]
    fn test_factor_one_admits_all() {
        let prescaler = single("p", 1);
        assert!((0..50).all(|_| prescaler.admit("p", "Default")));
    }

    #[test]
    fn test_zero_factor_rejected() {
        let result = Prescaler::configure(
            &[PathPrescale {
                name: String::from("p"),
                base_factor: 0,
            }],
            &[],
            &[],
            false,
        );
        assert!(matches!(result, Err(PrescaleConfigError::ZeroFactor { .. })));

        let result = Prescaler::configure(
            &[PathPrescale {
                name: String::from("p"),
                base_factor: 5,
            }],
            &labels(),
            &[LabelOverride {
                label: String::from("Cosmics"),
                factors: vec![(String::from("p"), 0)],
            }],
            false,
        );
        match result {
            Err(PrescaleConfigError::ZeroFactor { label, .. }) => {
                assert_eq!(label.as_deref(), Some("Cosmics"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_label_switch_keeps_counter() {
        let prescaler = with_override(false);
        assert_eq!(prescaler.factor("p1", "Cosmics"), Some(2));
        // Three calls under Default, counter at 3
        for _ in 0..3 {
            assert!(!prescaler.admit("p1", "Default"));
        }
        // Counter 4 under factor 2 passes; a reset counter would have been at 1
        assert!(prescaler.admit("p1", "Cosmics"));
        assert!(!prescaler.admit("p1", "Cosmics"));
        assert_eq!(prescaler.counter("p1"), Some(5));
        // Back to Default: counts 6..=9 fail, 10 passes
        let passed: Vec<bool> = (0..5).map(|_| prescaler.admit("p1", "Default")).collect();
        assert_eq!(passed, vec![false, false, false, false, true]);
    }

    #[test]
    fn test_force_default_ignores_overrides() {
        let prescaler = with_override(true);
        assert_eq!(prescaler.factor("p1", "Cosmics"), Some(10));
        let admitted = (0..100).filter(|_| prescaler.admit("p1", "Cosmics")).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_reconfigure_resets() {
        let mut prescaler = single("p", 3);
        prescaler.admit("p", "Default");
        prescaler.admit("p", "Default");
        prescaler
            .reconfigure(
                &[PathPrescale {
                    name: String::from("p"),
                    base_factor: 3,
                }],
                &[String::from("Default")],
                &[],
                false,
            )
            .unwrap();
        assert_eq!(prescaler.counter("p"), Some(0));
        assert!(!prescaler.admit("p", "Default"));
    }

    #[test]
    fn test_unknown_override_targets() {
        let bad_label = Prescaler::configure(
            &[],
            &labels(),
            &[LabelOverride {
                label: String::from("Physics"),
                factors: vec![],
            }],
            false,
        );
        assert!(matches!(bad_label, Err(PrescaleConfigError::UnknownLabel(_))));
        let bad_path = Prescaler::configure(
            &[],
            &labels(),
            &[LabelOverride {
                label: String::from("Default"),
                factors: vec![(String::from("nope"), 1)],
            }],
            false,
        );
        assert!(matches!(bad_path, Err(PrescaleConfigError::UnknownPath(_))));
    }

    #[test]
    fn test_from_config_table() {
        let config = PrescaleConfig {
            force_default: false,
            prescale_table: vec![PrescaleRow {
                path_name: String::from("p1"),
                prescales: vec![10, 3],
            }],
            lvl1_default_label: String::from("Default"),
            lvl1_labels: labels(),
        };
        let prescaler =
            Prescaler::from_config(&config, &[String::from("p1"), String::from("p3")]).unwrap();
        assert_eq!(prescaler.factor("p1", "Default"), Some(10));
        assert_eq!(prescaler.factor("p1", "Cosmics"), Some(3));
        assert_eq!(prescaler.factor("p3", "Cosmics"), Some(1));
        assert!(prescaler.admit("unconfigured", "Default"));

        let mut bad = config.clone();
        bad.prescale_table[0].prescales = vec![10];
        assert!(matches!(
            Prescaler::from_config(&bad, &[]),
            Err(PrescaleConfigError::LabelCountMismatch { .. })
        ));
    }

    #[test]
    fn test_shared_across_threads() {
        let prescaler = std::sync::Arc::new(single("p", 10));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let prescaler = prescaler.clone();
                std::thread::spawn(move || (0..250).filter(|_| prescaler.admit("p", "Default")).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}

//! Aggregation — merge snapshot lists from several processes.
//!
//! Families are grouped by name; within a family, samples are grouped by
//! series name plus exact label set, and each group is reduced with the
//! family's [`Aggregator`]. Input order is preserved throughout, which is
//! what makes [`Aggregator::First`] deterministic.

use std::collections::HashMap;

use crate::prometheus::render_prometheus;
use crate::snapshot::{Labels, MetricFamily, Sample};

type SeriesKey = (Option<String>, Labels);

struct FamilyAcc {
    template: MetricFamily,
    series: Vec<(SeriesKey, Vec<f64>)>,
    index: HashMap<SeriesKey, usize>,
}

impl FamilyAcc {
    fn new(family: &MetricFamily) -> Self {
        Self {
            template: MetricFamily {
                samples: Vec::new(),
                ..family.clone()
            },
            series: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn push(&mut self, sample: &Sample) {
        let key = (sample.metric_name.clone(), sample.labels.clone());
        match self.index.get(&key) {
            Some(&i) => self.series[i].1.push(sample.value),
            None => {
                self.index.insert(key.clone(), self.series.len());
                self.series.push((key, vec![sample.value]));
            }
        }
    }

    fn finish(self) -> Option<MetricFamily> {
        let aggregator = self.template.aggregator;
        let samples: Vec<Sample> = self
            .series
            .into_iter()
            .filter_map(|((metric_name, labels), values)| {
                aggregator.apply(&values).map(|value| Sample {
                    metric_name,
                    labels,
                    value,
                })
            })
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(MetricFamily {
            samples,
            ..self.template
        })
    }
}

/// Result of merging several snapshot lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedRegistry {
    families: Vec<MetricFamily>,
}

impl AggregatedRegistry {
    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    pub fn into_families(self) -> Vec<MetricFamily> {
        self.families
    }

    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    /// Exposition text of the merged families.
    pub fn render(&self) -> String {
        render_prometheus(&self.families)
    }
}

/// Merge `lists` (one snapshot list per registry or per peer) into one
/// registry. The first family seen for a name fixes its help, type and
/// aggregator.
pub fn aggregate(lists: &[Vec<MetricFamily>]) -> AggregatedRegistry {
    let mut order: Vec<FamilyAcc> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for family in lists.iter().flatten() {
        let i = *by_name.entry(family.name.clone()).or_insert_with(|| {
            order.push(FamilyAcc::new(family));
            order.len() - 1
        });
        for sample in &family.samples {
            order[i].push(sample);
        }
    }

    AggregatedRegistry {
        families: order.into_iter().filter_map(FamilyAcc::finish).collect(),
    }
}

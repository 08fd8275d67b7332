//! Aggregate function implementations

use crate::{Aggregation, KvValue, TsKvEntry};
use std::cmp::Ordering;

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Send {
    /// Add a value to the accumulator
    fn add(&mut self, value: &KvValue);

    /// Get the current result, `None` when nothing qualified
    fn result(&self) -> Option<KvValue>;
}

/// Accumulator for an aggregation, `None` for [`Aggregation::None`]
pub fn accumulator_for(aggregation: Aggregation) -> Option<Box<dyn Accumulator>> {
    match aggregation {
        Aggregation::None => None,
        Aggregation::Avg => Some(Box::<MeanAccumulator>::default()),
        Aggregation::Sum => Some(Box::<SumAccumulator>::default()),
        Aggregation::Count => Some(Box::<CountAccumulator>::default()),
        Aggregation::Min => Some(Box::new(ExtremumAccumulator::min())),
        Aggregation::Max => Some(Box::new(ExtremumAccumulator::max())),
    }
}

/// Aggregate the values of `entries`
pub fn aggregate(aggregation: Aggregation, entries: &[TsKvEntry]) -> Option<KvValue> {
    let mut acc = accumulator_for(aggregation)?;
    for entry in entries {
        acc.add(&entry.value);
    }
    acc.result()
}

/// Count of numeric values
#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, value: &KvValue) {
        if value.is_numeric() {
            self.count += 1;
        }
    }

    fn result(&self) -> Option<KvValue> {
        if self.count > 0 {
            Some(KvValue::Long(self.count))
        } else {
            None
        }
    }
}

/// Sum accumulator; stays integral while only Long values arrive and the
/// integral sum does not overflow
#[derive(Debug, Default)]
pub struct SumAccumulator {
    long_sum: i64,
    double_sum: f64,
    has_double: bool,
    count: u64,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: &KvValue) {
        match value {
            KvValue::Long(v) => {
                match self.long_sum.checked_add(*v) {
                    Some(sum) => self.long_sum = sum,
                    None => {
                        self.double_sum += *v as f64;
                        self.has_double = true;
                    }
                }
                self.count += 1;
            }
            KvValue::Double(v) => {
                self.double_sum += v;
                self.has_double = true;
                self.count += 1;
            }
            _ => {}
        }
    }

    fn result(&self) -> Option<KvValue> {
        if self.count == 0 {
            None
        } else if self.has_double {
            Some(KvValue::Double(self.double_sum + self.long_sum as f64))
        } else {
            Some(KvValue::Long(self.long_sum))
        }
    }
}

/// Mean accumulator, always a Double
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, value: &KvValue) {
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Option<KvValue> {
        if self.count > 0 {
            Some(KvValue::Double(self.sum / self.count as f64))
        } else {
            None
        }
    }
}

/// MIN or MAX. Numeric values win; strings are only compared when no
/// numeric value was seen. Longs keep their own extremum so that values
/// beyond 2^53 survive.
#[derive(Debug)]
pub struct ExtremumAccumulator {
    /// Ordering a new value must have against the current one to replace it
    wanted: Ordering,
    long: Option<i64>,
    double: Option<f64>,
    text: Option<String>,
}

impl ExtremumAccumulator {
    pub fn min() -> Self {
        Self::new(Ordering::Less)
    }

    pub fn max() -> Self {
        Self::new(Ordering::Greater)
    }

    fn new(wanted: Ordering) -> Self {
        Self {
            wanted,
            long: None,
            double: None,
            text: None,
        }
    }

    fn pick<T: PartialOrd + Copy>(&self, current: Option<T>, candidate: T) -> T {
        match current {
            Some(current) if candidate.partial_cmp(&current) != Some(self.wanted) => current,
            _ => candidate,
        }
    }
}

impl Accumulator for ExtremumAccumulator {
    fn add(&mut self, value: &KvValue) {
        match value {
            KvValue::Long(v) => self.long = Some(self.pick(self.long, *v)),
            KvValue::Double(v) => self.double = Some(self.pick(self.double, *v)),
            KvValue::String(s) => {
                let replace = match &self.text {
                    Some(current) => s.as_str().cmp(current.as_str()) == self.wanted,
                    None => true,
                };
                if replace {
                    self.text = Some(s.clone());
                }
            }
            KvValue::Boolean(_) | KvValue::Json(_) => {}
        }
    }

    fn result(&self) -> Option<KvValue> {
        match (self.long, self.double, &self.text) {
            (Some(l), None, _) => Some(KvValue::Long(l)),
            (Some(l), Some(d), _) => Some(KvValue::Double(self.pick(Some(d), l as f64))),
            (None, Some(d), _) => Some(KvValue::Double(d)),
            (None, None, Some(s)) => Some(KvValue::String(s.clone())),
            (None, None, None) => None,
        }
    }
}

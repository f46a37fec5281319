//! Aggregate function implementations

use crate::AggregateFunction;

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Send {
    /// Add a value to the accumulator
    fn add(&mut self, value: f64);

    /// Get the current result, `None` when nothing was added
    fn result(&self) -> Option<f64>;

    /// Reset the accumulator
    fn reset(&mut self);
}

/// Fresh accumulator for `func`
pub fn accumulator(func: AggregateFunction) -> Box<dyn Accumulator> {
    match func {
        AggregateFunction::Count => Box::<CountAccumulator>::default(),
        AggregateFunction::Sum => Box::<SumAccumulator>::default(),
        AggregateFunction::Mean => Box::<MeanAccumulator>::default(),
        AggregateFunction::Min => Box::<MinAccumulator>::default(),
        AggregateFunction::Max => Box::<MaxAccumulator>::default(),
    }
}

/// Count accumulator
#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _value: f64) {
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        Some(self.count as f64)
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Sum accumulator
#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Mean accumulator
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Min accumulator
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |current| current.min(value)));
    }

    fn result(&self) -> Option<f64> {
        self.min
    }

    fn reset(&mut self) {
        self.min = None;
    }
}

/// Max accumulator
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, value: f64) {
        self.max = Some(self.max.map_or(value, |current| current.max(value)));
    }

    fn result(&self) -> Option<f64> {
        self.max
    }

    fn reset(&mut self) {
        self.max = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_accumulator() {
        let mut acc = accumulator(AggregateFunction::Mean);
        assert_eq!(acc.result(), None);
        acc.add(10.0);
        acc.add(20.0);
        acc.add(30.0);
        assert_eq!(acc.result(), Some(20.0));
        acc.reset();
        assert_eq!(acc.result(), None);
    }

    #[test]
    fn test_min_max_accumulator() {
        let mut min_acc = MinAccumulator::default();
        let mut max_acc = MaxAccumulator::default();

        for v in [5.0, 2.0, 8.0, 1.0, 9.0] {
            min_acc.add(v);
            max_acc.add(v);
        }

        assert_eq!(min_acc.result(), Some(1.0));
        assert_eq!(max_acc.result(), Some(9.0));
    }

    #[test]
    fn test_count_of_nothing_is_zero() {
        let acc = accumulator(AggregateFunction::Count);
        assert_eq!(acc.result(), Some(0.0));
        assert_eq!(accumulator(AggregateFunction::Sum).result(), None);
    }
}

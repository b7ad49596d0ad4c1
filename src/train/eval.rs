// src/train/eval.rs
use crate::autograd::no_grad;
use crate::data::Batch;
use crate::module::Module;
use ndarray::Axis;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalReport {
    pub correct: usize,
    pub total: usize,
    pub wrong_counts: Vec<usize>, // per true label
}

impl EvalReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn wrong(&self, label: usize) -> usize {
        self.wrong_counts.get(label).copied().unwrap_or(0)
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "accuracy: {:.3} ({}/{})", self.accuracy(), self.correct, self.total)?;
        for (label, wrong) in self.wrong_counts.iter().enumerate() {
            writeln!(f, "  wrong counts for digit {label}: {wrong}")?;
        }
        Ok(())
    }
}

/// Labels outside `0..num_classes` count towards `total` only.
pub fn evaluate<M, I>(model: &M, batches: I, num_classes: usize) -> EvalReport
where
    M: Module + ?Sized,
    I: IntoIterator<Item = Batch>,
{
    let mut report = EvalReport {
        correct: 0,
        total: 0,
        wrong_counts: vec![0; num_classes],
    };

    no_grad(|| {
        for batch in batches {
            let logits = model.forward(batch.inputs.clone());
            let logits = logits.data_ref();
            for (row, &label) in logits.axis_iter(Axis(0)).zip(&batch.labels) {
                let predicted = argmax(row.iter().copied());
                report.total += 1;
                if predicted == Some(label) {
                    report.correct += 1;
                } else if let Some(slot) = report.wrong_counts.get_mut(label) {
                    *slot += 1;
                }
            }
        }
    });

    debug!(correct = report.correct, total = report.total, "evaluation done");
    report
}

// first maximum, NaN skipped
fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

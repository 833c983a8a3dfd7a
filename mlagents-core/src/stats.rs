//! Aggregation of training statistics and their output.
//!
//! A category is usually the behavior name, a key the name of a statistic,
//! e.g. `Environment/Cumulative Reward`. Values are collected with
//! [`StatsReporter::add_stat`] and written as their mean on
//! [`StatsReporter::write_stats`].
use chrono::{DateTime, Local};
use log::info;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Output destination of statistics.
pub trait StatsWriter: Send {
    /// Writes a single aggregated value.
    fn write_stats(&mut self, category: &str, key: &str, value: f32, step: u64);

    /// Writes a free text, e.g. the hyperparameters of a run.
    fn write_text(&mut self, category: &str, text: &str, step: u64);
}

struct Inner {
    writers: Vec<Box<dyn StatsWriter>>,
    stats: BTreeMap<String, BTreeMap<String, Vec<f32>>>,
}

/// Collects statistics and writes their means to a set of writers.
///
/// Cloned handles share the same storage and writers.
#[derive(Clone)]
pub struct StatsReporter {
    inner: Arc<Mutex<Inner>>,
}

impl StatsReporter {
    pub fn new(writers: Vec<Box<dyn StatsWriter>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                writers,
                stats: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Stored values stay consistent even if a writer panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a writer to the reporter.
    pub fn add_writer(&self, writer: Box<dyn StatsWriter>) {
        self.lock().writers.push(writer);
    }

    /// Stores a value of a statistic.
    pub fn add_stat(&self, category: &str, key: &str, value: f32) {
        self.lock()
            .stats
            .entry(category.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(value);
    }

    /// Writes the mean of every statistic of the category and clears the category.
    pub fn write_stats(&self, category: &str, step: u64) {
        let mut inner = self.lock();
        let stats = match inner.stats.remove(category) {
            Some(stats) => stats,
            None => return,
        };
        for (key, values) in stats.iter().filter(|(_, v)| !v.is_empty()) {
            let value = mean(values);
            for writer in inner.writers.iter_mut() {
                writer.write_stats(category, key, value, step);
            }
        }
    }

    /// Writes a text to every writer.
    pub fn write_text(&self, category: &str, text: &str, step: u64) {
        for writer in self.lock().writers.iter_mut() {
            writer.write_text(category, text, step);
        }
    }

    /// Mean of a statistic since the last write, NaN if there is no value.
    pub fn get_mean_stat(&self, category: &str, key: &str) -> f32 {
        self.with_values(category, key, mean)
    }

    /// Population standard deviation of a statistic since the last write.
    pub fn get_std_stat(&self, category: &str, key: &str) -> f32 {
        self.with_values(category, key, std)
    }

    /// Number of values of a statistic since the last write.
    pub fn get_num_stats(&self, category: &str, key: &str) -> usize {
        self.with_values(category, key, |v| v.len())
    }

    fn with_values<T>(&self, category: &str, key: &str, f: impl Fn(&[f32]) -> T) -> T {
        let inner = self.lock();
        let values = inner
            .stats
            .get(category)
            .and_then(|c| c.get(key))
            .map_or(&[][..], |v| v.as_slice());
        f(values)
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn std(values: &[f32]) -> f32 {
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32;
    var.sqrt()
}

/// Logs reward summaries and texts with [`log::info`].
pub struct ConsoleWriter {
    start: DateTime<Local>,
    is_training: BTreeMap<String, bool>,
}

impl ConsoleWriter {
    pub fn new() -> Self {
        Self {
            start: Local::now(),
            is_training: BTreeMap::new(),
        }
    }
}

impl Default for ConsoleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsWriter for ConsoleWriter {
    fn write_stats(&mut self, category: &str, key: &str, value: f32, step: u64) {
        match key {
            "Is Training" => {
                self.is_training.insert(category.to_string(), value > 0.0);
            }
            "Environment/Cumulative Reward" => {
                let elapsed = (Local::now() - self.start).num_milliseconds() as f32 / 1000.0;
                let mode = match self.is_training.get(category) {
                    Some(false) => "Not Training.",
                    _ => "Training.",
                };
                info!(
                    "{}. Step: {}. Time Elapsed: {:.3} s. Mean Reward: {:.3}. {}",
                    category, step, elapsed, value, mode
                );
            }
            _ => {}
        }
    }

    fn write_text(&mut self, category: &str, text: &str, _step: u64) {
        info!("{}: {}", category, text);
    }
}

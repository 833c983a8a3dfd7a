//! Writes training statistics as Tensorboard event files.
use log::{debug, warn};
use mlagents_core::stats::StatsWriter;
use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tensorboard_rs::summary_writer::SummaryWriter;

/// Keys that are only used by other writers.
const HIDDEN_KEYS: [&str; 2] = ["Is Training", "Step"];

/// A [`StatsWriter`] keeping one event file directory per category.
///
/// Events of the category `3DBall` go to `base_dir/3DBall`.
pub struct TensorboardWriter {
    base_dir: PathBuf,
    clear_past_data: bool,
    writers: HashMap<String, SummaryWriter>,
}

impl TensorboardWriter {
    /// With `clear_past_data`, event files left by an earlier run in a
    /// category directory are deleted when the category is first written.
    pub fn new<P: AsRef<Path>>(base_dir: P, clear_past_data: bool) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            clear_past_data,
            writers: HashMap::new(),
        }
    }

    fn category_dir(&self, category: &str) -> PathBuf {
        self.base_dir.join(category)
    }

    fn writer(&mut self, category: &str) -> &mut SummaryWriter {
        let dir = self.category_dir(category);
        let clear_past_data = self.clear_past_data;
        self.writers
            .entry(category.to_string())
            .or_insert_with(move || {
                if let Err(e) = fs::create_dir_all(&dir) {
                    warn!("Failed to create {:?}: {}", dir, e);
                }
                if clear_past_data {
                    delete_event_files(&dir);
                }
                SummaryWriter::new(&dir)
            })
    }
}

fn delete_event_files(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        let is_event_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("events.out.tfevents"));
        if is_event_file {
            debug!("Deleting {:?}", path);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete {:?}: {}", path, e);
            }
        }
    }
}

impl StatsWriter for TensorboardWriter {
    fn write_stats(&mut self, category: &str, key: &str, value: f32, step: u64) {
        if HIDDEN_KEYS.contains(&key) {
            return;
        }
        let writer = self.writer(category);
        writer.add_scalar(key, value, step as usize);
        writer.flush();
    }

    /// Appends the text to `text.md` next to the event files.
    fn write_text(&mut self, category: &str, text: &str, step: u64) {
        let path = self.category_dir(category).join("text.md");
        let result = fs::create_dir_all(self.category_dir(category)).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "## Step {}\n\n{}\n", step, text)
        });
        if let Err(e) = result {
            warn!("Failed to write text to {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    fn files_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test_log::test]
    fn test_tensorboard_writer() {
        let tmp = TempDir::new("tensorboard").unwrap();
        let mut writer = TensorboardWriter::new(tmp.path(), false);
        writer.write_stats("3DBall", "Environment/Cumulative Reward", 1.0, 10);
        writer.write_stats("3DBall", "Is Training", 1.0, 10);
        writer.write_text("3DBall", "batch_size: 64", 0);
        // Hidden keys do not open a directory for a new category.
        writer.write_stats("Other", "Is Training", 1.0, 10);

        // Event files are created by the writer thread, joined on drop.
        drop(writer);
        let files = files_in(&tmp.path().join("3DBall"));
        assert!(files.iter().any(|f| f.starts_with("events.out.tfevents")));
        assert!(files.iter().any(|f| f == "text.md"));
        assert!(!tmp.path().join("Other").exists());
    }

    #[test]
    fn test_clear_past_data() {
        let tmp = TempDir::new("tensorboard").unwrap();
        let dir = tmp.path().join("3DBall");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("events.out.tfevents.old"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();

        let mut writer = TensorboardWriter::new(tmp.path(), true);
        writer.write_stats("3DBall", "Losses/Value Loss", 0.5, 1);
        let files = files_in(&dir);
        assert!(!files.iter().any(|f| f == "events.out.tfevents.old"));
        assert!(files.iter().any(|f| f == "notes.txt"));
    }
}

//! Word frequency counting over a text file, the default workload.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::task::{Job, Tally, TaskContext, TaskError};

/// Counts word frequencies in a file, one line per unit of progress.
///
/// Empty lines are skipped and not counted. Words are separated by
/// whitespace; bytes that are not valid UTF-8 are replaced rather than
/// failing the task.
#[derive(Debug, Clone)]
pub struct WordCount {
    path: PathBuf,
}

impl WordCount {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Job for WordCount {
    fn describe(&self) -> String {
        format!("wordcount {}", self.path.display())
    }

    fn run(&mut self, ctx: &TaskContext<'_>, tally: &mut Tally) -> Result<(), TaskError> {
        let file = File::open(&self.path).map_err(|source| TaskError::Open {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        loop {
            ctx.checkpoint()?;
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| TaskError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            if read == 0 {
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            for word in line.split_whitespace() {
                tally.record(word);
            }
            ctx.advance(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskRegistry;
    use crate::task::{Task, TaskOutcome, WorkerId};
    use std::io::Write;

    fn run(path: &Path) -> (u64, TaskOutcome) {
        let registry = TaskRegistry::new();
        let task = Task::new(WordCount::new(path));
        let handle = task.handle();
        task.run(WorkerId::new(0), &registry);
        assert!(registry.is_empty());
        (handle.progress(), handle.outcome().unwrap())
    }

    #[test]
    fn test_counts_words_and_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "the cat\n\nthe  dog\r\nsat on the mat").unwrap();

        let (lines, outcome) = run(file.path());
        assert_eq!(lines, 3);
        match outcome {
            TaskOutcome::Completed(tally) => {
                assert_eq!(tally.count("the"), 3);
                assert_eq!(tally.count("dog"), 1);
                assert_eq!(tally.total(), 8);
                assert_eq!(tally.distinct(), 6);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_is_tolerated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"caf\xe9 ok\n").unwrap();

        let (lines, outcome) = run(file.path());
        assert_eq!(lines, 1);
        match outcome {
            TaskOutcome::Completed(tally) => assert_eq!(tally.total(), 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_fails_without_progress() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");

        let (lines, outcome) = run(&missing);
        assert_eq!(lines, 0);
        match outcome {
            TaskOutcome::Failed(msg) => assert!(msg.contains("couldn't open"), "{}", msg),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_describe_mentions_path() {
        let job = WordCount::new("/tmp/input.txt");
        assert_eq!(job.describe(), "wordcount /tmp/input.txt");
        assert_eq!(job.path(), Path::new("/tmp/input.txt"));
    }
}

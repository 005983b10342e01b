//! Paired clean/corrupted datasets for EAP experiments
//!
//! A dataset is a CSV file with a `clean` and a `corrupted` prompt column
//! plus the label columns of its task (see [`Task::extract_label`]).
//!
//! Integer cells may be written as `12`, `12.0` or `True`/`False`. List
//! cells are bracketed integer literals, `[262, 1049]` or `(262, 1049,)`;
//! a trailing comma and an empty list are allowed.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::StringRecord;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{EapError, Result};
use crate::task::{model_family, Label, LabelKind, Task};

/// Borrowed view of one CSV row, addressed by column name
pub struct Row<'a> {
    index: usize,
    headers: &'a StringRecord,
    record: &'a StringRecord,
}

impl<'a> Row<'a> {
    /// Raw string value of a column
    pub fn get(&self, column: &str) -> Result<&'a str> {
        let pos = self
            .headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| self.error(format!("missing column '{column}'")))?;
        self.record
            .get(pos)
            .ok_or_else(|| self.error(format!("short record, no value for '{column}'")))
    }

    /// Integer column. Accepts integral floats such as `"12.0"` and booleans.
    pub fn integer(&self, column: &str) -> Result<i64> {
        let raw = self.get(column)?;
        parse_integer(raw)
            .ok_or_else(|| self.error(format!("column '{column}': not an integer: {raw:?}")))
    }

    /// Token id column
    pub fn token(&self, column: &str) -> Result<u32> {
        let v = self.integer(column)?;
        u32::try_from(v).map_err(|_| self.error(format!("column '{column}': bad token id {v}")))
    }

    /// List-valued column holding a bracketed literal such as `[262, 1049]`
    pub fn token_list(&self, column: &str) -> Result<Vec<u32>> {
        let raw = self.get(column)?;
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .or_else(|| trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')))
            .ok_or_else(|| self.error(format!("column '{column}': not a list: {raw:?}")))?;

        let mut items: Vec<&str> = inner.split(',').map(str::trim).collect();
        if items.last().is_some_and(|s| s.is_empty()) {
            items.pop();
        }
        items
            .into_iter()
            .map(|item| {
                parse_integer(item)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| {
                        self.error(format!("column '{column}': bad list item {item:?} in {raw:?}"))
                    })
            })
            .collect()
    }

    fn error(&self, reason: String) -> EapError {
        EapError::Label {
            row: self.index,
            reason,
        }
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    match raw {
        "True" | "true" => return Some(1),
        "False" | "false" => return Some(0),
        _ => {}
    }
    if let Ok(v) = i64::from_str(raw) {
        return Some(v);
    }
    match f64::from_str(raw) {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Some(v as i64),
        _ => None,
    }
}

/// A single clean/corrupted example
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub clean: String,
    pub corrupted: String,
    pub label: Label,
}

/// Labels of a batch, shaped by task family
#[derive(Debug, Clone, PartialEq)]
pub enum LabelBatch {
    /// `[correct, incorrect]` token ids per example
    Pairs(Vec<[u32; 2]>),
    /// One index per example
    Scalars(Vec<i64>),
    /// Variable-length answer sets; kept as lists rather than a dense tensor
    Sets(Vec<(Vec<u32>, Vec<u32>)>),
}

impl LabelBatch {
    /// Assemble labels of one batch. All labels must share a kind;
    /// `first_row` is the dataset row of `labels[0]`, used in errors.
    pub fn collate(labels: Vec<Label>, first_row: usize) -> Result<Self> {
        let kind = labels.first().map_or(LabelKind::Scalar, Label::kind);
        let mismatch = |i: usize| EapError::Label {
            row: first_row + i,
            reason: "mixed label kinds in one batch".to_string(),
        };
        let batch = match kind {
            LabelKind::Pair => LabelBatch::Pairs(
                labels
                    .into_iter()
                    .enumerate()
                    .map(|(i, l)| match l {
                        Label::Pair(a, b) => Ok([a, b]),
                        _ => Err(mismatch(i)),
                    })
                    .collect::<Result<_>>()?,
            ),
            LabelKind::Scalar => LabelBatch::Scalars(
                labels
                    .into_iter()
                    .enumerate()
                    .map(|(i, l)| match l {
                        Label::Scalar(x) => Ok(x),
                        _ => Err(mismatch(i)),
                    })
                    .collect::<Result<_>>()?,
            ),
            LabelKind::Sets => LabelBatch::Sets(
                labels
                    .into_iter()
                    .enumerate()
                    .map(|(i, l)| match l {
                        Label::Sets(a, b) => Ok((a, b)),
                        _ => Err(mismatch(i)),
                    })
                    .collect::<Result<_>>()?,
            ),
        };
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        match self {
            LabelBatch::Pairs(v) => v.len(),
            LabelBatch::Scalars(v) => v.len(),
            LabelBatch::Sets(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A batch of examples ready for the model
#[derive(Debug, Clone)]
pub struct Batch {
    pub clean: Vec<String>,
    pub corrupted: Vec<String>,
    pub labels: LabelBatch,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clean.is_empty()
    }
}

/// Collection of clean/corrupted examples for one task
#[derive(Debug, Clone)]
pub struct EapDataset {
    task: Task,
    headers: StringRecord,
    rows: Vec<StringRecord>,
}

impl EapDataset {
    /// Load `{data_dir}/{task}/{family}.csv`, or `{data_dir}/{task}/{filename}`
    /// when a filename is given.
    pub fn load(
        task_name: &str,
        model_id: &str,
        data_dir: &Path,
        filename: Option<&str>,
    ) -> Result<Self> {
        let path = Self::resolve_path(task_name, model_id, data_dir, filename)?;
        info!("Loading dataset: {}", path.display());
        let file = std::fs::File::open(&path)?;
        Self::from_reader(task_name, file)
    }

    /// Path a dataset would be loaded from
    pub fn resolve_path(
        task_name: &str,
        model_id: &str,
        data_dir: &Path,
        filename: Option<&str>,
    ) -> Result<PathBuf> {
        let dir = data_dir.join(task_name);
        Ok(match filename {
            Some(name) => dir.join(name),
            None => dir.join(format!("{}.csv", model_family(model_id)?)),
        })
    }

    /// Parse a dataset from any CSV reader
    pub fn from_reader<R: Read>(task_name: &str, reader: R) -> Result<Self> {
        let task = Task::from_name(task_name)?;
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        for required in ["clean", "corrupted"] {
            if !headers.iter().any(|h| h == required) {
                return Err(EapError::Label {
                    row: 0,
                    reason: format!("missing column '{required}'"),
                });
            }
        }
        let rows = csv_reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!("Parsed {} rows for task {}", rows.len(), task_name);

        Ok(Self {
            task,
            headers,
            rows,
        })
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Permute the rows in place
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.rows.shuffle(&mut rng);
    }

    /// Keep only the first `n` rows
    pub fn head(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    /// Example at `index`, with its label extracted
    pub fn get(&self, index: usize) -> Result<Example> {
        let record = self.rows.get(index).ok_or_else(|| EapError::Label {
            row: index,
            reason: format!("index out of range (len={})", self.rows.len()),
        })?;
        let row = Row {
            index,
            headers: &self.headers,
            record,
        };
        Ok(Example {
            clean: row.get("clean")?.to_string(),
            corrupted: row.get("corrupted")?.to_string(),
            label: self.task.extract_label(&row)?,
        })
    }

    /// Iterate over consecutive batches of `batch_size` examples. The last
    /// batch holds the remainder.
    pub fn batches(&self, batch_size: usize) -> Result<Batches<'_>> {
        if batch_size == 0 {
            return Err(EapError::Config("batch size must be positive".to_string()));
        }
        Ok(Batches {
            dataset: self,
            batch_size,
            next: 0,
        })
    }

    /// Collect every batch, so the same batches can be replayed across
    /// several passes.
    pub fn to_batches(&self, batch_size: usize) -> Result<Vec<Batch>> {
        self.batches(batch_size)?.collect()
    }
}

/// Batch iterator over an [`EapDataset`]
pub struct Batches<'a> {
    dataset: &'a EapDataset,
    batch_size: usize,
    next: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.len() {
            return None;
        }
        let end = (self.next + self.batch_size).min(self.dataset.len());
        let range = self.next..end;
        self.next = end;
        Some(self.collate(range))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.next);
        let n = remaining.div_ceil(self.batch_size);
        (n, Some(n))
    }
}

impl Batches<'_> {
    fn collate(&self, range: std::ops::Range<usize>) -> Result<Batch> {
        let mut clean = Vec::with_capacity(range.len());
        let mut corrupted = Vec::with_capacity(range.len());
        let mut labels = Vec::with_capacity(range.len());
        let first_row = range.start;
        for i in range {
            let example = self.dataset.get(i)?;
            clean.push(example.clean);
            corrupted.push(example.corrupted);
            labels.push(example.label);
        }
        Ok(Batch {
            clean,
            corrupted,
            labels: LabelBatch::collate(labels, first_row)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOI_CSV: &str = "clean,corrupted,correct_idx,incorrect_idx\n\
        When Mary and John went,When Alice and Bob went,5,7\n\
        Then Tom and Ann left,Then Sam and Liz left,11,13\n\
        After Kim and Lee ate,After Max and Joe ate,17,19\n";

    #[test]
    fn test_ioi_labels() {
        let ds = EapDataset::from_reader("ioi", IOI_CSV.as_bytes()).unwrap();
        assert_eq!(ds.len(), 3);
        let ex = ds.get(1).unwrap();
        assert_eq!(ex.clean, "Then Tom and Ann left");
        assert_eq!(ex.corrupted, "Then Sam and Liz left");
        assert_eq!(ex.label, Label::Pair(11, 13));
    }

    #[test]
    fn test_head_and_batches() {
        let mut ds = EapDataset::from_reader("ioi", IOI_CSV.as_bytes()).unwrap();
        let batches = ds.to_batches(2).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(
            batches[0].labels,
            LabelBatch::Pairs(vec![[5, 7], [11, 13]])
        );

        ds.head(10);
        assert_eq!(ds.len(), 3);
        ds.head(1);
        assert_eq!(ds.len(), 1);
        ds.head(0);
        assert!(ds.is_empty());
        assert_eq!(ds.to_batches(4).unwrap().len(), 0);
    }

    #[test]
    fn test_zero_batch_size() {
        let ds = EapDataset::from_reader("ioi", IOI_CSV.as_bytes()).unwrap();
        assert!(matches!(ds.batches(0), Err(EapError::Config(_))));
    }

    #[test]
    fn test_missing_label_column() {
        let csv = "clean,corrupted,correct_idx\na,b,1\n";
        let ds = EapDataset::from_reader("ioi", csv.as_bytes()).unwrap();
        match ds.get(0) {
            Err(EapError::Label { row, reason }) => {
                assert_eq!(row, 0);
                assert!(reason.contains("incorrect_idx"));
            }
            other => panic!("expected label error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_prompt_column() {
        let csv = "prompt,corrupted,correct_idx,incorrect_idx\na,b,1,2\n";
        assert!(EapDataset::from_reader("ioi", csv.as_bytes()).is_err());
    }

    fn first_label(task: &str, csv: &str) -> Label {
        let ds = EapDataset::from_reader(task, csv.as_bytes()).unwrap();
        ds.get(0).unwrap().label
    }

    #[test]
    fn test_labels_per_task() {
        assert_eq!(
            first_label(
                "greater-than",
                "clean,corrupted,correct_idx\nThe war lasted from 1742 to 17,The war lasted from 1701 to 17,42\n"
            ),
            Label::Scalar(42)
        );
        assert_eq!(
            first_label(
                "hypernymy-comma",
                "clean,corrupted,answers_idx,corrupted_answers_idx\na,b,\"[262, 1049]\",[7]\n"
            ),
            Label::Sets(vec![262, 1049], vec![7])
        );
        assert_eq!(
            first_label(
                "fact-retrieval-comma",
                "clean,corrupted,country_idx,corrupted_country_idx\na,b,3,4\n"
            ),
            Label::Pair(3, 4)
        );
        assert_eq!(
            first_label(
                "gender-bias",
                "clean,corrupted,clean_answer_idx,corrupted_answer_idx\na,b,8,9\n"
            ),
            Label::Pair(8, 9)
        );
        assert_eq!(
            first_label(
                "colored-objects",
                "clean,corrupted,correct_idx,incorrect_idx\na,b,21,22\n"
            ),
            Label::Pair(21, 22)
        );
        assert_eq!(
            first_label("sva", "clean,corrupted,plural\nThe dog,The dogs,1\n"),
            Label::Scalar(1)
        );
        assert_eq!(
            first_label("dummy-easy", "clean,corrupted\na,b\n"),
            Label::Scalar(0)
        );
    }

    #[test]
    fn test_dummy_batches_have_zero_labels() {
        let csv = "clean,corrupted\na,b\nc,d\ne,f\n";
        let ds = EapDataset::from_reader("dummy-medium", csv.as_bytes()).unwrap();
        let labels: Vec<LabelBatch> = ds
            .to_batches(2)
            .unwrap()
            .into_iter()
            .map(|b| b.labels)
            .collect();
        assert_eq!(
            labels,
            vec![LabelBatch::Scalars(vec![0, 0]), LabelBatch::Scalars(vec![0])]
        );
    }

    #[test]
    fn test_python_literal_cells() {
        let csv = "clean,corrupted,answers_idx,corrupted_answers_idx\n\
            a,b,\"[262, 1049,]\",\"(7,)\"\n\
            c,d,[],\"[ 5 ,6 ]\"\n\
            e,f,\"[1, x]\",[2]\n\
            g,h,262,[2]\n";
        let ds = EapDataset::from_reader("hypernymy", csv.as_bytes()).unwrap();
        assert_eq!(ds.get(0).unwrap().label, Label::Sets(vec![262, 1049], vec![7]));
        assert_eq!(ds.get(1).unwrap().label, Label::Sets(vec![], vec![5, 6]));
        assert!(matches!(ds.get(2), Err(EapError::Label { row: 2, .. })));
        assert!(matches!(ds.get(3), Err(EapError::Label { row: 3, .. })));

        let csv = "clean,corrupted,plural\na,b,True\nc,d,False\ne,f,1.0\ng,h,maybe\n";
        let ds = EapDataset::from_reader("sva", csv.as_bytes()).unwrap();
        assert_eq!(ds.get(0).unwrap().label, Label::Scalar(1));
        assert_eq!(ds.get(1).unwrap().label, Label::Scalar(0));
        assert_eq!(ds.get(2).unwrap().label, Label::Scalar(1));
        assert!(matches!(ds.get(3), Err(EapError::Label { row: 3, .. })));
    }

    #[test]
    fn test_full_pass_visits_each_row_once() {
        let mut csv = String::from("clean,corrupted,correct_idx,incorrect_idx\n");
        for i in 0..7 {
            csv.push_str(&format!("prompt {i},other {i},{i},{}\n", i + 1));
        }
        let ds = EapDataset::from_reader("ioi", csv.as_bytes()).unwrap();
        let expected: Vec<String> = (0..7).map(|i| format!("prompt {i}")).collect();

        let batches = ds.to_batches(3).unwrap();
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        let seen: Vec<String> = batches.into_iter().flat_map(|b| b.clean).collect();
        assert_eq!(seen, expected);

        let mut shuffled = ds.clone();
        shuffled.shuffle(11);
        let mut seen: Vec<String> = shuffled
            .batches(3)
            .unwrap()
            .flat_map(|b| b.unwrap().clean)
            .collect();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_mixed_labels_report_dataset_row() {
        let labels = vec![Label::Pair(1, 2), Label::Pair(3, 4), Label::Scalar(5)];
        match LabelBatch::collate(labels, 40) {
            Err(EapError::Label { row, reason }) => {
                assert_eq!(row, 42);
                assert!(reason.contains("mixed"));
            }
            other => panic!("expected label error, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_path() {
        let dir = Path::new("data");
        let p = EapDataset::resolve_path("ioi", "openai-community/gpt2", dir, None).unwrap();
        assert_eq!(p, Path::new("data/ioi/gpt2.csv"));
        let p = EapDataset::resolve_path("ioi", "anything", dir, Some("small.csv")).unwrap();
        assert_eq!(p, Path::new("data/ioi/small.csv"));
    }
}

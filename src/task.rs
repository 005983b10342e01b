//! Task names, label-extraction rules and model families
//!
//! Every dataset row carries a clean prompt, a corrupted prompt and a
//! task-specific label. The label columns differ per task; `Task` knows
//! which columns to read and how to shape them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::Row;
use crate::error::{EapError, Result};

/// Task families with distinct label layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Indirect object identification
    Ioi,
    /// Greater-than year comparison (any task name containing `greater-than`)
    GreaterThan,
    /// Hypernym lookup with multiple valid answers
    Hypernymy,
    /// Country-of-entity recall
    FactRetrieval,
    /// Gendered pronoun resolution
    Gender,
    /// Subject-verb agreement
    Sva,
    /// Colored objects reasoning
    ColoredObjects,
    /// Synthetic tasks used for sanity checks (`dummy-easy|medium|hard`)
    Dummy,
}

impl Task {
    /// Resolve a task name. Matching rules are checked in order and the
    /// first hit wins.
    pub fn from_name(name: &str) -> Result<Self> {
        let task = if name == "ioi" {
            Task::Ioi
        } else if name.contains("greater-than") {
            Task::GreaterThan
        } else if name.contains("hypernymy") {
            Task::Hypernymy
        } else if name.contains("fact-retrieval") {
            Task::FactRetrieval
        } else if name.contains("gender") {
            Task::Gender
        } else if name == "sva" {
            Task::Sva
        } else if name == "colored-objects" {
            Task::ColoredObjects
        } else if matches!(name, "dummy-easy" | "dummy-medium" | "dummy-hard") {
            Task::Dummy
        } else {
            return Err(EapError::UnknownTask(name.to_string()));
        };
        Ok(task)
    }

    /// The kind of label this task produces
    pub fn label_kind(&self) -> LabelKind {
        match self {
            Task::Ioi | Task::FactRetrieval | Task::Gender | Task::ColoredObjects => {
                LabelKind::Pair
            }
            Task::GreaterThan | Task::Sva | Task::Dummy => LabelKind::Scalar,
            Task::Hypernymy => LabelKind::Sets,
        }
    }

    /// Extract the label of one dataset row
    pub fn extract_label(&self, row: &Row<'_>) -> Result<Label> {
        let label = match self {
            Task::Ioi | Task::ColoredObjects => {
                Label::Pair(row.token("correct_idx")?, row.token("incorrect_idx")?)
            }
            Task::GreaterThan => Label::Scalar(row.integer("correct_idx")?),
            Task::Hypernymy => Label::Sets(
                row.token_list("answers_idx")?,
                row.token_list("corrupted_answers_idx")?,
            ),
            Task::FactRetrieval => Label::Pair(
                row.token("country_idx")?,
                row.token("corrupted_country_idx")?,
            ),
            Task::Gender => Label::Pair(
                row.token("clean_answer_idx")?,
                row.token("corrupted_answer_idx")?,
            ),
            Task::Sva => Label::Scalar(row.integer("plural")?),
            Task::Dummy => Label::Scalar(0),
        };
        Ok(label)
    }
}

impl FromStr for Task {
    type Err = EapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// Shape of a task's label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Pair,
    Scalar,
    Sets,
}

/// Label of a single example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    /// Correct and incorrect answer token ids
    Pair(u32, u32),
    /// A single index (correct year for greater-than, plurality for sva)
    Scalar(i64),
    /// Answer token set and corrupted answer token set
    Sets(Vec<u32>, Vec<u32>),
}

impl Label {
    pub fn kind(&self) -> LabelKind {
        match self {
            Label::Pair(..) => LabelKind::Pair,
            Label::Scalar(_) => LabelKind::Scalar,
            Label::Sets(..) => LabelKind::Sets,
        }
    }
}

/// Map a model id to the dataset family directory name.
///
/// Datasets are tokenized per family, so `data/{task}/{family}.csv` holds
/// token indices valid for every model of that family.
pub fn model_family(model_id: &str) -> Result<&'static str> {
    let lower = model_id.to_lowercase();
    let family = if lower.contains("gpt2") {
        "gpt2"
    } else if lower.contains("pythia") {
        "pythia"
    } else if lower.contains("llama-3") {
        "llama3"
    } else if lower.contains("llama-2") {
        "llama2"
    } else if lower.contains("qwen") {
        "qwen2"
    } else if lower.contains("gemma") {
        "gemma2"
    } else if lower.contains("olmo") {
        "olmo"
    } else {
        return Err(EapError::UnknownModelFamily(model_id.to_string()));
    };
    Ok(family)
}

/// Last `/`-separated segment of a model id, used in output paths
pub fn model_short_name(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_matching_order() {
        assert_eq!(Task::from_name("ioi").unwrap(), Task::Ioi);
        assert_eq!(Task::from_name("greater-than-price").unwrap(), Task::GreaterThan);
        assert_eq!(Task::from_name("hypernymy-comma").unwrap(), Task::Hypernymy);
        assert_eq!(Task::from_name("fact-retrieval-rev").unwrap(), Task::FactRetrieval);
        assert_eq!(Task::from_name("gender-bias").unwrap(), Task::Gender);
        assert_eq!(Task::from_name("sva").unwrap(), Task::Sva);
        assert_eq!(Task::from_name("colored-objects").unwrap(), Task::ColoredObjects);
        assert_eq!(Task::from_name("dummy-hard").unwrap(), Task::Dummy);
    }

    #[test]
    fn test_exact_names_do_not_match_prefixes() {
        for name in ["ioi-long", "sva-nested", "colored-objects-2", "dummy", "", "IOI"] {
            match Task::from_name(name) {
                Err(EapError::UnknownTask(n)) => assert_eq!(n, name),
                other => panic!("{name}: expected UnknownTask, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_label_kinds() {
        assert_eq!(Task::Ioi.label_kind(), LabelKind::Pair);
        assert_eq!(Task::GreaterThan.label_kind(), LabelKind::Scalar);
        assert_eq!(Task::Hypernymy.label_kind(), LabelKind::Sets);
        assert_eq!(Label::Scalar(3).kind(), LabelKind::Scalar);
    }

    #[test]
    fn test_model_family() {
        assert_eq!(model_family("gpt2").unwrap(), "gpt2");
        assert_eq!(model_family("openai-community/gpt2-medium").unwrap(), "gpt2");
        assert_eq!(model_family("EleutherAI/pythia-160m").unwrap(), "pythia");
        assert_eq!(model_family("meta-llama/Llama-3.2-1B").unwrap(), "llama3");
        assert_eq!(model_family("Qwen/Qwen2.5-0.5B").unwrap(), "qwen2");
        assert!(matches!(
            model_family("bert-base-uncased"),
            Err(EapError::UnknownModelFamily(_))
        ));
    }

    #[test]
    fn test_model_short_name() {
        assert_eq!(model_short_name("openai-community/gpt2"), "gpt2");
        assert_eq!(model_short_name("gpt2"), "gpt2");
    }
}

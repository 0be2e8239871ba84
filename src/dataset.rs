//! Dataset assembly: turns a user's reflection answers into a quality-gated,
//! versioned training corpus.
//!
//! Scoring is a pure function of the answer set. Answers are put in a
//! canonical order before scoring and hashing, so re-assembling an unchanged
//! answer set yields the same score and the same dataset record.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::Display as StrumDisplay;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatasetConfig;
use crate::database::models::{reflection_answer, training_dataset};
use crate::database::unique_constraint::is_unique_violation;

/// One answer as provided by the raw answer storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAnswer {
    pub question_category: String,
    pub text: String,
    pub word_count: i32,
}

/// Read-only access to a user's reflection answers.
#[async_trait]
pub trait AnswerSource: Send + Sync + std::fmt::Debug {
    async fn answers(&self, user_id: &str) -> Result<Vec<RawAnswer>, DbErr>;
}

/// Reads answers from the `reflection_answer` table.
#[derive(Debug, Clone)]
pub struct DatabaseAnswerSource {
    db: DatabaseConnection,
}

impl DatabaseAnswerSource {
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnswerSource for DatabaseAnswerSource {
    async fn answers(&self, user_id: &str) -> Result<Vec<RawAnswer>, DbErr> {
        let rows = reflection_answer::Entity::find()
            .filter(reflection_answer::Column::UserId.eq(user_id))
            .order_by_asc(reflection_answer::Column::CreatedAt)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| RawAnswer {
                question_category: row.question_category,
                text: row.text,
                word_count: row.word_count,
            })
            .collect())
    }
}

/// A qualifying answer as it appears in the stored corpus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub category: String,
    pub text: String,
    pub word_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Criterion {
    MinAnswers,
    MinCategories,
    MinQualityScore,
}

/// A quality gate the corpus did not pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFailure {
    pub criterion: Criterion,
    pub required: f64,
    pub actual: f64,
}

impl Display for ThresholdFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} got {}", self.criterion, self.required, self.actual)
    }
}

/// The three normalized score components, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityComponents {
    pub coverage: f64,
    pub length: f64,
    pub diversity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Weighted score in `[0, 100]`, one decimal
    pub score: f64,
    pub total_answers: usize,
    pub qualifying_answers: usize,
    pub category_count: usize,
    pub average_words: f64,
    pub lexical_diversity: f64,
    pub components: QualityComponents,
    pub failures: Vec<ThresholdFailure>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("insufficient training data ({})", join_failures(.failures))]
pub struct InsufficientDataError {
    pub failures: Vec<ThresholdFailure>,
    pub report: QualityReport,
}

fn join_failures(failures: &[ThresholdFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Failed to encode corpus: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AssembledDataset {
    pub dataset: training_dataset::Model,
    pub report: QualityReport,
    /// True when an identical corpus had already been stored
    pub reused: bool,
}

/// Filters, scores and gates an answer set without touching storage.
pub fn evaluate(
    answers: &[RawAnswer],
    config: &DatasetConfig,
) -> Result<(Vec<CorpusEntry>, QualityReport), InsufficientDataError> {
    let mut entries: Vec<CorpusEntry> = answers
        .iter()
        .filter(|answer| {
            !answer.text.trim().is_empty() && answer.word_count >= config.min_answer_words
        })
        .map(|answer| CorpusEntry {
            category: answer.question_category.trim().to_lowercase(),
            text: answer.text.trim().to_string(),
            word_count: answer.word_count,
        })
        .collect();
    entries.sort();

    let mut report = score_corpus(&entries, config);
    report.total_answers = answers.len();

    if report.qualifying_answers < config.min_answers {
        report.failures.push(ThresholdFailure {
            criterion: Criterion::MinAnswers,
            required: config.min_answers as f64,
            actual: report.qualifying_answers as f64,
        });
    }

    if report.category_count < config.min_categories {
        report.failures.push(ThresholdFailure {
            criterion: Criterion::MinCategories,
            required: config.min_categories as f64,
            actual: report.category_count as f64,
        });
    }

    if report.score < config.min_quality_score {
        report.failures.push(ThresholdFailure {
            criterion: Criterion::MinQualityScore,
            required: config.min_quality_score,
            actual: report.score,
        });
    }

    if report.passed() {
        Ok((entries, report))
    } else {
        Err(InsufficientDataError {
            failures: report.failures.clone(),
            report,
        })
    }
}

/// Weighted quality score over category coverage, average length and lexical diversity.
pub fn score_corpus(entries: &[CorpusEntry], config: &DatasetConfig) -> QualityReport {
    let categories: BTreeSet<&str> = entries.iter().map(|e| e.category.as_str()).collect();

    let total_words: i64 = entries.iter().map(|e| i64::from(e.word_count)).sum();
    let average_words = if entries.is_empty() {
        0.0
    } else {
        total_words as f64 / entries.len() as f64
    };

    let mut token_count = 0usize;
    let mut distinct: HashSet<String> = HashSet::new();
    for entry in entries {
        for token in tokens(&entry.text) {
            token_count += 1;
            distinct.insert(token);
        }
    }
    let lexical_diversity = if token_count == 0 {
        0.0
    } else {
        distinct.len() as f64 / token_count as f64
    };

    let components = QualityComponents {
        coverage: saturate(categories.len() as f64, config.target_categories as f64),
        length: saturate(average_words, config.target_average_words),
        diversity: saturate(lexical_diversity, config.target_lexical_diversity),
    };

    let weights = config.weights;
    let weight_sum = weights.coverage + weights.length + weights.diversity;
    let weighted = if weight_sum > 0.0 {
        (weights.coverage * components.coverage
            + weights.length * components.length
            + weights.diversity * components.diversity)
            / weight_sum
    } else {
        0.0
    };
    let score = ((weighted * 100.0).clamp(0.0, 100.0) * 10.0).round() / 10.0;

    QualityReport {
        score,
        total_answers: entries.len(),
        qualifying_answers: entries.len(),
        category_count: categories.len(),
        average_words,
        lexical_diversity,
        components,
        failures: Vec::new(),
    }
}

fn saturate(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 1.0;
    }
    (value / target).clamp(0.0, 1.0)
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// SHA-256 over the canonical corpus, one JSON line per entry.
pub fn content_hash(entries: &[CorpusEntry]) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();

    for entry in entries {
        let bytes = serde_json::to_vec(entry)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Assembles and persists the corpus for `user_id`.
///
/// Nothing is written when a quality gate fails.
pub async fn assemble(
    db: &DatabaseConnection,
    source: &dyn AnswerSource,
    user_id: &str,
    config: &DatasetConfig,
) -> Result<AssembledDataset, AssembleError> {
    let answers = source.answers(user_id).await?;
    let (entries, report) = evaluate(&answers, config)?;
    let hash = content_hash(&entries)?;

    if let Some(dataset) = find_by_hash(db, user_id, &hash).await? {
        debug!(
            "📚 Reusing dataset {} v{} for user {}",
            dataset.id, dataset.version, user_id
        );
        return Ok(AssembledDataset {
            dataset,
            report,
            reused: true,
        });
    }

    let version = next_version(db, user_id).await?;
    let now = chrono::Utc::now().naive_utc();

    let new_dataset = training_dataset::ActiveModel {
        id: Set(Uuid::now_v7()),
        user_id: Set(user_id.to_string()),
        version: Set(version),
        content_hash: Set(hash.clone()),
        corpus: Set(serde_json::to_value(&entries)?),
        answer_count: Set(i32::try_from(entries.len()).unwrap_or(i32::MAX)),
        category_count: Set(i32::try_from(report.category_count).unwrap_or(i32::MAX)),
        quality_score: Set(report.score),
        quality_report: Set(serde_json::to_value(&report)?),
        created_at: Set(now),
    };

    match new_dataset.insert(db).await {
        Ok(dataset) => {
            info!(
                "📚 Assembled dataset {} v{} for user {}: {} answers across {} categories (score {})",
                dataset.id,
                dataset.version,
                user_id,
                dataset.answer_count,
                dataset.category_count,
                report.score
            );
            Ok(AssembledDataset {
                dataset,
                report,
                reused: false,
            })
        }
        Err(e) if is_unique_violation(&e) => {
            // A concurrent assembly stored the same corpus first
            let dataset = find_by_hash(db, user_id, &hash).await?.ok_or(e)?;
            Ok(AssembledDataset {
                dataset,
                report,
                reused: true,
            })
        }
        Err(e) => Err(e.into()),
    }
}

async fn find_by_hash(
    db: &DatabaseConnection,
    user_id: &str,
    hash: &str,
) -> Result<Option<training_dataset::Model>, DbErr> {
    training_dataset::Entity::find()
        .filter(training_dataset::Column::UserId.eq(user_id))
        .filter(training_dataset::Column::ContentHash.eq(hash))
        .one(db)
        .await
}

async fn next_version(db: &DatabaseConnection, user_id: &str) -> Result<i32, DbErr> {
    let latest: Option<i32> = training_dataset::Entity::find()
        .select_only()
        .column(training_dataset::Column::Version)
        .filter(training_dataset::Column::UserId.eq(user_id))
        .order_by_desc(training_dataset::Column::Version)
        .limit(1)
        .into_tuple()
        .one(db)
        .await?;

    Ok(latest.unwrap_or(0) + 1)
}

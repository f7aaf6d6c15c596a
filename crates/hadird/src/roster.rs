//! Class roster import.
//!
//! Classes and students are administered elsewhere; the daemon only needs
//! their ids and display fields. A TOML roster is upserted at startup:
//!
//! ```toml
//! [[class]]
//! id = "7a"
//! name = "VII A"
//!
//! [[class.student]]
//! id = "s1"
//! full_name = "Ayu Lestari"
//! student_number = "2024001"
//! gender = "FEMALE"
//! ```

use crate::store::{ClassRecord, Store, StoreError, StudentRecord};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("failed to read roster: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid roster: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate student id in roster: {0}")]
    DuplicateStudent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
pub struct Roster {
    #[serde(default, rename = "class")]
    pub classes: Vec<RosterClass>,
}

#[derive(Debug, Deserialize)]
pub struct RosterClass {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "student")]
    pub students: Vec<RosterStudent>,
}

#[derive(Debug, Deserialize)]
pub struct RosterStudent {
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub student_number: String,
    #[serde(default)]
    pub gender: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub classes: usize,
    pub students: usize,
}

impl Roster {
    pub fn parse(text: &str) -> Result<Self, RosterError> {
        let roster: Roster = toml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for student in roster.classes.iter().flat_map(|c| &c.students) {
            if !seen.insert(student.id.as_str()) {
                return Err(RosterError::DuplicateStudent(student.id.clone()));
            }
        }
        Ok(roster)
    }

    pub async fn load(path: &Path) -> Result<Self, RosterError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    /// Upsert every class and student. Existing face templates are kept.
    pub async fn apply(self, store: &Store) -> Result<ImportSummary, RosterError> {
        let mut summary = ImportSummary::default();
        for class in self.classes {
            store
                .upsert_class(ClassRecord {
                    id: class.id.clone(),
                    name: class.name,
                })
                .await?;
            summary.classes += 1;

            for student in class.students {
                store
                    .upsert_student(StudentRecord {
                        id: student.id,
                        class_id: class.id.clone(),
                        full_name: student.full_name,
                        student_number: student.student_number,
                        gender: student.gender,
                    })
                    .await?;
                summary.students += 1;
            }
        }
        Ok(summary)
    }
}

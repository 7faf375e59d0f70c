use serde::{Deserialize, Serialize};

use super::{BloomLevel, ContentUnit, Importance};

/// Course-specific authoring guidance for generated questions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Guidelines {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub good_example: Option<String>,
    #[serde(default)]
    pub bad_example: Option<String>,
}

/// One concept extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptBrief {
    pub title: String,
    #[serde(default)]
    pub bloom_level: Option<BloomLevel>,
    #[serde(default)]
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub guidelines: Option<Guidelines>,
}

/// A section of course material that questions are drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub course_id: String,
    #[serde(default)]
    pub section_title: String,
    pub content: String,
    #[serde(default)]
    pub concepts: Vec<ConceptBrief>,
    #[serde(default)]
    pub difficulty_index: f64,
}

impl ChunkRecord {
    pub fn concept_count(&self) -> u32 {
        u32::try_from(self.concepts.len()).unwrap_or(u32::MAX)
    }

    /// Planner view of this chunk for a learner with `mastery_score`.
    pub fn to_unit(&self, mastery_score: f64) -> ContentUnit {
        ContentUnit {
            id: self.id.clone(),
            concept_count: self.concept_count(),
            difficulty_index: self.difficulty_index,
            mastery_score,
        }
    }
}

/// How much of a chunk's question pool a learner has solved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCoverage {
    pub unique_solved: u32,
    pub total_questions: u32,
}

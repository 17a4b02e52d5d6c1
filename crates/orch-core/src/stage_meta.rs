//! Immutable description of one substage, carried by the Agent Manager.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageMeta {
    pub number: u8,
    pub slug: String,
    pub substage_number: u32,
    pub substage_name: String,
    pub goals: String,
    pub max_iterations: u32,
    pub num_drafts: u32,
}

impl StageMeta {
    pub fn new(
        number: u8,
        slug: impl Into<String>,
        substage_number: u32,
        substage_name: impl Into<String>,
        goals: impl Into<String>,
        max_iterations: u32,
        num_drafts: u32,
    ) -> Self {
        Self {
            number,
            slug: slug.into(),
            substage_number,
            substage_name: substage_name.into(),
            goals: goals.into(),
            max_iterations,
            num_drafts,
        }
    }

    /// `stage_{number}_{slug}_{substage_number}_{substage_name}`
    pub fn name(&self) -> String {
        format!(
            "stage_{}_{}_{}_{}",
            self.number, self.slug, self.substage_number, self.substage_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_follows_template() {
        let m = StageMeta::new(1, "initial_implementation", 1, "first_attempt", "goals", 20, 5);
        assert_eq!(m.name(), "stage_1_initial_implementation_1_first_attempt");
    }
}

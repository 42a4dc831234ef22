//! Estimate record and input validation.
//!
//! Pricing is not computed here; `total_cost` is whatever the analysis or an
//! operator wrote last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::EstimateId;

pub const MAX_PROJECT_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MAX_LABOR_HOURS: f64 = 10_000.0;

/// Estimate lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    Draft,
    Pending,
    Analyzed,
    Completed,
}

/// A detected or entered material line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLine {
    pub name: String,
    pub quantity: u32,
    pub unit: String,
}

/// Estimate record as stored by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub id: EstimateId,
    pub project_name: String,
    pub description: String,
    pub labor_hours: Option<f64>,
    pub total_cost: f64,
    pub status: EstimateStatus,
    pub materials: Vec<MaterialLine>,
    pub analysis_confidence: Option<f64>,
    pub report_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Estimate {
    /// Build a draft estimate from validated input.
    pub fn from_input(input: &EstimateInput) -> DomainResult<Self> {
        let labor_hours = input.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: EstimateId::new(),
            project_name: input.project_name.clone().unwrap_or_default(),
            description: input.description.clone().unwrap_or_default(),
            labor_hours,
            total_cost: 0.0,
            status: EstimateStatus::Draft,
            materials: Vec::new(),
            analysis_confidence: None,
            report_path: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update. Fields left `None` keep their current value.
    pub fn apply(&mut self, patch: &EstimatePatch) {
        if let Some(name) = &patch.project_name {
            self.project_name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(hours) = patch.labor_hours {
            self.labor_hours = Some(hours);
        }
        if let Some(cost) = patch.total_cost {
            self.total_cost = cost;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(materials) = &patch.materials {
            self.materials = materials.clone();
        }
        if let Some(confidence) = patch.analysis_confidence {
            self.analysis_confidence = Some(confidence);
        }
        if let Some(path) = &patch.report_path {
            self.report_path = Some(path.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Client input for creating an estimate.
///
/// `labor_hours` stays loosely typed so that `"12.5"` and `12.5` are both
/// accepted and anything else is reported as a validation error instead of a
/// deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimateInput {
    pub project_name: Option<String>,
    pub description: Option<String>,
    pub labor_hours: Option<JsonValue>,
}

impl EstimateInput {
    /// Validate the input, returning the parsed labor hours.
    pub fn validate(&self) -> DomainResult<Option<f64>> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("project_name", &self.project_name),
            ("description", &self.description),
        ] {
            if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                errors.push(format!("Field '{field}' is required"));
            }
        }

        check_lengths(
            self.project_name.as_deref(),
            self.description.as_deref(),
            &mut errors,
        );

        let labor_hours = match &self.labor_hours {
            None | Some(JsonValue::Null) => None,
            Some(raw) => check_hours(raw, &mut errors),
        };

        if errors.is_empty() {
            Ok(labor_hours)
        } else {
            Err(DomainError::validation(errors))
        }
    }
}

/// Partial update of an estimate, as applied by the repository.
///
/// Carries server-owned fields (materials, confidence, report path) written
/// by background tasks; clients go through [`EstimateUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatePatch {
    pub project_name: Option<String>,
    pub description: Option<String>,
    pub labor_hours: Option<f64>,
    pub total_cost: Option<f64>,
    pub status: Option<EstimateStatus>,
    pub materials: Option<Vec<MaterialLine>>,
    pub analysis_confidence: Option<f64>,
    pub report_path: Option<String>,
}

/// Client-editable subset of an estimate. Fields that only background tasks
/// may write are rejected as unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstimateUpdate {
    pub project_name: Option<String>,
    pub description: Option<String>,
    pub labor_hours: Option<JsonValue>,
    pub total_cost: Option<f64>,
    pub status: Option<EstimateStatus>,
}

impl EstimateUpdate {
    /// Validate the fields present and turn them into a patch.
    pub fn validate(&self) -> DomainResult<EstimatePatch> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("project_name", &self.project_name),
            ("description", &self.description),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                errors.push(format!("Field '{field}' is required"));
            }
        }

        check_lengths(
            self.project_name.as_deref(),
            self.description.as_deref(),
            &mut errors,
        );

        let labor_hours = match &self.labor_hours {
            None | Some(JsonValue::Null) => None,
            Some(raw) => check_hours(raw, &mut errors),
        };

        if let Some(cost) = self.total_cost {
            if !cost.is_finite() || cost < 0.0 {
                errors.push("Total cost must be a non-negative number".to_string());
            }
        }

        if self.status == Some(EstimateStatus::Analyzed) {
            errors.push("Status 'analyzed' is set by image analysis".to_string());
        }

        if !errors.is_empty() {
            return Err(DomainError::validation(errors));
        }

        Ok(EstimatePatch {
            project_name: self.project_name.clone(),
            description: self.description.clone(),
            labor_hours,
            total_cost: self.total_cost,
            status: self.status,
            ..Default::default()
        })
    }
}

fn check_lengths(project_name: Option<&str>, description: Option<&str>, errors: &mut Vec<String>) {
    if project_name.is_some_and(|n| n.chars().count() > MAX_PROJECT_NAME_LEN) {
        errors.push("Project name must be less than 200 characters".to_string());
    }
    if description.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN) {
        errors.push("Description must be less than 1000 characters".to_string());
    }
}

fn check_hours(raw: &JsonValue, errors: &mut Vec<String>) -> Option<f64> {
    match parse_hours(raw) {
        Some(hours) if (0.0..=MAX_LABOR_HOURS).contains(&hours) => Some(hours),
        Some(_) => {
            errors.push("Labor hours must be between 0 and 10000".to_string());
            None
        }
        None => {
            errors.push("Labor hours must be a valid number".to_string());
            None
        }
    }
}

fn parse_hours(raw: &JsonValue) -> Option<f64> {
    let hours = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    hours.is_finite().then_some(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(name: &str, description: &str) -> EstimateInput {
        EstimateInput {
            project_name: Some(name.to_string()),
            description: Some(description.to_string()),
            labor_hours: None,
        }
    }

    fn errors_of(result: DomainResult<Option<f64>>) -> Vec<String> {
        match result {
            Err(DomainError::Validation(errors)) => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_input_creates_draft() {
        let mut i = input("Office Building Renovation", "Complete electrical system upgrade");
        i.labor_hours = Some(json!("12.5"));

        let estimate = Estimate::from_input(&i).unwrap();
        assert_eq!(estimate.status, EstimateStatus::Draft);
        assert_eq!(estimate.labor_hours, Some(12.5));
        assert_eq!(estimate.total_cost, 0.0);
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let errors = errors_of(EstimateInput::default().validate());
        assert_eq!(
            errors,
            vec![
                "Field 'project_name' is required".to_string(),
                "Field 'description' is required".to_string(),
            ]
        );
    }

    #[test]
    fn overlong_fields_are_rejected() {
        let i = input(&"x".repeat(201), &"y".repeat(1001));
        let errors = errors_of(i.validate());
        assert!(errors.iter().any(|e| e.starts_with("Project name")));
        assert!(errors.iter().any(|e| e.starts_with("Description")));
    }

    #[test]
    fn labor_hours_must_be_numeric_and_in_range() {
        let mut i = input("a", "b");
        i.labor_hours = Some(json!("lots"));
        assert_eq!(errors_of(i.validate()), vec!["Labor hours must be a valid number"]);

        i.labor_hours = Some(json!(10_001));
        assert_eq!(errors_of(i.validate()), vec!["Labor hours must be between 0 and 10000"]);

        i.labor_hours = Some(json!(-1));
        assert!(i.validate().is_err());

        i.labor_hours = Some(json!(10_000));
        assert_eq!(i.validate().unwrap(), Some(10_000.0));
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut estimate = Estimate::from_input(&input("a", "b")).unwrap();
        estimate.apply(&EstimatePatch {
            total_cost: Some(450.0),
            status: Some(EstimateStatus::Analyzed),
            ..Default::default()
        });

        assert_eq!(estimate.project_name, "a");
        assert_eq!(estimate.total_cost, 450.0);
        assert_eq!(estimate.status, EstimateStatus::Analyzed);
    }

    #[test]
    fn update_rejects_blank_and_out_of_range_fields() {
        let update = EstimateUpdate {
            project_name: Some(String::new()),
            description: Some("  ".to_string()),
            labor_hours: Some(json!("many")),
            total_cost: Some(-5.0),
            status: Some(EstimateStatus::Analyzed),
        };

        match update.validate() {
            Err(DomainError::Validation(errors)) => assert_eq!(
                errors,
                vec![
                    "Field 'project_name' is required",
                    "Field 'description' is required",
                    "Labor hours must be a valid number",
                    "Total cost must be a non-negative number",
                    "Status 'analyzed' is set by image analysis",
                ]
            ),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn update_becomes_patch_of_given_fields() {
        let update = EstimateUpdate {
            labor_hours: Some(json!("12.5")),
            total_cost: Some(1200.0),
            status: Some(EstimateStatus::Completed),
            ..Default::default()
        };

        let patch = update.validate().unwrap();
        assert_eq!(
            patch,
            EstimatePatch {
                labor_hours: Some(12.5),
                total_cost: Some(1200.0),
                status: Some(EstimateStatus::Completed),
                ..Default::default()
            }
        );
    }

    #[test]
    fn update_refuses_server_owned_fields() {
        for body in [
            json!({ "analysis_confidence": 7.0 }),
            json!({ "report_path": "/etc/passwd" }),
            json!({ "materials": [] }),
        ] {
            assert!(serde_json::from_value::<EstimateUpdate>(body).is_err());
        }
    }

    proptest::proptest! {
        #[test]
        fn labor_hours_range_is_inclusive(hours in -20_000.0f64..20_000.0) {
            let mut i = input("a", "b");
            i.labor_hours = Some(json!(hours));
            let accepted = i.validate().is_ok();
            proptest::prop_assert_eq!(accepted, (0.0..=MAX_LABOR_HOURS).contains(&hours));
        }
    }
}

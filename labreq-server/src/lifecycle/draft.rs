//! The intake draft: an explicit value carried through the multi-step form,
//! validated as a whole at submission time.

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;

use super::error::FieldError;
use super::state::Priority;
use crate::model::StaffCode;

/// A fully-populated request draft, as submitted by the intake flow.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestDraft {
    pub first_name: String,
    pub surname: String,
    #[serde(default)]
    pub middle_name: String,
    pub dob: NaiveDate,
    pub gender: String,
    pub phone: String,
    pub email: String,
    pub location: String,
    pub selected_tests: Vec<String>,
    #[serde(default)]
    pub doctor_code: Option<StaffCode>,
    pub assign_to: StaffCode,
    pub priority: Priority,
    pub collection_date: NaiveDate,
    pub collection_time: NaiveTime,
}

impl RequestDraft {
    /// Check all required fields, collecting every problem rather than
    /// stopping at the first. Middle name and doctor code are optional.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        require_non_blank(&mut errors, "first_name", &self.first_name);
        require_non_blank(&mut errors, "surname", &self.surname);
        require_non_blank(&mut errors, "gender", &self.gender);
        require_non_blank(&mut errors, "phone", &self.phone);
        require_non_blank(&mut errors, "email", &self.email);
        require_non_blank(&mut errors, "location", &self.location);
        require_non_blank(&mut errors, "assign_to", &self.assign_to.0);

        if self.selected_tests.is_empty() {
            errors.push(FieldError::new(
                "selected_tests",
                "at least one test is required",
            ));
        } else if self.selected_tests.iter().any(|t| t.trim().is_empty()) {
            errors.push(FieldError::new(
                "selected_tests",
                "test names must not be blank",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A partial update to patient/appointment/test fields.
///
/// `None` leaves a field unchanged. Assignment and status are deliberately
/// absent: those mutations have their own operations with their own rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestPatch {
    pub first_name: Option<String>,
    pub surname: Option<String>,
    pub middle_name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
    pub selected_tests: Option<Vec<String>>,
    pub doctor_code: Option<Option<StaffCode>>,
    pub priority: Option<Priority>,
    pub collection_date: Option<NaiveDate>,
    pub collection_time: Option<NaiveTime>,
}

impl RequestPatch {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.surname.is_none()
            && self.middle_name.is_none()
            && self.dob.is_none()
            && self.gender.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.location.is_none()
            && self.selected_tests.is_none()
            && self.doctor_code.is_none()
            && self.priority.is_none()
            && self.collection_date.is_none()
            && self.collection_time.is_none()
    }

    /// Validate the fields the patch touches. Blanking a required field is
    /// rejected; the test selection, if replaced, must stay non-empty.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        patch_non_blank(&mut errors, "first_name", self.first_name.as_deref());
        patch_non_blank(&mut errors, "surname", self.surname.as_deref());
        patch_non_blank(&mut errors, "gender", self.gender.as_deref());
        patch_non_blank(&mut errors, "phone", self.phone.as_deref());
        patch_non_blank(&mut errors, "email", self.email.as_deref());
        patch_non_blank(&mut errors, "location", self.location.as_deref());

        if let Some(tests) = &self.selected_tests {
            if tests.is_empty() {
                errors.push(FieldError::new(
                    "selected_tests",
                    "at least one test is required",
                ));
            } else if tests.iter().any(|t| t.trim().is_empty()) {
                errors.push(FieldError::new(
                    "selected_tests",
                    "test names must not be blank",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn require_non_blank(errors: &mut Vec<FieldError>, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::blank(field));
    }
}

fn patch_non_blank(errors: &mut Vec<FieldError>, field: &'static str, value: Option<&str>) {
    if let Some(value) = value {
        require_non_blank(errors, field, value);
    }
}

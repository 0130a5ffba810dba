//! Participant data: input types, input elements and value validation

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeploymentError;
use crate::models::protocol::AssignedTo;

pub const SEX: &str = "sex";
pub const PHONE_NUMBER: &str = "phone_number";
pub const FULL_NAME: &str = "full_name";
pub const SOCIAL_SECURITY_NUMBER: &str = "social_security_number";
pub const INFORMED_CONSENT: &str = "informed_consent";

/// Identifies a kind of data participants provide
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputDataType(pub String);

impl InputDataType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this type has a built-in input element
    pub fn is_builtin(&self) -> bool {
        default_input_element(self).is_some()
    }
}

impl fmt::Display for InputDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a value is entered, and which values are acceptable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum InputElement {
    Text {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    SelectOne {
        prompt: String,
        options: BTreeSet<String>,
    },
    Number {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    PhoneNumber {
        prompt: String,
    },
    FullName {
        prompt: String,
    },
    SocialSecurityNumber {
        prompt: String,
    },
    InformedConsent {
        prompt: String,
    },
}

impl InputElement {
    /// Check `data` against the shape and constraints of this element
    pub fn validate(&self, data: &ParticipantData) -> Result<(), String> {
        match (self, data) {
            (InputElement::Text { max_length, .. }, ParticipantData::Text { value }) => {
                match max_length {
                    Some(max) if value.chars().count() > *max => {
                        Err(format!("text is longer than {} characters", max))
                    }
                    _ => Ok(()),
                }
            }
            (InputElement::SelectOne { options, .. }, ParticipantData::Selection { value }) => {
                if options.contains(value) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of the allowed options", value))
                }
            }
            (InputElement::Number { min, max, .. }, ParticipantData::Number { value }) => {
                if !value.is_finite() {
                    return Err("number is not finite".to_string());
                }
                if let Some(min) = min {
                    if value < min {
                        return Err(format!("{} is below the minimum of {}", value, min));
                    }
                }
                if let Some(max) = max {
                    if value > max {
                        return Err(format!("{} is above the maximum of {}", value, max));
                    }
                }
                Ok(())
            }
            (
                InputElement::PhoneNumber { .. },
                ParticipantData::PhoneNumber {
                    country_code,
                    number,
                },
            ) => {
                let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
                if !digits(country_code.trim_start_matches('+')) {
                    return Err(format!("'{}' is not a valid country code", country_code));
                }
                if !digits(number) {
                    return Err("phone number may only contain digits".to_string());
                }
                Ok(())
            }
            (
                InputElement::FullName { .. },
                ParticipantData::FullName {
                    first_name,
                    last_name,
                    ..
                },
            ) => {
                if first_name.trim().is_empty() && last_name.trim().is_empty() {
                    Err("a name needs a first or last name".to_string())
                } else {
                    Ok(())
                }
            }
            (
                InputElement::SocialSecurityNumber { .. },
                ParticipantData::SocialSecurityNumber { number, .. },
            ) => {
                if number.trim().is_empty() {
                    Err("social security number is empty".to_string())
                } else {
                    Ok(())
                }
            }
            (
                InputElement::InformedConsent { .. },
                ParticipantData::InformedConsent { signature_name, .. },
            ) => {
                if signature_name.trim().is_empty() {
                    Err("informed consent is not signed".to_string())
                } else {
                    Ok(())
                }
            }
            (element, data) => Err(format!(
                "a {} value does not fit a {} input",
                data.kind(),
                element.kind()
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            InputElement::Text { .. } => "text",
            InputElement::SelectOne { .. } => "select one",
            InputElement::Number { .. } => "number",
            InputElement::PhoneNumber { .. } => "phone number",
            InputElement::FullName { .. } => "full name",
            InputElement::SocialSecurityNumber { .. } => "social security number",
            InputElement::InformedConsent { .. } => "informed consent",
        }
    }
}

/// A value supplied by a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticipantData {
    Text {
        value: String,
    },
    Number {
        value: f64,
    },
    Selection {
        value: String,
    },
    PhoneNumber {
        country_code: String,
        number: String,
    },
    FullName {
        first_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        middle_name: Option<String>,
        last_name: String,
    },
    SocialSecurityNumber {
        number: String,
        country: String,
    },
    InformedConsent {
        signed_on: DateTime<Utc>,
        signature_name: String,
    },
}

impl ParticipantData {
    fn kind(&self) -> &'static str {
        match self {
            ParticipantData::Text { .. } => "text",
            ParticipantData::Number { .. } => "number",
            ParticipantData::Selection { .. } => "selection",
            ParticipantData::PhoneNumber { .. } => "phone number",
            ParticipantData::FullName { .. } => "full name",
            ParticipantData::SocialSecurityNumber { .. } => "social security number",
            ParticipantData::InformedConsent { .. } => "informed consent",
        }
    }
}

/// Input element of a built-in input data type
pub fn default_input_element(input_type: &InputDataType) -> Option<InputElement> {
    let element = match input_type.as_str() {
        SEX => InputElement::SelectOne {
            prompt: "Sex".to_string(),
            options: ["male", "female", "intersex"]
                .into_iter()
                .map(String::from)
                .collect(),
        },
        PHONE_NUMBER => InputElement::PhoneNumber {
            prompt: "Phone number".to_string(),
        },
        FULL_NAME => InputElement::FullName {
            prompt: "Full name".to_string(),
        },
        SOCIAL_SECURITY_NUMBER => InputElement::SocialSecurityNumber {
            prompt: "Social security number".to_string(),
        },
        INFORMED_CONSENT => InputElement::InformedConsent {
            prompt: "Informed consent".to_string(),
        },
        _ => return None,
    };
    Some(element)
}

/// Definition of a piece of data participants provide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attribute", rename_all = "snake_case")]
pub enum ParticipantAttribute {
    /// A built-in input data type
    Default { input_data_type: InputDataType },

    /// A study-specific input data type with its own input element
    Custom {
        input_data_type: InputDataType,
        input: InputElement,
    },
}

impl ParticipantAttribute {
    pub fn input_data_type(&self) -> &InputDataType {
        match self {
            ParticipantAttribute::Default { input_data_type }
            | ParticipantAttribute::Custom {
                input_data_type, ..
            } => input_data_type,
        }
    }

    pub fn input_element(&self) -> Option<InputElement> {
        match self {
            ParticipantAttribute::Default { input_data_type } => {
                default_input_element(input_data_type)
            }
            ParticipantAttribute::Custom { input, .. } => Some(input.clone()),
        }
    }
}

/// Data the protocol expects from participants holding `assigned_to` roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedParticipantData {
    pub attribute: ParticipantAttribute,
    pub assigned_to: AssignedTo,
}

impl ExpectedParticipantData {
    pub fn new(attribute: ParticipantAttribute, assigned_to: AssignedTo) -> Self {
        Self {
            attribute,
            assigned_to,
        }
    }

    pub fn input_data_type(&self) -> &InputDataType {
        self.attribute.input_data_type()
    }
}

/// Reject expected data declarations that cannot coexist in one protocol
///
/// The same input type must always be declared with the same attribute, and
/// may be assigned to each participant role at most once. Assigning a type to
/// everyone excludes assigning it to any specific role.
pub fn expected_data_conflicts(declarations: &[ExpectedParticipantData]) -> Result<(), DeploymentError> {
    let mut by_type: BTreeMap<&InputDataType, Vec<&ExpectedParticipantData>> = BTreeMap::new();
    for declaration in declarations {
        by_type
            .entry(declaration.input_data_type())
            .or_default()
            .push(declaration);
    }

    for (input_type, declared) in by_type {
        let first = &declared[0].attribute;
        match first {
            ParticipantAttribute::Default { .. } if !input_type.is_builtin() => {
                return Err(DeploymentError::InvalidArgument(format!(
                    "'{}' is not a built-in input data type",
                    input_type
                )));
            }
            ParticipantAttribute::Custom { .. } if input_type.is_builtin() => {
                return Err(DeploymentError::InvalidArgument(format!(
                    "custom attribute '{}' redefines a built-in input data type",
                    input_type
                )));
            }
            _ => {}
        }
        if declared.iter().any(|d| &d.attribute != first) {
            return Err(DeploymentError::InvalidArgument(format!(
                "input data type '{}' is declared with differing attributes",
                input_type
            )));
        }

        let mut assigned_roles = BTreeSet::new();
        let mut assigned_to_all = false;
        for declaration in &declared {
            match &declaration.assigned_to {
                AssignedTo::All => {
                    if assigned_to_all || !assigned_roles.is_empty() {
                        return Err(duplicate_assignment(input_type));
                    }
                    assigned_to_all = true;
                }
                AssignedTo::Roles(roles) => {
                    if assigned_to_all || roles.iter().any(|r| !assigned_roles.insert(r)) {
                        return Err(duplicate_assignment(input_type));
                    }
                }
            }
        }
    }

    Ok(())
}

fn duplicate_assignment(input_type: &InputDataType) -> DeploymentError {
    DeploymentError::InvalidArgument(format!(
        "input data type '{}' is assigned more than once to the same participant role",
        input_type
    ))
}
